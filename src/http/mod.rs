mod file;
mod handlers;

use std::{collections::HashSet, sync::Arc};

use axum::{
    Router,
    http::{
        HeaderName, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, REFERRER_POLICY, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS},
    },
    routing::{delete, get, post},
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{error::ApiError, extractor::MediaExtractor, orchestrator::Orchestrator};

pub use file::{build_content_disposition, content_type_for_filename, sanitize_ascii_filename};

#[derive(Clone)]
pub struct AppState {
    pub extractor: Arc<dyn MediaExtractor>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/extract", post(handlers::extract_info))
        .route("/get_video_info", post(handlers::extract_info))
        .route("/download", post(handlers::start_download))
        .route("/download/{id}", delete(handlers::cancel_download))
        .route("/progress/{id}", get(handlers::get_progress))
        .route("/download_file/{id}", get(handlers::download_file))
        .with_state(state)
        .layer(SetResponseHeaderLayer::if_not_present(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

pub fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let origins = if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Falling back to local development origins.");
        vec![
            "http://127.0.0.1:8787".to_string(),
            "http://localhost:8787".to_string(),
            "http://127.0.0.1:5173".to_string(),
            "http://localhost:5173".to_string(),
        ]
    } else {
        configured.to_vec()
    };

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        count = normalized_origins.len(),
        origins = ?normalized_origins,
        "CORS allow-list loaded"
    );

    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(raw = ?origin, normalized = ?normalized, allowed, "CORS origin check");
        allowed
    });

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(file::DOWNLOAD_FILENAME_HEADER),
        ]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port().filter(|port| *port != default_port) {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}
