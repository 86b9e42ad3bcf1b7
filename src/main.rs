use std::{sync::Arc, time::Duration};

use simplyt::{
    config::Config,
    error::ApiError,
    extractor::{MediaExtractor, ProfileSet, YtDlp},
    http::{AppState, build_cors_layer, router},
    locate::cleanup_stale_files,
    orchestrator::{Orchestrator, OrchestratorSettings},
    progress::JobStore,
    retry::RetryPolicy,
};
use tokio::net::TcpListener;
use tracing::{error, info};

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "simplyt=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        error!("{}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.downloads_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create downloads directory {}: {error}",
                config.downloads_dir.display()
            ))
        })?;

    if config.cleanup_on_start {
        let removed = cleanup_stale_files(&config.downloads_dir, config.stale_file_age).await;
        if removed > 0 {
            info!(removed, "removed stale files from downloads directory");
        }
    }

    let profiles = match &config.client_profiles_path {
        Some(path) => ProfileSet::load(path, RetryPolicy::default())
            .await
            .map_err(|error| ApiError::internal(error.to_string()))?,
        None => ProfileSet::default(),
    };
    info!(
        profiles = ?profiles.profiles().iter().map(|profile| profile.name.as_str()).collect::<Vec<_>>(),
        "client profiles loaded"
    );

    let extractor: Arc<dyn MediaExtractor> = Arc::new(YtDlp::new(
        config.yt_dlp_bin.clone(),
        profiles,
        config.metadata_timeout,
    ));

    let store = JobStore::new(config.job_ttl, config.max_tracked_jobs);
    store.spawn_pruner(PRUNE_INTERVAL, config.downloads_dir.clone());

    let mut settings = OrchestratorSettings::new(config.downloads_dir.clone());
    settings.max_concurrent = config.max_concurrent_downloads;
    let orchestrator = Arc::new(Orchestrator::new(extractor.clone(), store, settings));

    let cors = build_cors_layer(&config.allowed_origins)?;
    let app = router(
        AppState {
            extractor,
            orchestrator,
        },
        cors,
    );

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;

    info!(
        addr = %config.bind_addr,
        downloads = %config.downloads_dir.display(),
        "server ready"
    );

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}
