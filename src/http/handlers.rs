use axum::{
    Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{AppState, file::attachment_response};
use crate::{
    catalog::{FormatDescriptor, catalog_formats},
    config::non_empty,
    error::{ApiError, ValidationError},
    extractor::MediaKind,
    orchestrator::DownloadRequest,
    progress::JobStatus,
    validator::validate_url,
};

#[derive(Debug, Deserialize)]
pub struct InfoRequest {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    title: String,
    uploader: String,
    duration: f64,
    thumbnail: String,
    view_count: u64,
    video_id: String,
    video_formats: Vec<FormatDescriptor>,
    audio_formats: Vec<FormatDescriptor>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadBody {
    #[serde(default)]
    url: String,
    #[serde(default, alias = "formatId")]
    format_id: Option<String>,
    #[serde(default = "default_format_type", alias = "formatType")]
    format_type: MediaKind,
    #[serde(default)]
    has_audio: Option<bool>,
    #[serde(default)]
    title: Option<String>,
}

fn default_format_type() -> MediaKind {
    MediaKind::Video
}

#[derive(Debug, Serialize)]
pub struct DownloadStarted {
    download_id: String,
    status: &'static str,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn extract_info(
    State(state): State<AppState>,
    Json(payload): Json<InfoRequest>,
) -> Result<Json<InfoResponse>, ApiError> {
    let video = validate_url(&payload.url)?;
    let metadata = state.extractor.fetch_metadata(&video.canonical()).await?;
    let catalog = catalog_formats(&metadata.formats);

    Ok(Json(InfoResponse {
        title: metadata.display_title(),
        uploader: metadata.uploader.clone().unwrap_or_else(|| "Unknown".to_string()),
        duration: metadata.duration_seconds.unwrap_or_default(),
        thumbnail: metadata.thumbnail.clone().unwrap_or_default(),
        view_count: metadata.view_count.unwrap_or_default(),
        video_id: video.video_id,
        video_formats: catalog.video,
        audio_formats: catalog.audio,
    }))
}

pub async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadBody>,
) -> Result<Json<DownloadStarted>, ApiError> {
    let video = validate_url(&payload.url)?;
    let format_id = match payload.format_id.as_deref() {
        None => "best".to_string(),
        Some(value) => non_empty(value)
            .ok_or(ValidationError::MissingFormat)?
            .to_string(),
    };

    let request = DownloadRequest {
        url: video.canonical(),
        format_id,
        kind: payload.format_type,
        has_audio: payload.has_audio,
        title: payload.title.as_deref().and_then(non_empty).map(ToString::to_string),
    };

    let download_id = state.orchestrator.submit(request);
    info!(job = %download_id, video = %video.video_id, "download submitted");

    Ok(Json(DownloadStarted {
        download_id,
        status: "started",
    }))
}

pub async fn get_progress(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.store().get(&id) {
        Some(job) => Json(job).into_response(),
        None => Json(serde_json::json!({ "status": "not_found" })).into_response(),
    }
}

pub async fn cancel_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.orchestrator.store();
    let Some(job) = store.get(&id) else {
        return Err(ApiError::not_found("Download not found"));
    };

    if store.cancel(&id) {
        info!(job = %id, "download cancelled");
        Ok(Json(serde_json::json!({ "status": "cancelled" })))
    } else {
        Err(ApiError::bad_request(format!(
            "Download already finished with status {:?}",
            job.status
        )))
    }
}

pub async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state
        .orchestrator
        .store()
        .get(&id)
        .ok_or_else(|| ApiError::not_found("Download not found"))?;

    if job.status != JobStatus::Completed {
        return Err(ApiError::bad_request("Download not completed"));
    }

    let filename = job
        .filename
        .ok_or_else(|| ApiError::bad_request("No filename available"))?;

    let path = state.orchestrator.job_dir(&id).join(&filename);
    attachment_response(&path, &filename).await
}
