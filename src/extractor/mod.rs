//! Boundary around the external extraction tool.
//!
//! Everything that talks to yt-dlp lives behind [`MediaExtractor`], so the
//! orchestrator and the HTTP layer can be driven by a fake in tests.

mod profiles;
mod ytdlp;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;

pub use profiles::{ClientProfile, ProfileError, ProfileSet};
pub use ytdlp::{YtDlp, parse_progress_line};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Extension of the file left on disk once post-processing is done.
    pub fn expected_extension(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::Audio => "mp3",
        }
    }
}

/// One stream variant as reported by yt-dlp's JSON dump.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    #[serde(default)]
    pub format_id: String,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<u32>,
    pub width: Option<u32>,
    pub fps: Option<f32>,
    pub tbr: Option<f32>,
    pub abr: Option<f32>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
}

impl RawFormat {
    pub fn has_video(&self) -> bool {
        matches!(self.vcodec.as_deref(), Some(value) if value != "none" && !value.is_empty())
    }

    pub fn has_audio(&self) -> bool {
        matches!(self.acodec.as_deref(), Some(value) if value != "none" && !value.is_empty())
    }

    pub fn is_audio_only(&self) -> bool {
        !self.has_video() && self.has_audio()
    }

    pub fn estimated_size(&self) -> Option<u64> {
        self.filesize
            .or(self.filesize_approx)
            .filter(|size| *size > 0.0)
            .map(|size| size as u64)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default, rename = "duration")]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub view_count: Option<u64>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
}

impl MediaMetadata {
    pub fn display_title(&self) -> String {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or("Unknown Title")
            .to_string()
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub selector: String,
    pub kind: MediaKind,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct FetchedMedia {
    /// Final path printed by the tool after post-processing, when it reported one.
    pub reported_path: Option<PathBuf>,
}

/// Snapshot emitted while a transfer is running.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Downloading {
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        speed: Option<f64>,
        eta: Option<u64>,
    },
    /// One stream is complete. A merged video+audio transfer reports two,
    /// each counting from zero.
    StreamFinished {
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
    },
    /// The tool started a post-processor (merge, audio extraction).
    PostProcessing { step: String },
}

/// Receiver for progress snapshots. Called inline from the transfer, so
/// implementations must return promptly and never await.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

/// Sink that discards everything.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _event: ProgressEvent) {}
}

#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn fetch_metadata(&self, url: &str) -> Result<MediaMetadata, ExtractError>;

    async fn fetch_media(
        &self,
        request: &FetchRequest,
        sink: &dyn ProgressSink,
    ) -> Result<FetchedMedia, ExtractError>;
}
