//! Scripted extractor used by unit tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    error::ExtractError,
    extractor::{
        FetchRequest, FetchedMedia, MediaExtractor, MediaMetadata, ProgressEvent, ProgressSink,
    },
};

pub enum FakeOutcome {
    /// Writes `name` into the output directory and reports progress.
    Write { name: String, bytes: Vec<u8> },
    Fail(ExtractError),
    /// Succeeds without producing anything.
    Nothing,
    /// Never returns.
    Hang,
}

pub struct FakeExtractor {
    pub metadata: Result<MediaMetadata, ExtractError>,
    outcomes: Mutex<VecDeque<FakeOutcome>>,
    selectors: Mutex<Vec<String>>,
}

impl FakeExtractor {
    pub fn new(metadata: Result<MediaMetadata, ExtractError>, outcomes: Vec<FakeOutcome>) -> Self {
        Self {
            metadata,
            outcomes: Mutex::new(outcomes.into()),
            selectors: Mutex::new(Vec::new()),
        }
    }

    pub fn titled(title: &str, outcomes: Vec<FakeOutcome>) -> Self {
        Self::new(
            Ok(MediaMetadata {
                title: Some(title.to_string()),
                ..MediaMetadata::default()
            }),
            outcomes,
        )
    }

    pub fn selectors(&self) -> Vec<String> {
        self.selectors.lock().clone()
    }
}

#[async_trait]
impl MediaExtractor for FakeExtractor {
    async fn fetch_metadata(&self, _url: &str) -> Result<MediaMetadata, ExtractError> {
        self.metadata.clone()
    }

    async fn fetch_media(
        &self,
        request: &FetchRequest,
        sink: &dyn ProgressSink,
    ) -> Result<FetchedMedia, ExtractError> {
        self.selectors.lock().push(request.selector.clone());
        let outcome = self.outcomes.lock().pop_front().unwrap_or(FakeOutcome::Nothing);

        match outcome {
            FakeOutcome::Write { name, bytes } => {
                let total = bytes.len() as u64;
                sink.on_progress(ProgressEvent::Downloading {
                    downloaded_bytes: total / 2,
                    total_bytes: Some(total),
                    speed: Some(1024.0),
                    eta: Some(1),
                });
                tokio::fs::create_dir_all(&request.output_dir)
                    .await
                    .map_err(|error| ExtractError::DownloadFailed(error.to_string()))?;
                tokio::fs::write(request.output_dir.join(name), bytes)
                    .await
                    .map_err(|error| ExtractError::DownloadFailed(error.to_string()))?;
                sink.on_progress(ProgressEvent::StreamFinished {
                    downloaded_bytes: total,
                    total_bytes: Some(total),
                });
                Ok(FetchedMedia::default())
            }
            FakeOutcome::Fail(error) => Err(error),
            FakeOutcome::Nothing => Ok(FetchedMedia::default()),
            FakeOutcome::Hang => std::future::pending().await,
        }
    }
}
