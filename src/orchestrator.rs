//! Lifecycle of one download job:
//! `starting -> downloading -> processing -> completed`, or `error` from any
//! live state.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{ExtractError, JobError},
    extractor::{FetchRequest, FetchedMedia, MediaExtractor, MediaKind},
    locate::{locate_output, remove_job_output, snapshot_dir},
    progress::{DEFAULT_PROGRESS_INTERVAL, JobStore, ThrottledProgress},
    retry::RetryPolicy,
};

const VIDEO_FALLBACK_SELECTORS: [&str; 5] = [
    "best[height<=720]",
    "best[height<=480]",
    "best[height<=360]",
    "worst",
    "best",
];
const AUDIO_FALLBACK_SELECTORS: [&str; 2] = ["bestaudio", "worst"];

/// A validated download submission.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub format_id: String,
    pub kind: MediaKind,
    /// Whether the chosen video format already carries audio, if known.
    pub has_audio: Option<bool>,
    /// Title as shown to the user; fetched lazily when file matching needs it.
    pub title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub output_dir: PathBuf,
    pub retry: RetryPolicy,
    pub video_grace: Duration,
    pub audio_grace: Duration,
    pub progress_interval: Duration,
    pub max_concurrent: usize,
}

impl OrchestratorSettings {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            retry: RetryPolicy::default(),
            video_grace: Duration::from_secs(1),
            audio_grace: Duration::from_secs(3),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            max_concurrent: 3,
        }
    }

    fn grace_for(&self, kind: MediaKind) -> Duration {
        match kind {
            MediaKind::Video => self.video_grace,
            MediaKind::Audio => self.audio_grace,
        }
    }
}

pub struct Orchestrator {
    extractor: Arc<dyn MediaExtractor>,
    store: JobStore,
    settings: OrchestratorSettings,
    permits: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        extractor: Arc<dyn MediaExtractor>,
        store: JobStore,
        settings: OrchestratorSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self {
            extractor,
            store,
            settings,
            permits,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Directory owned by job `id`. Every job writes into its own directory
    /// so concurrent transfers never see each other's files.
    pub fn job_dir(&self, id: &str) -> PathBuf {
        self.settings.output_dir.join(id)
    }

    /// Registers the job and runs it on its own task. Returns the job id
    /// immediately.
    pub fn submit(self: &Arc<Self>, request: DownloadRequest) -> String {
        let id = self.store.create(request.kind);
        if let Some(title) = &request.title {
            self.store.set_title(&id, title);
        }

        let orchestrator = Arc::clone(self);
        let job_id = id.clone();
        tokio::spawn(async move {
            orchestrator.run(&job_id, request).await;
        });

        id
    }

    /// Drives one job to a terminal state.
    pub async fn run(&self, id: &str, request: DownloadRequest) {
        let Some(token) = self.store.cancel_token(id) else {
            warn!(job = id, "job vanished before it started");
            return;
        };

        match self.execute(id, &request, &token).await {
            Ok((filename, size)) => {
                info!(job = id, filename = %filename, size, "download completed");
                self.store.complete(id, &filename, size);
            }
            Err(error) => {
                warn!(job = id, error = %error, "download failed");
                self.store.fail(id, &error.user_message());
                remove_job_output(&self.settings.output_dir, id).await;
            }
        }
    }

    async fn execute(
        &self,
        id: &str,
        request: &DownloadRequest,
        token: &CancellationToken,
    ) -> Result<(String, u64), JobError> {
        let _permit = tokio::select! {
            _ = token.cancelled() => return Err(JobError::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| JobError::Cancelled)?
            }
        };

        let job_dir = self.job_dir(id);
        tokio::fs::create_dir_all(&job_dir).await?;

        let selectors = selector_chain(&request.format_id, request.kind, request.has_audio);
        let sink = ThrottledProgress::new(self.store.clone(), id, self.settings.progress_interval);
        let attempts = selectors.len() as u32;
        let mut last_error: Option<ExtractError> = None;
        let mut outcome = None;

        for (index, selector) in selectors.iter().enumerate() {
            let attempt = index as u32 + 1;
            if index > 0 && !self.settings.retry.wait(index as u32, token).await {
                return Err(JobError::Cancelled);
            }
            if token.is_cancelled() {
                return Err(JobError::Cancelled);
            }

            self.store.begin_attempt(id, attempt, attempts);
            info!(job = id, attempt, attempts, selector = %selector, "trying format");

            let before = snapshot_dir(&job_dir).await?;
            let fetch = FetchRequest {
                url: request.url.clone(),
                selector: selector.clone(),
                kind: request.kind,
                output_dir: job_dir.clone(),
            };

            let result = tokio::select! {
                _ = token.cancelled() => return Err(JobError::Cancelled),
                result = self.extractor.fetch_media(&fetch, &sink) => result,
            };

            match result {
                Ok(media) => {
                    outcome = Some((media, before));
                    break;
                }
                Err(error) if is_retryable(&error) && attempt < attempts => {
                    warn!(job = id, selector = %selector, error = %error, "format failed, trying next");
                    last_error = Some(error);
                }
                Err(error) => return Err(error.into()),
            }
        }

        let Some((media, before)) = outcome else {
            return Err(last_error
                .unwrap_or_else(|| ExtractError::DownloadFailed("no formats to try".to_string()))
                .into());
        };

        self.store.mark_processing(id);
        tokio::select! {
            _ = token.cancelled() => return Err(JobError::Cancelled),
            _ = tokio::time::sleep(self.settings.grace_for(request.kind)) => {}
        }

        self.identify(id, &job_dir, request, &media, &before).await
    }

    async fn identify(
        &self,
        id: &str,
        dir: &std::path::Path,
        request: &DownloadRequest,
        media: &FetchedMedia,
        before: &std::collections::HashSet<String>,
    ) -> Result<(String, u64), JobError> {
        let extension = request.kind.expected_extension();

        let mut found = locate_output(dir, before, extension, "", media.reported_path.as_deref()).await?;

        if found.is_none() {
            let title = match &request.title {
                Some(title) => title.clone(),
                None => match self.extractor.fetch_metadata(&request.url).await {
                    Ok(metadata) => metadata.display_title(),
                    Err(error) => {
                        warn!(job = id, error = %error, "could not fetch title for file matching");
                        String::new()
                    }
                },
            };
            found = locate_output(dir, before, extension, &title, None).await?;
        }

        let path = found.ok_or_else(|| JobError::FileNotLocated(id.to_string()))?;
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToString::to_string)
            .ok_or_else(|| JobError::FileNotLocated(id.to_string()))?;
        let size = tokio::fs::metadata(&path).await?.len();

        Ok((filename, size))
    }
}

/// Ordered selectors for one request: the requested format first, then
/// progressively safer fallbacks. Duplicates are dropped.
pub fn selector_chain(format_id: &str, kind: MediaKind, has_audio: Option<bool>) -> Vec<String> {
    let requested = format_id.trim();
    let primary = match (kind, has_audio) {
        (MediaKind::Video, Some(false)) => format!("{requested}+bestaudio/{requested}"),
        _ => requested.to_string(),
    };

    let fallbacks: &[&str] = match kind {
        MediaKind::Video => &VIDEO_FALLBACK_SELECTORS,
        MediaKind::Audio => &AUDIO_FALLBACK_SELECTORS,
    };

    let mut chain: Vec<String> = Vec::with_capacity(fallbacks.len() + 1);
    for selector in std::iter::once(primary.as_str()).chain(fallbacks.iter().copied()) {
        if !selector.is_empty() && !chain.iter().any(|existing| existing == selector) {
            chain.push(selector.to_string());
        }
    }
    chain
}

/// Failures that a different format selector may get around.
pub fn is_retryable(error: &ExtractError) -> bool {
    let detail = match error {
        ExtractError::DownloadFailed(detail) | ExtractError::ExtractionFailed(detail) => {
            detail.to_ascii_lowercase()
        }
        ExtractError::ToolMissing(_) | ExtractError::Timeout(_) => return false,
    };

    detail.contains("empty")
        || detail.contains("403")
        || detail.contains("forbidden")
        || detail.contains("requested format is not available")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        progress::JobStatus,
        testing::{FakeExtractor, FakeOutcome},
    };

    fn settings(dir: &std::path::Path) -> OrchestratorSettings {
        OrchestratorSettings {
            output_dir: dir.to_path_buf(),
            retry: RetryPolicy::immediate(),
            video_grace: Duration::ZERO,
            audio_grace: Duration::ZERO,
            progress_interval: Duration::ZERO,
            max_concurrent: 2,
        }
    }

    fn request(kind: MediaKind, format_id: &str) -> DownloadRequest {
        DownloadRequest {
            url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string(),
            format_id: format_id.to_string(),
            kind,
            has_audio: None,
            title: None,
        }
    }

    fn orchestrator(dir: &std::path::Path, fake: FakeExtractor) -> (Arc<Orchestrator>, Arc<FakeExtractor>) {
        let fake = Arc::new(fake);
        let store = JobStore::new(Duration::from_secs(60), 100);
        let orchestrator = Arc::new(Orchestrator::new(fake.clone(), store, settings(dir)));
        (orchestrator, fake)
    }

    async fn run_job(orchestrator: &Orchestrator, request: DownloadRequest) -> String {
        let id = orchestrator.store().create(request.kind);
        orchestrator.run(&id, request).await;
        id
    }

    #[test]
    fn video_chain_keeps_order_and_drops_duplicates() {
        let chain = selector_chain("best", MediaKind::Video, None);
        assert_eq!(
            chain,
            ["best", "best[height<=720]", "best[height<=480]", "best[height<=360]", "worst"]
        );
    }

    #[test]
    fn video_only_format_merges_audio() {
        let chain = selector_chain("137", MediaKind::Video, Some(false));
        assert_eq!(chain[0], "137+bestaudio/137");
        assert_eq!(chain.len(), 6);
    }

    #[test]
    fn audio_chain() {
        assert_eq!(selector_chain("140", MediaKind::Audio, None), ["140", "bestaudio", "worst"]);
        assert_eq!(selector_chain("bestaudio", MediaKind::Audio, None), ["bestaudio", "worst"]);
    }

    #[test]
    fn retryable_errors() {
        assert!(is_retryable(&ExtractError::DownloadFailed("HTTP Error 403: Forbidden".into())));
        assert!(is_retryable(&ExtractError::DownloadFailed("The downloaded file is empty".into())));
        assert!(is_retryable(&ExtractError::DownloadFailed(
            "ERROR: Requested format is not available".into()
        )));
        assert!(!is_retryable(&ExtractError::DownloadFailed("Video unavailable".into())));
        assert!(!is_retryable(&ExtractError::ToolMissing("yt-dlp".into())));
    }

    #[tokio::test]
    async fn completes_with_new_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (orchestrator, _) = orchestrator(
            dir.path(),
            FakeExtractor::titled(
                "Some Title",
                vec![FakeOutcome::Write {
                    name: "Some Title.mp4".into(),
                    bytes: vec![7; 64],
                }],
            ),
        );

        let id = run_job(&orchestrator, request(MediaKind::Video, "22")).await;
        let job = orchestrator.store().get(&id).expect("job");

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.filename.as_deref(), Some("Some Title.mp4"));
        assert_eq!(job.file_size_bytes, Some(64));
        assert_eq!(job.percent, 100.0);
        assert!(orchestrator.job_dir(&id).join("Some Title.mp4").is_file());
    }

    #[tokio::test]
    async fn retries_next_selector_after_blocked_attempt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (orchestrator, fake) = orchestrator(
            dir.path(),
            FakeExtractor::titled(
                "Song",
                vec![
                    FakeOutcome::Fail(ExtractError::DownloadFailed("HTTP Error 403: Forbidden".into())),
                    FakeOutcome::Write {
                        name: "Song.mp3".into(),
                        bytes: vec![1; 8],
                    },
                ],
            ),
        );

        let id = run_job(&orchestrator, request(MediaKind::Audio, "251")).await;
        let job = orchestrator.store().get(&id).expect("job");

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(fake.selectors(), ["251", "bestaudio"]);
        assert_eq!(job.attempt, 2);
        assert_eq!(job.attempts, 3);
    }

    #[tokio::test]
    async fn hard_failure_stops_and_classifies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (orchestrator, fake) = orchestrator(
            dir.path(),
            FakeExtractor::titled(
                "x",
                vec![FakeOutcome::Fail(ExtractError::DownloadFailed(
                    "ERROR: [youtube] abc: Video unavailable".into(),
                ))],
            ),
        );

        let id = run_job(&orchestrator, request(MediaKind::Video, "22")).await;
        let job = orchestrator.store().get(&id).expect("job");

        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error.expect("message").starts_with("This video is not available"));
        assert_eq!(fake.selectors().len(), 1);
        assert!(!orchestrator.job_dir(&id).exists());
    }

    #[tokio::test]
    async fn exhausted_fallbacks_surface_last_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocked = || FakeOutcome::Fail(ExtractError::DownloadFailed("HTTP Error 403".into()));
        let (orchestrator, fake) = orchestrator(
            dir.path(),
            FakeExtractor::titled("x", vec![blocked(), blocked(), blocked()]),
        );

        let id = run_job(&orchestrator, request(MediaKind::Audio, "251")).await;
        let job = orchestrator.store().get(&id).expect("job");

        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error.expect("message").starts_with("YouTube is blocking"));
        assert_eq!(fake.selectors().len(), 3);
    }

    #[tokio::test]
    async fn missing_output_is_a_hard_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (orchestrator, fake) =
            orchestrator(dir.path(), FakeExtractor::titled("Nothing Here At All", vec![FakeOutcome::Nothing]));

        let id = run_job(&orchestrator, request(MediaKind::Video, "22")).await;
        let job = orchestrator.store().get(&id).expect("job");

        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(
            job.error.as_deref(),
            Some(format!("No downloaded file found for download {id}").as_str())
        );
        assert_eq!(fake.selectors().len(), 1);
    }

    #[tokio::test]
    async fn overwritten_file_found_by_title() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (orchestrator, _) = orchestrator(
            dir.path(),
            FakeExtractor::titled("Daily Morning Jazz Piano Session", vec![FakeOutcome::Nothing]),
        );

        let id = orchestrator.store().create(MediaKind::Audio);
        let job_dir = orchestrator.job_dir(&id);
        tokio::fs::create_dir_all(&job_dir).await.expect("job dir");
        tokio::fs::write(job_dir.join("Daily Morning Jazz Piano Session.mp3"), b"old")
            .await
            .expect("seed file");

        orchestrator.run(&id, request(MediaKind::Audio, "bestaudio")).await;
        let job = orchestrator.store().get(&id).expect("job");

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.filename.as_deref(), Some("Daily Morning Jazz Piano Session.mp3"));
    }

    #[tokio::test]
    async fn concurrent_jobs_keep_their_own_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (orchestrator, _) = orchestrator(
            dir.path(),
            FakeExtractor::titled(
                "x",
                vec![
                    FakeOutcome::Write {
                        name: "First.mp4".into(),
                        bytes: vec![1; 32],
                    },
                    FakeOutcome::Write {
                        name: "Second.mp4".into(),
                        bytes: vec![2; 48],
                    },
                ],
            ),
        );

        let first = orchestrator.store().create(MediaKind::Video);
        let second = orchestrator.store().create(MediaKind::Video);
        tokio::join!(
            orchestrator.run(&first, request(MediaKind::Video, "22")),
            orchestrator.run(&second, request(MediaKind::Video, "22")),
        );

        let mut names = Vec::new();
        for id in [&first, &second] {
            let job = orchestrator.store().get(id).expect("job");
            assert_eq!(job.status, JobStatus::Completed);
            let filename = job.filename.expect("filename");
            let on_disk = tokio::fs::metadata(orchestrator.job_dir(id).join(&filename))
                .await
                .expect("file in the job's own directory");
            assert_eq!(Some(on_disk.len()), job.file_size_bytes);
            names.push(filename);
        }
        names.sort();
        assert_eq!(names, ["First.mp4", "Second.mp4"]);
    }

    #[tokio::test]
    async fn cancelling_stops_a_hanging_transfer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (orchestrator, _) = orchestrator(dir.path(), FakeExtractor::titled("x", vec![FakeOutcome::Hang]));

        let id = orchestrator.submit(request(MediaKind::Video, "22"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orchestrator.store().cancel(&id));

        let token = orchestrator.store().cancel_token(&id).expect("token");
        assert!(token.is_cancelled());
        let job = orchestrator.store().get(&id).expect("job");
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("Download cancelled"));
    }

    #[tokio::test]
    async fn status_samples_are_monotonic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (orchestrator, _) = orchestrator(
            dir.path(),
            FakeExtractor::titled(
                "Clip",
                vec![
                    FakeOutcome::Fail(ExtractError::DownloadFailed("file is empty".into())),
                    FakeOutcome::Write {
                        name: "Clip.mp4".into(),
                        bytes: vec![0; 16],
                    },
                ],
            ),
        );

        let id = orchestrator.submit(request(MediaKind::Video, "22"));
        let rank = |status: JobStatus| match status {
            JobStatus::Starting => 0,
            JobStatus::Downloading => 1,
            JobStatus::Processing => 2,
            JobStatus::Completed | JobStatus::Error => 3,
        };

        let mut previous = 0;
        for _ in 0..500 {
            let job = orchestrator.store().get(&id).expect("job");
            let current = rank(job.status);
            assert!(current >= previous, "status went backwards");
            previous = current;
            if job.status.is_terminal() {
                assert_eq!(job.status, JobStatus::Completed);
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job did not finish");
    }
}
