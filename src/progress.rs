//! In-memory job tracking.
//!
//! [`JobStore`] owns every [`DownloadJob`] record. Writers go through methods
//! that enforce the forward-only lifecycle; readers get cloned snapshots.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::{
    extractor::{MediaKind, ProgressEvent, ProgressSink},
    locate::remove_job_output,
};

/// Minimum spacing between accepted `downloading` snapshots.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Downloading,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Downloading => 1,
            Self::Processing => 2,
            Self::Completed | Self::Error => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Whether a record in `self` may be overwritten with `next`.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Error || next.rank() >= self.rank()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadJob {
    pub id: String,
    pub kind: MediaKind,
    pub status: JobStatus,
    pub percent: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed: f64,
    pub eta: u64,
    pub speed_text: String,
    pub eta_text: String,
    pub file_size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub attempt: u32,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bytes of streams already finished in the current attempt. A merged
    /// video+audio transfer reports each stream from zero.
    #[serde(skip)]
    finished_stream_bytes: u64,
}

impl DownloadJob {
    fn new(id: String, kind: MediaKind) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            status: JobStatus::Starting,
            percent: 0.0,
            downloaded_bytes: 0,
            total_bytes: None,
            speed: 0.0,
            eta: 0,
            speed_text: "Starting...".to_string(),
            eta_text: "Calculating...".to_string(),
            file_size: "-- MB".to_string(),
            filename: None,
            file_size_bytes: None,
            error: None,
            title: None,
            attempt: 0,
            attempts: 0,
            created_at: now,
            updated_at: now,
            finished_stream_bytes: 0,
        }
    }
}

struct JobEntry {
    job: DownloadJob,
    cancel: CancellationToken,
}

/// Shared, explicitly owned map of job records with TTL and size bounds.
#[derive(Clone)]
pub struct JobStore {
    inner: Arc<RwLock<HashMap<String, JobEntry>>>,
    evicted: Arc<Mutex<Vec<String>>>,
    ttl: Duration,
    max_entries: usize,
}

impl JobStore {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            evicted: Arc::new(Mutex::new(Vec::new())),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Registers a new job in `starting` state and returns its id.
    pub fn create(&self, kind: MediaKind) -> String {
        let id = Uuid::new_v4().to_string();
        {
            let mut jobs = self.inner.write();
            jobs.insert(
                id.clone(),
                JobEntry {
                    job: DownloadJob::new(id.clone(), kind),
                    cancel: CancellationToken::new(),
                },
            );
        }
        self.prune_at(Utc::now());
        id
    }

    pub fn get(&self, id: &str) -> Option<DownloadJob> {
        self.inner.read().get(id).map(|entry| entry.job.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel_token(&self, id: &str) -> Option<CancellationToken> {
        self.inner.read().get(id).map(|entry| entry.cancel.clone())
    }

    /// Applies `update` if moving to `next` keeps the lifecycle forward-only.
    /// Returns whether the record was changed.
    fn transition(&self, id: &str, next: JobStatus, update: impl FnOnce(&mut DownloadJob)) -> bool {
        let mut jobs = self.inner.write();
        let Some(entry) = jobs.get_mut(id) else {
            return false;
        };

        if !entry.job.status.can_advance_to(next) {
            debug!(job = id, from = ?entry.job.status, to = ?next, "ignored backward transition");
            return false;
        }

        entry.job.status = next;
        update(&mut entry.job);
        entry.job.updated_at = Utc::now();
        true
    }

    pub fn set_title(&self, id: &str, title: &str) {
        if let Some(entry) = self.inner.write().get_mut(id) {
            entry.job.title = Some(title.to_string());
        }
    }

    /// Marks the start of transfer attempt `attempt` of `attempts`.
    pub fn begin_attempt(&self, id: &str, attempt: u32, attempts: u32) -> bool {
        self.transition(id, JobStatus::Downloading, |job| {
            job.attempt = attempt;
            job.attempts = attempts;
            job.finished_stream_bytes = 0;
            if job.downloaded_bytes == 0 {
                job.speed_text = format!("Trying format {attempt}/{attempts}...");
            }
        })
    }

    pub fn apply_progress(&self, id: &str, event: &ProgressEvent) -> bool {
        match *event {
            ProgressEvent::Downloading {
                downloaded_bytes,
                total_bytes,
                speed,
                eta,
            } => self.transition(id, JobStatus::Downloading, |job| {
                let offset = job.finished_stream_bytes;
                let downloaded = offset + downloaded_bytes;
                let total = total_bytes.filter(|total| *total > 0).map(|total| offset + total);
                let percent = total
                    .map(|total| (downloaded as f64 / total as f64 * 100.0).min(100.0))
                    .map(|percent| (percent * 10.0).round() / 10.0)
                    .unwrap_or(0.0);

                job.percent = job.percent.max(percent);
                job.downloaded_bytes = downloaded;
                job.total_bytes = total.or(job.total_bytes);
                job.speed = speed.unwrap_or(0.0);
                job.eta = eta.unwrap_or(0);
                job.speed_text = format_speed(job.speed);
                job.eta_text = format_eta(job.eta);
                job.file_size = job
                    .total_bytes
                    .map(format_bytes)
                    .unwrap_or_else(|| "-- MB".to_string());
            }),
            ProgressEvent::StreamFinished {
                downloaded_bytes,
                total_bytes,
            } => self.transition(id, JobStatus::Downloading, |job| {
                let stream_bytes = total_bytes.unwrap_or(0).max(downloaded_bytes);
                job.finished_stream_bytes += stream_bytes;
                job.downloaded_bytes = job.finished_stream_bytes;
                job.total_bytes = Some(job.finished_stream_bytes);
                job.speed = 0.0;
                job.eta = 0;
                job.speed_text = format_speed(0.0);
                job.eta_text = "Finishing...".to_string();
                job.file_size = format_bytes(job.finished_stream_bytes);
            }),
            ProgressEvent::PostProcessing { ref step } => {
                debug!(job = id, step = %step, "post-processing started");
                self.mark_processing(id)
            }
        }
    }

    /// Transfer done; merging, transcoding or flushing output remains.
    pub fn mark_processing(&self, id: &str) -> bool {
        self.transition(id, JobStatus::Processing, |job| {
            job.percent = job.percent.max(99.0);
            job.speed = 0.0;
            job.eta = 0;
            job.speed_text = "Processing...".to_string();
            job.eta_text = "Almost done".to_string();
        })
    }

    pub fn complete(&self, id: &str, filename: &str, size: u64) -> bool {
        self.transition(id, JobStatus::Completed, |job| {
            job.percent = 100.0;
            job.filename = Some(filename.to_string());
            job.file_size_bytes = Some(size);
            job.total_bytes = Some(size);
            job.downloaded_bytes = size;
            job.speed = 0.0;
            job.eta = 0;
            job.speed_text = "Completed".to_string();
            job.eta_text = "Done".to_string();
            job.file_size = format_bytes(size);
        })
    }

    pub fn fail(&self, id: &str, message: &str) -> bool {
        self.transition(id, JobStatus::Error, |job| {
            job.percent = 0.0;
            job.error = Some(message.to_string());
            job.speed = 0.0;
            job.eta = 0;
            job.speed_text = "Error".to_string();
            job.eta_text = "Failed".to_string();
            job.file_size = "-- MB".to_string();
        })
    }

    /// Stops an in-flight job. Returns `false` for unknown or finished jobs.
    pub fn cancel(&self, id: &str) -> bool {
        let failed = self.fail(id, "Download cancelled");
        if failed && let Some(token) = self.cancel_token(id) {
            token.cancel();
        }
        failed
    }

    /// Drops finished jobs older than the TTL, then enforces the size cap by
    /// evicting the oldest finished jobs first. Evicted ids are queued for
    /// [`JobStore::take_evicted`].
    pub fn prune_at(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::MAX);
        let mut jobs = self.inner.write();

        let mut removed: Vec<String> = jobs
            .iter()
            .filter(|(_, entry)| entry.job.status.is_terminal() && now - entry.job.updated_at > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &removed {
            jobs.remove(id);
        }

        if jobs.len() > self.max_entries {
            let mut order: Vec<(bool, DateTime<Utc>, String)> = jobs
                .iter()
                .map(|(id, entry)| (!entry.job.status.is_terminal(), entry.job.updated_at, id.clone()))
                .collect();
            order.sort();

            let overflow = jobs.len() - self.max_entries;
            for (_, _, id) in order.into_iter().take(overflow) {
                if let Some(entry) = jobs.remove(&id) {
                    entry.cancel.cancel();
                    removed.push(id);
                }
            }
        }
        drop(jobs);

        let count = removed.len();
        if count > 0 {
            self.evicted.lock().extend(removed);
        }
        count
    }

    /// Ids evicted since the last call.
    pub fn take_evicted(&self) -> Vec<String> {
        std::mem::take(&mut *self.evicted.lock())
    }

    /// Prunes records and deletes the output directory of every evicted job
    /// under `output_root`, including jobs evicted by [`JobStore::create`].
    pub async fn prune_with_output(&self, now: DateTime<Utc>, output_root: &Path) -> usize {
        let removed = self.prune_at(now);
        for id in self.take_evicted() {
            remove_job_output(output_root, &id).await;
        }
        removed
    }

    /// Runs [`JobStore::prune_with_output`] every `interval` until the handle
    /// is aborted.
    pub fn spawn_pruner(&self, interval: Duration, output_root: PathBuf) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = store.prune_with_output(Utc::now(), &output_root).await;
                if removed > 0 {
                    debug!(removed, remaining = store.len(), "pruned finished jobs");
                }
            }
        })
    }
}

/// Progress sink bound to one job that drops `downloading` snapshots arriving
/// faster than `min_interval`. Status changes always pass.
pub struct ThrottledProgress {
    store: JobStore,
    id: String,
    min_interval: Duration,
    last_accepted: Mutex<Option<Instant>>,
}

impl ThrottledProgress {
    pub fn new(store: JobStore, id: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            store,
            id: id.into(),
            min_interval,
            last_accepted: Mutex::new(None),
        }
    }
}

impl ProgressSink for ThrottledProgress {
    fn on_progress(&self, event: ProgressEvent) {
        if matches!(event, ProgressEvent::Downloading { .. }) {
            let now = Instant::now();
            let mut last = self.last_accepted.lock();
            if last.is_some_and(|previous| now.duration_since(previous) < self.min_interval) {
                return;
            }
            *last = Some(now);
        }

        self.store.apply_progress(&self.id, &event);
    }
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} TB")
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec <= 0.0 || !bytes_per_sec.is_finite() {
        return "0 B/s".to_string();
    }
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

pub fn format_eta(seconds: u64) -> String {
    match seconds {
        0 => "0s".to_string(),
        1..=59 => format!("{seconds}s"),
        60..=3599 => format!("{}m {}s", seconds / 60, seconds % 60),
        _ => format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::extractor::parse_progress_line;

    fn store() -> JobStore {
        JobStore::new(Duration::from_secs(60), 100)
    }

    fn downloading(downloaded: u64, total: u64) -> ProgressEvent {
        ProgressEvent::Downloading {
            downloaded_bytes: downloaded,
            total_bytes: Some(total),
            speed: Some(2048.0),
            eta: Some(75),
        }
    }

    #[test]
    fn new_job_starts_in_starting_state() {
        let store = store();
        let id = store.create(MediaKind::Video);
        let job = store.get(&id).expect("job exists");

        assert_eq!(job.status, JobStatus::Starting);
        assert_eq!(job.percent, 0.0);
        assert!(job.filename.is_none() && job.error.is_none());
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let store = store();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    (0..50).map(|_| store.create(MediaKind::Audio)).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("thread finished") {
                assert!(seen.insert(id), "duplicate job id");
            }
        }
        assert_eq!(seen.len(), 400);
    }

    #[test]
    fn progress_updates_percent_and_text() {
        let store = store();
        let id = store.create(MediaKind::Video);

        assert!(store.apply_progress(&id, &downloading(512, 2048)));
        let job = store.get(&id).expect("job exists");
        assert_eq!(job.status, JobStatus::Downloading);
        assert_eq!(job.percent, 25.0);
        assert_eq!(job.speed_text, "2.0 KB/s");
        assert_eq!(job.eta_text, "1m 15s");
        assert_eq!(job.file_size, "2.0 KB");
    }

    #[test]
    fn percent_never_decreases_while_downloading() {
        let store = store();
        let id = store.create(MediaKind::Video);

        store.apply_progress(&id, &downloading(800, 1000));
        // A later fallback format restarting from zero must not move the bar back.
        store.apply_progress(&id, &downloading(100, 5000));
        assert_eq!(store.get(&id).expect("job").percent, 80.0);
    }

    #[test]
    fn status_never_moves_backwards() {
        let store = store();
        let id = store.create(MediaKind::Video);

        store.apply_progress(
            &id,
            &ProgressEvent::PostProcessing {
                step: "Merger".to_string(),
            },
        );
        assert!(!store.apply_progress(&id, &downloading(1, 10)));
        assert!(!store.begin_attempt(&id, 2, 3));
        assert_eq!(store.get(&id).expect("job").status, JobStatus::Processing);

        assert!(store.complete(&id, "clip.mp4", 10));
        assert!(!store.fail(&id, "late failure"));
        assert!(!store.apply_progress(&id, &downloading(1, 10)));

        let job = store.get(&id).expect("job");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.filename.as_deref(), Some("clip.mp4"));
        assert!(job.error.is_none());
    }

    #[test]
    fn error_is_reachable_from_any_live_state() {
        let store = store();
        for setup in 0..3 {
            let id = store.create(MediaKind::Audio);
            if setup >= 1 {
                store.apply_progress(&id, &downloading(1, 10));
            }
            if setup >= 2 {
                store.mark_processing(&id);
            }
            assert!(store.fail(&id, "boom"));
            assert_eq!(store.get(&id).expect("job").error.as_deref(), Some("boom"));
        }
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let store = store();
        assert!(store.get("missing").is_none());
        assert!(!store.complete("missing", "x.mp4", 1));
        assert!(!store.cancel("missing"));
    }

    #[test]
    fn cancel_marks_error_and_trips_token() {
        let store = store();
        let id = store.create(MediaKind::Video);
        let token = store.cancel_token(&id).expect("token");

        assert!(store.cancel(&id));
        assert!(token.is_cancelled());
        assert_eq!(store.get(&id).expect("job").error.as_deref(), Some("Download cancelled"));
    }

    #[test]
    fn prune_drops_expired_finished_jobs_only() {
        let store = JobStore::new(Duration::from_secs(10), 100);
        let done = store.create(MediaKind::Video);
        let running = store.create(MediaKind::Video);
        store.complete(&done, "a.mp4", 1);
        store.apply_progress(&running, &downloading(1, 2));

        let later = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(store.prune_at(later), 1);
        assert!(store.get(&done).is_none());
        assert!(store.get(&running).is_some());
    }

    #[test]
    fn cap_evicts_finished_jobs_first() {
        let store = JobStore::new(Duration::from_secs(3600), 2);
        let finished = store.create(MediaKind::Video);
        store.fail(&finished, "x");
        let live = store.create(MediaKind::Video);
        let newest = store.create(MediaKind::Video);

        assert_eq!(store.len(), 2);
        assert!(store.get(&finished).is_none());
        assert!(store.get(&live).is_some());
        assert!(store.get(&newest).is_some());
    }

    #[test]
    fn throttle_drops_rapid_downloading_events() {
        let store = store();
        let id = store.create(MediaKind::Video);
        let sink = ThrottledProgress::new(store.clone(), id.clone(), Duration::from_secs(60));

        sink.on_progress(downloading(100, 1000));
        sink.on_progress(downloading(900, 1000));
        assert_eq!(store.get(&id).expect("job").percent, 10.0);

        sink.on_progress(ProgressEvent::StreamFinished {
            downloaded_bytes: 1000,
            total_bytes: Some(1000),
        });
        let job = store.get(&id).expect("job");
        assert_eq!(job.status, JobStatus::Downloading);
        assert_eq!(job.downloaded_bytes, 1000);

        sink.on_progress(ProgressEvent::PostProcessing {
            step: "ExtractAudio".to_string(),
        });
        let job = store.get(&id).expect("job");
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.percent, 99.0);
    }

    #[test]
    fn second_stream_of_merged_download_keeps_reporting() {
        let store = store();
        let id = store.create(MediaKind::Video);
        let sink = ThrottledProgress::new(store.clone(), id.clone(), Duration::ZERO);
        let feed = |line: &str| {
            sink.on_progress(parse_progress_line(line).expect("progress line"));
            store.get(&id).expect("job")
        };

        feed("[progress] downloading 500 1000 NA 100.0 5");
        let job = feed("[progress] finished 1000 1000 NA NA NA");
        assert_eq!(job.status, JobStatus::Downloading);

        let job = feed("[progress] downloading 10 4000 NA 64.0 60");
        assert_eq!(job.status, JobStatus::Downloading);
        assert_eq!(job.downloaded_bytes, 1010);
        assert_eq!(job.percent, 50.0);
        assert_eq!(job.speed_text, "64.0 B/s");

        let job = feed("[progress] downloading 3000 4000 NA 2048.0 1");
        assert_eq!(job.status, JobStatus::Downloading);
        assert_eq!(job.downloaded_bytes, 4000);
        assert_eq!(job.total_bytes, Some(5000));
        assert_eq!(job.percent, 80.0);
        assert_eq!(job.speed_text, "2.0 KB/s");

        let job = feed("[postprocess] started Merger");
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.percent, 99.0);
    }

    #[test]
    fn new_attempt_restarts_stream_accounting() {
        let store = store();
        let id = store.create(MediaKind::Video);

        store.apply_progress(
            &id,
            &ProgressEvent::StreamFinished {
                downloaded_bytes: 700,
                total_bytes: Some(700),
            },
        );
        store.begin_attempt(&id, 2, 3);
        store.apply_progress(&id, &downloading(100, 200));

        let job = store.get(&id).expect("job");
        assert_eq!(job.downloaded_bytes, 100);
        assert_eq!(job.total_bytes, Some(200));
    }

    #[tokio::test]
    async fn pruning_deletes_output_of_evicted_jobs() {
        let root = tempfile::tempdir().expect("tempdir");
        let store = JobStore::new(Duration::from_secs(10), 100);
        let done = store.create(MediaKind::Video);
        let running = store.create(MediaKind::Video);
        for id in [&done, &running] {
            let dir = root.path().join(id);
            tokio::fs::create_dir_all(&dir).await.expect("job dir");
            tokio::fs::write(dir.join("clip.mp4"), b"data").await.expect("file");
        }
        store.complete(&done, "clip.mp4", 4);

        let later = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(store.prune_with_output(later, root.path()).await, 1);
        assert!(!root.path().join(&done).exists());
        assert!(root.path().join(&running).join("clip.mp4").is_file());
        assert!(store.take_evicted().is_empty());
    }

    #[tokio::test]
    async fn cap_evictions_during_create_are_cleaned_later() {
        let root = tempfile::tempdir().expect("tempdir");
        let store = JobStore::new(Duration::from_secs(3600), 1);
        let first = store.create(MediaKind::Audio);
        tokio::fs::create_dir_all(root.path().join(&first)).await.expect("job dir");
        store.fail(&first, "x");

        let second = store.create(MediaKind::Audio);
        assert!(store.get(&first).is_none());
        assert!(root.path().join(&first).exists());

        store.prune_with_output(Utc::now(), root.path()).await;
        assert!(!root.path().join(&first).exists());
        assert!(store.get(&second).is_some());
    }

    #[test]
    fn human_readable_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_speed(0.0), "0 B/s");
        assert_eq!(format_eta(42), "42s");
        assert_eq!(format_eta(3725), "1h 2m");
    }
}
