use std::{
    collections::VecDeque,
    io::ErrorKind,
    path::PathBuf,
    process::Stdio,
    sync::LazyLock,
    time::Duration,
};

use async_trait::async_trait;
use regex::Regex;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    ClientProfile, FetchRequest, FetchedMedia, MediaExtractor, MediaKind, MediaMetadata,
    ProfileSet, ProgressEvent, ProgressSink,
};
use crate::error::ExtractError;

const PROGRESS_PREFIX: &str = "[progress]";
const PROGRESS_TEMPLATE: &str = "download:[progress] %(progress.status)s %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s %(progress.speed)s %(progress.eta)s";
const POSTPROCESS_PREFIX: &str = "[postprocess]";
const POSTPROCESS_TEMPLATE: &str =
    "postprocess:[postprocess] %(progress.status)s %(progress.postprocessor)s";
/// Post-processor banners printed when the tool is not in quiet mode.
const POSTPROCESSOR_BANNERS: [&str; 4] = ["[Merger]", "[ExtractAudio]", "[VideoConvertor]", "[VideoRemuxer]"];
const MAX_STDERR_LINES: usize = 50;

static HUMAN_PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[download\]\s+(\d+(?:\.\d+)?)%\s+of\s+~?\s*(\d+(?:\.\d+)?)\s*([KMGT]?i?B)(?:\s+at\s+(\d+(?:\.\d+)?)\s*([KMGT]?i?B)/s)?(?:\s+ETA\s+(\d+(?::\d+){0,2}))?",
    )
    .expect("static regex")
});

/// Adapter that shells out to the yt-dlp binary.
pub struct YtDlp {
    binary: String,
    profiles: ProfileSet,
    metadata_timeout: Duration,
}

impl YtDlp {
    pub fn new(binary: impl Into<String>, profiles: ProfileSet, metadata_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            profiles,
            metadata_timeout,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.kill_on_drop(true).stdin(Stdio::null());
        command
    }

    fn spawn_error(&self, error: std::io::Error) -> ExtractError {
        if error.kind() == ErrorKind::NotFound {
            ExtractError::ToolMissing(format!(
                "{} was not found. Install yt-dlp and restart the server.",
                self.binary
            ))
        } else {
            ExtractError::ToolMissing(format!("could not run {}: {error}", self.binary))
        }
    }

    async fn metadata_with(
        &self,
        url: &str,
        profile: &ClientProfile,
    ) -> Result<MediaMetadata, ExtractError> {
        let mut command = self.command();
        command
            .args(["-J", "--no-playlist", "--no-warnings"])
            .args(profile.args())
            .arg(url);

        debug!(profile = %profile.name, url, "fetching metadata");
        let output = timeout(self.metadata_timeout, command.output())
            .await
            .map_err(|_| ExtractError::Timeout(self.metadata_timeout.as_secs()))?
            .map_err(|error| self.spawn_error(error))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::ExtractionFailed(run_error_message(
                stderr.lines(),
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|error| {
            ExtractError::ExtractionFailed(format!("could not parse yt-dlp metadata: {error}"))
        })
    }

    async fn media_with(
        &self,
        request: &FetchRequest,
        profile: &ClientProfile,
        sink: &dyn ProgressSink,
    ) -> Result<FetchedMedia, ExtractError> {
        let mut command = self.command();
        command
            .args(media_args(request))
            .args(profile.args())
            .arg(&request.url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(
            profile = %profile.name,
            selector = %request.selector,
            url = %request.url,
            "starting yt-dlp transfer"
        );
        let mut child = command.spawn().map_err(|error| self.spawn_error(error))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractError::DownloadFailed("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExtractError::DownloadFailed("stderr was not captured".to_string()))?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut printed_path: Option<String> = None;
        let mut error_lines: VecDeque<String> = VecDeque::new();

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_progress_line(&line) {
                            sink.on_progress(event);
                        } else if let Some(value) = non_progress_line(&line) {
                            printed_path = Some(value.to_string());
                        }
                    }
                    _ => stdout_open = false,
                },
                line = stderr_lines.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_progress_line(&line) {
                            sink.on_progress(event);
                        } else if let Some(value) = non_progress_line(&line) {
                            if error_lines.len() == MAX_STDERR_LINES {
                                error_lines.pop_front();
                            }
                            error_lines.push_back(value.to_string());
                        }
                    }
                    _ => stderr_open = false,
                },
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|error| ExtractError::DownloadFailed(format!("yt-dlp did not exit: {error}")))?;

        if !status.success() {
            return Err(ExtractError::DownloadFailed(run_error_message(
                error_lines.iter().map(String::as_str),
            )));
        }

        Ok(FetchedMedia {
            reported_path: printed_path.map(PathBuf::from),
        })
    }
}

#[async_trait]
impl MediaExtractor for YtDlp {
    async fn fetch_metadata(&self, url: &str) -> Result<MediaMetadata, ExtractError> {
        let token = CancellationToken::new();
        self.profiles
            .run(&token, |profile| {
                let profile = profile.clone();
                async move { self.metadata_with(url, &profile).await }
            })
            .await
    }

    async fn fetch_media(
        &self,
        request: &FetchRequest,
        sink: &dyn ProgressSink,
    ) -> Result<FetchedMedia, ExtractError> {
        let token = CancellationToken::new();
        self.profiles
            .run(&token, |profile| {
                let profile = profile.clone();
                async move { self.media_with(request, &profile, sink).await }
            })
            .await
    }
}

fn media_args(request: &FetchRequest) -> Vec<String> {
    let output_template = format!("{}/%(title)s.%(ext)s", request.output_dir.to_string_lossy());

    let mut args = vec![
        "-f".to_string(),
        request.selector.clone(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--newline".to_string(),
        "--progress".to_string(),
        "--progress-template".to_string(),
        PROGRESS_TEMPLATE.to_string(),
        "--progress-template".to_string(),
        POSTPROCESS_TEMPLATE.to_string(),
        "--print".to_string(),
        "after_move:filepath".to_string(),
        "--force-overwrites".to_string(),
        "--fragment-retries".to_string(),
        "10".to_string(),
        "--skip-unavailable-fragments".to_string(),
        "-o".to_string(),
        output_template,
    ];

    match request.kind {
        MediaKind::Video => {
            args.push("--merge-output-format".to_string());
            args.push("mp4".to_string());
        }
        MediaKind::Audio => {
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push("mp3".to_string());
            args.push("--audio-quality".to_string());
            args.push("192K".to_string());
        }
    }

    args
}

fn non_progress_line(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with("[download]") {
        None
    } else {
        Some(trimmed)
    }
}

/// Picks the most telling line of yt-dlp's error output.
fn run_error_message<'a>(lines: impl Iterator<Item = &'a str>) -> String {
    let lines: Vec<&str> = lines
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    lines
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|line| line.to_string())
        .unwrap_or_else(|| "yt-dlp could not complete the operation".to_string())
}

/// Parses either the machine-readable template lines or yt-dlp's default
/// `[download]  12.5% of ~ 310.04MiB at 374.36KiB/s ETA 11:59` line.
///
/// A `finished` line ends one stream only; the end of the whole transfer is
/// signalled by a post-processor starting or by the process exiting.
pub fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let trimmed = line.trim();

    if let Some(rest) = trimmed.strip_prefix(POSTPROCESS_PREFIX) {
        let mut fields = rest.split_whitespace();
        return match (fields.next()?, fields.next()) {
            ("started", step) => Some(ProgressEvent::PostProcessing {
                step: step.unwrap_or("unknown").to_string(),
            }),
            _ => None,
        };
    }

    if let Some(banner) = POSTPROCESSOR_BANNERS
        .iter()
        .find(|banner| trimmed.starts_with(**banner))
    {
        return Some(ProgressEvent::PostProcessing {
            step: banner.trim_matches(['[', ']']).to_string(),
        });
    }

    if let Some(rest) = trimmed.strip_prefix(PROGRESS_PREFIX) {
        let mut fields = rest.split_whitespace();
        let status = fields.next()?;
        let downloaded = parse_number(fields.next()).unwrap_or(0.0) as u64;
        let total = parse_number(fields.next());
        let estimate = parse_number(fields.next());
        let speed = parse_number(fields.next());
        let eta = parse_number(fields.next()).map(|value| value as u64);
        let total_bytes = total.or(estimate).filter(|v| *v > 0.0).map(|v| v as u64);

        return match status {
            "downloading" => Some(ProgressEvent::Downloading {
                downloaded_bytes: downloaded,
                total_bytes,
                speed,
                eta,
            }),
            "finished" => Some(ProgressEvent::StreamFinished {
                downloaded_bytes: downloaded,
                total_bytes,
            }),
            _ => None,
        };
    }

    let caps = HUMAN_PROGRESS_RE.captures(trimmed)?;
    let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
    let total = caps.get(2)?.as_str().parse::<f64>().ok()? * unit_multiplier(caps.get(3)?.as_str());
    let speed = match (caps.get(4), caps.get(5)) {
        (Some(value), Some(unit)) => value
            .as_str()
            .parse::<f64>()
            .ok()
            .map(|value| value * unit_multiplier(unit.as_str())),
        _ => None,
    };
    let eta = caps.get(6).and_then(|value| parse_clock(value.as_str()));
    let downloaded = (total * percent / 100.0).round() as u64;

    if percent >= 100.0 {
        Some(ProgressEvent::StreamFinished {
            downloaded_bytes: downloaded,
            total_bytes: Some(total as u64),
        })
    } else {
        Some(ProgressEvent::Downloading {
            downloaded_bytes: downloaded,
            total_bytes: Some(total as u64),
            speed,
            eta,
        })
    }
}

fn parse_number(value: Option<&str>) -> Option<f64> {
    value
        .filter(|value| *value != "NA" && *value != "None")
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value >= 0.0)
}

fn unit_multiplier(unit: &str) -> f64 {
    match unit {
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" => 1_000.0,
        "MB" => 1_000_000.0,
        "GB" => 1_000_000_000.0,
        "TB" => 1_000_000_000_000.0,
        _ => 1.0,
    }
}

fn parse_clock(value: &str) -> Option<u64> {
    value
        .split(':')
        .try_fold(0u64, |acc, part| part.parse::<u64>().ok().map(|n| acc * 60 + n))
}
