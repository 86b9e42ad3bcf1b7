use std::{path::PathBuf, time::Duration};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_DOWNLOADS_DIR: &str = "downloads";
const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_JOB_TTL_SECONDS: u64 = 60 * 60;
const DEFAULT_MAX_TRACKED_JOBS: usize = 1_000;
const DEFAULT_STALE_FILE_SECONDS: u64 = 2 * 60 * 60;
const DEFAULT_METADATA_TIMEOUT_SECONDS: u64 = 60;

/// Runtime settings, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub downloads_dir: PathBuf,
    pub yt_dlp_bin: String,
    pub client_profiles_path: Option<PathBuf>,
    pub max_concurrent_downloads: usize,
    pub job_ttl: Duration,
    pub max_tracked_jobs: usize,
    pub stale_file_age: Duration,
    pub cleanup_on_start: bool,
    pub metadata_timeout: Duration,
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            downloads_dir: PathBuf::from(DEFAULT_DOWNLOADS_DIR),
            yt_dlp_bin: DEFAULT_YT_DLP_BIN.to_string(),
            client_profiles_path: None,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            job_ttl: Duration::from_secs(DEFAULT_JOB_TTL_SECONDS),
            max_tracked_jobs: DEFAULT_MAX_TRACKED_JOBS,
            stale_file_age: Duration::from_secs(DEFAULT_STALE_FILE_SECONDS),
            cleanup_on_start: true,
            metadata_timeout: Duration::from_secs(DEFAULT_METADATA_TIMEOUT_SECONDS),
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: resolve_bind_addr(),
            downloads_dir: read_string_env("DOWNLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.downloads_dir),
            yt_dlp_bin: read_string_env("YT_DLP_BIN").unwrap_or(defaults.yt_dlp_bin),
            client_profiles_path: read_string_env("CLIENT_PROFILES_PATH").map(PathBuf::from),
            max_concurrent_downloads: read_usize_env("MAX_CONCURRENT_DOWNLOADS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_concurrent_downloads),
            job_ttl: read_u64_env("JOB_TTL_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_ttl),
            max_tracked_jobs: read_usize_env("MAX_TRACKED_JOBS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_tracked_jobs),
            stale_file_age: read_u64_env("STALE_FILE_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_file_age),
            cleanup_on_start: read_bool_env("CLEANUP_ON_START").unwrap_or(defaults.cleanup_on_start),
            metadata_timeout: read_u64_env("METADATA_TIMEOUT_SECONDS")
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.metadata_timeout),
            allowed_origins: read_string_env("ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

pub fn read_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    parse_bool(&value)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

pub fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
