use std::{future::Future, path::Path};

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{error::ExtractError, retry::RetryPolicy};

const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";
const SAFARI_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15";

/// Identity and transport settings handed to yt-dlp for one attempt.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ClientProfile {
    pub name: String,
    #[serde(default)]
    pub player_clients: Vec<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_socket_timeout() -> u64 {
    30
}

fn default_retries() -> u32 {
    10
}

impl ClientProfile {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--socket-timeout".to_string(),
            self.socket_timeout_secs.to_string(),
            "--retries".to_string(),
            self.retries.to_string(),
        ];

        if !self.player_clients.is_empty() {
            args.push("--extractor-args".to_string());
            args.push(format!(
                "youtube:player_client={}",
                self.player_clients.join(",")
            ));
        }

        if let Some(user_agent) = &self.user_agent {
            args.push("--user-agent".to_string());
            args.push(user_agent.clone());
        }

        for (name, value) in &self.headers {
            args.push("--add-header".to_string());
            args.push(format!("{name}:{value}"));
        }

        args
    }
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("could not read client profiles from {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid client profiles in {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("client profile list in {0} is empty")]
    Empty(String),
}

/// Ordered list of profiles consumed by one fallback loop.
#[derive(Debug, Clone)]
pub struct ProfileSet {
    profiles: Vec<ClientProfile>,
    policy: RetryPolicy,
}

impl ProfileSet {
    pub fn new(profiles: Vec<ClientProfile>, policy: RetryPolicy) -> Self {
        Self { profiles, policy }
    }

    /// Reads a JSON array of profiles. Order in the file is priority order.
    pub async fn load(path: &Path, policy: RetryPolicy) -> Result<Self, ProfileError> {
        let display = path.display().to_string();
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ProfileError::Read {
                path: display.clone(),
                source,
            })?;
        let profiles: Vec<ClientProfile> =
            serde_json::from_str(&contents).map_err(|source| ProfileError::Parse {
                path: display.clone(),
                source,
            })?;

        if profiles.is_empty() {
            return Err(ProfileError::Empty(display));
        }

        Ok(Self::new(profiles, policy))
    }

    pub fn profiles(&self) -> &[ClientProfile] {
        &self.profiles
    }

    /// Tries each profile in order and returns the first success. Any single
    /// failure is non-fatal except a missing tool; if every profile fails the
    /// last error is returned.
    pub async fn run<T, F, Fut>(
        &self,
        token: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ExtractError>
    where
        F: FnMut(&ClientProfile) -> Fut,
        Fut: Future<Output = Result<T, ExtractError>>,
    {
        let mut last_error = None;

        for (index, profile) in self.profiles.iter().enumerate() {
            if index > 0 && !self.policy.wait(index as u32, token).await {
                break;
            }

            match operation(profile).await {
                Ok(value) => {
                    if index > 0 {
                        info!(profile = %profile.name, attempt = index + 1, "client profile succeeded");
                    }
                    return Ok(value);
                }
                Err(error @ ExtractError::ToolMissing(_)) => return Err(error),
                Err(error) => {
                    warn!(
                        profile = %profile.name,
                        attempt = index + 1,
                        total = self.profiles.len(),
                        error = %error,
                        "client profile failed"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ExtractError::ExtractionFailed("no client profiles were attempted".to_string())
        }))
    }
}

impl Default for ProfileSet {
    fn default() -> Self {
        let browser_headers = vec![
            (
                "Accept".to_string(),
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
            ),
            ("Accept-Language".to_string(), "en-us,en;q=0.5".to_string()),
        ];

        let profiles = vec![
            ClientProfile {
                name: "android-web".to_string(),
                player_clients: vec!["android".to_string(), "web".to_string()],
                user_agent: Some(CHROME_USER_AGENT.to_string()),
                headers: browser_headers.clone(),
                socket_timeout_secs: default_socket_timeout(),
                retries: default_retries(),
            },
            ClientProfile {
                name: "web-safari".to_string(),
                player_clients: vec!["web_safari".to_string()],
                user_agent: Some(SAFARI_USER_AGENT.to_string()),
                headers: browser_headers,
                socket_timeout_secs: default_socket_timeout(),
                retries: default_retries(),
            },
            ClientProfile {
                name: "ios".to_string(),
                player_clients: vec!["ios".to_string()],
                user_agent: None,
                headers: Vec::new(),
                socket_timeout_secs: default_socket_timeout(),
                retries: 5,
            },
            ClientProfile {
                name: "tool-default".to_string(),
                player_clients: Vec::new(),
                user_agent: None,
                headers: Vec::new(),
                socket_timeout_secs: default_socket_timeout(),
                retries: 5,
            },
        ];

        Self::new(profiles, RetryPolicy::default())
    }
}
