use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Rejected user input. Always surfaced synchronously as a 400.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please provide a YouTube URL")]
    EmptyUrl,

    #[error("Please provide a valid YouTube URL")]
    UnsupportedUrl,

    #[error("Please provide a format ID")]
    MissingFormat,
}

/// Failures reported by the extraction tool.
#[derive(Debug, Error, Clone)]
pub enum ExtractError {
    #[error("yt-dlp is not installed or not executable: {0}")]
    ToolMissing(String),

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("yt-dlp did not finish within {0} seconds")]
    Timeout(u64),
}

impl ExtractError {
    /// Raw text reported by the tool, without the variant prefix.
    pub fn detail(&self) -> String {
        match self {
            Self::ToolMissing(detail)
            | Self::ExtractionFailed(detail)
            | Self::DownloadFailed(detail) => detail.clone(),
            Self::Timeout(seconds) => format!("timed out after {seconds} seconds"),
        }
    }
}

/// Failures of one download job after submission.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Download(#[from] ExtractError),

    #[error("No downloaded file found for download {0}")]
    FileNotLocated(String),

    #[error("Download cancelled")]
    Cancelled,

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Message stored in the job record and shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Download(error) => FailureCategory::classify(&error.detail()).message(&error.detail()),
            Self::FileNotLocated(_) | Self::Cancelled => self.to_string(),
            Self::Io(error) => FailureCategory::classify(&error.to_string()).message(&error.to_string()),
        }
    }
}

/// Coarse buckets for upstream failure text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Blocked,
    Incomplete,
    Unavailable,
    Network,
    Generic,
}

impl FailureCategory {
    pub fn classify(text: &str) -> Self {
        let lower = text.to_ascii_lowercase();

        if lower.contains("403")
            || lower.contains("forbidden")
            || lower.contains("429")
            || lower.contains("too many requests")
            || lower.contains("sign in to confirm")
            || lower.contains("not a bot")
        {
            Self::Blocked
        } else if lower.contains("empty") || lower.contains("incomplete") {
            Self::Incomplete
        } else if lower.contains("unavailable")
            || lower.contains("private video")
            || lower.contains("not available in your country")
        {
            Self::Unavailable
        } else if lower.contains("network")
            || lower.contains("connection")
            || lower.contains("timed out")
        {
            Self::Network
        } else {
            Self::Generic
        }
    }

    pub fn message(self, detail: &str) -> String {
        match self {
            Self::Blocked => "YouTube is blocking this video download. This can happen due to regional restrictions, copyright protection, or rate limiting. Please try a different video or wait a few minutes before trying again.".to_string(),
            Self::Incomplete => "The video file couldn't be downloaded completely. This usually happens when YouTube blocks the download partway through. Please try again in a few minutes.".to_string(),
            Self::Unavailable => "This video is not available for download. It might be private, deleted, or restricted in your region.".to_string(),
            Self::Network => "Network connection error. Please check your internet connection and try again.".to_string(),
            Self::Generic => format!("Download failed: {detail}"),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: Some("NOT_FOUND"),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: error.to_string(),
            code: Some("INVALID_INPUT"),
        }
    }
}

impl From<ExtractError> for ApiError {
    fn from(error: ExtractError) -> Self {
        match error {
            ExtractError::ToolMissing(_) => Self::internal(error.to_string()),
            ExtractError::Timeout(_) => Self {
                status: StatusCode::GATEWAY_TIMEOUT,
                message: format!("Failed to get video information: {error}"),
                code: Some("EXTRACTION_TIMEOUT"),
            },
            ExtractError::ExtractionFailed(ref detail) | ExtractError::DownloadFailed(ref detail) => {
                let category = FailureCategory::classify(detail);
                let message = match category {
                    FailureCategory::Generic => {
                        format!("Failed to get video information: {detail}")
                    }
                    _ => category.message(detail),
                };
                Self {
                    status: StatusCode::BAD_GATEWAY,
                    message,
                    code: Some("EXTRACTION_FAILED"),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
        });

        (self.status, body).into_response()
    }
}
