use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::error::ValidationError;

static VIDEO_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("static regex"));

const SUPPORTED_DOMAINS: [&str; 3] = ["youtube.com", "youtube-nocookie.com", "youtu.be"];

/// Path prefixes that carry the video id as the next segment.
const ID_PATH_PREFIXES: [&str; 5] = ["embed", "v", "shorts", "live", "e"];

/// A URL that passed validation, with the video id it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoUrl {
    pub original: String,
    pub video_id: String,
}

impl VideoUrl {
    /// Watch URL without playlist or tracking parameters.
    pub fn canonical(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.video_id)
    }
}

pub fn validate_url(input: &str) -> Result<VideoUrl, ValidationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyUrl);
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let parsed = Url::parse(&with_scheme).map_err(|_| ValidationError::UnsupportedUrl)?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::UnsupportedUrl);
    }

    let host = parsed
        .host_str()
        .map(str::to_ascii_lowercase)
        .ok_or(ValidationError::UnsupportedUrl)?;
    let domain = SUPPORTED_DOMAINS
        .iter()
        .find(|domain| host == **domain || host.ends_with(&format!(".{domain}")))
        .ok_or(ValidationError::UnsupportedUrl)?;

    let video_id = if *domain == "youtu.be" {
        first_segment(&parsed)
    } else {
        query_video_id(&parsed).or_else(|| prefixed_segment(&parsed))
    }
    .filter(|candidate| VIDEO_ID_RE.is_match(candidate))
    .ok_or(ValidationError::UnsupportedUrl)?;

    Ok(VideoUrl {
        original: trimmed.to_string(),
        video_id,
    })
}

pub fn is_valid_url(input: &str) -> bool {
    validate_url(input).is_ok()
}

fn first_segment(url: &Url) -> Option<String> {
    url.path_segments()?
        .find(|segment| !segment.is_empty())
        .map(ToString::to_string)
}

fn query_video_id(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "v")
        .map(|(_, value)| value.into_owned())
}

fn prefixed_segment(url: &Url) -> Option<String> {
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    segments
        .windows(2)
        .find(|pair| ID_PATH_PREFIXES.contains(&pair[0]))
        .map(|pair| pair[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_url_shapes() {
        let cases = [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "http://youtube.com/watch?v=dQw4w9WgXcQ&list=PL123",
            "https://m.youtube.com/watch?feature=share&v=dQw4w9WgXcQ",
            "https://music.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ?t=42",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
            "https://www.youtube-nocookie.com/embed/dQw4w9WgXcQ",
            "youtube.com/watch?v=dQw4w9WgXcQ",
        ];

        for case in cases {
            let parsed = validate_url(case).unwrap_or_else(|e| panic!("{case}: {e}"));
            assert_eq!(parsed.video_id, "dQw4w9WgXcQ", "{case}");
        }
    }

    #[test]
    fn rejects_empty_input() {
        assert_eq!(validate_url("   "), Err(ValidationError::EmptyUrl));
    }

    #[test]
    fn rejects_other_hosts_and_shapes() {
        let cases = [
            "https://vimeo.com/123456",
            "https://notyoutube.com/watch?v=dQw4w9WgXcQ",
            "https://www.youtube.com/channel/UC123",
            "https://www.youtube.com/watch?v=short",
            "ftp://youtube.com/watch?v=dQw4w9WgXcQ",
            "not a url at all",
        ];

        for case in cases {
            assert!(!is_valid_url(case), "{case} should be rejected");
        }
    }

    #[test]
    fn canonical_drops_extra_parameters() {
        let parsed = validate_url("https://youtu.be/dQw4w9WgXcQ?si=abc").expect("valid");
        assert_eq!(parsed.canonical(), "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
    }
}
