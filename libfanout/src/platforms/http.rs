//! HTTP plumbing shared by the platform adapters
//!
//! Response classification:
//! - HTTP 401/403 → `PlatformError::Authentication`
//! - HTTP 400/422 → `PlatformError::Validation`
//! - HTTP 429 → `PlatformError::RateLimit`
//! - Any other non-2xx → `PlatformError::Posting`
//! - Malformed success bodies → `PlatformError::Posting`
//! - Transport failures → `PlatformError::Network`

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde_json::Value;

use crate::config::MediaConfig;
use crate::error::{PlatformError, Result};

/// Longest error body excerpt carried into an error message
const MAX_ERROR_BODY: usize = 300;

/// Bounds for media processing status checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollSettings {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(config.poll_attempts, config.poll_interval())
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from_config(&MediaConfig::default())
    }
}

/// Client used by every adapter
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .user_agent(concat!("fanout/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| PlatformError::Network(format!("Failed to build HTTP client: {}", e)))?;
    Ok(client)
}

pub fn transport_error(platform: &str, context: &str, error: reqwest::Error) -> PlatformError {
    PlatformError::Network(format!("{} {}: {}", platform, context, error))
}

/// Map a non-success status and its body to a platform error
pub fn classify_status(platform: &str, status: StatusCode, body: &str) -> PlatformError {
    let message = format!(
        "{} returned HTTP {}: {}",
        platform,
        status.as_u16(),
        error_message(body)
    );

    match status.as_u16() {
        401 | 403 => PlatformError::Authentication(message),
        400 | 422 => PlatformError::Validation(message),
        429 => PlatformError::RateLimit(message),
        _ => PlatformError::Posting(message),
    }
}

/// Best human-readable message from a vendor error body
pub fn error_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let candidates = [
            json.pointer("/error/message"),
            json.pointer("/errors/0/message"),
            json.get("detail"),
            json.get("message"),
            json.get("error_description"),
            json.get("error"),
        ];
        if let Some(message) = candidates
            .into_iter()
            .flatten()
            .find_map(|value| value.as_str())
        {
            return message.to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    trimmed.chars().take(MAX_ERROR_BODY).collect()
}

/// Fail on non-success statuses, otherwise hand back the response
pub async fn check_status(
    platform: &str,
    response: Response,
) -> std::result::Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(platform, status, &body))
}

/// Check the status and parse a JSON body
pub async fn read_json(
    platform: &str,
    response: Response,
) -> std::result::Result<Value, PlatformError> {
    let response = check_status(platform, response).await?;
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(platform, "response body", e))?;

    serde_json::from_str(&body).map_err(|e| {
        PlatformError::Posting(format!("{} returned a malformed response: {}", platform, e))
    })
}

/// Pull a string (or number) field out of a success body
pub fn required_str(
    platform: &str,
    body: &Value,
    pointer: &str,
) -> std::result::Result<String, PlatformError> {
    match body.pointer(pointer) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(PlatformError::Posting(format!(
            "{} response is missing '{}'",
            platform, pointer
        ))),
    }
}

/// Download a media file for binary upload
pub async fn download(
    client: &reqwest::Client,
    platform: &str,
    url: &str,
) -> std::result::Result<Vec<u8>, PlatformError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| transport_error(platform, "media download", e))?;

    if !response.status().is_success() {
        return Err(PlatformError::MediaProcessing(format!(
            "Could not fetch media {} for {} (HTTP {})",
            url,
            platform,
            response.status().as_u16()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| transport_error(platform, "media download", e))?;
    Ok(bytes.to_vec())
}

/// Append hashtags the content does not already mention
///
/// Tags are rendered as `#tag`, space separated, after a blank line. A tag
/// already present in the content (case-insensitive) is not repeated.
pub fn compose_caption(content: &str, hashtags: &[String]) -> String {
    let lower = content.to_lowercase();
    let mut seen: Vec<String> = Vec::new();
    let mut tags: Vec<String> = Vec::new();

    for tag in hashtags {
        let tag = tag.trim().trim_start_matches('#');
        if tag.is_empty() {
            continue;
        }
        let rendered = format!("#{}", tag);
        let key = rendered.to_lowercase();
        if contains_tag(&lower, &key) || seen.contains(&key) {
            continue;
        }
        seen.push(key);
        tags.push(rendered);
    }

    if tags.is_empty() {
        return content.to_string();
    }
    if content.trim().is_empty() {
        return tags.join(" ");
    }
    format!("{}\n\n{}", content.trim_end(), tags.join(" "))
}

/// Whole-tag match so `#rust` counts in neither `#rustlang` nor `abc#rust`
fn contains_tag(haystack: &str, tag: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    haystack.match_indices(tag).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + tag.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_caption_appends_missing_tags_after_blank_line() {
        let caption = compose_caption("Spring menu is live", &tags(&["food", "spring"]));
        assert_eq!(caption, "Spring menu is live\n\n#food #spring");
    }

    #[test]
    fn test_caption_skips_tags_already_present_case_insensitive() {
        let caption = compose_caption("New #Food drop today", &tags(&["food", "#local"]));
        assert_eq!(caption, "New #Food drop today\n\n#local");
    }

    #[test]
    fn test_caption_prefix_tag_is_not_a_match() {
        let caption = compose_caption("Learning #rustlang", &tags(&["rust"]));
        assert_eq!(caption, "Learning #rustlang\n\n#rust");
    }

    #[test]
    fn test_caption_tag_glued_to_word_is_not_a_match() {
        let caption = compose_caption("Crate of the week abc#rust", &tags(&["rust"]));
        assert_eq!(caption, "Crate of the week abc#rust\n\n#rust");
    }

    #[test]
    fn test_contains_tag_needs_both_boundaries() {
        assert!(contains_tag("hi #rust!", "#rust"));
        assert!(contains_tag("#rust", "#rust"));
        assert!(contains_tag("(#rust)", "#rust"));
        assert!(!contains_tag("abc#rust", "#rust"));
        assert!(!contains_tag("snake_#rust", "#rust"));
        assert!(!contains_tag("#rustlang", "#rust"));
    }

    #[test]
    fn test_caption_without_tags_is_unchanged() {
        assert_eq!(compose_caption("Plain", &[]), "Plain");
        assert_eq!(compose_caption("Plain #x", &tags(&["x", "X"])), "Plain #x");
    }

    #[test]
    fn test_classify_status() {
        let auth = classify_status("Facebook", StatusCode::UNAUTHORIZED, "");
        assert!(matches!(auth, PlatformError::Authentication(_)));
        let forbidden = classify_status("Facebook", StatusCode::FORBIDDEN, "");
        assert!(matches!(forbidden, PlatformError::Authentication(_)));
        let invalid = classify_status("LinkedIn", StatusCode::UNPROCESSABLE_ENTITY, "");
        assert!(matches!(invalid, PlatformError::Validation(_)));
        let limited = classify_status("X", StatusCode::TOO_MANY_REQUESTS, "");
        assert!(matches!(limited, PlatformError::RateLimit(_)));
        let server = classify_status("TikTok", StatusCode::BAD_GATEWAY, "");
        assert!(matches!(server, PlatformError::Posting(_)));
    }

    #[test]
    fn test_error_message_prefers_vendor_message() {
        let graph = r#"{"error":{"message":"Invalid OAuth access token.","code":190}}"#;
        assert_eq!(error_message(graph), "Invalid OAuth access token.");

        let twitter = r#"{"title":"Unauthorized","detail":"Unauthorized","status":401}"#;
        assert_eq!(error_message(twitter), "Unauthorized");

        assert_eq!(error_message("  "), "empty response body");
        assert_eq!(error_message("gateway timeout"), "gateway timeout");
    }

    #[test]
    fn test_required_str_accepts_numbers() {
        let body = serde_json::json!({"id": 42, "data": {"id": "abc"}});
        assert_eq!(required_str("X", &body, "/id").unwrap(), "42");
        assert_eq!(required_str("X", &body, "/data/id").unwrap(), "abc");
        assert!(matches!(
            required_str("X", &body, "/missing"),
            Err(PlatformError::Posting(_))
        ));
    }

    #[test]
    fn test_poll_settings_need_one_attempt() {
        let settings = PollSettings::new(0, Duration::ZERO);
        assert_eq!(settings.attempts, 1);
    }
}
