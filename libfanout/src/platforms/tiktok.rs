//! TikTok publishing through the Content Posting API
//!
//! TikTok pulls media from public URLs. A video (the first one wins) becomes
//! a direct video post, otherwise the images become a photo post. The publish
//! is asynchronous and its status is polled until it completes or fails.
//!
//! The API reports errors in the body as well as the status code: a response
//! is only successful when `error.code` is `"ok"`.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::http::{self, compose_caption, required_str, PollSettings};
use crate::platforms::{into_outcome, Posted, PublishOutcome, PublishRequest, Publisher};
use crate::types::Platform;

const NAME: &str = "TikTok";

/// Photo posts accept at most this many images
const MAX_PHOTOS: usize = 35;

/// Title limit for photo posts
const MAX_TITLE_CHARS: usize = 90;

pub struct TiktokPublisher {
    client: reqwest::Client,
    base_url: String,
    poll: PollSettings,
}

/// Map an in-body error code onto the shared error taxonomy
fn classify_error_code(code: &str, message: &str) -> PlatformError {
    let text = format!("TikTok error {}: {}", code, message);
    match code {
        "access_token_invalid" | "scope_not_authorized" | "scope_permission_missed" => {
            PlatformError::Authentication(text)
        }
        "rate_limit_exceeded" | "spam_risk_too_many_posts" | "spam_risk_user_banned_from_posting" => {
            PlatformError::RateLimit(text)
        }
        "invalid_params" | "invalid_file_upload" | "url_ownership_unverified"
        | "privacy_level_option_mismatch" => PlatformError::Validation(text),
        _ => PlatformError::Posting(text),
    }
}

impl TiktokPublisher {
    pub fn new(client: reqwest::Client, base_url: String, poll: PollSettings) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll,
        }
    }

    /// POST a JSON body and unwrap TikTok's `{data, error}` envelope
    async fn call(
        &self,
        path: &str,
        token: &str,
        body: &Value,
    ) -> std::result::Result<Value, PlatformError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| http::transport_error(NAME, path, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| http::transport_error(NAME, path, e))?;

        if !status.is_success() {
            return Err(http::classify_status(NAME, status, &text));
        }

        let parsed: Value = serde_json::from_str(&text).map_err(|_| {
            PlatformError::Posting(format!("{} returned a malformed response for {}", NAME, path))
        })?;

        match parsed.pointer("/error/code").and_then(Value::as_str) {
            Some("ok") | None => Ok(parsed),
            Some(code) => {
                let message = parsed
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                Err(classify_error_code(code, message))
            }
        }
    }

    async fn try_publish(&self, request: &PublishRequest<'_>) -> std::result::Result<Posted, PlatformError> {
        if request.media.is_empty() {
            return Err(PlatformError::Validation(
                "TikTok requires a video or at least one image".to_string(),
            ));
        }

        let token = request.access_token.expose_secret();
        let caption = compose_caption(request.content, request.hashtags);

        let init = if let Some(video) = request.media.iter().find(|m| m.is_video()) {
            self.call(
                "/v2/post/publish/video/init/",
                token,
                &json!({
                    "post_info": {
                        "title": caption,
                        "privacy_level": "PUBLIC_TO_EVERYONE",
                    },
                    "source_info": {
                        "source": "PULL_FROM_URL",
                        "video_url": video.url,
                    }
                }),
            )
            .await?
        } else {
            let photos: Vec<&str> = request
                .media
                .iter()
                .take(MAX_PHOTOS)
                .map(|m| m.url.as_str())
                .collect();
            let title: String = caption.chars().take(MAX_TITLE_CHARS).collect();
            self.call(
                "/v2/post/publish/content/init/",
                token,
                &json!({
                    "post_info": {
                        "title": title,
                        "description": caption,
                        "privacy_level": "PUBLIC_TO_EVERYONE",
                    },
                    "source_info": {
                        "source": "PULL_FROM_URL",
                        "photo_images": photos,
                        "photo_cover_index": 0,
                    },
                    "post_mode": "DIRECT_POST",
                    "media_type": "PHOTO",
                }),
            )
            .await?
        };

        let publish_id = required_str(NAME, &init, "/data/publish_id")?;
        let post_id = self.wait_for_publish(token, &publish_id).await?;
        Ok((post_id, None))
    }

    /// Poll the publish status; returns the public post id when TikTok reports one
    async fn wait_for_publish(&self, token: &str, publish_id: &str) -> std::result::Result<String, PlatformError> {
        for check in 1..=self.poll.attempts {
            let body = self
                .call(
                    "/v2/post/publish/status/fetch/",
                    token,
                    &json!({ "publish_id": publish_id }),
                )
                .await?;

            let status = body.pointer("/data/status").and_then(Value::as_str).unwrap_or("");
            match status {
                "PUBLISH_COMPLETE" => {
                    // The field name is misspelled in the API
                    let public_id = body
                        .pointer("/data/publicaly_available_post_id/0")
                        .and_then(|v| match v {
                            Value::String(s) => Some(s.clone()),
                            Value::Number(n) => Some(n.to_string()),
                            _ => None,
                        });
                    return Ok(public_id.unwrap_or_else(|| publish_id.to_string()));
                }
                "FAILED" => {
                    let reason = body
                        .pointer("/data/fail_reason")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown reason");
                    return Err(PlatformError::MediaProcessing(format!(
                        "TikTok publish {} failed: {}",
                        publish_id, reason
                    )));
                }
                _ => {
                    tracing::debug!(publish_id = %publish_id, status = %status, check, "TikTok publish in progress");
                    if check < self.poll.attempts {
                        sleep(self.poll.interval).await;
                    }
                }
            }
        }

        Err(PlatformError::MediaTimeout(format!(
            "TikTok publish {} not complete after {} checks",
            publish_id, self.poll.attempts
        )))
    }
}

#[async_trait]
impl Publisher for TiktokPublisher {
    fn platform(&self) -> Platform {
        Platform::Tiktok
    }

    async fn publish(&self, request: &PublishRequest<'_>) -> Result<PublishOutcome> {
        into_outcome(self.try_publish(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaItem;
    use secrecy::SecretString;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn publisher(server: &MockServer, attempts: u32) -> TiktokPublisher {
        let client = http::build_client(Duration::from_secs(5)).unwrap();
        TiktokPublisher::new(client, server.uri(), PollSettings::new(attempts, Duration::ZERO))
    }

    fn request<'a>(token: &'a SecretString, media: &'a [MediaItem]) -> PublishRequest<'a> {
        PublishRequest {
            content: "Day in the life",
            hashtags: &[],
            media,
            access_token: token,
            account_id: "open-id-1",
            page_id: None,
        }
    }

    fn ok(data: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "data": data,
            "error": {"code": "ok", "message": "", "log_id": "log-1"}
        }))
    }

    #[test]
    fn test_classify_error_code() {
        assert!(matches!(
            classify_error_code("access_token_invalid", ""),
            PlatformError::Authentication(_)
        ));
        assert!(matches!(
            classify_error_code("rate_limit_exceeded", ""),
            PlatformError::RateLimit(_)
        ));
        assert!(matches!(
            classify_error_code("invalid_params", ""),
            PlatformError::Validation(_)
        ));
        assert!(matches!(
            classify_error_code("internal_error", ""),
            PlatformError::Posting(_)
        ));
    }

    #[tokio::test]
    async fn test_requires_media() {
        let server = MockServer::start().await;
        let token = SecretString::from("tt".to_string());
        let outcome = publisher(&server, 3).publish(&request(&token, &[])).await.unwrap();
        assert!(matches!(outcome.error, Some(PlatformError::Validation(_))));
    }

    #[tokio::test]
    async fn test_video_post_completes_with_public_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/video/init/"))
            .and(body_string_contains("PULL_FROM_URL"))
            .and(body_string_contains("clip.mp4"))
            .respond_with(ok(json!({"publish_id": "v_pub_1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/status/fetch/"))
            .respond_with(ok(json!({"status": "PROCESSING_DOWNLOAD"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/status/fetch/"))
            .respond_with(ok(json!({
                "status": "PUBLISH_COMPLETE",
                "publicaly_available_post_id": [7312345678901234567u64]
            })))
            .mount(&server)
            .await;

        let token = SecretString::from("tt".to_string());
        let media = vec![
            MediaItem::from_url("https://cdn.example.com/cover.jpg"),
            MediaItem::from_url("https://cdn.example.com/clip.mp4"),
        ];
        let outcome = publisher(&server, 5).publish(&request(&token, &media)).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.external_post_id.as_deref(), Some("7312345678901234567"));
    }

    #[tokio::test]
    async fn test_photo_post_falls_back_to_publish_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/content/init/"))
            .and(body_string_contains(r#""media_type":"PHOTO""#))
            .respond_with(ok(json!({"publish_id": "p_pub_1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/status/fetch/"))
            .respond_with(ok(json!({"status": "PUBLISH_COMPLETE"})))
            .mount(&server)
            .await;

        let token = SecretString::from("tt".to_string());
        let media = vec![MediaItem::from_url("https://cdn.example.com/a.jpg")];
        let outcome = publisher(&server, 3).publish(&request(&token, &media)).await.unwrap();

        assert_eq!(outcome.external_post_id.as_deref(), Some("p_pub_1"));
    }

    #[tokio::test]
    async fn test_failed_publish_is_media_processing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/video/init/"))
            .respond_with(ok(json!({"publish_id": "v_pub_2"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/status/fetch/"))
            .respond_with(ok(json!({"status": "FAILED", "fail_reason": "video_pull_failed"})))
            .mount(&server)
            .await;

        let token = SecretString::from("tt".to_string());
        let media = vec![MediaItem::from_url("https://cdn.example.com/clip.mp4")];
        let outcome = publisher(&server, 3).publish(&request(&token, &media)).await.unwrap();

        match outcome.error {
            Some(PlatformError::MediaProcessing(message)) => {
                assert!(message.contains("video_pull_failed"))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_that_never_completes_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/video/init/"))
            .respond_with(ok(json!({"publish_id": "v_pub_3"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/status/fetch/"))
            .respond_with(ok(json!({"status": "PROCESSING_UPLOAD"})))
            .expect(4)
            .mount(&server)
            .await;

        let token = SecretString::from("tt".to_string());
        let media = vec![MediaItem::from_url("https://cdn.example.com/clip.mp4")];
        let outcome = publisher(&server, 4).publish(&request(&token, &media)).await.unwrap();

        assert!(matches!(outcome.error, Some(PlatformError::MediaTimeout(_))));
    }

    #[tokio::test]
    async fn test_error_in_body_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/video/init/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {},
                "error": {"code": "access_token_invalid", "message": "token expired"}
            })))
            .mount(&server)
            .await;

        let token = SecretString::from("tt".to_string());
        let media = vec![MediaItem::from_url("https://cdn.example.com/clip.mp4")];
        let outcome = publisher(&server, 3).publish(&request(&token, &media)).await.unwrap();

        match outcome.error {
            Some(PlatformError::Authentication(message)) => assert!(message.contains("token expired")),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
