//! Facebook Pages publishing through the Graph API
//!
//! The post goes to the page when the connection has one, otherwise to the
//! account itself:
//! - no media: `/{id}/feed` text post
//! - one image: `/{id}/photos` with the caption
//! - several images: unpublished `/{id}/photos` uploads, then one `/{id}/feed`
//!   post with `attached_media`
//! - any video (the first one wins): `/{id}/videos` with `file_url`

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::json;

use crate::error::{PlatformError, Result};
use crate::platforms::http::{self, compose_caption, required_str};
use crate::platforms::{into_outcome, Posted, PublishOutcome, PublishRequest, Publisher};
use crate::types::{MediaItem, Platform};

const NAME: &str = "Facebook";

pub struct FacebookPublisher {
    client: reqwest::Client,
    base_url: String,
}

impl FacebookPublisher {
    /// `base_url` is the versioned Graph root, e.g. `https://graph.facebook.com/v19.0`
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> std::result::Result<serde_json::Value, PlatformError> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .form(form)
            .send()
            .await
            .map_err(|e| http::transport_error(NAME, path, e))?;
        http::read_json(NAME, response).await
    }

    async fn try_publish(&self, request: &PublishRequest<'_>) -> std::result::Result<Posted, PlatformError> {
        let target = request.page_id.unwrap_or(request.account_id);
        let token = request.access_token.expose_secret();
        let caption = compose_caption(request.content, request.hashtags);

        let post_id = if let Some(video) = request.media.iter().find(|m| m.is_video()) {
            self.post_video(target, token, &caption, video).await?
        } else {
            match request.media {
                [] => self.post_text(target, token, &caption).await?,
                [image] => self.post_photo(target, token, &caption, image).await?,
                images => self.post_album(target, token, &caption, images).await?,
            }
        };

        let url = format!("https://www.facebook.com/{}", post_id);
        tracing::debug!(post_id = %post_id, "Facebook post created");
        Ok((post_id, Some(url)))
    }

    async fn post_text(
        &self,
        target: &str,
        token: &str,
        caption: &str,
    ) -> std::result::Result<String, PlatformError> {
        let body = self
            .post_form(
                &format!("{}/feed", target),
                &[("message", caption), ("access_token", token)],
            )
            .await?;
        required_str(NAME, &body, "/id")
    }

    async fn post_photo(
        &self,
        target: &str,
        token: &str,
        caption: &str,
        image: &MediaItem,
    ) -> std::result::Result<String, PlatformError> {
        let body = self
            .post_form(
                &format!("{}/photos", target),
                &[
                    ("url", image.url.as_str()),
                    ("caption", caption),
                    ("access_token", token),
                ],
            )
            .await?;
        // post_id is the feed story, id the photo object
        required_str(NAME, &body, "/post_id").or_else(|_| required_str(NAME, &body, "/id"))
    }

    async fn post_album(
        &self,
        target: &str,
        token: &str,
        caption: &str,
        images: &[MediaItem],
    ) -> std::result::Result<String, PlatformError> {
        let mut attached = Vec::with_capacity(images.len());
        for image in images {
            let body = self
                .post_form(
                    &format!("{}/photos", target),
                    &[
                        ("url", image.url.as_str()),
                        ("published", "false"),
                        ("access_token", token),
                    ],
                )
                .await?;
            attached.push(json!({ "media_fbid": required_str(NAME, &body, "/id")? }));
        }

        let path = format!("{}/feed", target);
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .json(&json!({
                "message": caption,
                "attached_media": attached,
                "access_token": token,
            }))
            .send()
            .await
            .map_err(|e| http::transport_error(NAME, &path, e))?;
        let body = http::read_json(NAME, response).await?;
        required_str(NAME, &body, "/id")
    }

    async fn post_video(
        &self,
        target: &str,
        token: &str,
        caption: &str,
        video: &MediaItem,
    ) -> std::result::Result<String, PlatformError> {
        let body = self
            .post_form(
                &format!("{}/videos", target),
                &[
                    ("file_url", video.url.as_str()),
                    ("description", caption),
                    ("access_token", token),
                ],
            )
            .await?;
        required_str(NAME, &body, "/id")
    }
}

#[async_trait]
impl Publisher for FacebookPublisher {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    async fn publish(&self, request: &PublishRequest<'_>) -> Result<PublishOutcome> {
        into_outcome(self.try_publish(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn publisher(server: &MockServer) -> FacebookPublisher {
        let client = http::build_client(Duration::from_secs(5)).unwrap();
        FacebookPublisher::new(client, server.uri())
    }

    fn request<'a>(
        token: &'a SecretString,
        media: &'a [MediaItem],
        hashtags: &'a [String],
    ) -> PublishRequest<'a> {
        PublishRequest {
            content: "Doors open at 9",
            hashtags,
            media,
            access_token: token,
            account_id: "user-77",
            page_id: Some("page-1"),
        }
    }

    #[tokio::test]
    async fn test_text_post_goes_to_page_feed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/page-1/feed"))
            .and(body_string_contains("access_token=EAAB"))
            .and(body_string_contains("%23openday"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "page-1_123"})))
            .expect(1)
            .mount(&server)
            .await;

        let token = SecretString::from("EAAB".to_string());
        let tags = vec!["openday".to_string()];
        let outcome = publisher(&server)
            .publish(&request(&token, &[], &tags))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.external_post_id.as_deref(), Some("page-1_123"));
        assert_eq!(
            outcome.external_post_url.as_deref(),
            Some("https://www.facebook.com/page-1_123")
        );
    }

    #[tokio::test]
    async fn test_single_image_uses_photos_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/page-1/photos"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "photo-1", "post_id": "page-1_555"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let token = SecretString::from("EAAB".to_string());
        let media = vec![MediaItem::from_url("https://cdn.example.com/a.jpg")];
        let outcome = publisher(&server)
            .publish(&request(&token, &media, &[]))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.external_post_id.as_deref(), Some("page-1_555"));
    }

    #[tokio::test]
    async fn test_multiple_images_attach_unpublished_photos() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/page-1/photos"))
            .and(body_string_contains("published=false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "photo-x"})))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/page-1/feed"))
            .and(body_string_contains("attached_media"))
            .and(body_string_contains("photo-x"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "page-1_900"})))
            .expect(1)
            .mount(&server)
            .await;

        let token = SecretString::from("EAAB".to_string());
        let media = vec![
            MediaItem::from_url("https://cdn.example.com/a.jpg"),
            MediaItem::from_url("https://cdn.example.com/b.png"),
        ];
        let outcome = publisher(&server)
            .publish(&request(&token, &media, &[]))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.external_post_id.as_deref(), Some("page-1_900"));
    }

    #[tokio::test]
    async fn test_video_wins_over_images() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/page-1/videos"))
            .and(body_string_contains("file_url="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "video-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let token = SecretString::from("EAAB".to_string());
        let media = vec![
            MediaItem::from_url("https://cdn.example.com/a.jpg"),
            MediaItem::from_url("https://cdn.example.com/clip.mp4"),
        ];
        let outcome = publisher(&server)
            .publish(&request(&token, &media, &[]))
            .await
            .unwrap();

        assert_eq!(outcome.external_post_id.as_deref(), Some("video-1"));
    }

    #[tokio::test]
    async fn test_expired_token_is_failed_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/page-1/feed"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Error validating access token", "code": 190}
            })))
            .mount(&server)
            .await;

        let token = SecretString::from("stale".to_string());
        let outcome = publisher(&server)
            .publish(&request(&token, &[], &[]))
            .await
            .unwrap();

        assert!(!outcome.success);
        match outcome.error {
            Some(PlatformError::Authentication(message)) => {
                assert!(message.contains("Error validating access token"))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_account_used_when_no_page() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/user-77/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "user-77_1"})))
            .expect(1)
            .mount(&server)
            .await;

        let token = SecretString::from("EAAB".to_string());
        let mut req = request(&token, &[], &[]);
        req.page_id = None;
        let outcome = publisher(&server).publish(&req).await.unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_unreachable_graph_propagates() {
        let client = http::build_client(Duration::from_secs(2)).unwrap();
        let publisher = FacebookPublisher::new(client, "http://127.0.0.1:9".to_string());

        let token = SecretString::from("EAAB".to_string());
        let result = publisher.publish(&request(&token, &[], &[])).await;
        assert!(matches!(
            result,
            Err(crate::FanoutError::Platform(PlatformError::Network(_)))
        ));
    }
}
