//! Instagram publishing through the Graph API content publishing flow
//!
//! Publishing is two-phase: create a media container, then publish it.
//! Videos are processed asynchronously, so their containers are polled on
//! `status_code` until `FINISHED` before publishing.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::http::{self, compose_caption, required_str, PollSettings};
use crate::platforms::{into_outcome, Posted, PublishOutcome, PublishRequest, Publisher};
use crate::types::{MediaItem, Platform};

const NAME: &str = "Instagram";

/// Carousel size limit enforced by the API
const MAX_CAROUSEL_ITEMS: usize = 10;

pub struct InstagramPublisher {
    client: reqwest::Client,
    base_url: String,
    poll: PollSettings,
}

/// How a container will be used
#[derive(Clone, Copy)]
enum ContainerRole<'a> {
    Single { caption: &'a str },
    CarouselItem,
}

impl InstagramPublisher {
    pub fn new(client: reqwest::Client, base_url: String, poll: PollSettings) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll,
        }
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> std::result::Result<Value, PlatformError> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .form(form)
            .send()
            .await
            .map_err(|e| http::transport_error(NAME, path, e))?;
        http::read_json(NAME, response).await
    }

    async fn get_fields(
        &self,
        id: &str,
        fields: &str,
        token: &str,
    ) -> std::result::Result<Value, PlatformError> {
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, id))
            .query(&[("fields", fields), ("access_token", token)])
            .send()
            .await
            .map_err(|e| http::transport_error(NAME, id, e))?;
        http::read_json(NAME, response).await
    }

    async fn try_publish(&self, request: &PublishRequest<'_>) -> std::result::Result<Posted, PlatformError> {
        if request.media.is_empty() {
            return Err(PlatformError::Validation(
                "Instagram requires at least one image or video".to_string(),
            ));
        }

        let ig_user = request.account_id;
        let token = request.access_token.expose_secret();
        let caption = compose_caption(request.content, request.hashtags);

        let creation_id = match request.media {
            [item] => {
                self.create_container(ig_user, token, item, ContainerRole::Single { caption: &caption })
                    .await?
            }
            items => self.create_carousel(ig_user, token, &caption, items).await?,
        };

        let body = self
            .post_form(
                &format!("{}/media_publish", ig_user),
                &[("creation_id", creation_id.as_str()), ("access_token", token)],
            )
            .await?;
        let media_id = required_str(NAME, &body, "/id")?;

        let permalink = match self.get_fields(&media_id, "permalink", token).await {
            Ok(body) => body.get("permalink").and_then(Value::as_str).map(str::to_string),
            Err(e) => {
                tracing::debug!(media_id = %media_id, error = %e, "Could not fetch Instagram permalink");
                None
            }
        };

        Ok((media_id, permalink))
    }

    async fn create_carousel(
        &self,
        ig_user: &str,
        token: &str,
        caption: &str,
        items: &[MediaItem],
    ) -> std::result::Result<String, PlatformError> {
        if items.len() > MAX_CAROUSEL_ITEMS {
            tracing::warn!(
                count = items.len(),
                "Instagram carousel limited to {} items, extra media dropped",
                MAX_CAROUSEL_ITEMS
            );
        }

        let mut children = Vec::new();
        for item in items.iter().take(MAX_CAROUSEL_ITEMS) {
            children.push(
                self.create_container(ig_user, token, item, ContainerRole::CarouselItem)
                    .await?,
            );
        }

        let children = children.join(",");
        let body = self
            .post_form(
                &format!("{}/media", ig_user),
                &[
                    ("media_type", "CAROUSEL"),
                    ("children", children.as_str()),
                    ("caption", caption),
                    ("access_token", token),
                ],
            )
            .await?;
        let parent = required_str(NAME, &body, "/id")?;
        self.wait_until_ready(&parent, token).await?;
        Ok(parent)
    }

    async fn create_container(
        &self,
        ig_user: &str,
        token: &str,
        item: &MediaItem,
        role: ContainerRole<'_>,
    ) -> std::result::Result<String, PlatformError> {
        let mut form: Vec<(&str, &str)> = Vec::new();
        match (item.is_video(), role) {
            (true, ContainerRole::Single { .. }) => {
                form.push(("media_type", "REELS"));
                form.push(("video_url", item.url.as_str()));
            }
            (true, ContainerRole::CarouselItem) => {
                form.push(("media_type", "VIDEO"));
                form.push(("video_url", item.url.as_str()));
            }
            (false, _) => form.push(("image_url", item.url.as_str())),
        }
        match role {
            ContainerRole::Single { caption } => form.push(("caption", caption)),
            ContainerRole::CarouselItem => form.push(("is_carousel_item", "true")),
        }
        form.push(("access_token", token));

        let body = self.post_form(&format!("{}/media", ig_user), &form).await?;
        let container = required_str(NAME, &body, "/id")?;

        if item.is_video() {
            self.wait_until_ready(&container, token).await?;
        }
        Ok(container)
    }

    /// Poll a container until the platform finishes processing it
    async fn wait_until_ready(&self, container: &str, token: &str) -> std::result::Result<(), PlatformError> {
        for check in 1..=self.poll.attempts {
            let body = self.get_fields(container, "status_code", token).await?;
            let status = body.get("status_code").and_then(Value::as_str).unwrap_or("");

            match status {
                "FINISHED" | "PUBLISHED" => return Ok(()),
                "ERROR" | "EXPIRED" => {
                    return Err(PlatformError::MediaProcessing(format!(
                        "Instagram container {} reported {}",
                        container, status
                    )))
                }
                _ => {
                    tracing::debug!(container = %container, status = %status, check, "Instagram container not ready");
                    if check < self.poll.attempts {
                        sleep(self.poll.interval).await;
                    }
                }
            }
        }

        Err(PlatformError::MediaTimeout(format!(
            "Instagram container {} not ready after {} checks",
            container, self.poll.attempts
        )))
    }
}

#[async_trait]
impl Publisher for InstagramPublisher {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    async fn publish(&self, request: &PublishRequest<'_>) -> Result<PublishOutcome> {
        into_outcome(self.try_publish(request).await)
    }
}
