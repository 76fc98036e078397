//! X (Twitter) publishing
//!
//! Media is uploaded with the chunked v1.1 flow (INIT, APPEND, FINALIZE and,
//! for video, STATUS polling) before the tweet is created through
//! `POST /2/tweets`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::http::{self, compose_caption, required_str, PollSettings};
use crate::platforms::{into_outcome, Posted, PublishOutcome, PublishRequest, Publisher};
use crate::types::{MediaItem, Platform};

const NAME: &str = "X";

/// Media items a tweet can carry
pub const MAX_MEDIA: usize = 4;

/// APPEND segment size
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

pub struct TwitterPublisher {
    client: reqwest::Client,
    api_base: String,
    upload_base: String,
    chunk_size: usize,
    poll: PollSettings,
}

impl TwitterPublisher {
    pub fn new(
        client: reqwest::Client,
        api_base: String,
        upload_base: String,
        poll: PollSettings,
    ) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            upload_base: upload_base.trim_end_matches('/').to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn upload_url(&self) -> String {
        format!("{}/1.1/media/upload.json", self.upload_base)
    }

    async fn try_publish(&self, request: &PublishRequest<'_>) -> std::result::Result<Posted, PlatformError> {
        let token = request.access_token.expose_secret();

        if request.media.len() > MAX_MEDIA {
            tracing::warn!(
                count = request.media.len(),
                "X allows {} media items per tweet, extra media dropped",
                MAX_MEDIA
            );
        }

        let mut media_ids = Vec::new();
        for item in request.media.iter().take(MAX_MEDIA) {
            media_ids.push(self.upload_media(token, item).await?);
        }

        let mut body = json!({ "text": compose_caption(request.content, request.hashtags) });
        if !media_ids.is_empty() {
            body["media"] = json!({ "media_ids": media_ids });
        }

        let response = self
            .client
            .post(format!("{}/2/tweets", self.api_base))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::transport_error(NAME, "create tweet", e))?;
        let body = http::read_json(NAME, response).await?;
        let tweet_id = required_str(NAME, &body, "/data/id")?;

        let url = format!("https://x.com/i/web/status/{}", tweet_id);
        Ok((tweet_id, Some(url)))
    }

    async fn upload_media(&self, token: &str, item: &MediaItem) -> std::result::Result<String, PlatformError> {
        let bytes = http::download(&self.client, NAME, &item.url).await?;
        let category = if item.is_video() { "tweet_video" } else { "tweet_image" };
        let total_bytes = bytes.len().to_string();

        // INIT
        let response = self
            .client
            .post(self.upload_url())
            .bearer_auth(token)
            .form(&[
                ("command", "INIT"),
                ("total_bytes", total_bytes.as_str()),
                ("media_type", item.mime_type()),
                ("media_category", category),
            ])
            .send()
            .await
            .map_err(|e| http::transport_error(NAME, "media INIT", e))?;
        let init = http::read_json(NAME, response).await?;
        let media_id = required_str(NAME, &init, "/media_id_string")?;

        // APPEND
        for (segment, chunk) in bytes.chunks(self.chunk_size).enumerate() {
            let form = multipart::Form::new()
                .text("command", "APPEND")
                .text("media_id", media_id.clone())
                .text("segment_index", segment.to_string())
                .part("media", multipart::Part::bytes(chunk.to_vec()));

            let response = self
                .client
                .post(self.upload_url())
                .bearer_auth(token)
                .multipart(form)
                .send()
                .await
                .map_err(|e| http::transport_error(NAME, "media APPEND", e))?;
            http::check_status(NAME, response).await?;
        }

        // FINALIZE
        let response = self
            .client
            .post(self.upload_url())
            .bearer_auth(token)
            .form(&[("command", "FINALIZE"), ("media_id", media_id.as_str())])
            .send()
            .await
            .map_err(|e| http::transport_error(NAME, "media FINALIZE", e))?;
        let finalize = http::read_json(NAME, response).await?;

        if let Some(info) = finalize.get("processing_info") {
            self.wait_for_processing(token, &media_id, info.clone()).await?;
        }

        tracing::debug!(media_id = %media_id, "X media uploaded");
        Ok(media_id)
    }

    /// Follow `processing_info` until the media succeeds, fails, or checks run out
    async fn wait_for_processing(
        &self,
        token: &str,
        media_id: &str,
        mut info: Value,
    ) -> std::result::Result<(), PlatformError> {
        for checks in 0..=self.poll.attempts {
            match info.get("state").and_then(Value::as_str).unwrap_or("") {
                "succeeded" => return Ok(()),
                "failed" => {
                    let reason = info
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or("processing failed");
                    return Err(PlatformError::MediaProcessing(format!(
                        "X media {}: {}",
                        media_id, reason
                    )));
                }
                _ => {}
            }
            if checks == self.poll.attempts {
                break;
            }

            let wait = info
                .get("check_after_secs")
                .and_then(Value::as_u64)
                .map(Duration::from_secs)
                .unwrap_or(self.poll.interval);
            sleep(wait).await;

            let response = self
                .client
                .get(self.upload_url())
                .bearer_auth(token)
                .query(&[("command", "STATUS"), ("media_id", media_id)])
                .send()
                .await
                .map_err(|e| http::transport_error(NAME, "media STATUS", e))?;
            let status = http::read_json(NAME, response).await?;

            match status.get("processing_info") {
                Some(next) => info = next.clone(),
                None => return Ok(()),
            }
        }

        Err(PlatformError::MediaTimeout(format!(
            "X media {} still processing after {} checks",
            media_id, self.poll.attempts
        )))
    }
}

#[async_trait]
impl Publisher for TwitterPublisher {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    async fn publish(&self, request: &PublishRequest<'_>) -> Result<PublishOutcome> {
        into_outcome(self.try_publish(request).await)
    }
}
