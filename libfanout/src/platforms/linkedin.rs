//! LinkedIn publishing through the UGC Posts API
//!
//! Media goes through the assets API: register an upload, PUT the bytes to
//! the returned URL, then reference the asset URN in the post.

use async_trait::async_trait;
use reqwest::header::HeaderValue;
use secrecy::ExposeSecret;
use serde_json::{json, Value};

use crate::error::{PlatformError, Result};
use crate::platforms::http::{self, compose_caption, required_str};
use crate::platforms::{into_outcome, Posted, PublishOutcome, PublishRequest, Publisher};
use crate::types::{MediaItem, Platform};

const NAME: &str = "LinkedIn";
const RESTLI_PROTOCOL: &str = "2.0.0";
const UPLOAD_MECHANISM: &str = "com.linkedin.digitalmedia.uploadMechanism.MediaUploadHttpRequest";

pub struct LinkedinPublisher {
    client: reqwest::Client,
    base_url: String,
}

/// Author URN: the organization page when set, otherwise the member
pub fn author_urn(account_id: &str, page_id: Option<&str>) -> String {
    match page_id {
        Some(page) => format!("urn:li:organization:{}", page),
        None => format!("urn:li:person:{}", account_id),
    }
}

impl LinkedinPublisher {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn try_publish(&self, request: &PublishRequest<'_>) -> std::result::Result<Posted, PlatformError> {
        let token = request.access_token.expose_secret();
        let author = author_urn(request.account_id, request.page_id);
        let caption = compose_caption(request.content, request.hashtags);

        let mut assets = Vec::with_capacity(request.media.len());
        for item in request.media {
            assets.push(self.upload_asset(token, &author, item).await?);
        }

        let category = match request.media.first() {
            None => "NONE",
            Some(item) if item.is_video() => "VIDEO",
            Some(_) => "IMAGE",
        };
        let media: Vec<Value> = assets
            .iter()
            .map(|asset| json!({ "status": "READY", "media": asset }))
            .collect();

        let response = self
            .client
            .post(format!("{}/ugcPosts", self.base_url))
            .bearer_auth(token)
            .header("X-Restli-Protocol-Version", RESTLI_PROTOCOL)
            .json(&json!({
                "author": author,
                "lifecycleState": "PUBLISHED",
                "specificContent": {
                    "com.linkedin.ugc.ShareContent": {
                        "shareCommentary": { "text": caption },
                        "shareMediaCategory": category,
                        "media": media,
                    }
                },
                "visibility": {
                    "com.linkedin.ugc.MemberNetworkVisibility": "PUBLIC"
                }
            }))
            .send()
            .await
            .map_err(|e| http::transport_error(NAME, "ugcPosts", e))?;

        let response = http::check_status(NAME, response).await?;
        let header_id = response
            .headers()
            .get("x-restli-id")
            .and_then(|v: &HeaderValue| v.to_str().ok())
            .map(str::to_string);

        let post_id = match header_id {
            Some(id) => id,
            None => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| http::transport_error(NAME, "ugcPosts", e))?;
                let json: Value = serde_json::from_str(&body).map_err(|_| {
                    PlatformError::Posting("LinkedIn did not return a post id".to_string())
                })?;
                required_str(NAME, &json, "/id")?
            }
        };

        let url = format!("https://www.linkedin.com/feed/update/{}", post_id);
        Ok((post_id, Some(url)))
    }

    async fn upload_asset(
        &self,
        token: &str,
        owner: &str,
        item: &MediaItem,
    ) -> std::result::Result<String, PlatformError> {
        let recipe = if item.is_video() {
            "urn:li:digitalmediaRecipe:feedshare-video"
        } else {
            "urn:li:digitalmediaRecipe:feedshare-image"
        };

        let response = self
            .client
            .post(format!("{}/assets?action=registerUpload", self.base_url))
            .bearer_auth(token)
            .header("X-Restli-Protocol-Version", RESTLI_PROTOCOL)
            .json(&json!({
                "registerUploadRequest": {
                    "recipes": [recipe],
                    "owner": owner,
                    "serviceRelationships": [{
                        "relationshipType": "OWNER",
                        "identifier": "urn:li:userGeneratedContent"
                    }]
                }
            }))
            .send()
            .await
            .map_err(|e| http::transport_error(NAME, "registerUpload", e))?;
        let body = http::read_json(NAME, response).await?;

        let upload_url = body
            .pointer("/value/uploadMechanism")
            .and_then(|m| m.get(UPLOAD_MECHANISM))
            .and_then(|m| m.get("uploadUrl"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PlatformError::Posting("LinkedIn registerUpload response has no uploadUrl".to_string())
            })?
            .to_string();
        let asset = required_str(NAME, &body, "/value/asset")?;

        let bytes = http::download(&self.client, NAME, &item.url).await?;
        let response = self
            .client
            .put(&upload_url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, item.mime_type())
            .body(bytes)
            .send()
            .await
            .map_err(|e| http::transport_error(NAME, "media upload", e))?;
        http::check_status(NAME, response).await?;

        tracing::debug!(asset = %asset, "LinkedIn asset uploaded");
        Ok(asset)
    }
}

#[async_trait]
impl Publisher for LinkedinPublisher {
    fn platform(&self) -> Platform {
        Platform::Linkedin
    }

    async fn publish(&self, request: &PublishRequest<'_>) -> Result<PublishOutcome> {
        into_outcome(self.try_publish(request).await)
    }
}
