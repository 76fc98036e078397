//! Platform publishers
//!
//! Each supported network has one adapter implementing [`Publisher`]. An
//! adapter turns a [`PublishRequest`] into that network's API calls and
//! reports a [`PublishOutcome`].
//!
//! Expected failures (rejections, missing media, processing failures and
//! timeouts) come back as an outcome with `success == false`. Only transport
//! failures are returned as `Err`. The engine treats both the same way.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::config::Config;
use crate::error::{PlatformError, Result};
use crate::types::{MediaItem, Platform};

pub mod facebook;
pub mod http;
pub mod instagram;
pub mod linkedin;
pub mod tiktok;
pub mod twitter;

// Available in all builds so integration tests can register it
pub mod mock;

/// Everything an adapter needs for one publish attempt
#[derive(Debug)]
pub struct PublishRequest<'a> {
    pub content: &'a str,
    pub hashtags: &'a [String],
    pub media: &'a [MediaItem],
    /// Decrypted access token, valid for this attempt only
    pub access_token: &'a SecretString,
    /// External account id of the connection
    pub account_id: &'a str,
    /// Page or organization to post as, if any
    pub page_id: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishOutcome {
    pub success: bool,
    pub external_post_id: Option<String>,
    pub external_post_url: Option<String>,
    pub error: Option<PlatformError>,
}

impl PublishOutcome {
    pub fn published(external_post_id: String, external_post_url: Option<String>) -> Self {
        Self {
            success: true,
            external_post_id: Some(external_post_id),
            external_post_url,
            error: None,
        }
    }

    pub fn failed(error: PlatformError) -> Self {
        Self {
            success: false,
            external_post_id: None,
            external_post_url: None,
            error: Some(error),
        }
    }

    /// Error text for a failed outcome
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Publish failed without an error message".to_string())
    }
}

/// A post the platform accepted: id plus optional public URL
pub(crate) type Posted = (String, Option<String>);

/// Fold an adapter result into the outcome contract
///
/// Expected failures become a failed outcome, transport failures propagate.
pub(crate) fn into_outcome(result: std::result::Result<Posted, PlatformError>) -> Result<PublishOutcome> {
    match result {
        Ok((id, url)) => Ok(PublishOutcome::published(id, url)),
        Err(error) if error.is_expected() => Ok(PublishOutcome::failed(error)),
        Err(error) => Err(error.into()),
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Network this adapter publishes to
    fn platform(&self) -> Platform;

    /// Publish one target-account record
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Network` when the platform could not be
    /// reached. Every other failure is reported inside the outcome.
    async fn publish(&self, request: &PublishRequest<'_>) -> Result<PublishOutcome>;
}

/// Static map from platform to adapter
#[derive(Clone, Default)]
pub struct PublisherRegistry {
    publishers: HashMap<Platform, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the HTTP adapter for every supported platform
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = http::build_client(config.media.request_timeout())?;
        let poll = http::PollSettings::from_config(&config.media);
        let endpoints = &config.endpoints;

        Ok(Self::new()
            .with(Arc::new(facebook::FacebookPublisher::new(
                client.clone(),
                endpoints.graph.clone(),
            )))
            .with(Arc::new(instagram::InstagramPublisher::new(
                client.clone(),
                endpoints.graph.clone(),
                poll,
            )))
            .with(Arc::new(linkedin::LinkedinPublisher::new(
                client.clone(),
                endpoints.linkedin.clone(),
            )))
            .with(Arc::new(twitter::TwitterPublisher::new(
                client.clone(),
                endpoints.twitter_api.clone(),
                endpoints.twitter_upload.clone(),
                poll,
            )))
            .with(Arc::new(tiktok::TiktokPublisher::new(
                client,
                endpoints.tiktok.clone(),
                poll,
            ))))
    }

    /// Add or replace the adapter for the publisher's platform
    pub fn register(&mut self, publisher: Arc<dyn Publisher>) {
        self.publishers.insert(publisher.platform(), publisher);
    }

    pub fn with(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.register(publisher);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn Publisher>> {
        self.publishers.get(&platform).cloned()
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockPublisher;

    #[test]
    fn test_registry_from_config_covers_every_platform() {
        let registry = PublisherRegistry::from_config(&Config::default()).unwrap();
        assert_eq!(registry.len(), Platform::ALL.len());
        for platform in Platform::ALL {
            assert_eq!(registry.get(platform).unwrap().platform(), platform);
        }
    }

    #[tokio::test]
    async fn test_register_replaces_existing_adapter() {
        let mock = Arc::new(MockPublisher::success(Platform::Tiktok));
        let registry = PublisherRegistry::from_config(&Config::default())
            .unwrap()
            .with(mock.clone());
        assert_eq!(registry.len(), Platform::ALL.len());

        let token = SecretString::from("token".to_string());
        let request = PublishRequest {
            content: "clip",
            hashtags: &[],
            media: &[],
            access_token: &token,
            account_id: "acct",
            page_id: None,
        };
        let outcome = registry
            .get(Platform::Tiktok)
            .unwrap()
            .publish(&request)
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(mock.call_count(), 1);
    }

    #[test]
    fn test_into_outcome_splits_expected_from_transport_errors() {
        let rejected = into_outcome(Err(PlatformError::Validation("too long".into()))).unwrap();
        assert!(!rejected.success);
        assert_eq!(rejected.error_message(), "Content validation failed: too long");

        let network = into_outcome(Err(PlatformError::Network("reset".into())));
        assert!(network.is_err());

        let posted = into_outcome(Ok(("1".to_string(), None))).unwrap();
        assert!(posted.success);
        assert_eq!(posted.external_post_id.as_deref(), Some("1"));
    }
}
