//! Scriptable publisher for tests
//!
//! Simulates success, rejection, transient failure and transport errors
//! without network access, and records every request it receives so tests
//! can verify what the engine sent.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::{PublishOutcome, PublishRequest, Publisher};
use crate::types::Platform;

#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Every call publishes
    Succeed,
    /// Every call returns a failed outcome
    Fail(PlatformError),
    /// The first `n` calls fail, later calls publish
    FailTimes(usize, PlatformError),
    /// Every call fails at the transport level
    NetworkError(String),
}

/// What the mock was asked to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub content: String,
    pub hashtags: Vec<String>,
    pub media_urls: Vec<String>,
    pub access_token: String,
    pub account_id: String,
    pub page_id: Option<String>,
}

pub struct MockPublisher {
    platform: Platform,
    behavior: MockBehavior,
    delay: Duration,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl MockPublisher {
    pub fn new(platform: Platform, behavior: MockBehavior) -> Self {
        Self {
            platform,
            behavior,
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn success(platform: Platform) -> Self {
        Self::new(platform, MockBehavior::Succeed)
    }

    pub fn failure(platform: Platform, error: PlatformError) -> Self {
        Self::new(platform, MockBehavior::Fail(error))
    }

    pub fn failing_times(platform: Platform, times: usize, error: PlatformError) -> Self {
        Self::new(platform, MockBehavior::FailTimes(times, error))
    }

    pub fn network_error(platform: Platform, message: &str) -> Self {
        Self::new(platform, MockBehavior::NetworkError(message.to_string()))
    }

    /// Simulate platform latency on every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.lock_calls().len()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock_calls().clone()
    }

    fn lock_calls(&self) -> MutexGuard<'_, Vec<MockCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn publish(&self, request: &PublishRequest<'_>) -> Result<PublishOutcome> {
        let call_number = {
            let mut calls = self.lock_calls();
            calls.push(MockCall {
                content: request.content.to_string(),
                hashtags: request.hashtags.to_vec(),
                media_urls: request.media.iter().map(|m| m.url.clone()).collect(),
                access_token: request.access_token.expose_secret().to_string(),
                account_id: request.account_id.to_string(),
                page_id: request.page_id.map(str::to_string),
            });
            calls.len()
        };

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let published = || {
            PublishOutcome::published(
                format!("mock-{}-{}", self.platform, call_number),
                Some(format!("https://{}.example/posts/{}", self.platform, call_number)),
            )
        };

        match &self.behavior {
            MockBehavior::Succeed => Ok(published()),
            MockBehavior::Fail(error) => Ok(PublishOutcome::failed(error.clone())),
            MockBehavior::FailTimes(times, error) if call_number <= *times => {
                Ok(PublishOutcome::failed(error.clone()))
            }
            MockBehavior::FailTimes(..) => Ok(published()),
            MockBehavior::NetworkError(message) => {
                Err(PlatformError::Network(message.clone()).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn request<'a>(token: &'a SecretString) -> PublishRequest<'a> {
        PublishRequest {
            content: "hello",
            hashtags: &[],
            media: &[],
            access_token: token,
            account_id: "acct-1",
            page_id: None,
        }
    }

    #[tokio::test]
    async fn test_success_records_call() {
        let token = SecretString::from("token-1".to_string());
        let mock = MockPublisher::success(Platform::Linkedin);

        let outcome = mock.publish(&request(&token)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.external_post_id.as_deref(), Some("mock-linkedin-1"));
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.calls()[0].access_token, "token-1");
    }

    #[tokio::test]
    async fn test_failing_times_then_succeeds() {
        let token = SecretString::from("t".to_string());
        let mock = MockPublisher::failing_times(
            Platform::Twitter,
            2,
            PlatformError::RateLimit("slow down".to_string()),
        );

        assert!(!mock.publish(&request(&token)).await.unwrap().success);
        assert!(!mock.publish(&request(&token)).await.unwrap().success);
        assert!(mock.publish(&request(&token)).await.unwrap().success);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_network_error_propagates() {
        let token = SecretString::from("t".to_string());
        let mock = MockPublisher::network_error(Platform::Facebook, "connection reset");
        assert!(mock.publish(&request(&token)).await.is_err());
    }
}
