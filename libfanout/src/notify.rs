//! Failure notification seam
//!
//! The aggregator hands failed publications to a [`FailureNotifier`]. The
//! default implementation only logs; deployments plug in email, webhooks,
//! or whatever reaches the user.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One failed account in a failure notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFailure {
    /// Human-readable platform name
    pub platform_name: String,
    pub error: String,
}

#[async_trait]
pub trait FailureNotifier: Send + Sync {
    /// Tell `user_id` that some accounts of `publication_id` could not be published
    async fn notify_publish_failed(
        &self,
        user_id: &str,
        publication_id: &str,
        failures: &[PlatformFailure],
    ) -> Result<()>;
}

/// Notifier that writes a warning per failed publication
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl FailureNotifier for TracingNotifier {
    async fn notify_publish_failed(
        &self,
        user_id: &str,
        publication_id: &str,
        failures: &[PlatformFailure],
    ) -> Result<()> {
        let summary = failures
            .iter()
            .map(|f| format!("{}: {}", f.platform_name, f.error))
            .collect::<Vec<_>>()
            .join("; ");

        tracing::warn!(
            user_id = %user_id,
            publication_id = %publication_id,
            failed = failures.len(),
            "Publication had failed accounts: {}",
            summary
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracing_notifier_never_fails() {
        let notifier = TracingNotifier;
        let failures = vec![PlatformFailure {
            platform_name: "TikTok".to_string(),
            error: "Media processing failed: FAILED".to_string(),
        }];
        assert!(notifier
            .notify_publish_failed("user-1", "pub-1", &failures)
            .await
            .is_ok());
    }
}
