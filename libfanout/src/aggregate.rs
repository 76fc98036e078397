//! Publication status aggregation
//!
//! A publication's status is derived from its target-account records once
//! every one of them has settled. Only the call that actually changes the
//! stored status notifies, so repeated or concurrent recomputes produce at
//! most one notification per transition.

use std::sync::Arc;

use crate::db::Database;
use crate::error::{FanoutError, Result};
use crate::events::{Event, EventBus};
use crate::notify::{FailureNotifier, PlatformFailure};
use crate::types::{PublicationStatus, TargetOutcome, TargetStatus};

/// Aggregate status for a set of record statuses
///
/// `None` while any record is still pending or publishing, and for an empty
/// set.
pub fn aggregate(statuses: &[TargetStatus]) -> Option<PublicationStatus> {
    if statuses.is_empty() || statuses.iter().any(|s| !s.is_settled()) {
        return None;
    }

    let succeeded = |s: &TargetStatus| matches!(s, TargetStatus::Published | TargetStatus::Skipped);

    if statuses.iter().all(succeeded) {
        Some(PublicationStatus::Published)
    } else if statuses.iter().all(|s| *s == TargetStatus::Failed) {
        Some(PublicationStatus::Failed)
    } else {
        Some(PublicationStatus::Partial)
    }
}

fn failures(outcomes: &[TargetOutcome]) -> Vec<PlatformFailure> {
    outcomes
        .iter()
        .filter(|o| o.status == TargetStatus::Failed)
        .map(|o| PlatformFailure {
            platform_name: o.platform.display_name().to_string(),
            error: o
                .error_message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string()),
        })
        .collect()
}

pub struct StatusAggregator {
    db: Database,
    notifier: Arc<dyn FailureNotifier>,
    events: EventBus,
}

impl StatusAggregator {
    pub fn new(db: Database, notifier: Arc<dyn FailureNotifier>, events: EventBus) -> Self {
        Self {
            db,
            notifier,
            events,
        }
    }

    /// Recompute and store the publication's aggregate status
    ///
    /// Returns `None` when the publication has not settled yet; nothing is
    /// written in that case.
    pub async fn recompute_publication_status(
        &self,
        publication_id: &str,
    ) -> Result<Option<PublicationStatus>> {
        let outcomes = self.db.publication_outcomes(publication_id).await?;
        let statuses: Vec<TargetStatus> = outcomes.iter().map(|o| o.status).collect();

        let Some(status) = aggregate(&statuses) else {
            tracing::debug!(
                publication_id = %publication_id,
                records = outcomes.len(),
                "Publication not settled yet"
            );
            return Ok(None);
        };

        let published_at =
            (status == PublicationStatus::Published).then(|| chrono::Utc::now().timestamp());
        let changed = self
            .db
            .settle_publication(publication_id, status, published_at)
            .await?;

        if !changed {
            tracing::debug!(publication_id = %publication_id, status = %status, "Publication status unchanged");
            return Ok(Some(status));
        }

        tracing::info!(publication_id = %publication_id, status = %status, "Publication settled");
        self.events.emit(Event::PublicationSettled {
            publication_id: publication_id.to_string(),
            status: status.to_string(),
        });

        if matches!(status, PublicationStatus::Failed | PublicationStatus::Partial) {
            self.dispatch_notification(publication_id, failures(&outcomes))
                .await?;
        }

        Ok(Some(status))
    }

    /// Fire-and-forget: notifier errors are logged, never returned
    async fn dispatch_notification(
        &self,
        publication_id: &str,
        failures: Vec<PlatformFailure>,
    ) -> Result<()> {
        let publication = self
            .db
            .get_publication(publication_id)
            .await?
            .ok_or_else(|| FanoutError::NotFound(format!("publication {}", publication_id)))?;

        let notifier = Arc::clone(&self.notifier);
        let publication_id = publication_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = notifier
                .notify_publish_failed(&publication.user_id, &publication_id, &failures)
                .await
            {
                tracing::warn!(
                    publication_id = %publication_id,
                    error = %e,
                    "Failed to send publish failure notification"
                );
            }
        });

        Ok(())
    }
}
