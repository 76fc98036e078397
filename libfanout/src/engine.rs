//! Publish job state machine
//!
//! `process_job` drives one job through a single publish attempt:
//!
//! ```text
//! pending ──claim──▶ processing ──success──────────────▶ completed
//!    ▲                   │
//!    └──attempts left────┤
//!                        └──attempts exhausted/inactive──▶ failed
//! ```
//!
//! The claim is a compare-and-set on the job status, so when the same job
//! is dispatched twice only one dispatch reaches the publisher. Every
//! transition out of `processing` is conditional as well, which keeps
//! `completed` and `failed` absorbing.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::aggregate::StatusAggregator;
use crate::config::Config;
use crate::db::Database;
use crate::error::{FanoutError, PlatformError, Result};
use crate::events::{Event, EventBus, EventReceiver};
use crate::notify::FailureNotifier;
use crate::platforms::{PublishOutcome, PublishRequest, PublisherRegistry};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::tokens::{OAuthRefreshClient, TokenManager};
use crate::types::{Connection, JobStatus, Platform, PublishJob, TargetAccount, TargetStatus};
use crate::vault::AgeVault;

/// Result of one `process_job` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Published; the job is terminal
    Completed,
    /// Failed with attempts left; re-armed for the given unix time
    RetryScheduled { next_retry_at: i64 },
    /// Failed terminally
    Failed,
    /// Not pending, or another worker claimed it first; nothing changed
    Skipped,
}

pub struct PublishEngine {
    db: Database,
    tokens: TokenManager,
    publishers: PublisherRegistry,
    retry: RetryPolicy,
    aggregator: StatusAggregator,
    events: EventBus,
}

impl PublishEngine {
    pub fn new(
        db: Database,
        tokens: TokenManager,
        publishers: PublisherRegistry,
        retry: RetryPolicy,
        notifier: Arc<dyn FailureNotifier>,
    ) -> Self {
        let events = EventBus::default();
        let aggregator = StatusAggregator::new(db.clone(), notifier, events.clone());
        Self {
            db,
            tokens,
            publishers,
            retry,
            aggregator,
            events,
        }
    }

    /// Wire the engine from configuration: database, vault, OAuth client and
    /// the HTTP adapter for every platform
    pub async fn from_config(config: &Config, notifier: Arc<dyn FailureNotifier>) -> Result<Self> {
        let db = Database::new(&config.database.path).await?;
        let vault = AgeVault::from_file(&config.vault.identity_file)?;
        let refresher = OAuthRefreshClient::from_config(config)?;
        let tokens = TokenManager::new(
            db.clone(),
            Arc::new(vault),
            Arc::new(refresher),
            config.tokens.refresh_margin_secs,
        );
        let publishers = PublisherRegistry::from_config(config)?;

        Ok(Self::new(
            db,
            tokens,
            publishers,
            RetryPolicy::from_config(&config.retry),
            notifier,
        ))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn aggregator(&self) -> &StatusAggregator {
        &self.aggregator
    }

    /// Receive job and publication events
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Run one publish attempt for `job_id`
    ///
    /// # Errors
    ///
    /// `FanoutError::NotFound` for an unknown job. Failures of the publish
    /// attempt itself are not errors: they end in `RetryScheduled` or
    /// `Failed`. Errors are only returned when the store cannot record the
    /// transition.
    pub async fn process_job(&self, job_id: &str) -> Result<JobOutcome> {
        let job = self
            .db
            .get_job(job_id)
            .await?
            .ok_or_else(|| FanoutError::NotFound(format!("job {}", job_id)))?;

        if job.status != JobStatus::Pending {
            info!(job_id = %job_id, status = job.status.as_str(), "Job is not pending, skipping");
            return Ok(JobOutcome::Skipped);
        }

        if !self.db.claim_job(job_id).await? {
            info!(job_id = %job_id, "Job claimed by another worker, skipping");
            return Ok(JobOutcome::Skipped);
        }
        let attempt = job.attempts + 1;

        let (target, connection) = match self.db.get_target_with_connection(&job.target_id).await {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                let message = format!(
                    "Target-account record {} or its connection not found",
                    job.target_id
                );
                return self.handle_failure(&job, attempt, None, &message).await;
            }
            Err(e) => return self.handle_failure(&job, attempt, None, &e.to_string()).await,
        };
        let platform = connection.platform;

        if !connection.is_active {
            return self.fail_inactive(&job, attempt, &connection).await;
        }

        debug!(job_id = %job_id, platform = %platform, attempt, "Publishing");
        match self.attempt(&target, &connection).await {
            Ok(outcome) if outcome.success => {
                match self.complete(&job, &target, &connection, outcome).await {
                    Ok(result) => Ok(result),
                    Err(e) => {
                        let message = format!("Published but recording the result failed: {}", e);
                        self.handle_failure(&job, attempt, Some(platform), &message)
                            .await
                    }
                }
            }
            Ok(outcome) => {
                self.handle_failure(&job, attempt, Some(platform), &outcome.error_message())
                    .await
            }
            Err(e) => self.handle_failure(&job, attempt, Some(platform), &e.to_string()).await,
        }
    }

    async fn attempt(&self, target: &TargetAccount, connection: &Connection) -> Result<PublishOutcome> {
        self.db
            .set_target_status(&target.id, TargetStatus::Publishing)
            .await?;

        let access_token = self.tokens.ensure_fresh_credential(connection).await?;
        let publisher = self.publishers.get(connection.platform).ok_or_else(|| {
            PlatformError::NotImplemented(format!(
                "no publisher registered for {}",
                connection.platform.display_name()
            ))
        })?;

        let media = target.media();
        let request = PublishRequest {
            content: &target.content,
            hashtags: &target.hashtags,
            media: &media,
            access_token: &access_token,
            account_id: &connection.external_account_id,
            page_id: connection.external_page_id.as_deref(),
        };
        publisher.publish(&request).await
    }

    async fn complete(
        &self,
        job: &PublishJob,
        target: &TargetAccount,
        connection: &Connection,
        outcome: PublishOutcome,
    ) -> Result<JobOutcome> {
        let recorded = self
            .db
            .complete_job_and_publish_target(
                &job.id,
                &target.id,
                outcome.external_post_id.as_deref(),
                outcome.external_post_url.as_deref(),
            )
            .await?;
        if !recorded {
            warn!(job_id = %job.id, "Job left processing before completion was recorded");
            return Ok(JobOutcome::Skipped);
        }

        if let Err(e) = self.db.touch_connection(&connection.id).await {
            warn!(connection_id = %connection.id, error = %e, "Failed to record connection use");
        }

        info!(
            job_id = %job.id,
            platform = %connection.platform,
            post_id = ?outcome.external_post_id,
            "Published"
        );
        self.events.emit(Event::JobCompleted {
            job_id: job.id.clone(),
            platform: connection.platform.to_string(),
            external_post_id: outcome.external_post_id,
        });

        self.settle(&job.publication_id).await;
        Ok(JobOutcome::Completed)
    }

    /// Connection disabled: terminal on the first dispatch, no publisher call
    async fn fail_inactive(
        &self,
        job: &PublishJob,
        attempt: u32,
        connection: &Connection,
    ) -> Result<JobOutcome> {
        let message = connection
            .last_error
            .clone()
            .unwrap_or_else(|| "connection is inactive".to_string());

        if !self.db.fail_job_and_target(&job.id, &job.target_id, &message).await? {
            warn!(job_id = %job.id, "Job left processing before failure was recorded");
            return Ok(JobOutcome::Skipped);
        }

        warn!(
            job_id = %job.id,
            platform = %connection.platform,
            connection_id = %connection.id,
            "Connection inactive, job failed: {}",
            message
        );
        self.events.emit(Event::JobFailed {
            job_id: job.id.clone(),
            platform: connection.platform.to_string(),
            attempts: attempt,
            error: message,
        });

        self.settle(&job.publication_id).await;
        Ok(JobOutcome::Failed)
    }

    /// Retry or fail the job after an unsuccessful attempt
    async fn handle_failure(
        &self,
        job: &PublishJob,
        attempt: u32,
        platform: Option<Platform>,
        message: &str,
    ) -> Result<JobOutcome> {
        let platform_name = platform.map_or("unknown", |p| p.as_str()).to_string();

        match self.retry.decide(attempt, job.max_attempts, Utc::now()) {
            RetryDecision::RetryAt(at) => {
                let next_retry_at = at.timestamp();
                let recorded = self
                    .db
                    .reschedule_job_and_target(&job.id, &job.target_id, message, next_retry_at)
                    .await?;
                if !recorded {
                    warn!(job_id = %job.id, "Job left processing before retry was recorded");
                    return Ok(JobOutcome::Skipped);
                }

                warn!(
                    job_id = %job.id,
                    platform = %platform_name,
                    attempt,
                    max_attempts = job.max_attempts,
                    next_retry_at,
                    "Publish attempt failed, retry scheduled: {}",
                    message
                );
                self.events.emit(Event::JobRetryScheduled {
                    job_id: job.id.clone(),
                    platform: platform_name,
                    attempts: attempt,
                    next_retry_at,
                    error: message.to_string(),
                });
                Ok(JobOutcome::RetryScheduled { next_retry_at })
            }
            RetryDecision::Exhausted => {
                if !self.db.fail_job_and_target(&job.id, &job.target_id, message).await? {
                    warn!(job_id = %job.id, "Job left processing before failure was recorded");
                    return Ok(JobOutcome::Skipped);
                }

                error!(
                    job_id = %job.id,
                    platform = %platform_name,
                    attempt,
                    "Publish failed after {} attempts: {}",
                    attempt,
                    message
                );
                self.events.emit(Event::JobFailed {
                    job_id: job.id.clone(),
                    platform: platform_name,
                    attempts: attempt,
                    error: message.to_string(),
                });

                self.settle(&job.publication_id).await;
                Ok(JobOutcome::Failed)
            }
        }
    }

    /// Recompute the publication status; the job transition already stands
    async fn settle(&self, publication_id: &str) {
        if let Err(e) = self.aggregator.recompute_publication_status(publication_id).await {
            warn!(
                publication_id = %publication_id,
                error = %e,
                "Failed to recompute publication status"
            );
        }
    }
}
