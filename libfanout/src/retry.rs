//! Backoff policy for failed publish attempts
//!
//! A failed attempt is either re-armed for a later dispatch or declared
//! terminal once the job has used up its attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::RetryConfig;

/// Outcome of a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-dispatch no earlier than the given time
    RetryAt(DateTime<Utc>),
    /// No attempts left
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    ladder: Vec<Duration>,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// An empty ladder falls back to a single 30 second step
    pub fn new(ladder: Vec<Duration>, max_attempts: u32) -> Self {
        let ladder = if ladder.is_empty() {
            vec![Duration::from_secs(30)]
        } else {
            ladder
        };
        Self {
            ladder,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config
                .backoff_secs
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
            config.max_attempts,
        )
    }

    /// Attempt budget assigned to newly created jobs
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) as usize - 1).min(self.ladder.len() - 1);
        self.ladder[index]
    }

    /// Decide what happens after `attempts` failed attempts out of `max_attempts`
    pub fn decide(&self, attempts: u32, max_attempts: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempts >= max_attempts {
            return RetryDecision::Exhausted;
        }

        let delay = chrono::Duration::from_std(self.backoff(attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        RetryDecision::RetryAt(now + delay)
    }
}
