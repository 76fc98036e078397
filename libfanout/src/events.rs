//! In-process event bus
//!
//! The engine reports job and publication transitions here. Delivery is
//! best-effort: with no subscribers events are dropped, and a lagging
//! subscriber loses the oldest events rather than blocking the engine.
//!
//! ```no_run
//! use libfanout::events::{Event, EventBus};
//!
//! # async fn example() {
//! let bus = EventBus::new(100);
//! let mut receiver = bus.subscribe();
//!
//! bus.emit(Event::JobCompleted {
//!     job_id: "job-1".to_string(),
//!     platform: "facebook".to_string(),
//!     external_post_id: None,
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("{:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before old events are dropped
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The platform accepted the post
    JobCompleted {
        job_id: String,
        platform: String,
        external_post_id: Option<String>,
    },

    /// The attempt failed and the job was re-armed
    JobRetryScheduled {
        job_id: String,
        platform: String,
        attempts: u32,
        /// Unix timestamp of the earliest next dispatch
        next_retry_at: i64,
        error: String,
    },

    /// The job reached its terminal failure state
    JobFailed {
        job_id: String,
        platform: String,
        attempts: u32,
        error: String,
    },

    /// A publication's aggregate status changed
    PublicationSettled {
        publication_id: String,
        status: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_events() {
        let bus = EventBus::new(10);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let event = Event::PublicationSettled {
            publication_id: "pub-1".to_string(),
            status: "partial".to_string(),
        };
        bus.emit(event.clone());

        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.recv().await.unwrap(), event);
    }

    #[test]
    fn test_emit_without_subscribers_is_dropped() {
        let bus = EventBus::new(10);
        bus.emit(Event::JobFailed {
            job_id: "job-1".to_string(),
            platform: "tiktok".to_string(),
            attempts: 3,
            error: "Rate limit exceeded: slow down".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_newest_events() {
        let bus = EventBus::new(2);
        let mut receiver = bus.subscribe();

        for attempts in 1..=4 {
            bus.emit(Event::JobRetryScheduled {
                job_id: "job-1".to_string(),
                platform: "twitter".to_string(),
                attempts,
                next_retry_at: 0,
                error: "timeout".to_string(),
            });
        }

        assert!(matches!(
            receiver.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        match receiver.recv().await.unwrap() {
            Event::JobRetryScheduled { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_string(&Event::JobCompleted {
            job_id: "job-1".to_string(),
            platform: "linkedin".to_string(),
            external_post_id: Some("urn:li:share:1".to_string()),
        })
        .unwrap();
        assert!(json.contains(r#""type":"job_completed""#));
    }
}
