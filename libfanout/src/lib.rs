//! Fanout - publish dispatch and retry engine
//!
//! This library drives per-account publish jobs for a piece of content that
//! has already been adapted for several social networks. It keeps platform
//! credentials fresh, retries failed attempts with backoff, and rolls the
//! per-account outcomes up into one publication status.

pub mod aggregate;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod notify;
pub mod platforms;
pub mod retry;
pub mod tokens;
pub mod types;
pub mod vault;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use engine::{JobOutcome, PublishEngine};
pub use error::{FanoutError, Result};
pub use types::{
    Connection, JobStatus, Platform, Publication, PublicationStatus, PublishJob, TargetAccount,
    TargetStatus,
};
