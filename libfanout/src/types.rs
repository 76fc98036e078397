//! Core types for Fanout

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DbError, FanoutError};

// ============================================================================
// Platforms
// ============================================================================

/// Supported social networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Facebook,
    Instagram,
    Linkedin,
    Twitter,
    Tiktok,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Facebook,
        Platform::Instagram,
        Platform::Linkedin,
        Platform::Twitter,
        Platform::Tiktok,
    ];

    /// Lowercase identifier used in storage and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::Instagram => "instagram",
            Platform::Linkedin => "linkedin",
            Platform::Twitter => "twitter",
            Platform::Tiktok => "tiktok",
        }
    }

    /// Human-readable name used in notifications
    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::Facebook => "Facebook",
            Platform::Instagram => "Instagram",
            Platform::Linkedin => "LinkedIn",
            Platform::Twitter => "X (Twitter)",
            Platform::Tiktok => "TikTok",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "facebook" => Ok(Platform::Facebook),
            "instagram" => Ok(Platform::Instagram),
            "linkedin" => Ok(Platform::Linkedin),
            "twitter" | "x" => Ok(Platform::Twitter),
            "tiktok" => Ok(Platform::Tiktok),
            other => Err(DbError::InvalidValue(format!("unknown platform '{}'", other)).into()),
        }
    }
}

// ============================================================================
// Statuses
// ============================================================================

/// Status of a single target-account record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Pending,
    Publishing,
    Published,
    Failed,
    Skipped,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Pending => "pending",
            TargetStatus::Publishing => "publishing",
            TargetStatus::Published => "published",
            TargetStatus::Failed => "failed",
            TargetStatus::Skipped => "skipped",
        }
    }

    /// Whether the record's job has reached a terminal state
    pub fn is_settled(&self) -> bool {
        !matches!(self, TargetStatus::Pending | TargetStatus::Publishing)
    }
}

impl FromStr for TargetStatus {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TargetStatus::Pending),
            "publishing" => Ok(TargetStatus::Publishing),
            "published" => Ok(TargetStatus::Published),
            "failed" => Ok(TargetStatus::Failed),
            "skipped" => Ok(TargetStatus::Skipped),
            other => Err(DbError::InvalidValue(format!("unknown target status '{}'", other)).into()),
        }
    }
}

/// Status of a publish job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DbError::InvalidValue(format!("unknown job status '{}'", other)).into()),
        }
    }
}

/// Aggregate status of a publication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicationStatus {
    Pending,
    Publishing,
    Published,
    Partial,
    Failed,
}

impl PublicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicationStatus::Pending => "pending",
            PublicationStatus::Publishing => "publishing",
            PublicationStatus::Published => "published",
            PublicationStatus::Partial => "partial",
            PublicationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PublicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PublicationStatus {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PublicationStatus::Pending),
            "publishing" => Ok(PublicationStatus::Publishing),
            "published" => Ok(PublicationStatus::Published),
            "partial" => Ok(PublicationStatus::Partial),
            "failed" => Ok(PublicationStatus::Failed),
            other => Err(
                DbError::InvalidValue(format!("unknown publication status '{}'", other)).into(),
            ),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// A stored credential set for one external account on one platform
///
/// `access_token` and `refresh_token` hold vault ciphertext, never plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub client_id: String,
    pub user_id: String,
    pub platform: Platform,
    pub external_account_id: String,
    /// Page or organization the account posts as, when not posting as itself
    pub external_page_id: Option<String>,
    pub account_name: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<i64>,
    pub is_active: bool,
    pub last_error: Option<String>,
    pub last_used_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Connection {
    /// Create a new active connection with auto-generated ID and timestamps
    pub fn new(
        client_id: String,
        user_id: String,
        platform: Platform,
        external_account_id: String,
        access_token: String,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            client_id,
            user_id,
            platform,
            external_account_id,
            external_page_id: None,
            account_name: None,
            access_token,
            refresh_token: None,
            token_expires_at: None,
            is_active: true,
            last_error: None,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One composed content item fanned out to several accounts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publication {
    pub id: String,
    pub user_id: String,
    pub client_id: String,
    pub status: PublicationStatus,
    pub published_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Publication {
    pub fn new(user_id: String, client_id: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            client_id,
            status: PublicationStatus::Pending,
            published_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Adapted content destined for one connection of a publication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetAccount {
    pub id: String,
    pub publication_id: String,
    pub connection_id: String,
    pub content: String,
    pub hashtags: Vec<String>,
    pub media_urls: Vec<String>,
    pub status: TargetStatus,
    pub external_post_id: Option<String>,
    pub external_post_url: Option<String>,
    pub error_message: Option<String>,
    pub published_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TargetAccount {
    pub fn new(
        publication_id: String,
        connection_id: String,
        content: String,
        hashtags: Vec<String>,
        media_urls: Vec<String>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            publication_id,
            connection_id,
            content,
            hashtags,
            media_urls,
            status: TargetStatus::Pending,
            external_post_id: None,
            external_post_url: None,
            error_message: None,
            published_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Media references classified by kind
    pub fn media(&self) -> Vec<MediaItem> {
        self.media_urls.iter().map(|url| MediaItem::from_url(url)).collect()
    }
}

/// Retryable unit of work wrapping one target-account record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishJob {
    pub id: String,
    pub target_id: String,
    /// Owning publication, joined from the target record
    pub publication_id: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<i64>,
    pub processed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PublishJob {
    pub fn new(target_id: String, publication_id: String, max_attempts: u32) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            target_id,
            publication_id,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            next_retry_at: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-account outcome row used by the status aggregator
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub target_id: String,
    pub platform: Platform,
    pub status: TargetStatus,
    pub error_message: Option<String>,
}

// ============================================================================
// Media
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// A media reference attached to a target-account record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub url: String,
    pub kind: MediaKind,
}

impl MediaItem {
    /// Classify a media URL by its file extension
    ///
    /// Query strings and fragments are ignored. Unknown extensions are
    /// treated as images.
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let ext = path
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();

        let kind = match ext.as_str() {
            "mp4" | "mov" | "m4v" | "webm" | "avi" => MediaKind::Video,
            _ => MediaKind::Image,
        };

        Self {
            url: url.to_string(),
            kind,
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    /// Best-effort MIME type derived from the URL
    pub fn mime_type(&self) -> &'static str {
        let lower = self.url.split(['?', '#']).next().unwrap_or("").to_lowercase();
        match self.kind {
            MediaKind::Video if lower.ends_with(".mov") => "video/quicktime",
            MediaKind::Video if lower.ends_with(".webm") => "video/webm",
            MediaKind::Video => "video/mp4",
            MediaKind::Image if lower.ends_with(".png") => "image/png",
            MediaKind::Image if lower.ends_with(".gif") => "image/gif",
            MediaKind::Image if lower.ends_with(".webp") => "image/webp",
            MediaKind::Image => "image/jpeg",
        }
    }
}
