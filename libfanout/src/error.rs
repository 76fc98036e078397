//! Error types for Fanout

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FanoutError>;

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl FanoutError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            FanoutError::InvalidInput(_) => 3,
            FanoutError::Platform(PlatformError::Authentication(_)) => 2,
            FanoutError::Credential(_) => 2,
            FanoutError::Platform(_) => 1,
            FanoutError::Config(_) => 1,
            FanoutError::Database(_) => 1,
            FanoutError::NotFound(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

/// Failures reported by a platform publisher or the OAuth refresh client
///
/// Everything except `Network` is an expected outcome that publishers return
/// inside a failed [`PublishOutcome`](crate::platforms::PublishOutcome)
/// instead of propagating.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Media processing failed: {0}")]
    MediaProcessing(String),

    #[error("Media processing timed out: {0}")]
    MediaTimeout(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl PlatformError {
    /// Whether this failure is returned as an outcome rather than propagated
    pub fn is_expected(&self) -> bool {
        !matches!(self, PlatformError::Network(_))
    }
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Failed to decrypt credential (wrong vault identity or corrupted data)")]
    DecryptionFailed,

    #[error("Invalid vault identity: {0}")]
    InvalidIdentity(String),

    #[error("No refresh token stored for {0} connection. Suggestion: reconnect the account.")]
    MissingRefreshToken(String),
}
