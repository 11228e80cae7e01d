//! Error handling for PiVision

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error (malformed ROI, bad payload field)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict (duplicate device sequence)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Config error (missing or inconsistent device configuration)
    #[error("Config error: {0}")]
    Config(String),

    /// Image decode error
    #[error("Image decode error: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// Detector adapter error
    #[error("Detector error: {0}")]
    Detector(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLx database error
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry can plausibly succeed.
    ///
    /// Transient failures (storage, database, unreadable image, detector
    /// hiccup) go back to the queue with backoff. Permanent failures
    /// (validation, configuration, conflicts) dead-letter immediately since
    /// retrying cannot fix them.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::Sqlx(_)
            | Error::Migrate(_)
            | Error::ImageDecode(_)
            | Error::Detector(_)
            | Error::Internal(_) => true,
            Error::NotFound(_)
            | Error::Validation(_)
            | Error::Conflict(_)
            | Error::Config(_)
            | Error::Serialization(_) => false,
        }
    }
}
