//! Error types for chat-compare.

use thiserror::Error;

/// Result type alias using the shared error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for chat-compare infrastructure.
#[derive(Error, Debug)]
pub enum Error {
    /// Durable store could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),

    /// Durable store was readable but its contents could not be parsed
    #[error("Malformed persisted state: {0}")]
    MalformedState(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Check if this error means stored data exists but is unusable.
    pub fn is_malformed(&self) -> bool {
        match self {
            Self::MalformedState(_) | Self::Json(_) => true,
            Self::WithContext { source, .. } => source.is_malformed(),
            _ => false,
        }
    }
}

/// Extension trait for adding context to any error type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}
