//! Typed rejections returned by the session controller.
//!
//! None of these abort a session: callers get the error back and state is
//! left exactly as it was before the call.

use thiserror::Error;

use crate::session::MessageId;

/// Error returned by catalog, ledger, session and rating operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The id is not in the provider catalog
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Provider is already in the active set
    #[error("Provider {0} is already active")]
    AlreadyActive(String),

    /// Provider is not in the active set
    #[error("Provider {0} is not active")]
    NotActive(String),

    /// A running session always keeps one active provider
    #[error("Provider {0} is the last active provider and cannot be removed")]
    LastActiveProvider(String),

    /// Budget check failed
    #[error("Insufficient tokens for {provider}: {available} available, {requested} requested")]
    InsufficientTokens {
        provider: String,
        available: u64,
        requested: u64,
    },

    /// Provider has no tokens left and cannot open a session
    #[error("Provider {0} has no available tokens")]
    ProviderUnavailable(String),

    /// Rating outside 1..=5
    #[error("Invalid rating {0}: must be between 1 and 5")]
    InvalidRating(u8),

    /// Only complete provider responses can be rated
    #[error("Message {0} cannot be rated")]
    NotRateable(MessageId),

    /// Message id not present in the log
    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),

    /// Session is terminal
    #[error("Session has ended")]
    SessionEnded,

    /// Catalog could not be constructed
    #[error("Invalid catalog: {0}")]
    Catalog(String),
}

impl SessionError {
    /// Check if this is a budget failure.
    pub const fn is_insufficient_tokens(&self) -> bool {
        matches!(self, Self::InsufficientTokens { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_tokens_message() {
        let err = SessionError::InsufficientTokens {
            provider: "gpt-4o".into(),
            available: 1,
            requested: 2,
        };
        assert!(err.is_insufficient_tokens());
        assert_eq!(
            err.to_string(),
            "Insufficient tokens for gpt-4o: 1 available, 2 requested"
        );
    }
}
