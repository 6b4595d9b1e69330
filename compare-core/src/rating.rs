//! Response ratings and the end-of-session summary.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::SessionError;
use crate::session::{Author, Message, MessageId, MessageStatus, SessionState};

/// Lowest accepted rating.
pub const MIN_RATING: u8 = 1;
/// Highest accepted rating.
pub const MAX_RATING: u8 = 5;

/// Average rating of one provider's responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderScore {
    pub provider_id: String,
    /// 0.0 when nothing was rated
    pub average: f64,
    pub rated: usize,
}

/// Read-only outcome of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub ended_at: DateTime<Utc>,
    /// Best first
    pub scores: Vec<ProviderScore>,
}

impl SessionSummary {
    pub fn winner(&self) -> Option<&ProviderScore> {
        self.scores.first()
    }
}

/// One score per rated message; a later rating replaces an earlier one.
#[derive(Debug, Clone, Default)]
pub struct RatingLedger {
    ratings: HashMap<MessageId, u8>,
}

impl RatingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rating for a complete provider response.
    pub fn rate(&mut self, state: &SessionState, message_id: MessageId, value: u8) -> Result<(), SessionError> {
        if !(MIN_RATING..=MAX_RATING).contains(&value) {
            return Err(SessionError::InvalidRating(value));
        }

        let message = state
            .message(message_id)
            .ok_or(SessionError::UnknownMessage(message_id))?;

        if message.author.is_user() || message.status != MessageStatus::Complete {
            return Err(SessionError::NotRateable(message_id));
        }

        self.ratings.insert(message_id, value);
        Ok(())
    }

    pub fn get(&self, message_id: MessageId) -> Option<u8> {
        self.ratings.get(&message_id).copied()
    }

    pub fn len(&self) -> usize {
        self.ratings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }

    /// Score each provider and order best first.
    ///
    /// `providers` must already be in catalog order; the sort is stable so
    /// equal averages keep that order.
    pub fn summarize(&self, providers: &[&str], messages: &[Message]) -> Vec<ProviderScore> {
        let mut scores: Vec<ProviderScore> = providers
            .iter()
            .map(|provider_id| {
                let values: Vec<u8> = messages
                    .iter()
                    .filter(|m| m.status == MessageStatus::Complete)
                    .filter(|m| matches!(&m.author, Author::Provider(id) if id == provider_id))
                    .filter_map(|m| self.get(m.id))
                    .collect();

                let average = if values.is_empty() {
                    0.0
                } else {
                    values.iter().map(|&v| f64::from(v)).sum::<f64>() / values.len() as f64
                };

                ProviderScore {
                    provider_id: (*provider_id).to_string(),
                    average,
                    rated: values.len(),
                }
            })
            .collect();

        scores.sort_by(|a, b| b.average.total_cmp(&a.average));
        scores
    }
}
