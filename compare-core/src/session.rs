//! Session membership and the shared message log.
//!
//! Each provider sees only the part of the log written since it joined.
//! The log is append-only; the one permitted mutation is a pending
//! placeholder settling into its final status, in place.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use compare_common::USER_SENTINEL;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;

/// Content written into a placeholder whose request failed.
pub const API_ERROR_MARKER: &str = "API error";

/// Content of the bubble emitted when a provider runs out of tokens.
pub const BUDGET_EXHAUSTED_MARKER: &str = "Token budget exhausted";

/// Unique message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who wrote a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    User,
    Provider(String),
}

impl Author {
    pub fn provider_id(&self) -> Option<&str> {
        match self {
            Self::User => None,
            Self::Provider(id) => Some(id),
        }
    }

    pub const fn is_user(&self) -> bool {
        matches!(self, Self::User)
    }

    /// Provider id, or the `user` sentinel.
    pub fn as_str(&self) -> &str {
        match self {
            Self::User => USER_SENTINEL,
            Self::Provider(id) => id,
        }
    }
}

/// Lifecycle of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageStatus {
    Complete,
    Pending,
    Error,
    BudgetExhausted,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Pending => "pending",
            Self::Error => "error",
            Self::BudgetExhausted => "budget-exhausted",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub author: Author,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

impl Message {
    pub fn user(content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            author: Author::User,
            content: content.into(),
            created_at: now,
            status: MessageStatus::Complete,
        }
    }

    /// Placeholder for an outstanding request.
    pub fn pending(provider_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            author: Author::Provider(provider_id.into()),
            content: String::new(),
            created_at: now,
            status: MessageStatus::Pending,
        }
    }

    pub fn budget_exhausted(provider_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            author: Author::Provider(provider_id.into()),
            content: BUDGET_EXHAUSTED_MARKER.to_string(),
            created_at: now,
            status: MessageStatus::BudgetExhausted,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }
}

/// A provider's membership in the active set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMember {
    pub provider_id: String,
    pub joined_at: DateTime<Utc>,
}

/// Active set plus ordered message log.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    members: Vec<SessionMember>,
    messages: Vec<Message>,
}

impl SessionState {
    /// A session with exactly one active provider.
    pub fn with_initial(provider_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            members: vec![SessionMember {
                provider_id: provider_id.into(),
                joined_at: now,
            }],
            messages: Vec::new(),
        }
    }

    pub fn add_provider(&mut self, provider_id: &str, now: DateTime<Utc>) -> Result<(), SessionError> {
        if self.is_active(provider_id) {
            return Err(SessionError::AlreadyActive(provider_id.to_string()));
        }
        self.members.push(SessionMember {
            provider_id: provider_id.to_string(),
            joined_at: now,
        });
        Ok(())
    }

    pub fn remove_provider(&mut self, provider_id: &str) -> Result<(), SessionError> {
        let idx = self
            .members
            .iter()
            .position(|m| m.provider_id == provider_id)
            .ok_or_else(|| SessionError::NotActive(provider_id.to_string()))?;

        if self.members.len() == 1 {
            return Err(SessionError::LastActiveProvider(provider_id.to_string()));
        }

        self.members.remove(idx);
        Ok(())
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Settle a pending placeholder. Returns false if the id is unknown or
    /// the message already left `pending`.
    pub fn resolve_pending(&mut self, id: MessageId, status: MessageStatus, content: impl Into<String>) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) if message.is_pending() => {
                message.status = status;
                message.content = content.into();
                true
            }
            _ => false,
        }
    }

    /// Log entries a provider is allowed to see, in log order.
    ///
    /// User turns written at or after the join time, plus the provider's own
    /// messages from the same window. Inactive providers see nothing.
    pub fn visible_messages_for(&self, provider_id: &str) -> Vec<&Message> {
        let Some(joined_at) = self.joined_at(provider_id) else {
            return Vec::new();
        };

        self.messages
            .iter()
            .filter(|m| m.created_at >= joined_at)
            .filter(|m| match &m.author {
                Author::User => true,
                Author::Provider(id) => id == provider_id,
            })
            .collect()
    }

    pub fn is_active(&self, provider_id: &str) -> bool {
        self.members.iter().any(|m| m.provider_id == provider_id)
    }

    pub fn joined_at(&self, provider_id: &str) -> Option<DateTime<Utc>> {
        self.members
            .iter()
            .find(|m| m.provider_id == provider_id)
            .map(|m| m.joined_at)
    }

    pub fn members(&self) -> &[SessionMember] {
        &self.members
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.provider_id.clone()).collect()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Providers with at least one outstanding placeholder.
    pub fn pending_providers(&self) -> HashSet<&str> {
        self.messages
            .iter()
            .filter(|m| m.is_pending())
            .filter_map(|m| m.author.provider_id())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_add_and_remove_provider() {
        let mut state = SessionState::with_initial("a", t0());
        state.add_provider("b", t0()).unwrap();
        assert_eq!(state.active_ids(), vec!["a", "b"]);

        assert_eq!(
            state.add_provider("b", t0()),
            Err(SessionError::AlreadyActive("b".into()))
        );
        assert_eq!(state.members().len(), 2);

        state.remove_provider("a").unwrap();
        assert_eq!(
            state.remove_provider("a"),
            Err(SessionError::NotActive("a".into()))
        );
    }

    #[test]
    fn test_last_provider_cannot_be_removed() {
        let mut state = SessionState::with_initial("a", t0());
        assert_eq!(
            state.remove_provider("a"),
            Err(SessionError::LastActiveProvider("a".into()))
        );
        assert!(state.is_active("a"));
    }

    #[test]
    fn test_visibility_is_windowed_by_join_time() {
        let mut state = SessionState::with_initial("a", t0());
        state.append(Message::user("early", t0()));

        let join = t0() + Duration::seconds(10);
        state.add_provider("b", join).unwrap();
        state.append(Message::user("late", join));

        let seen: Vec<_> = state
            .visible_messages_for("b")
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(seen, vec!["late"]);
        assert_eq!(state.visible_messages_for("a").len(), 2);
    }

    #[test]
    fn test_visibility_excludes_other_providers() {
        let mut state = SessionState::with_initial("a", t0());
        state.add_provider("b", t0()).unwrap();
        state.append(Message::user("hi", t0()));

        let mut reply_a = Message::pending("a", t0());
        reply_a.status = MessageStatus::Complete;
        state.append(reply_a);
        state.append(Message::budget_exhausted("b", t0()));

        let for_a = state.visible_messages_for("a");
        assert_eq!(for_a.len(), 2);
        assert!(for_a.iter().all(|m| m.author.as_str() != "b"));
    }

    #[test]
    fn test_rejoin_starts_a_fresh_window() {
        let mut state = SessionState::with_initial("a", t0());
        state.add_provider("b", t0()).unwrap();
        state.append(Message::user("first", t0()));
        state.append(Message::pending("b", t0()));

        state.remove_provider("b").unwrap();
        assert!(state.visible_messages_for("b").is_empty());

        let rejoin = t0() + Duration::minutes(1);
        state.add_provider("b", rejoin).unwrap();
        assert!(state.visible_messages_for("b").is_empty());

        state.append(Message::user("second", rejoin));
        let seen: Vec<_> = state
            .visible_messages_for("b")
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(seen, vec!["second"]);
    }

    #[test]
    fn test_resolve_pending_preserves_identity() {
        let mut state = SessionState::with_initial("a", t0());
        let placeholder = Message::pending("a", t0());
        let id = placeholder.id;
        state.append(placeholder);
        assert!(state.pending_providers().contains("a"));

        assert!(state.resolve_pending(id, MessageStatus::Complete, "Hello!"));
        let settled = state.message(id).unwrap();
        assert_eq!(settled.status, MessageStatus::Complete);
        assert_eq!(settled.content, "Hello!");
        assert!(state.pending_providers().is_empty());

        // Settled messages stay settled
        assert!(!state.resolve_pending(id, MessageStatus::Error, API_ERROR_MARKER));
        assert!(!state.resolve_pending(MessageId::new(), MessageStatus::Complete, "x"));
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&MessageStatus::BudgetExhausted).unwrap();
        assert_eq!(json, "\"budget-exhausted\"");
        assert_eq!(MessageStatus::BudgetExhausted.to_string(), "budget-exhausted");
    }
}
