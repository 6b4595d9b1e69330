//! Session controller.
//!
//! Owns the active set, the message log, the token ledger and the ratings
//! behind one lock. A user turn fans out to every eligible provider as an
//! independent Tokio task; each task awaits its completion outside the lock
//! and then applies the result as a single atomic update.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use compare_common::config::Config;
use compare_common::logging::generate_trace_id;
use compare_common::util::truncate_with_ellipsis;
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

use crate::catalog::ProviderCatalog;
use crate::clock::Clock;
use crate::error::SessionError;
use crate::ledger::{LedgerEntry, TokenLedger};
use crate::provider::{ChatMessage, CompletionRequest, CompletionResponse, ProviderError};
use crate::rating::{RatingLedger, SessionSummary};
use crate::session::{
    Author, Message, MessageId, MessageStatus, SessionMember, SessionState, API_ERROR_MARKER,
};
use crate::tokens::estimate_tokens;

const COMPLETION_PANICKED: &str = "Completion task panicked";

/// Knobs that shape a dispatch round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// `max_tokens` sent with every completion request
    pub max_tokens: i64,
    /// Give the prompt cost back when a provider call fails
    pub refund_prompt_on_error: bool,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            refund_prompt_on_error: false,
        }
    }
}

impl DispatchPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_tokens: config.proxy.max_tokens,
            refund_prompt_on_error: config.session.refund_prompt_on_error,
        }
    }
}

/// What happened to one provider in one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOutcome {
    Completed {
        provider_id: String,
        message_id: MessageId,
        prompt_cost: u64,
        response_cost: u64,
        latency_ms: u64,
    },
    Failed {
        provider_id: String,
        message_id: MessageId,
        error: String,
    },
    BudgetExhausted {
        provider_id: String,
        message_id: MessageId,
        available: u64,
        requested: u64,
    },
    /// A request for this provider was still outstanding
    SkippedBusy { provider_id: String },
    /// Provider is flagged exhausted until the next replenishment
    SkippedExhausted { provider_id: String },
}

impl ProviderOutcome {
    pub fn provider_id(&self) -> &str {
        match self {
            Self::Completed { provider_id, .. }
            | Self::Failed { provider_id, .. }
            | Self::BudgetExhausted { provider_id, .. }
            | Self::SkippedBusy { provider_id }
            | Self::SkippedExhausted { provider_id } => provider_id,
        }
    }

    /// Log entry this outcome wrote or settled, if any.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::Completed { message_id, .. }
            | Self::Failed { message_id, .. }
            | Self::BudgetExhausted { message_id, .. } => Some(*message_id),
            Self::SkippedBusy { .. } | Self::SkippedExhausted { .. } => None,
        }
    }
}

/// Handle on one fanned-out user turn.
///
/// Placeholders are already in the log when this is returned. Dropping the
/// handle does not cancel anything: outstanding requests keep running and
/// still settle the ledger and the log.
pub struct DispatchRound {
    trace_id: String,
    user_message: MessageId,
    settled: VecDeque<ProviderOutcome>,
    tasks: JoinSet<ProviderOutcome>,
}

impl DispatchRound {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn user_message_id(&self) -> MessageId {
        self.user_message
    }

    /// Requests still outstanding.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Next outcome, in the order providers settle. Outcomes decided without
    /// a request come first. `None` once every provider is accounted for.
    pub async fn next_outcome(&mut self) -> Option<ProviderOutcome> {
        if let Some(outcome) = self.settled.pop_front() {
            return Some(outcome);
        }

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(outcome) => return Some(outcome),
                Err(e) => {
                    tracing::error!(trace_id = %self.trace_id, error = %e, "Dispatch task failed");
                }
            }
        }
        None
    }

    /// Wait for every provider.
    pub async fn join(mut self) -> Vec<ProviderOutcome> {
        let mut outcomes = Vec::with_capacity(self.settled.len() + self.tasks.len());
        while let Some(outcome) = self.next_outcome().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}

impl Drop for DispatchRound {
    fn drop(&mut self) {
        self.tasks.detach_all();
    }
}

struct SessionCore {
    state: SessionState,
    ledger: TokenLedger,
    ratings: RatingLedger,
    exhausted: HashSet<String>,
    ended: Option<SessionSummary>,
}

struct Shared {
    catalog: ProviderCatalog,
    clock: Arc<dyn Clock>,
    policy: DispatchPolicy,
    core: Mutex<SessionCore>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold one provider's result into the ledger and the log.
    fn apply_completion(
        &self,
        provider_id: &str,
        message_id: MessageId,
        prompt_cost: u64,
        result: Result<CompletionResponse, ProviderError>,
    ) -> ProviderOutcome {
        let mut core = self.lock();
        let frozen = core.ended.is_some();

        match result {
            Ok(response) => {
                let response_cost = estimate_tokens(&response.content);
                if let Err(e) = core.ledger.consume(provider_id, response_cost) {
                    tracing::error!(provider = %provider_id, error = %e, "Failed to debit response cost");
                }

                tracing::info!(
                    provider = %provider_id,
                    prompt_cost,
                    response_cost,
                    latency_ms = response.latency_ms,
                    preview = %truncate_with_ellipsis(&response.content, 60),
                    "Completion received"
                );

                if !frozen {
                    core.state
                        .resolve_pending(message_id, MessageStatus::Complete, response.content);
                }

                ProviderOutcome::Completed {
                    provider_id: provider_id.to_string(),
                    message_id,
                    prompt_cost,
                    response_cost,
                    latency_ms: response.latency_ms,
                }
            }
            Err(e) => {
                tracing::warn!(provider = %provider_id, error = %e, "Completion failed");

                if self.policy.refund_prompt_on_error {
                    if let Err(e) = core.ledger.refund(provider_id, prompt_cost) {
                        tracing::error!(provider = %provider_id, error = %e, "Failed to refund prompt cost");
                    }
                }

                if !frozen {
                    core.state
                        .resolve_pending(message_id, MessageStatus::Error, API_ERROR_MARKER);
                }

                ProviderOutcome::Failed {
                    provider_id: provider_id.to_string(),
                    message_id,
                    error: e.message,
                }
            }
        }
    }

    fn sweep(&self) -> Vec<String> {
        let mut core = self.lock();
        if core.ended.is_some() {
            return Vec::new();
        }

        let now = self.clock.now();
        let mut replenished = Vec::new();
        for provider_id in core.state.active_ids() {
            match core.ledger.replenish_if_due(&provider_id, now) {
                Ok(true) => {
                    core.exhausted.remove(&provider_id);
                    replenished.push(provider_id);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(provider = %provider_id, error = %e, "Replenishment failed");
                }
            }
        }
        replenished
    }
}

/// Drives one comparison session.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    /// Open a session with a single pre-selected provider.
    ///
    /// The provider's budget is replenished first if due; a provider with
    /// no tokens left cannot open a session.
    pub fn start(
        catalog: ProviderCatalog,
        mut ledger: TokenLedger,
        clock: Arc<dyn Clock>,
        policy: DispatchPolicy,
        initial_provider: &str,
    ) -> Result<Self, SessionError> {
        if !catalog.contains(initial_provider) {
            return Err(SessionError::UnknownProvider(initial_provider.to_string()));
        }

        let now = clock.now();
        ledger.replenish_if_due(initial_provider, now)?;
        if ledger.entry(initial_provider).is_some_and(|e| e.is_empty()) {
            return Err(SessionError::ProviderUnavailable(initial_provider.to_string()));
        }

        tracing::info!(provider = %initial_provider, "Session started");

        Ok(Self {
            shared: Arc::new(Shared {
                catalog,
                clock,
                policy,
                core: Mutex::new(SessionCore {
                    state: SessionState::with_initial(initial_provider, now),
                    ledger,
                    ratings: RatingLedger::new(),
                    exhausted: HashSet::new(),
                    ended: None,
                }),
            }),
        })
    }

    /// Bring another provider into the comparison.
    pub fn add_provider(&self, provider_id: &str) -> Result<(), SessionError> {
        if !self.shared.catalog.contains(provider_id) {
            return Err(SessionError::UnknownProvider(provider_id.to_string()));
        }

        let mut core = self.shared.lock();
        if core.ended.is_some() {
            return Err(SessionError::SessionEnded);
        }
        if core.state.is_active(provider_id) {
            return Err(SessionError::AlreadyActive(provider_id.to_string()));
        }

        let now = self.shared.clock.now();
        if core.ledger.replenish_if_due(provider_id, now)? {
            core.exhausted.remove(provider_id);
        }
        core.state.add_provider(provider_id, now)?;

        tracing::info!(provider = %provider_id, "Provider joined session");
        Ok(())
    }

    /// Drop a provider from the comparison. Outstanding requests still settle.
    pub fn remove_provider(&self, provider_id: &str) -> Result<(), SessionError> {
        let mut core = self.shared.lock();
        if core.ended.is_some() {
            return Err(SessionError::SessionEnded);
        }
        core.state.remove_provider(provider_id)?;

        tracing::info!(provider = %provider_id, "Provider left session");
        Ok(())
    }

    /// Fan a user turn out to every eligible active provider.
    ///
    /// Blank input is ignored and yields `Ok(None)`. Must be called from
    /// within a Tokio runtime; requests are spawned onto it.
    pub fn send_user_message(&self, text: &str) -> Result<Option<DispatchRound>, SessionError> {
        if text.trim().is_empty() {
            return Ok(None);
        }

        let trace_id = generate_trace_id();
        let span = tracing::info_span!("dispatch_round", trace_id = %trace_id);
        let _enter = span.enter();

        let mut core = self.shared.lock();
        if core.ended.is_some() {
            return Err(SessionError::SessionEnded);
        }

        let now = self.shared.clock.now();
        let prompt_cost = estimate_tokens(text);
        let user_message = Message::user(text, now);
        let user_message_id = user_message.id;
        core.state.append(user_message);

        let busy: HashSet<String> = core
            .state
            .pending_providers()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut settled = VecDeque::new();
        let mut tasks = JoinSet::new();

        for provider_id in core.state.active_ids() {
            if core.exhausted.contains(&provider_id) {
                tracing::debug!(provider = %provider_id, "Skipping exhausted provider");
                settled.push_back(ProviderOutcome::SkippedExhausted { provider_id });
                continue;
            }

            if busy.contains(&provider_id) {
                tracing::warn!(provider = %provider_id, "Previous request still pending, not dispatching");
                settled.push_back(ProviderOutcome::SkippedBusy { provider_id });
                continue;
            }

            let Some(provider) = self.shared.catalog.get(&provider_id) else {
                tracing::error!(provider = %provider_id, "Active provider missing from catalog");
                continue;
            };

            match core.ledger.check_and_reserve(&provider_id, prompt_cost) {
                Ok(()) => {}
                Err(SessionError::InsufficientTokens {
                    available,
                    requested,
                    ..
                }) => {
                    tracing::warn!(
                        provider = %provider_id,
                        available,
                        requested,
                        "Token budget exhausted"
                    );
                    let marker = Message::budget_exhausted(provider_id.as_str(), now);
                    let message_id = marker.id;
                    core.state.append(marker);
                    core.exhausted.insert(provider_id.clone());
                    settled.push_back(ProviderOutcome::BudgetExhausted {
                        provider_id,
                        message_id,
                        available,
                        requested,
                    });
                    continue;
                }
                Err(e) => {
                    tracing::error!(provider = %provider_id, error = %e, "Budget check failed");
                    continue;
                }
            }

            let request = CompletionRequest {
                model: provider.model.clone(),
                max_tokens: self.shared.policy.max_tokens,
                messages: transcript(&core.state, &provider_id),
            };

            let placeholder = Message::pending(provider_id.as_str(), now);
            let message_id = placeholder.id;
            core.state.append(placeholder);

            tracing::debug!(
                provider = %provider_id,
                model = %request.model,
                turns = request.messages.len(),
                prompt_cost,
                "Dispatching completion"
            );

            let shared = Arc::clone(&self.shared);
            let completion = provider.completion();
            let model = request.model.clone();
            tasks.spawn(
                async move {
                    // A panicking capability must still settle its placeholder
                    let call = tokio::spawn(
                        async move { completion.complete(request).await }.instrument(tracing::Span::current()),
                    );
                    let result = match call.await {
                        Ok(result) => result,
                        Err(e) => {
                            tracing::error!(provider = %provider_id, error = %e, "Completion task aborted");
                            Err(ProviderError::new(provider_id.as_str(), model, COMPLETION_PANICKED))
                        }
                    };
                    shared.apply_completion(&provider_id, message_id, prompt_cost, result)
                }
                .instrument(span.clone()),
            );
        }

        Ok(Some(DispatchRound {
            trace_id,
            user_message: user_message_id,
            settled,
            tasks,
        }))
    }

    /// Score a complete provider response from 1 to 5.
    pub fn rate(&self, message_id: MessageId, value: u8) -> Result<(), SessionError> {
        let mut guard = self.shared.lock();
        let core = &mut *guard;
        if core.ended.is_some() {
            return Err(SessionError::SessionEnded);
        }
        core.ratings.rate(&core.state, message_id, value)
    }

    /// End the session and derive its summary. Later calls return the same
    /// summary; every other mutation fails with [`SessionError::SessionEnded`].
    pub fn end(&self) -> SessionSummary {
        let mut core = self.shared.lock();
        if let Some(summary) = &core.ended {
            return summary.clone();
        }

        let mut active = core.state.active_ids();
        active.sort_by_key(|id| self.shared.catalog.position(id).unwrap_or(usize::MAX));
        let providers: Vec<&str> = active.iter().map(String::as_str).collect();

        let summary = SessionSummary {
            ended_at: self.shared.clock.now(),
            scores: core.ratings.summarize(&providers, core.state.messages()),
        };

        tracing::info!(
            providers = summary.scores.len(),
            rated = core.ratings.len(),
            winner = summary.winner().map(|s| s.provider_id.as_str()).unwrap_or(""),
            "Session ended"
        );

        core.ended = Some(summary.clone());
        summary
    }

    /// Run one replenishment pass over the active set. Returns the providers
    /// whose budget was reset; their exhausted flag is cleared.
    pub fn sweep_replenishment(&self) -> Vec<String> {
        self.shared.sweep()
    }

    /// Run [`Self::sweep_replenishment`] every `period` until the session
    /// ends or every controller handle is dropped.
    pub fn spawn_replenish_sweep(&self, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if shared.lock().ended.is_some() {
                    break;
                }
                for provider_id in shared.sweep() {
                    tracing::debug!(provider = %provider_id, "Sweep cleared exhausted flag");
                }
            }
        })
    }

    pub fn catalog(&self) -> &ProviderCatalog {
        &self.shared.catalog
    }

    pub fn messages(&self) -> Vec<Message> {
        self.shared.lock().state.messages().to_vec()
    }

    pub fn message(&self, message_id: MessageId) -> Option<Message> {
        self.shared.lock().state.message(message_id).cloned()
    }

    pub fn visible_messages_for(&self, provider_id: &str) -> Vec<Message> {
        self.shared
            .lock()
            .state
            .visible_messages_for(provider_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn active_providers(&self) -> Vec<SessionMember> {
        self.shared.lock().state.members().to_vec()
    }

    pub fn ledger_entry(&self, provider_id: &str) -> Option<LedgerEntry> {
        self.shared.lock().ledger.entry(provider_id)
    }

    /// Time until the provider's next budget reset.
    pub fn refresh_in(&self, provider_id: &str) -> Option<ChronoDuration> {
        let now = self.shared.clock.now();
        self.shared.lock().ledger.refresh_in(provider_id, now)
    }

    pub fn is_exhausted(&self, provider_id: &str) -> bool {
        self.shared.lock().exhausted.contains(provider_id)
    }

    pub fn rating(&self, message_id: MessageId) -> Option<u8> {
        self.shared.lock().ratings.get(message_id)
    }

    pub fn is_ended(&self) -> bool {
        self.shared.lock().ended.is_some()
    }

    pub fn summary(&self) -> Option<SessionSummary> {
        self.shared.lock().ended.clone()
    }
}

/// Completed turns a provider may see, as chat messages.
fn transcript(state: &SessionState, provider_id: &str) -> Vec<ChatMessage> {
    state
        .visible_messages_for(provider_id)
        .into_iter()
        .filter(|m| m.status == MessageStatus::Complete)
        .map(|m| match m.author {
            Author::User => ChatMessage::user(m.content.clone()),
            Author::Provider(_) => ChatMessage::assistant(m.content.clone()),
        })
        .collect()
}
