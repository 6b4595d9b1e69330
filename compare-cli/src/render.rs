//! Plain-text rendering for the terminal.

use chrono::{DateTime, Duration, Utc};
use compare_common::util::{format_countdown, truncate_with_ellipsis};
use compare_core::{
    LedgerEntry, Message, MessageStatus, ProviderCatalog, ProviderOutcome, SessionController,
    SessionSummary, TokenLedger,
};
use serde::Serialize;

/// `1234567` -> `1,234,567`
pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Balance line shown under a provider name.
pub fn budget_label(entry: Option<LedgerEntry>) -> String {
    match entry {
        Some(LedgerEntry::Metered { available, total, .. }) => format!(
            "{} / {} tokens",
            group_thousands(available),
            group_thousands(total)
        ),
        Some(LedgerEntry::Unlimited) | None => "Unlimited".to_string(),
    }
}

/// Replenishment hint, empty when the budget is full or never refills.
pub fn refresh_label(entry: Option<LedgerEntry>, refresh_in: Option<Duration>) -> String {
    match (entry, refresh_in) {
        (Some(LedgerEntry::Metered { available, total, .. }), Some(remaining)) if available < total => {
            let secs = u64::try_from(remaining.num_seconds()).unwrap_or(0);
            format!("Refreshes in {}", format_countdown(secs))
        }
        _ => String::new(),
    }
}

/// One row of the `providers` listing.
#[derive(Debug, Serialize)]
pub struct ProviderRow {
    pub id: String,
    pub display_name: String,
    pub model: String,
    pub budget: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub refresh: String,
    pub available: bool,
}

impl ProviderRow {
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{:<20} {:<22} {}",
            self.id, self.display_name, self.budget
        );
        if !self.refresh.is_empty() {
            line.push_str("  ");
            line.push_str(&self.refresh);
        }
        if !self.available {
            line.push_str("  No available tokens");
        }
        line
    }
}

/// Catalog listing as of `now`. Overdue budgets are replenished first so the
/// listing agrees with what `chat` would accept.
pub fn provider_rows(catalog: &ProviderCatalog, ledger: &mut TokenLedger, now: DateTime<Utc>) -> Vec<ProviderRow> {
    catalog
        .iter()
        .map(|p| {
            if let Err(e) = ledger.replenish_if_due(&p.id, now) {
                tracing::warn!(provider = %p.id, error = %e, "Replenishment check failed");
            }
            let entry = ledger.entry(&p.id);
            ProviderRow {
                id: p.id.clone(),
                display_name: p.display_name.clone(),
                model: p.model.clone(),
                budget: budget_label(entry),
                refresh: refresh_label(entry, ledger.refresh_in(&p.id, now)),
                available: !entry.is_some_and(|e| e.is_empty()),
            }
        })
        .collect()
}

/// One line for a settled provider.
pub fn outcome_line(session: &SessionController, outcome: &ProviderOutcome) -> String {
    let name = display_name(session, outcome.provider_id());
    match outcome {
        ProviderOutcome::Completed {
            message_id,
            prompt_cost,
            response_cost,
            latency_ms,
            ..
        } => {
            let index = message_index(session, *message_id);
            let content = session
                .message(*message_id)
                .map(|m| m.content)
                .unwrap_or_default();
            format!(
                "[{index}] {name} ({latency_ms} ms, {} tokens): {content}",
                prompt_cost + response_cost
            )
        }
        ProviderOutcome::Failed { error, .. } => {
            format!("[!] {name}: API error ({})", truncate_with_ellipsis(error, 80))
        }
        ProviderOutcome::BudgetExhausted {
            available,
            requested,
            ..
        } => format!("[$] {name}: token budget exhausted ({available} left, {requested} needed)"),
        ProviderOutcome::SkippedBusy { .. } => {
            format!("[~] {name}: still answering the previous message")
        }
        ProviderOutcome::SkippedExhausted { .. } => {
            format!("[$] {name}: out of tokens until the next refresh")
        }
    }
}

/// One transcript line for `/status`.
pub fn message_line(session: &SessionController, index: usize, message: &Message) -> String {
    let who = match message.author.provider_id() {
        Some(id) => display_name(session, id),
        None => "You".to_string(),
    };
    let body = match message.status {
        MessageStatus::Complete => truncate_with_ellipsis(&message.content, 120),
        MessageStatus::Pending => "...".to_string(),
        MessageStatus::Error | MessageStatus::BudgetExhausted => format!("<{}>", message.content),
    };
    let rating = session
        .rating(message.id)
        .map(|r| format!(" [{r}/5]"))
        .unwrap_or_default();
    format!("[{index}] {who}: {body}{rating}")
}

/// Closing report.
pub fn summary_lines(session: &SessionController, summary: &SessionSummary) -> Vec<String> {
    let mut lines = vec!["Session summary".to_string()];
    for (rank, score) in summary.scores.iter().enumerate() {
        let rated = if score.rated == 0 {
            "no ratings".to_string()
        } else {
            format!("{:.1} avg over {} rated", score.average, score.rated)
        };
        lines.push(format!(
            "  {}. {} ({})",
            rank + 1,
            display_name(session, &score.provider_id),
            rated
        ));
    }
    lines
}

fn display_name(session: &SessionController, provider_id: &str) -> String {
    session
        .catalog()
        .get(provider_id)
        .map_or_else(|| provider_id.to_string(), |p| p.display_name.clone())
}

/// 1-based position in the log, used by `/rate`.
fn message_index(session: &SessionController, id: compare_core::MessageId) -> usize {
    session
        .messages()
        .iter()
        .position(|m| m.id == id)
        .map_or(0, |i| i + 1)
}
