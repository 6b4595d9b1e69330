//! Per-provider token accounting.
//!
//! Balances are debited when a prompt goes out and again when a response
//! comes back, reset when the replenishment interval elapses, and flushed to
//! the [`LedgerStore`] after every change.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::catalog::{BudgetPolicy, ProviderCatalog};
use crate::error::SessionError;
use crate::store::{LedgerStore, PersistedBalance, PersistedLedger};

/// Balance of one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEntry {
    /// Never debited, never replenished.
    Unlimited,
    Metered {
        available: u64,
        total: u64,
        last_replenish_at: Option<DateTime<Utc>>,
        replenish_interval_secs: Option<u64>,
    },
}

impl LedgerEntry {
    fn fresh(policy: BudgetPolicy, now: DateTime<Utc>) -> Self {
        match policy {
            BudgetPolicy::Unlimited => Self::Unlimited,
            BudgetPolicy::Limited {
                total,
                replenish_interval_secs,
            } => Self::Metered {
                available: total,
                total,
                last_replenish_at: Some(now),
                replenish_interval_secs,
            },
        }
    }

    /// Remaining tokens, `None` when unlimited.
    pub const fn available(&self) -> Option<u64> {
        match self {
            Self::Unlimited => None,
            Self::Metered { available, .. } => Some(*available),
        }
    }

    /// True for a metered entry with nothing left.
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Metered { available: 0, .. })
    }
}

/// Token balances for every provider in the catalog.
pub struct TokenLedger {
    entries: Vec<(String, LedgerEntry)>,
    store: Arc<dyn LedgerStore>,
}

impl std::fmt::Debug for TokenLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLedger")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl TokenLedger {
    /// Build balances for every catalog provider, restoring what the store holds.
    pub fn from_catalog(catalog: &ProviderCatalog, store: Arc<dyn LedgerStore>, now: DateTime<Utc>) -> Self {
        Self::new(
            catalog.iter().map(|p| (p.id.clone(), p.budget)),
            store,
            now,
        )
    }

    /// Build balances from `(provider_id, policy)` pairs.
    ///
    /// Missing or unreadable stored state falls back to a full balance.
    /// Stored balances above the configured total are clamped down and
    /// records for unknown providers are ignored.
    pub fn new(
        budgets: impl IntoIterator<Item = (String, BudgetPolicy)>,
        store: Arc<dyn LedgerStore>,
        now: DateTime<Utc>,
    ) -> Self {
        let persisted = match store.load() {
            Ok(persisted) => persisted,
            Err(e) if e.is_malformed() => {
                tracing::warn!(error = %e, "Discarding malformed ledger state, using catalog defaults");
                PersistedLedger::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load ledger state, using catalog defaults");
                PersistedLedger::new()
            }
        };

        let entries: Vec<(String, LedgerEntry)> = budgets
            .into_iter()
            .map(|(id, policy)| {
                let entry = match (LedgerEntry::fresh(policy, now), persisted.get(&id)) {
                    (
                        LedgerEntry::Metered {
                            total,
                            replenish_interval_secs,
                            ..
                        },
                        Some(stored),
                    ) => LedgerEntry::Metered {
                        available: stored.available.min(total),
                        total,
                        last_replenish_at: stored.last_replenish_at,
                        replenish_interval_secs,
                    },
                    (fresh, _) => fresh,
                };
                (id, entry)
            })
            .collect();

        for id in persisted.keys() {
            if !entries.iter().any(|(known, _)| known == id) {
                tracing::debug!(provider = %id, "Ignoring stored balance for unknown provider");
            }
        }

        Self { entries, store }
    }

    pub fn entry(&self, provider_id: &str) -> Option<LedgerEntry> {
        self.entries
            .iter()
            .find(|(id, _)| id == provider_id)
            .map(|(_, entry)| *entry)
    }

    fn entry_mut(&mut self, provider_id: &str) -> Result<&mut LedgerEntry, SessionError> {
        self.entries
            .iter_mut()
            .find(|(id, _)| id == provider_id)
            .map(|(_, entry)| entry)
            .ok_or_else(|| SessionError::UnknownProvider(provider_id.to_string()))
    }

    /// Debit `cost` if the balance covers it; otherwise leave it untouched.
    pub fn check_and_reserve(&mut self, provider_id: &str, cost: u64) -> Result<(), SessionError> {
        match self.entry_mut(provider_id)? {
            LedgerEntry::Unlimited => return Ok(()),
            LedgerEntry::Metered { available, .. } => {
                if *available < cost {
                    return Err(SessionError::InsufficientTokens {
                        provider: provider_id.to_string(),
                        available: *available,
                        requested: cost,
                    });
                }
                *available -= cost;
                tracing::debug!(provider = %provider_id, cost, remaining = *available, "Reserved tokens");
            }
        }
        self.persist();
        Ok(())
    }

    /// Debit up to `amount`, stopping at zero. Returns what was actually taken.
    pub fn consume(&mut self, provider_id: &str, amount: u64) -> Result<u64, SessionError> {
        let taken = match self.entry_mut(provider_id)? {
            LedgerEntry::Unlimited => return Ok(0),
            LedgerEntry::Metered { available, .. } => {
                let taken = amount.min(*available);
                *available -= taken;
                if taken < amount {
                    tracing::debug!(
                        provider = %provider_id,
                        requested = amount,
                        taken,
                        "Response cost exceeded balance, clamped at zero"
                    );
                }
                taken
            }
        };
        self.persist();
        Ok(taken)
    }

    /// Give tokens back, never above the total.
    pub fn refund(&mut self, provider_id: &str, amount: u64) -> Result<(), SessionError> {
        match self.entry_mut(provider_id)? {
            LedgerEntry::Unlimited => return Ok(()),
            LedgerEntry::Metered { available, total, .. } => {
                *available = available.saturating_add(amount).min(*total);
            }
        }
        self.persist();
        Ok(())
    }

    /// Reset to the full total once the interval has elapsed.
    ///
    /// Returns true when a reset happened. A metered entry with no recorded
    /// replenishment time starts its interval now instead of resetting.
    pub fn replenish_if_due(&mut self, provider_id: &str, now: DateTime<Utc>) -> Result<bool, SessionError> {
        let replenished = match self.entry_mut(provider_id)? {
            LedgerEntry::Unlimited
            | LedgerEntry::Metered {
                replenish_interval_secs: None,
                ..
            } => return Ok(false),
            LedgerEntry::Metered {
                available,
                total,
                last_replenish_at,
                replenish_interval_secs: Some(interval),
            } => match last_replenish_at.as_ref().copied() {
                None => {
                    *last_replenish_at = Some(now);
                    false
                }
                Some(last) => {
                    let elapsed = now.signed_duration_since(last).num_seconds();
                    if elapsed < i64::try_from(*interval).unwrap_or(i64::MAX) {
                        return Ok(false);
                    }
                    *available = *total;
                    *last_replenish_at = Some(now);
                    tracing::info!(provider = %provider_id, total = *total, "Token budget replenished");
                    true
                }
            },
        };
        self.persist();
        Ok(replenished)
    }

    /// Time left until the next replenishment, if one is scheduled.
    pub fn refresh_in(&self, provider_id: &str, now: DateTime<Utc>) -> Option<Duration> {
        match self.entry(provider_id)? {
            LedgerEntry::Metered {
                last_replenish_at: Some(last),
                replenish_interval_secs: Some(interval),
                ..
            } => {
                let due = last + Duration::seconds(i64::try_from(interval).ok()?);
                Some((due - now).max(Duration::zero()))
            }
            _ => None,
        }
    }

    /// Durable fields of every metered entry.
    pub fn snapshot(&self) -> PersistedLedger {
        self.entries
            .iter()
            .filter_map(|(id, entry)| match *entry {
                LedgerEntry::Unlimited => None,
                LedgerEntry::Metered {
                    available,
                    last_replenish_at,
                    ..
                } => Some((
                    id.clone(),
                    PersistedBalance {
                        available,
                        last_replenish_at,
                    },
                )),
            })
            .collect()
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.snapshot()) {
            tracing::warn!(error = %e, "Failed to persist ledger state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLedgerStore;
    use chrono::TimeZone;
    use compare_common::error::{Error, Result as StoreResult};

    const SIX_HOURS: u64 = 6 * 60 * 60;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    fn limited(total: u64) -> BudgetPolicy {
        BudgetPolicy::Limited {
            total,
            replenish_interval_secs: Some(SIX_HOURS),
        }
    }

    fn ledger_with(store: Arc<MemoryLedgerStore>) -> TokenLedger {
        TokenLedger::new(
            vec![
                ("a".to_string(), limited(800)),
                ("b".to_string(), BudgetPolicy::Unlimited),
            ],
            store,
            t0(),
        )
    }

    struct BrokenStore;

    impl LedgerStore for BrokenStore {
        fn load(&self) -> StoreResult<PersistedLedger> {
            Err(Error::MalformedState("truncated document".into()))
        }

        fn save(&self, _ledger: &PersistedLedger) -> StoreResult<()> {
            Err(Error::Storage("disk full".into()))
        }
    }

    #[test]
    fn test_unlimited_never_changes() {
        let mut ledger = ledger_with(Arc::new(MemoryLedgerStore::default()));
        for cost in [0, 1, 10_000, u64::MAX] {
            ledger.check_and_reserve("b", cost).unwrap();
            assert_eq!(ledger.consume("b", cost).unwrap(), 0);
        }
        ledger.refund("b", 5).unwrap();
        assert!(!ledger.replenish_if_due("b", t0() + Duration::days(3)).unwrap());
        assert_eq!(ledger.entry("b"), Some(LedgerEntry::Unlimited));
    }

    #[test]
    fn test_reserve_debits_and_rejects_without_change() {
        let mut ledger = ledger_with(Arc::new(MemoryLedgerStore::default()));
        ledger.check_and_reserve("a", 2).unwrap();
        assert_eq!(ledger.entry("a").unwrap().available(), Some(798));

        let err = ledger.check_and_reserve("a", 799).unwrap_err();
        assert_eq!(
            err,
            SessionError::InsufficientTokens {
                provider: "a".into(),
                available: 798,
                requested: 799,
            }
        );
        assert_eq!(ledger.entry("a").unwrap().available(), Some(798));
    }

    #[test]
    fn test_balance_stays_within_bounds() {
        let mut ledger = ledger_with(Arc::new(MemoryLedgerStore::default()));
        assert_eq!(ledger.consume("a", 700).unwrap(), 700);
        assert_eq!(ledger.consume("a", 500).unwrap(), 100);
        assert_eq!(ledger.entry("a").unwrap().available(), Some(0));
        assert!(ledger.entry("a").unwrap().is_empty());

        ledger.refund("a", 5_000).unwrap();
        assert_eq!(ledger.entry("a").unwrap().available(), Some(800));
    }

    #[test]
    fn test_replenish_boundary() {
        let mut ledger = ledger_with(Arc::new(MemoryLedgerStore::default()));
        ledger.consume("a", 300).unwrap();

        let almost = t0() + Duration::hours(5) + Duration::minutes(59);
        assert!(!ledger.replenish_if_due("a", almost).unwrap());
        assert_eq!(ledger.entry("a").unwrap().available(), Some(500));

        let due = t0() + Duration::hours(6);
        assert!(ledger.replenish_if_due("a", due).unwrap());
        assert_eq!(ledger.entry("a").unwrap().available(), Some(800));
    }

    #[test]
    fn test_replenish_is_idempotent_within_interval() {
        let mut ledger = ledger_with(Arc::new(MemoryLedgerStore::default()));
        ledger.consume("a", 100).unwrap();

        let due = t0() + Duration::hours(7);
        assert!(ledger.replenish_if_due("a", due).unwrap());
        let once = ledger.entry("a");

        assert!(!ledger.replenish_if_due("a", due).unwrap());
        assert!(!ledger.replenish_if_due("a", due + Duration::hours(1)).unwrap());
        assert_eq!(ledger.entry("a"), once);
    }

    #[test]
    fn test_missing_replenish_time_starts_interval() {
        let mut stored = PersistedLedger::new();
        stored.insert(
            "a".into(),
            PersistedBalance {
                available: 10,
                last_replenish_at: None,
            },
        );
        let mut ledger = ledger_with(Arc::new(MemoryLedgerStore::with_contents(stored)));

        let later = t0() + Duration::days(1);
        assert!(!ledger.replenish_if_due("a", later).unwrap());
        assert_eq!(
            ledger.entry("a"),
            Some(LedgerEntry::Metered {
                available: 10,
                total: 800,
                last_replenish_at: Some(later),
                replenish_interval_secs: Some(SIX_HOURS),
            })
        );
    }

    #[test]
    fn test_restores_and_clamps_stored_state() {
        let mut stored = PersistedLedger::new();
        stored.insert(
            "a".into(),
            PersistedBalance {
                available: 5_000,
                last_replenish_at: Some(t0() - Duration::hours(1)),
            },
        );
        stored.insert(
            "retired".into(),
            PersistedBalance {
                available: 3,
                last_replenish_at: None,
            },
        );

        let ledger = ledger_with(Arc::new(MemoryLedgerStore::with_contents(stored)));
        assert_eq!(ledger.entry("a").unwrap().available(), Some(800));
        assert!(ledger.entry("retired").is_none());
        assert_eq!(
            ledger.refresh_in("a", t0()),
            Some(Duration::hours(5))
        );
    }

    #[test]
    fn test_every_mutation_is_flushed() {
        let store = Arc::new(MemoryLedgerStore::default());
        let mut ledger = ledger_with(Arc::clone(&store));

        ledger.check_and_reserve("a", 40).unwrap();
        assert_eq!(store.contents()["a"].available, 760);

        ledger.refund("a", 15).unwrap();
        assert_eq!(store.contents()["a"].available, 775);

        // Unlimited entries are never written
        assert!(!store.contents().contains_key("b"));
    }

    #[test]
    fn test_broken_store_falls_back_to_defaults() {
        let mut ledger = TokenLedger::new(
            vec![("a".to_string(), limited(300))],
            Arc::new(BrokenStore),
            t0(),
        );
        assert_eq!(ledger.entry("a").unwrap().available(), Some(300));

        // Save failures are logged, the in-memory balance still moves
        ledger.check_and_reserve("a", 30).unwrap();
        assert_eq!(ledger.entry("a").unwrap().available(), Some(270));
    }

    #[test]
    fn test_unknown_provider() {
        let mut ledger = ledger_with(Arc::new(MemoryLedgerStore::default()));
        assert_eq!(
            ledger.check_and_reserve("zzz", 1),
            Err(SessionError::UnknownProvider("zzz".into()))
        );
    }
}
