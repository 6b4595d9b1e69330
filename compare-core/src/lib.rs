//! Multi-model session controller for chat-compare.
//!
//! One session runs the same conversation against several independently
//! metered providers at once:
//!
//! - **Catalog**: configured providers and their budget policies
//! - **Ledger**: per-provider token balances with time-based replenishment
//! - **Session**: the active set and the join-windowed message log
//! - **Controller**: concurrent fan-out of user turns and reconciliation
//! - **Ratings**: per-response scores and the end-of-session summary
//! - **Store**: durable ledger state (JSON file, SQLite, or memory)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use compare_common::Config;
//! use compare_core::{
//!     open_store, Clock, DispatchPolicy, ProviderCatalog, SessionController, SystemClock,
//!     TokenLedger,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let catalog = ProviderCatalog::from_config(&config)?;
//! let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//! let ledger = TokenLedger::from_catalog(&catalog, open_store(&config.persistence)?, clock.now());
//!
//! let session = SessionController::start(
//!     catalog,
//!     ledger,
//!     clock,
//!     DispatchPolicy::from_config(&config),
//!     "gpt-4o",
//! )?;
//! session.add_provider("claude-3.7-sonnet")?;
//!
//! if let Some(round) = session.send_user_message("hello world")? {
//!     for outcome in round.join().await {
//!         println!("{}: {:?}", outcome.provider_id(), outcome);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod clock;
pub mod controller;
pub mod error;
pub mod ledger;
pub mod provider;
pub mod rating;
pub mod session;
pub mod store;
pub mod tokens;

pub use catalog::{BudgetPolicy, Provider, ProviderCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{DispatchPolicy, DispatchRound, ProviderOutcome, SessionController};
pub use error::SessionError;
pub use ledger::{LedgerEntry, TokenLedger};
pub use provider::{
    ChatMessage, ChatRole, CompletionProvider, CompletionRequest, CompletionResponse,
    ProviderError, ProxyProvider,
};
pub use rating::{ProviderScore, RatingLedger, SessionSummary};
pub use session::{
    Author, Message, MessageId, MessageStatus, SessionMember, SessionState, API_ERROR_MARKER,
    BUDGET_EXHAUSTED_MARKER,
};
pub use store::{
    open_store, JsonFileLedgerStore, LedgerStore, MemoryLedgerStore, PersistedBalance,
    PersistedLedger, SqliteLedgerStore,
};
pub use tokens::estimate_tokens;
