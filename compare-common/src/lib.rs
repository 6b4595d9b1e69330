//! Compare Common - Shared types, utilities, and configuration for chat-compare.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup
//! - Small formatting helpers shared by the session core and the CLI

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;
pub mod validation;

pub use config::{
    BudgetConfig, Config, ObservabilityConfig, PersistenceBackend, PersistenceConfig,
    ProviderConfig, ProxyConfig, SessionConfig,
};
pub use error::{Error, Result};
pub use validation::{Validate, ValidationError, ValidationResult, USER_SENTINEL};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::{Config, ProviderConfig, SessionConfig};
    pub use crate::error::{Error, Result};
    pub use crate::logging::init_logging_with_exclusions;
    pub use crate::validation::{Validate, ValidationError};
}
