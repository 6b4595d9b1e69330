//! Provider catalog.
//!
//! Built once at startup from configuration and shared read-only by the
//! session controller. Catalog order breaks ties in the session summary.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use compare_common::config::{BudgetConfig, Config, ProviderConfig};
use compare_common::USER_SENTINEL;

use crate::error::SessionError;
use crate::provider::{CompletionProvider, ProxyProvider};

/// How a provider's tokens are metered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetPolicy {
    Unlimited,
    Limited {
        total: u64,
        replenish_interval_secs: Option<u64>,
    },
}

impl From<&BudgetConfig> for BudgetPolicy {
    fn from(config: &BudgetConfig) -> Self {
        match *config {
            BudgetConfig::Unlimited => Self::Unlimited,
            BudgetConfig::Limited {
                total,
                replenish_interval_secs,
            } => Self::Limited {
                total,
                replenish_interval_secs,
            },
        }
    }
}

/// One configured chat-completion backend.
#[derive(Clone)]
pub struct Provider {
    pub id: String,
    pub display_name: String,
    pub icon: String,
    pub description: String,
    pub model: String,
    pub budget: BudgetPolicy,
    completion: Arc<dyn CompletionProvider>,
}

impl Provider {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        model: impl Into<String>,
        budget: BudgetPolicy,
        completion: Arc<dyn CompletionProvider>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            icon: String::new(),
            description: String::new(),
            model: model.into(),
            budget,
            completion,
        }
    }

    /// Build a catalog entry from its configuration.
    pub fn from_config(config: &ProviderConfig, completion: Arc<dyn CompletionProvider>) -> Self {
        Self {
            id: config.id.clone(),
            display_name: config.display_name.clone(),
            icon: config.icon.clone(),
            description: config.description.clone(),
            model: config.model.clone(),
            budget: BudgetPolicy::from(&config.budget),
            completion,
        }
    }

    pub fn completion(&self) -> Arc<dyn CompletionProvider> {
        Arc::clone(&self.completion)
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("model", &self.model)
            .field("budget", &self.budget)
            .field("completion", &self.completion.name())
            .finish()
    }
}

/// Ordered, immutable set of providers.
#[derive(Debug, Clone)]
pub struct ProviderCatalog {
    providers: Vec<Provider>,
}

impl ProviderCatalog {
    /// Create a catalog. Ids must be unique, non-empty, and not the user sentinel.
    pub fn new(providers: Vec<Provider>) -> Result<Self, SessionError> {
        if providers.is_empty() {
            return Err(SessionError::Catalog("catalog has no providers".into()));
        }

        let mut seen = HashSet::new();
        for provider in &providers {
            if provider.id.trim().is_empty() {
                return Err(SessionError::Catalog("provider id is empty".into()));
            }
            if provider.id == USER_SENTINEL {
                return Err(SessionError::Catalog(format!(
                    "provider id '{USER_SENTINEL}' is reserved"
                )));
            }
            if !seen.insert(provider.id.clone()) {
                return Err(SessionError::Catalog(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
        }

        Ok(Self { providers })
    }

    /// Build the catalog from configuration; every entry talks to the proxy.
    pub fn from_config(config: &Config) -> Result<Self, SessionError> {
        let proxy: Arc<dyn CompletionProvider> = Arc::new(ProxyProvider::new(&config.proxy));
        let providers = config
            .providers
            .iter()
            .map(|p| Provider::from_config(p, Arc::clone(&proxy)))
            .collect();
        Self::new(providers)
    }

    pub fn get(&self, id: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Catalog position, used as the summary tie-breaker.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.providers.iter().position(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Provider> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
