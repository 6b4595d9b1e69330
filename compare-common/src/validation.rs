//! Configuration validation.
//!
//! Catches catalog mistakes (duplicate ids, empty budgets, a provider named
//! like the user sentinel) before a session is ever started.

use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use crate::config::{BudgetConfig, Config, ObservabilityConfig, ProxyConfig, SessionConfig};

/// Provider id reserved for human-authored messages.
pub const USER_SENTINEL: &str = "user";

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Configuration conflict: {reason}")]
    Conflict { reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.proxy.validate() {
            errors.push(e);
        }

        if let Err(e) = self.session.validate() {
            errors.push(e);
        }

        if let Err(e) = self.observability.validate() {
            errors.push(e);
        }

        errors.extend(self.check_providers());

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }

    fn check_providers(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.providers.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "providers".into(),
            });
            return errors;
        }

        let mut seen = HashSet::new();
        for (idx, provider) in self.providers.iter().enumerate() {
            if provider.id.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("providers[{idx}].id"),
                });
                continue;
            }
            if provider.id == USER_SENTINEL {
                errors.push(ValidationError::InvalidValue {
                    field: format!("providers[{idx}].id"),
                    reason: format!("'{USER_SENTINEL}' is reserved for human messages"),
                });
            }
            if !seen.insert(provider.id.as_str()) {
                errors.push(ValidationError::Conflict {
                    reason: format!("Provider id '{}' is listed more than once", provider.id),
                });
            }
            if provider.model.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("providers[{}].model", provider.id),
                });
            }
            if let BudgetConfig::Limited {
                total,
                replenish_interval_secs,
            } = provider.budget
            {
                if total == 0 {
                    errors.push(ValidationError::InvalidValue {
                        field: format!("providers[{}].budget.total", provider.id),
                        reason: "must be greater than 0".into(),
                    });
                }
                if replenish_interval_secs == Some(0) {
                    errors.push(ValidationError::InvalidValue {
                        field: format!("providers[{}].budget.replenish_interval_secs", provider.id),
                        reason: "must be greater than 0 when set".into(),
                    });
                }
            }
        }

        errors
    }

    /// Load and validate configuration, applying environment overrides.
    pub fn load_and_validate(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = Self::load_with_env(path)?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
        Ok(config)
    }
}

impl Validate for ProxyConfig {
    fn validate(&self) -> ValidationResult<()> {
        let url = url::Url::parse(&self.endpoint).map_err(|e| ValidationError::InvalidValue {
            field: "proxy.endpoint".into(),
            reason: e.to_string(),
        })?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ValidationError::InvalidValue {
                field: "proxy.endpoint".into(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        if self.timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "proxy.timeout_secs".into(),
                reason: "timeouts must be greater than 0".into(),
            });
        }

        if self.max_tokens <= 0 {
            return Err(ValidationError::InvalidValue {
                field: "proxy.max_tokens".into(),
                reason: "must be greater than 0".into(),
            });
        }

        Ok(())
    }
}

impl Validate for SessionConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.replenish_sweep_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "session.replenish_sweep_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        match self.log_format.as_str() {
            "json" | "pretty" => Ok(()),
            other => Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("expected 'json' or 'pretty', got '{other}'"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;

    fn provider(id: &str, budget: BudgetConfig) -> ProviderConfig {
        ProviderConfig {
            id: id.into(),
            display_name: id.to_uppercase(),
            icon: String::new(),
            description: String::new(),
            model: format!("vendor/{id}"),
            budget,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_duplicate_provider_ids_conflict() {
        let mut config = Config::default();
        config.providers = vec![
            provider("a", BudgetConfig::Unlimited),
            provider("a", BudgetConfig::Unlimited),
        ];
        assert!(matches!(
            config.validate(),
            Err(ValidationError::Conflict { .. })
        ));
    }

    #[test]
    fn test_user_sentinel_is_reserved() {
        let mut config = Config::default();
        config.providers = vec![provider(USER_SENTINEL, BudgetConfig::Unlimited)];
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_budget_rejected() {
        let mut config = Config::default();
        config.providers = vec![provider(
            "a",
            BudgetConfig::Limited {
                total: 0,
                replenish_interval_secs: Some(0),
            },
        )];
        match config.validate() {
            Err(ValidationError::Multiple(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected two errors, got {other:?}"),
        }
    }

    #[test]
    fn test_load_and_validate_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        Config::default().save_to(&path).unwrap();
        let loaded = Config::load_and_validate(Some(&path)).unwrap();
        assert_eq!(loaded.providers.len(), Config::default().providers.len());

        let mut broken = Config::default();
        broken.providers.clear();
        broken.save_to(&path).unwrap();
        let err = Config::load_and_validate(Some(&path)).unwrap_err();
        assert!(err.to_string().starts_with("Invalid configuration"));
    }

    #[test]
    fn test_empty_catalog_rejected() {
        let mut config = Config::default();
        config.providers.clear();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::MissingField { .. })
        ));
    }

    #[test]
    fn test_proxy_endpoint_must_be_http() {
        let mut config = Config::default();
        config.proxy.endpoint = "ftp://example.com/proxy".into();
        assert!(config.validate().is_err());

        config.proxy.endpoint = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_format_checked() {
        let mut config = Config::default();
        config.observability.log_format = "xml".into();
        assert!(config.validate().is_err());
    }
}
