//! Configuration management for chat-compare.
//!
//! The client reads a single file at `~/.chatcompare/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (CHATCOMPARE_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `CHATCOMPARE_PROXY_URL` → proxy.endpoint
//! - `CHATCOMPARE_LOG_LEVEL` → observability.log_level
//! - `CHATCOMPARE_LOG_FORMAT` → observability.log_format
//! - `CHATCOMPARE_STORE_PATH` → persistence.path
//!
//! Upstream API keys are deliberately absent: they belong to the proxy's
//! environment, never to the client.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".chatcompare"),
        |dirs| dirs.home_dir().join(".chatcompare"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Proxy Configuration
// ============================================================================

/// Where completion requests are sent.
///
/// The proxy forwards `{model, max_tokens, messages}` upstream and answers
/// with `{choices: [{message: {content}}]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Full URL of the completion proxy endpoint
    #[serde(default = "default_proxy_endpoint")]
    pub endpoint: String,

    /// Whole-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// `max_tokens` sent with every completion request
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            endpoint: default_proxy_endpoint(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_proxy_endpoint() -> String {
    "http://127.0.0.1:3000/api/proxy".into()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_tokens() -> i64 {
    1024
}

// ============================================================================
// Provider Catalog Configuration
// ============================================================================

/// Token budget policy for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BudgetConfig {
    /// Never debited, never replenished
    Unlimited,
    /// Finite budget, optionally refilled to `total` every interval
    Limited {
        total: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replenish_interval_secs: Option<u64>,
    },
}

/// One entry of the provider catalog. List order is catalog order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique identifier (the string `user` is reserved)
    pub id: String,

    /// Human-readable name
    pub display_name: String,

    /// Icon reference (file name or URL)
    #[serde(default)]
    pub icon: String,

    /// Short description shown next to the name
    #[serde(default)]
    pub description: String,

    /// Upstream model identifier forwarded to the proxy
    pub model: String,

    /// Budget policy
    pub budget: BudgetConfig,
}

impl ProviderConfig {
    fn limited(
        id: &str,
        display_name: &str,
        icon: &str,
        description: &str,
        model: &str,
        total: u64,
        replenish_interval_secs: Option<u64>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            icon: icon.into(),
            description: description.into(),
            model: model.into(),
            budget: BudgetConfig::Limited {
                total,
                replenish_interval_secs,
            },
        }
    }
}

const SIX_HOURS: u64 = 6 * 3600;

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig::limited(
            "gpt-4o",
            "GPT-4o",
            "icon_gpt.jpg",
            "OpenAI flagship multimodal model",
            "openai/gpt-4o",
            1000,
            Some(SIX_HOURS),
        ),
        ProviderConfig::limited(
            "claude-3.7-sonnet",
            "Claude 3.7 Sonnet",
            "icon_claude.png",
            "Anthropic hybrid reasoning model",
            "anthropic/claude-3.7-sonnet",
            1000,
            Some(SIX_HOURS),
        ),
        ProviderConfig::limited(
            "gemini-2.0-flash",
            "Gemini 2.0 Flash",
            "icon_gemini.png",
            "Google low-latency model",
            "google/gemini-2.0-flash-001",
            300,
            Some(2 * 3600),
        ),
        ProviderConfig::limited(
            "deepseek-r1",
            "Deepseek R-1",
            "icon_deepseek.jpeg",
            "Open reasoning model",
            "deepseek/deepseek-r1",
            500,
            Some(SIX_HOURS),
        ),
        ProviderConfig::limited(
            "grok-3",
            "Grok 3",
            "icon_grok.png",
            "xAI general model",
            "x-ai/grok-3-beta",
            750,
            Some(SIX_HOURS),
        ),
        ProviderConfig {
            id: "llama-3.2".into(),
            display_name: "Llama 3.2".into(),
            icon: "icon_llama.png".into(),
            description: "Meta open-weights model".into(),
            model: "meta-llama/llama-3.2-3b-instruct:free".into(),
            budget: BudgetConfig::Unlimited,
        },
    ]
}

// ============================================================================
// Persistence Configuration
// ============================================================================

/// Backend for the durable token ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    /// Single JSON document
    #[default]
    Json,
    /// SQLite database, one row per provider
    Sqlite,
    /// Nothing survives the process
    Memory,
}

/// Durable ledger storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub backend: PersistenceBackend,

    /// Store location; `~` is expanded. Defaults to the config directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl PersistenceConfig {
    /// Resolve the on-disk location for the selected backend.
    pub fn resolved_path(&self) -> PathBuf {
        match self.path {
            Some(ref p) => PathBuf::from(shellexpand::tilde(p).into_owned()),
            None => {
                let file = match self.backend {
                    PersistenceBackend::Sqlite => "ledger.db",
                    PersistenceBackend::Json | PersistenceBackend::Memory => "ledger.json",
                };
                config_dir().join(file)
            }
        }
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Session controller tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Period of the background replenishment sweep
    #[serde(default = "default_sweep_secs")]
    pub replenish_sweep_secs: u64,

    /// Give the prompt cost back when a provider call fails
    #[serde(default)]
    pub refund_prompt_on_error: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            replenish_sweep_secs: default_sweep_secs(),
            refund_prompt_on_error: false,
        }
    }
}

fn default_sweep_secs() -> u64 {
    60
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets forced to `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// JSON Schema reference
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Completion proxy
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Provider catalog, in display order
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,

    /// Durable ledger storage
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Session controller tuning
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema: None,
            proxy: ProxyConfig::default(),
            providers: default_providers(),
            persistence: PersistenceConfig::default(),
            session: SessionConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration from `path` (or the default location) with
    /// environment variable overrides.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("CHATCOMPARE_PROXY_URL") {
            self.proxy.endpoint = url;
        }

        if let Ok(level) = std::env::var("CHATCOMPARE_LOG_LEVEL") {
            self.observability.log_level = level;
        }

        if let Ok(format) = std::env::var("CHATCOMPARE_LOG_FORMAT") {
            self.observability.log_format = format;
        }

        if let Ok(path) = std::env::var("CHATCOMPARE_STORE_PATH") {
            self.persistence.path = Some(path);
        }
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    /// Save configuration to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).with_context(|| {
                    format!("Failed to create config directory {}", dir.display())
                })?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// Look up a provider entry by id.
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_matches_product_lineup() {
        let config = Config::default();
        assert_eq!(config.providers.len(), 6);
        assert_eq!(config.providers[0].display_name, "GPT-4o");
        assert_eq!(
            config.provider("llama-3.2").map(|p| &p.budget),
            Some(&BudgetConfig::Unlimited)
        );
        assert_eq!(
            config.provider("gemini-2.0-flash").map(|p| &p.budget),
            Some(&BudgetConfig::Limited {
                total: 300,
                replenish_interval_secs: Some(7200)
            })
        );
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.proxy.endpoint, "http://127.0.0.1:3000/api/proxy");
        assert_eq!(config.session.replenish_sweep_secs, 60);
        assert!(!config.session.refund_prompt_on_error);
        assert_eq!(config.persistence.backend, PersistenceBackend::Json);
        assert_eq!(config.providers.len(), 6);
    }

    #[test]
    fn test_budget_config_tagging() {
        let json = r#"{
            "providers": [
                {"id": "a", "display_name": "A", "model": "m/a",
                 "budget": {"kind": "limited", "total": 800, "replenish_interval_secs": 21600}},
                {"id": "b", "display_name": "B", "model": "m/b",
                 "budget": {"kind": "unlimited"}}
            ],
            "persistence": {"backend": "sqlite"}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(
            config.providers[0].budget,
            BudgetConfig::Limited {
                total: 800,
                replenish_interval_secs: Some(21_600)
            }
        );
        assert_eq!(config.providers[1].budget, BudgetConfig::Unlimited);
        assert!(config.persistence.resolved_path().ends_with("ledger.db"));
    }

    #[test]
    fn test_observability_aliases() {
        let json = r#"{"observability": {"level": "debug", "format": "json"}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.observability.log_level, "debug");
        assert_eq!(config.observability.log_format, "json");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.proxy.max_tokens = 256;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.proxy.max_tokens, 256);
        assert_eq!(loaded.providers.len(), config.providers.len());
    }

    #[test]
    fn test_load_from_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ nope").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("config.json"));
    }

    #[test]
    fn test_explicit_store_path_is_tilde_expanded() {
        let persistence = PersistenceConfig {
            backend: PersistenceBackend::Json,
            path: Some("/tmp/chatcompare/ledger.json".into()),
        };
        assert_eq!(
            persistence.resolved_path(),
            PathBuf::from("/tmp/chatcompare/ledger.json")
        );

        let home_relative = PersistenceConfig {
            backend: PersistenceBackend::Json,
            path: Some("~/ledger.json".into()),
        };
        assert!(!home_relative.resolved_path().starts_with("~"));
    }
}
