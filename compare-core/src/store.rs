//! Durable storage for the token ledger.
//!
//! Only two fields per provider survive a restart: the available count and
//! the last replenishment time. Totals and intervals always come from the
//! catalog.

use chrono::{DateTime, Utc};
use compare_common::config::{PersistenceBackend, PersistenceConfig};
use compare_common::error::{Error, Result, ResultExt};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Durable fields of one ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedBalance {
    pub available: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_replenish_at: Option<DateTime<Utc>>,
}

/// Snapshot keyed by provider id.
pub type PersistedLedger = HashMap<String, PersistedBalance>;

/// Load/save adapter for ledger state.
pub trait LedgerStore: Send + Sync {
    /// Read the stored snapshot. An absent store yields an empty map.
    fn load(&self) -> Result<PersistedLedger>;

    /// Replace the stored snapshot.
    fn save(&self, ledger: &PersistedLedger) -> Result<()>;
}

/// Open the store selected in configuration.
pub fn open_store(config: &PersistenceConfig) -> anyhow::Result<Arc<dyn LedgerStore>> {
    let path = config.resolved_path();
    let store: Arc<dyn LedgerStore> = match config.backend {
        PersistenceBackend::Json => Arc::new(JsonFileLedgerStore::new(path)),
        PersistenceBackend::Sqlite => Arc::new(SqliteLedgerStore::new(&path)?),
        PersistenceBackend::Memory => Arc::new(MemoryLedgerStore::default()),
    };
    Ok(store)
}

// ============================================================================
// In-memory
// ============================================================================

/// Keeps the snapshot in process memory.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    inner: Mutex<PersistedLedger>,
}

impl MemoryLedgerStore {
    pub fn with_contents(ledger: PersistedLedger) -> Self {
        Self {
            inner: Mutex::new(ledger),
        }
    }

    /// Current stored snapshot.
    pub fn contents(&self) -> PersistedLedger {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> Result<PersistedLedger> {
        let guard = self
            .inner
            .lock()
            .map_err(|e| Error::Internal(format!("Lock error: {e}")))?;
        Ok(guard.clone())
    }

    fn save(&self, ledger: &PersistedLedger) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|e| Error::Internal(format!("Lock error: {e}")))?;
        *guard = ledger.clone();
        Ok(())
    }
}

// ============================================================================
// JSON file
// ============================================================================

/// One JSON object `{provider_id: {available, last_replenish_at}}` on disk.
#[derive(Debug, Clone)]
pub struct JsonFileLedgerStore {
    path: PathBuf,
}

impl JsonFileLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LedgerStore for JsonFileLedgerStore {
    fn load(&self) -> Result<PersistedLedger> {
        if !self.path.exists() {
            return Ok(PersistedLedger::new());
        }

        let content = fs::read_to_string(&self.path)
            .context(format!("Failed to read {}", self.path.display()))?;

        serde_json::from_str(&content).map_err(|e| {
            Error::MalformedState(format!("{}: {}", self.path.display(), e))
        })
    }

    fn save(&self, ledger: &PersistedLedger) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .context(format!("Failed to create {}", dir.display()))?;
            }
        }

        // Write-then-rename so a crash never leaves half a document behind
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(ledger)?;
        fs::write(&tmp, content).context(format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .context(format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

// ============================================================================
// SQLite
// ============================================================================

/// One row per provider in a local SQLite database. Saves upsert every
/// provider in the snapshot inside a single transaction.
pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

impl SqliteLedgerStore {
    /// Open (or create) the database at the given path.
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ledger (
                provider_id        TEXT PRIMARY KEY,
                available          INTEGER NOT NULL,
                last_replenish_at  TEXT
            );",
        )
    }
}

fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

impl LedgerStore for SqliteLedgerStore {
    fn load(&self) -> Result<PersistedLedger> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Lock error: {e}")))?;

        let mut stmt = conn
            .prepare("SELECT provider_id, available, last_replenish_at FROM ledger")
            .map_err(storage_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(storage_err)?;

        let mut ledger = PersistedLedger::new();
        for row in rows {
            let (provider_id, available, last) = row.map_err(storage_err)?;

            let available = u64::try_from(available).map_err(|_| {
                Error::MalformedState(format!(
                    "negative balance {available} stored for {provider_id}"
                ))
            })?;

            let last_replenish_at = last
                .map(|raw| {
                    DateTime::parse_from_rfc3339(&raw)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| {
                            Error::MalformedState(format!(
                                "bad timestamp '{raw}' stored for {provider_id}: {e}"
                            ))
                        })
                })
                .transpose()?;

            ledger.insert(
                provider_id,
                PersistedBalance {
                    available,
                    last_replenish_at,
                },
            );
        }

        Ok(ledger)
    }

    fn save(&self, ledger: &PersistedLedger) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Lock error: {e}")))?;

        let tx = conn.transaction().map_err(storage_err)?;
        for (provider_id, balance) in ledger {
            tx.execute(
                r"
                INSERT INTO ledger (provider_id, available, last_replenish_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(provider_id) DO UPDATE SET
                    available = ?2,
                    last_replenish_at = ?3
                ",
                params![
                    provider_id,
                    i64::try_from(balance.available).unwrap_or(i64::MAX),
                    balance.last_replenish_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;

        Ok(())
    }
}
