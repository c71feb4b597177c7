//! SQLite-backed ledger.
//!
//! Several processes may open the same file: WAL mode plus a busy timeout
//! lets them interleave, and the `PRIMARY KEY` on `event_key` makes
//! `INSERT OR IGNORE` the single atomic claim.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};

use super::{ClaimOutcome, EventKey, FiredRecord, Ledger};

/// How long a writer waits for another process holding the lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS fired_events (
        event_key TEXT PRIMARY KEY NOT NULL,
        fired_at INTEGER NOT NULL,
        relevant_until INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_fired_events_relevant_until
        ON fired_events(relevant_until);
";

/// Durable ledger in a SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteLedger {
    /// Open or create the ledger at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open ledger {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set ledger busy timeout")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("Failed to enable WAL mode")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create ledger schema")?;

        log::info!("[Ledger] Opened {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a blocking database call off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| anyhow!("ledger connection lock poisoned: {e}"))?;
            f(&guard).map_err(anyhow::Error::from)
        })
        .await
        .context("Ledger task failed")?
    }
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn try_claim(
        &self,
        key: &EventKey,
        fired_at: DateTime<Utc>,
        relevant_until: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let key_str = key.as_str().to_string();
        let inserted = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO fired_events (event_key, fired_at, relevant_until)
                     VALUES (?1, ?2, ?3)",
                    params![key_str, fired_at.timestamp(), relevant_until.timestamp()],
                )
            })
            .await
            .with_context(|| format!("Failed to claim {key}"))?;

        Ok(if inserted == 1 {
            ClaimOutcome::Claimed
        } else {
            ClaimOutcome::AlreadyFired
        })
    }

    async fn unclaim(&self, key: &EventKey) -> Result<bool> {
        let key_str = key.as_str().to_string();
        let removed = self
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM fired_events WHERE event_key = ?1",
                    params![key_str],
                )
            })
            .await
            .with_context(|| format!("Failed to unclaim {key}"))?;
        Ok(removed > 0)
    }

    async fn is_fired(&self, key: &EventKey) -> Result<bool> {
        let key_str = key.as_str().to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM fired_events WHERE event_key = ?1)",
                params![key_str],
                |row| row.get::<_, bool>(0),
            )
        })
        .await
        .with_context(|| format!("Failed to look up {key}"))
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let cutoff = older_than.timestamp();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM fired_events WHERE relevant_until < ?1",
                params![cutoff],
            )
        })
        .await
        .context("Failed to prune ledger")
    }

    async fn records(&self) -> Result<Vec<FiredRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT event_key, fired_at, relevant_until FROM fired_events ORDER BY event_key",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(FiredRecord {
                    event_key: EventKey::from_raw(row.get::<_, String>(0)?),
                    fired_at: from_unix(row.get(1)?),
                    relevant_until: from_unix(row.get(2)?),
                })
            })?;
            let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
        .context("Failed to list ledger records")
    }
}
