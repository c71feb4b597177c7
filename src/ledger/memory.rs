//! In-memory ledger.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ClaimOutcome, EventKey, FiredRecord, Ledger};

/// Ledger held in a mutex-guarded map. Not durable across restarts.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<BTreeMap<EventKey, FiredRecord>>,
}

impl MemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut BTreeMap<EventKey, FiredRecord>) -> T) -> Result<T> {
        let mut guard = self
            .records
            .lock()
            .map_err(|e| anyhow!("ledger lock poisoned: {e}"))?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn try_claim(
        &self,
        key: &EventKey,
        fired_at: DateTime<Utc>,
        relevant_until: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        self.with(|records| {
            if records.contains_key(key) {
                return ClaimOutcome::AlreadyFired;
            }
            records.insert(
                key.clone(),
                FiredRecord {
                    event_key: key.clone(),
                    fired_at,
                    relevant_until,
                },
            );
            ClaimOutcome::Claimed
        })
    }

    async fn unclaim(&self, key: &EventKey) -> Result<bool> {
        self.with(|records| records.remove(key).is_some())
    }

    async fn is_fired(&self, key: &EventKey) -> Result<bool> {
        self.with(|records| records.contains_key(key))
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<usize> {
        self.with(|records| {
            let before = records.len();
            records.retain(|_, r| r.relevant_until >= older_than);
            before - records.len()
        })
    }

    async fn records(&self) -> Result<Vec<FiredRecord>> {
        self.with(|records| records.values().cloned().collect())
    }
}
