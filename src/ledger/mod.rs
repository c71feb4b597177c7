//! Reminder idempotency ledger.
//!
//! A durable set of fired event keys. The only write that matters is
//! [`Ledger::try_claim`], an atomic insert-if-absent: whoever inserts a key
//! first owns that event, every other caller sees [`ClaimOutcome::AlreadyFired`].
//!
//! Claims are recorded *before* delivery is attempted. A crash between claim
//! and delivery loses that one notification instead of sending it twice.
//!
//! # Event keys
//!
//! ```text
//! task:<task_id>:t-24h               threshold reminder
//! task:<task_id>:overdue-day-<n>     n-th overdue day
//! task:<task_id>:completed           completion seal, blocks every task reminder
//! digest:<user_id>:<YYYY-MM-DD>      daily digest
//! ```

mod memory;
mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::directory::{TaskId, UserId};
use crate::scheduler::Threshold;

/// Canonical identity of a reminder or digest event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey(String);

impl EventKey {
    /// Threshold reminder for a task.
    pub fn threshold(task_id: TaskId, threshold: Threshold) -> Self {
        Self(format!("task:{}:{}", task_id, threshold.label()))
    }

    /// N-th day overdue for a task.
    pub fn overdue(task_id: TaskId, day: u32) -> Self {
        Self(format!("task:{task_id}:overdue-day-{day}"))
    }

    /// Completion seal for a task.
    pub fn completed(task_id: TaskId) -> Self {
        Self(format!("task:{task_id}:completed"))
    }

    /// Daily digest for a user on a local calendar date.
    pub fn digest(user_id: UserId, date: NaiveDate) -> Self {
        Self(format!("digest:{}:{}", user_id, date.format("%Y-%m-%d")))
    }

    /// Wrap an already-encoded key, e.g. read back from storage.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// String form, as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns the event and must attempt it.
    Claimed,
    /// Somebody already claimed it. Not an error.
    AlreadyFired,
}

impl ClaimOutcome {
    /// Whether the caller won the claim.
    pub fn is_claimed(self) -> bool {
        self == Self::Claimed
    }
}

/// One row of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiredRecord {
    /// Event identity.
    pub event_key: EventKey,
    /// When the claim was made.
    pub fired_at: DateTime<Utc>,
    /// After this instant the record can be pruned.
    pub relevant_until: DateTime<Utc>,
}

/// Durable store of fired events.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Atomically record `key` unless it is already present.
    async fn try_claim(
        &self,
        key: &EventKey,
        fired_at: DateTime<Utc>,
        relevant_until: DateTime<Utc>,
    ) -> Result<ClaimOutcome>;

    /// Remove a claim after a definitive pre-delivery failure.
    /// Returns whether a record was removed.
    async fn unclaim(&self, key: &EventKey) -> Result<bool>;

    /// Read-only presence check.
    async fn is_fired(&self, key: &EventKey) -> Result<bool>;

    /// Delete records whose `relevant_until` is before `older_than`.
    /// Returns the number of records removed.
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<usize>;

    /// All records, ordered by key.
    async fn records(&self) -> Result<Vec<FiredRecord>>;
}
