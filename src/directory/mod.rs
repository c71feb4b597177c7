//! Task/User Directory and Subscription Store collaborators.
//!
//! The reminder engine never owns users or tasks. It reads them through
//! [`Directory`] and touches push registrations only through
//! [`SubscriptionStore`]. Two adapters are provided:
//!
//! - [`MemoryDirectory`] - in-process state for tests and embedding
//! - [`FileDirectory`] - a JSON snapshot on disk, used by the daemon binary
//!
//! Both delegate the query semantics to [`DirectoryState`], so they answer
//! every query identically.

mod file;
mod memory;
mod state;

pub use file::FileDirectory;
pub use memory::MemoryDirectory;
pub use state::DirectoryState;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::notifications::push::PushSubscription;

/// Identifier of a user in the Directory.
pub type UserId = i64;

/// Identifier of a task in the Directory.
pub type TaskId = i64;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started.
    #[default]
    Pending,
    /// Started but not finished.
    InProgress,
    /// Finished. Completed tasks never produce reminders.
    Completed,
}

impl TaskStatus {
    /// Whether reminders may still fire for a task in this state.
    pub fn is_open(self) -> bool {
        self != Self::Completed
    }
}

/// A task with a deadline, owned by the Directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier.
    pub id: TaskId,
    /// Owning user.
    pub owner: UserId,
    /// Human-readable title, shown in notification bodies.
    pub title: String,
    /// Absolute deadline. Input may carry any offset; it is stored as UTC.
    pub deadline: DateTime<Utc>,
    /// Current lifecycle state.
    #[serde(default)]
    pub status: TaskStatus,
}

/// A user known to the Directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User identifier.
    pub id: UserId,
    /// Display name, used for welcome notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Inactive users receive no digests.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// The user's single push registration (last write wins).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_subscription: Option<PushSubscription>,
}

fn default_true() -> bool {
    true
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// Whether `at` falls inside the range.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Per-user task totals used by the daily digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Tasks whose deadline falls in the range.
    pub total: u32,
    /// Of those, how many are completed.
    pub completed: u32,
    /// Open tasks whose deadline is already in the past (any day).
    pub overdue: u32,
}

/// Read-only query surface over tasks and users.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Open tasks whose deadline lies in `(now, now + threshold]`.
    async fn list_due_tasks(&self, threshold: Duration, now: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Open tasks whose deadline is strictly before `now`.
    async fn list_overdue_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Completed tasks whose deadline is after `cutoff`.
    async fn list_completed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Active users that hold a push subscription.
    async fn list_active_subscribers(&self) -> Result<Vec<User>>;

    /// Digest totals for one user over `range`, with overdue counted at `now`.
    async fn task_stats(
        &self,
        user_id: UserId,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> Result<TaskStats>;
}

/// Mutable store of push registrations, keyed by user.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// The user's current subscription, if any.
    async fn get(&self, user_id: UserId) -> Result<Option<PushSubscription>>;

    /// Create or replace the user's subscription.
    async fn upsert(&self, user_id: UserId, subscription: PushSubscription) -> Result<()>;

    /// Remove the user's subscription. Returns whether one existed.
    async fn delete(&self, user_id: UserId) -> Result<bool>;
}
