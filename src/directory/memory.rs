//! In-process Directory adapter.

use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::{
    DateRange, Directory, DirectoryState, SubscriptionStore, Task, TaskId, TaskStats, TaskStatus,
    User, UserId,
};
use crate::notifications::push::PushSubscription;

/// Directory and Subscription Store held entirely in memory.
///
/// Cloning shares the underlying state, so a test can keep a handle, mutate
/// tasks between ticks, and observe subscription deletions made by workers.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<RwLock<DirectoryState>>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory pre-populated from a snapshot.
    pub fn from_state(state: DirectoryState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Insert or replace a user.
    pub fn put_user(&self, user: User) -> Result<()> {
        self.write(|s| {
            s.users.insert(user.id, user);
        })
    }

    /// Insert or replace a task by id.
    pub fn put_task(&self, task: Task) -> Result<()> {
        self.write(|s| {
            s.tasks.retain(|t| t.id != task.id);
            s.tasks.push(task);
        })
    }

    /// Change a task's status. Returns false if the task is unknown.
    pub fn set_task_status(&self, task_id: TaskId, status: TaskStatus) -> Result<bool> {
        self.write(|s| {
            s.tasks
                .iter_mut()
                .find(|t| t.id == task_id)
                .map(|t| t.status = status)
                .is_some()
        })
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> Result<DirectoryState> {
        self.read(Clone::clone)
    }

    fn read<T>(&self, f: impl FnOnce(&DirectoryState) -> T) -> Result<T> {
        let guard = self
            .state
            .read()
            .map_err(|e| anyhow!("directory lock poisoned: {e}"))?;
        Ok(f(&guard))
    }

    fn write<T>(&self, f: impl FnOnce(&mut DirectoryState) -> T) -> Result<T> {
        let mut guard = self
            .state
            .write()
            .map_err(|e| anyhow!("directory lock poisoned: {e}"))?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn list_due_tasks(&self, threshold: Duration, now: DateTime<Utc>) -> Result<Vec<Task>> {
        self.read(|s| s.due_tasks(threshold, now))
    }

    async fn list_overdue_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        self.read(|s| s.overdue_tasks(now))
    }

    async fn list_completed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        self.read(|s| s.completed_since(cutoff))
    }

    async fn list_active_subscribers(&self) -> Result<Vec<User>> {
        self.read(DirectoryState::active_subscribers)
    }

    async fn task_stats(
        &self,
        user_id: UserId,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> Result<TaskStats> {
        self.read(|s| s.task_stats(user_id, range, now))
    }
}

#[async_trait]
impl SubscriptionStore for MemoryDirectory {
    async fn get(&self, user_id: UserId) -> Result<Option<PushSubscription>> {
        self.read(|s| s.subscription(user_id))
    }

    async fn upsert(&self, user_id: UserId, subscription: PushSubscription) -> Result<()> {
        self.write(|s| s.upsert_subscription(user_id, subscription))
    }

    async fn delete(&self, user_id: UserId) -> Result<bool> {
        self.write(|s| s.remove_subscription(user_id))
    }
}
