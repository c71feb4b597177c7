//! JSON snapshot Directory adapter.
//!
//! The snapshot is re-read on every query, so an external process (the CRUD
//! backend, a cron export) may rewrite it at any time. Subscription writes
//! made by this process go through a temp file and an atomic rename.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use super::{DateRange, Directory, DirectoryState, SubscriptionStore, Task, TaskStats, User, UserId};
use crate::notifications::push::PushSubscription;

/// Directory backed by a JSON file on disk.
#[derive(Debug)]
pub struct FileDirectory {
    path: PathBuf,
    /// Serializes read-modify-write cycles from this process.
    write_lock: Mutex<()>,
}

impl FileDirectory {
    /// Open a directory at `path`. The file does not have to exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the backing snapshot.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current snapshot. A missing file is an empty directory.
    pub async fn load(&self) -> Result<DirectoryState> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!(
                    "[Directory] No snapshot at {}, treating as empty",
                    self.path.display()
                );
                return Ok(DirectoryState::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse directory snapshot {}", self.path.display()))
    }

    /// Write a snapshot atomically (temp file + rename).
    pub async fn save(&self, state: &DirectoryState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let content =
            serde_json::to_string_pretty(state).context("Failed to serialize directory")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;

        // Subscriptions hold per-user key material
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .context("Failed to set directory file permissions")?;
        }

        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    async fn modify<T>(&self, f: impl FnOnce(&mut DirectoryState) -> T + Send) -> Result<T> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.load().await?;
        let result = f(&mut state);
        self.save(&state).await?;
        Ok(result)
    }
}

#[async_trait]
impl Directory for FileDirectory {
    async fn list_due_tasks(&self, threshold: Duration, now: DateTime<Utc>) -> Result<Vec<Task>> {
        Ok(self.load().await?.due_tasks(threshold, now))
    }

    async fn list_overdue_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        Ok(self.load().await?.overdue_tasks(now))
    }

    async fn list_completed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        Ok(self.load().await?.completed_since(cutoff))
    }

    async fn list_active_subscribers(&self) -> Result<Vec<User>> {
        Ok(self.load().await?.active_subscribers())
    }

    async fn task_stats(
        &self,
        user_id: UserId,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> Result<TaskStats> {
        Ok(self.load().await?.task_stats(user_id, range, now))
    }
}

#[async_trait]
impl SubscriptionStore for FileDirectory {
    async fn get(&self, user_id: UserId) -> Result<Option<PushSubscription>> {
        Ok(self.load().await?.subscription(user_id))
    }

    async fn upsert(&self, user_id: UserId, subscription: PushSubscription) -> Result<()> {
        self.modify(|s| s.upsert_subscription(user_id, subscription))
            .await
    }

    async fn delete(&self, user_id: UserId) -> Result<bool> {
        let removed = self.modify(|s| s.remove_subscription(user_id)).await?;
        if removed {
            log::info!("[Directory] Deleted push subscription for user {}", user_id);
        }
        Ok(removed)
    }
}
