//! Shared query semantics for the Directory adapters.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{DateRange, Task, TaskStats, User, UserId};
use crate::notifications::push::PushSubscription;

/// Snapshot of users and tasks.
///
/// This is also the on-disk format of [`super::FileDirectory`]:
///
/// ```json
/// {
///   "users": [{ "id": 1, "name": "Ada", "push_subscription": { "endpoint": "...", "p256dh": "...", "auth": "..." } }],
///   "tasks": [{ "id": 7, "owner": 1, "title": "Essay", "deadline": "2026-05-01T18:00:00+03:00", "status": "pending" }]
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryState {
    /// Users keyed by id.
    #[serde(default, with = "users_as_list")]
    pub users: BTreeMap<UserId, User>,
    /// All tasks, any status.
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl DirectoryState {
    /// Build a snapshot from plain lists.
    pub fn new(users: Vec<User>, tasks: Vec<Task>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.id, u)).collect(),
            tasks,
        }
    }

    /// Open tasks with a deadline in `(now, now + threshold]`.
    pub fn due_tasks(&self, threshold: Duration, now: DateTime<Utc>) -> Vec<Task> {
        let horizon = now + threshold;
        self.tasks
            .iter()
            .filter(|t| t.status.is_open() && t.deadline > now && t.deadline <= horizon)
            .cloned()
            .collect()
    }

    /// Open tasks with a deadline strictly before `now`.
    pub fn overdue_tasks(&self, now: DateTime<Utc>) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.status.is_open() && t.deadline < now)
            .cloned()
            .collect()
    }

    /// Completed tasks whose deadline is after `cutoff`.
    pub fn completed_since(&self, cutoff: DateTime<Utc>) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| !t.status.is_open() && t.deadline > cutoff)
            .cloned()
            .collect()
    }

    /// Active users holding a push subscription.
    pub fn active_subscribers(&self) -> Vec<User> {
        self.users
            .values()
            .filter(|u| u.is_active && u.push_subscription.is_some())
            .cloned()
            .collect()
    }

    /// Digest totals for `user_id`.
    pub fn task_stats(&self, user_id: UserId, range: DateRange, now: DateTime<Utc>) -> TaskStats {
        let mut stats = TaskStats::default();
        for task in self.tasks.iter().filter(|t| t.owner == user_id) {
            if range.contains(task.deadline) {
                stats.total += 1;
                if !task.status.is_open() {
                    stats.completed += 1;
                }
            }
            if task.status.is_open() && task.deadline < now {
                stats.overdue += 1;
            }
        }
        stats
    }

    /// The user's subscription, if the user exists and has one.
    pub fn subscription(&self, user_id: UserId) -> Option<PushSubscription> {
        self.users
            .get(&user_id)
            .and_then(|u| u.push_subscription.clone())
    }

    /// Add or replace a user's push subscription.
    ///
    /// Deduplicates by endpoint: if another user already holds a subscription
    /// with the same push endpoint, that stale copy is removed first. A browser
    /// that re-subscribes after switching accounts keeps its endpoint, and the
    /// previous account must stop receiving that browser's notifications.
    pub fn upsert_subscription(&mut self, user_id: UserId, subscription: PushSubscription) {
        for (id, user) in &mut self.users {
            let stale = *id != user_id
                && user
                    .push_subscription
                    .as_ref()
                    .is_some_and(|s| s.endpoint == subscription.endpoint);
            if stale {
                log::info!(
                    "[Directory] Replacing stale subscription of user {} (same endpoint, new user {})",
                    id,
                    user_id
                );
                user.push_subscription = None;
            }
        }

        self.users
            .entry(user_id)
            .or_insert_with(|| User {
                id: user_id,
                name: None,
                is_active: true,
                push_subscription: None,
            })
            .push_subscription = Some(subscription);
    }

    /// Remove a user's subscription. Returns whether one existed.
    pub fn remove_subscription(&mut self, user_id: UserId) -> bool {
        self.users
            .get_mut(&user_id)
            .and_then(|u| u.push_subscription.take())
            .is_some()
    }
}

/// Users are stored as a JSON list and indexed by id in memory.
mod users_as_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{User, UserId};

    pub fn serialize<S: Serializer>(
        users: &BTreeMap<UserId, User>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let list: Vec<&User> = users.values().collect();
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<UserId, User>, D::Error> {
        let list = Vec::<User>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|u| (u.id, u)).collect())
    }
}
