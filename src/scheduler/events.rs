//! Events the scheduler emits.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::directory::{Task, TaskStats, UserId};
use crate::ledger::EventKey;

/// A reminder offset before a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Threshold {
    minutes: u32,
}

impl Threshold {
    /// Threshold `minutes` before the deadline.
    pub const fn from_minutes(minutes: u32) -> Self {
        Self { minutes }
    }

    /// Offset in minutes.
    pub fn minutes(self) -> u32 {
        self.minutes
    }

    /// Window width.
    pub fn duration(self) -> Duration {
        Duration::minutes(i64::from(self.minutes))
    }

    /// Stable label used in event keys: `t-24h`, `t-1h`, `t-30m`.
    pub fn label(self) -> String {
        if self.minutes % 60 == 0 {
            format!("t-{}h", self.minutes / 60)
        } else {
            format!("t-{}m", self.minutes)
        }
    }
}

/// A due event, handed from the scheduler to the delivery coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReminderEvent {
    /// Task entered a threshold window.
    Deadline {
        /// The task, as read during the sweep.
        task: Task,
        /// Tightest window the task is in.
        threshold: Threshold,
    },
    /// Task is overdue by `day` whole days.
    Overdue {
        /// The task, as read during the sweep.
        task: Task,
        /// Whole days past the deadline, at least 1.
        day: u32,
    },
    /// Daily digest for one user.
    Digest {
        /// Recipient.
        user_id: UserId,
        /// Local calendar date of the digest.
        date: NaiveDate,
        /// Totals computed during the sweep.
        stats: TaskStats,
        /// End of the local day, in UTC.
        day_end: DateTime<Utc>,
    },
}

impl ReminderEvent {
    /// Ledger identity.
    pub fn key(&self) -> EventKey {
        match self {
            Self::Deadline { task, threshold } => EventKey::threshold(task.id, *threshold),
            Self::Overdue { task, day } => EventKey::overdue(task.id, *day),
            Self::Digest { user_id, date, .. } => EventKey::digest(*user_id, *date),
        }
    }

    /// Recipient.
    pub fn user_id(&self) -> UserId {
        match self {
            Self::Deadline { task, .. } | Self::Overdue { task, .. } => task.owner,
            Self::Digest { user_id, .. } => *user_id,
        }
    }

    /// Instant after which the ledger record may be pruned.
    pub fn relevant_until(&self, retention: Duration) -> DateTime<Utc> {
        match self {
            Self::Deadline { task, .. } => task.deadline + retention,
            Self::Overdue { task, day } => {
                task.deadline + Duration::days(i64::from(*day) + 1) + retention
            }
            Self::Digest { day_end, .. } => *day_end + retention,
        }
    }

    /// Short kind name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Deadline { .. } => "deadline",
            Self::Overdue { .. } => "overdue",
            Self::Digest { .. } => "digest",
        }
    }
}
