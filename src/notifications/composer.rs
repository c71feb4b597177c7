//! Notification composer: domain events to push payloads.
//!
//! Everything here is pure. Given the same event and `now`, the composer
//! returns the same payload, which keeps reminder texts easy to test.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::push::Urgency;
use crate::directory::{Task, TaskStats};
use crate::scheduler::ReminderEvent;

/// Default notification icon.
pub const DEFAULT_ICON: &str = "/icon-192x192.png";

/// Default notification badge.
pub const DEFAULT_BADGE: &str = "/icon-72x72.png";

/// A button shown on the notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    /// Action id reported back to the service worker.
    pub action: String,
    /// Button label.
    pub title: String,
}

/// The JSON document a service worker receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub body: String,
    /// Icon path or URL.
    pub icon: String,
    /// Badge path or URL.
    pub badge: String,
    /// Page opened on click.
    pub url: String,
    /// Client-side dedup tag. A newer notification with the same tag
    /// replaces the older one.
    pub tag: String,
    /// Creation time, milliseconds since the epoch.
    pub timestamp: i64,
    /// Keep the notification on screen until the user acts.
    pub require_interaction: bool,
    /// Buttons.
    pub actions: Vec<NotificationAction>,
    /// Delivery deadline. Becomes the push TTL; not part of the JSON body.
    #[serde(skip)]
    pub deliver_by: Option<DateTime<Utc>>,
    /// Push urgency. Not part of the JSON body.
    #[serde(skip)]
    pub urgency: Urgency,
}

impl NotificationPayload {
    /// Serialized body handed to the encryptor.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize notification payload")
    }

    /// Seconds the push service may hold this message, at least one.
    pub fn ttl_secs(&self, now: DateTime<Utc>) -> u64 {
        self.deliver_by
            .map_or(0, |at| (at - now).num_seconds().max(1) as u64)
    }
}

/// Human text for the time left until a deadline.
///
/// Zero or negative remaining time reads as already passed.
pub fn time_text(remaining: Duration) -> String {
    if remaining <= Duration::zero() {
        return "has passed".to_string();
    }
    let days = remaining.num_days();
    if days > 0 {
        let unit = if days == 1 { "day" } else { "days" };
        return format!("in {days} {unit}");
    }
    if remaining > Duration::hours(1) {
        return format!("in {} h", remaining.num_hours());
    }
    if remaining > Duration::minutes(1) {
        return format!("in {} min", remaining.num_minutes());
    }
    "in less than a minute".to_string()
}

/// Builds payloads for every notification kind.
#[derive(Debug, Clone)]
pub struct Composer {
    icon: String,
    badge: String,
    app_url: Option<String>,
    push_ttl: Duration,
}

impl Default for Composer {
    fn default() -> Self {
        Self::new(DEFAULT_ICON, DEFAULT_BADGE, None, Duration::days(1))
    }
}

impl Composer {
    /// Create a composer. `app_url`, when set, prefixes every target path.
    pub fn new(
        icon: impl Into<String>,
        badge: impl Into<String>,
        app_url: Option<String>,
        push_ttl: Duration,
    ) -> Self {
        Self {
            icon: icon.into(),
            badge: badge.into(),
            app_url: app_url.map(|u| u.trim_end_matches('/').to_string()),
            push_ttl,
        }
    }

    /// Payload for a scheduled event.
    pub fn compose(&self, event: &ReminderEvent, now: DateTime<Utc>) -> NotificationPayload {
        match event {
            ReminderEvent::Deadline { task, .. } => self.deadline(task, now),
            ReminderEvent::Overdue { task, day } => self.overdue(task, *day, now),
            ReminderEvent::Digest { stats, day_end, .. } => self.digest(*stats, *day_end, now),
        }
    }

    /// Approaching deadline.
    pub fn deadline(&self, task: &Task, now: DateTime<Utc>) -> NotificationPayload {
        let remaining = task.deadline - now;
        let urgency = if remaining <= Duration::hours(1) {
            Urgency::High
        } else {
            Urgency::Normal
        };
        // Past the deadline the reminder is useless
        let deliver_by = task
            .deadline
            .min(now + self.push_ttl)
            .max(now + Duration::minutes(1));

        self.build(
            format!("📅 Deadline {}", time_text(remaining)),
            format!("Task: {}", task.title),
            &format!("/tasks/{}", task.id),
            format!("deadline-{}", task.id),
            now,
            deliver_by,
            urgency,
        )
    }

    /// Task overdue by `days` whole days.
    pub fn overdue(&self, task: &Task, days: u32, now: DateTime<Utc>) -> NotificationPayload {
        let unit = if days == 1 { "day" } else { "days" };
        self.build(
            "🚨 Overdue task!".to_string(),
            format!("{} is overdue by {} {}", task.title, days, unit),
            &format!("/tasks/{}", task.id),
            format!("overdue-{}", task.id),
            now,
            now + self.push_ttl.min(Duration::days(1)),
            Urgency::High,
        )
    }

    /// Daily digest. Stale after the end of the digest day.
    pub fn digest(&self, stats: TaskStats, day_end: DateTime<Utc>, now: DateTime<Utc>) -> NotificationPayload {
        let body = if stats.total == 0 {
            "No tasks for today. A good day to rest! 😎".to_string()
        } else if stats.completed == stats.total {
            format!("All {} tasks done! Excellent! 🎉", stats.total)
        } else if stats.overdue > 0 {
            format!(
                "Done {}/{}, overdue: {}",
                stats.completed, stats.total, stats.overdue
            )
        } else {
            format!("Done {}/{} tasks. Keep going! 💪", stats.completed, stats.total)
        };

        self.build(
            "📊 Daily summary".to_string(),
            body,
            "/",
            "daily-summary".to_string(),
            now,
            day_end.min(now + self.push_ttl).max(now + Duration::minutes(1)),
            Urgency::Normal,
        )
    }

    /// Greeting sent right after a user subscribes.
    pub fn welcome(&self, name: Option<&str>, now: DateTime<Utc>) -> NotificationPayload {
        let title = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => format!("Welcome, {name}! 🎓"),
            None => "Welcome! 🎓".to_string(),
        };
        self.build(
            title,
            "Start planning your tasks right now!".to_string(),
            "/tasks/new",
            "welcome".to_string(),
            now,
            now + self.push_ttl,
            Urgency::Low,
        )
    }

    /// Operator-triggered test message.
    pub fn test(&self, now: DateTime<Utc>) -> NotificationPayload {
        self.build(
            "🔔 Test notification".to_string(),
            "Push notifications are working.".to_string(),
            "/",
            "test".to_string(),
            now,
            now + self.push_ttl,
            Urgency::Normal,
        )
    }

    #[allow(clippy::too_many_arguments, reason = "private builder shared by all kinds")]
    fn build(
        &self,
        title: String,
        body: String,
        path: &str,
        tag: String,
        now: DateTime<Utc>,
        deliver_by: DateTime<Utc>,
        urgency: Urgency,
    ) -> NotificationPayload {
        NotificationPayload {
            title,
            body,
            icon: self.icon.clone(),
            badge: self.badge.clone(),
            url: self.url_for(path),
            tag,
            timestamp: now.timestamp_millis(),
            require_interaction: true,
            actions: vec![
                NotificationAction {
                    action: "view".to_string(),
                    title: "View".to_string(),
                },
                NotificationAction {
                    action: "dismiss".to_string(),
                    title: "Dismiss".to_string(),
                },
            ],
            deliver_by: Some(deliver_by),
            urgency,
        }
    }

    fn url_for(&self, path: &str) -> String {
        match &self.app_url {
            Some(base) => format!("{base}{path}"),
            None => path.to_string(),
        }
    }
}
