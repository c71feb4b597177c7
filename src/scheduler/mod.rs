//! Reminder window scheduler.
//!
//! A single cooperative loop. Every tick it runs five independent sweeps:
//!
//! 1. **Seal**: every completed task that could still fire gets a completion
//!    key claimed. A sealed task never fires again, even if reopened.
//! 2. **Deadline**: open tasks inside a threshold window. Only the tightest
//!    window fires; wider ones are claimed as suppressed.
//! 3. **Overdue**: open tasks past their deadline fire once per whole day
//!    overdue. Missed days are claimed as suppressed, only the latest fires.
//! 4. **Digest**: during the configured local hour, one digest per active
//!    subscriber per day.
//! 5. **Prune**: at most once per [`SchedulerConfig::prune_interval`].
//!
//! The deadline and overdue sweeps only consider tasks whose owner has an
//! active subscription; the others would be skipped by the workers anyway.
//!
//! A failing sweep is logged and does not stop the others. Due events are
//! pushed to the delivery queue without waiting; a full queue drops the event
//! unclaimed so a later tick offers it again.

mod clock;
mod events;

pub use clock::{Clock, LocalZone, ManualClock, SystemClock};
pub use events::{ReminderEvent, Threshold};

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::constants::{DIRECTORY_QUERY_TIMEOUT, MIN_TICK_INTERVAL, PRUNE_INTERVAL};
use crate::directory::{Directory, Task, UserId};
use crate::ledger::{ClaimOutcome, EventKey, Ledger};

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay between ticks.
    pub tick_interval: Duration,
    /// Reminder thresholds, any order.
    pub thresholds: Vec<Threshold>,
    /// Local hour (0-23) at which digests go out.
    pub digest_hour: u32,
    /// Zone for the digest hour and calendar days.
    pub zone: LocalZone,
    /// How long ledger records outlive their event.
    pub retention: chrono::Duration,
    /// Overdue reminders stop after this many days.
    pub max_overdue_days: u32,
    /// Minimum delay after a tick with a failed sweep.
    pub error_backoff: Duration,
    /// Timeout for each Directory call.
    pub query_timeout: Duration,
    /// Minimum time between two prunes.
    pub prune_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: MIN_TICK_INTERVAL,
            thresholds: vec![
                Threshold::from_minutes(24 * 60),
                Threshold::from_minutes(60),
                Threshold::from_minutes(30),
            ],
            digest_hour: 9,
            zone: LocalZone::System,
            retention: chrono::Duration::days(30),
            max_overdue_days: 30,
            error_backoff: Duration::from_secs(30),
            query_timeout: DIRECTORY_QUERY_TIMEOUT,
            prune_interval: PRUNE_INTERVAL,
        }
    }
}

/// A sweep within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    /// Completion seal.
    Seal,
    /// Threshold windows.
    Deadline,
    /// Overdue days.
    Overdue,
    /// Daily digest.
    Digest,
    /// Ledger housekeeping.
    Prune,
}

impl std::fmt::Display for Sweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Seal => "seal",
            Self::Deadline => "deadline",
            Self::Overdue => "overdue",
            Self::Digest => "digest",
            Self::Prune => "prune",
        })
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Keys handed to the delivery queue.
    pub enqueued: Vec<EventKey>,
    /// Claims recorded without delivery.
    pub suppressed: usize,
    /// Candidates skipped because their key already fired or the task is
    /// sealed.
    pub already_fired: usize,
    /// Candidates skipped because their owner has no active subscription.
    pub unsubscribed: usize,
    /// Events dropped because the queue was full or closed.
    pub dropped: usize,
    /// Ledger records removed by the prune sweep.
    pub pruned: usize,
    /// Sweeps that failed this tick.
    pub failed_sweeps: Vec<Sweep>,
}

impl TickReport {
    /// Whether every sweep succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed_sweeps.is_empty()
    }
}

/// The scheduler control loop.
pub struct Scheduler {
    directory: Arc<dyn Directory>,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    queue: mpsc::Sender<ReminderEvent>,
    config: SchedulerConfig,
    last_prune: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("last_prune", &self.last_prune)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler feeding `queue`.
    pub fn new(
        directory: Arc<dyn Directory>,
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        queue: mpsc::Sender<ReminderEvent>,
        mut config: SchedulerConfig,
    ) -> Self {
        // Tightest first
        config.thresholds.sort_unstable();
        config.thresholds.dedup();
        Self {
            directory,
            ledger,
            clock,
            queue,
            config,
            last_prune: None,
        }
    }

    /// Run until `shutdown` becomes true or its sender is dropped.
    ///
    /// Dropping the scheduler afterwards releases its queue sender, which
    /// lets the delivery workers drain and stop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "[Scheduler] Started (tick {}s, thresholds {:?}, digest at {:02}:00)",
            self.config.tick_interval.as_secs(),
            self.config.thresholds.iter().map(|t| t.label()).collect::<Vec<_>>(),
            self.config.digest_hour
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.tick(self.clock.now()).await;
            let delay = if report.is_clean() {
                self.config.tick_interval
            } else {
                self.config.tick_interval.max(self.config.error_backoff)
            };

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!("[Scheduler] Stopped");
    }

    /// Run every sweep once at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        if let Err(e) = self.seal_sweep(now, &mut report).await {
            log::warn!("[Scheduler] Seal sweep failed: {:#}", e);
            report.failed_sweeps.push(Sweep::Seal);
        }
        match self.subscribed_owners().await {
            Ok(owners) => {
                if let Err(e) = self.deadline_sweep(now, &owners, &mut report).await {
                    log::warn!("[Scheduler] Deadline sweep failed: {:#}", e);
                    report.failed_sweeps.push(Sweep::Deadline);
                }
                if let Err(e) = self.overdue_sweep(now, &owners, &mut report).await {
                    log::warn!("[Scheduler] Overdue sweep failed: {:#}", e);
                    report.failed_sweeps.push(Sweep::Overdue);
                }
            }
            Err(e) => {
                log::warn!("[Scheduler] Subscriber lookup failed, skipping deadline and overdue sweeps: {:#}", e);
                report.failed_sweeps.extend([Sweep::Deadline, Sweep::Overdue]);
            }
        }
        if let Err(e) = self.digest_sweep(now, &mut report).await {
            log::warn!("[Scheduler] Digest sweep failed: {:#}", e);
            report.failed_sweeps.push(Sweep::Digest);
        }
        if let Err(e) = self.prune_sweep(now, &mut report).await {
            log::warn!("[Scheduler] Prune sweep failed: {:#}", e);
            report.failed_sweeps.push(Sweep::Prune);
        }

        if report.enqueued.is_empty() && report.is_clean() {
            log::debug!("[Scheduler] Tick at {}: nothing due", now);
        } else {
            log::info!(
                "[Scheduler] Tick at {}: enqueued {}, suppressed {}, already fired {}, unsubscribed {}, dropped {}, failed sweeps {:?}",
                now,
                report.enqueued.len(),
                report.suppressed,
                report.already_fired,
                report.unsubscribed,
                report.dropped,
                report.failed_sweeps
            );
        }

        report
    }

    async fn query<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.query_timeout, fut)
            .await
            .with_context(|| format!("Directory query {what} timed out"))?
            .with_context(|| format!("Directory query {what} failed"))
    }

    async fn suppress(
        &self,
        key: &EventKey,
        now: DateTime<Utc>,
        relevant_until: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        if self.ledger.try_claim(key, now, relevant_until).await? == ClaimOutcome::Claimed {
            log::debug!("[Scheduler] Suppressed {}", key);
            report.suppressed += 1;
        }
        Ok(())
    }

    fn enqueue(&self, event: ReminderEvent, report: &mut TickReport) {
        let key = event.key();
        match self.queue.try_send(event) {
            Ok(()) => report.enqueued.push(key),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("[Scheduler] Delivery queue full, dropping {} until next tick", key);
                report.dropped += 1;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::warn!("[Scheduler] Delivery queue closed, dropping {}", key);
                report.dropped += 1;
            }
        }
    }

    /// How long after its deadline a task can still fire: the last overdue
    /// day plus one.
    fn overdue_reach(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.config.max_overdue_days) + 1)
    }

    async fn subscribed_owners(&self) -> Result<HashSet<UserId>> {
        let users = self
            .query("list_active_subscribers", self.directory.list_active_subscribers())
            .await?;
        Ok(users.into_iter().map(|u| u.id).collect())
    }

    /// Whether `task` passes the owner and seal filters. Updates the report
    /// when it does not.
    async fn eligible(&self, task: &Task, owners: &HashSet<UserId>, report: &mut TickReport) -> Result<bool> {
        if !owners.contains(&task.owner) {
            report.unsubscribed += 1;
            return Ok(false);
        }
        if self.ledger.is_fired(&EventKey::completed(task.id)).await? {
            report.already_fired += 1;
            return Ok(false);
        }
        Ok(true)
    }

    async fn seal_sweep(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let reach = self.overdue_reach();
        let completed = self
            .query("list_completed_since", self.directory.list_completed_since(now - reach))
            .await?;

        for task in &completed {
            let relevant_until = task.deadline + reach + self.config.retention;
            self.suppress(&EventKey::completed(task.id), now, relevant_until, report)
                .await?;
        }
        Ok(())
    }

    async fn deadline_sweep(
        &self,
        now: DateTime<Utc>,
        owners: &HashSet<UserId>,
        report: &mut TickReport,
    ) -> Result<()> {
        // task id -> (task, tightest threshold containing it)
        let mut due: BTreeMap<i64, (Task, Threshold)> = BTreeMap::new();
        for threshold in &self.config.thresholds {
            let tasks = self
                .query(
                    "list_due_tasks",
                    self.directory.list_due_tasks(threshold.duration(), now),
                )
                .await?;
            for task in tasks {
                due.entry(task.id).or_insert((task, *threshold));
            }
        }

        for (task, tightest) in due.into_values() {
            if !self.eligible(&task, owners, report).await? {
                continue;
            }
            let key = EventKey::threshold(task.id, tightest);
            if self.ledger.is_fired(&key).await? {
                report.already_fired += 1;
                continue;
            }

            let relevant_until = task.deadline + self.config.retention;
            for wider in self.config.thresholds.iter().filter(|t| **t > tightest) {
                let wider_key = EventKey::threshold(task.id, *wider);
                self.suppress(&wider_key, now, relevant_until, report).await?;
            }

            self.enqueue(
                ReminderEvent::Deadline {
                    task,
                    threshold: tightest,
                },
                report,
            );
        }
        Ok(())
    }

    async fn overdue_sweep(
        &self,
        now: DateTime<Utc>,
        owners: &HashSet<UserId>,
        report: &mut TickReport,
    ) -> Result<()> {
        let overdue = self
            .query("list_overdue_tasks", self.directory.list_overdue_tasks(now))
            .await?;

        for task in overdue {
            let days = (now - task.deadline).num_days();
            if days < 1 || days > i64::from(self.config.max_overdue_days) {
                continue;
            }
            if !self.eligible(&task, owners, report).await? {
                continue;
            }
            let day = days as u32;

            if self.ledger.is_fired(&EventKey::overdue(task.id, day)).await? {
                report.already_fired += 1;
                continue;
            }

            for missed in 1..day {
                let missed_event = ReminderEvent::Overdue {
                    task: task.clone(),
                    day: missed,
                };
                let relevant_until = missed_event.relevant_until(self.config.retention);
                self.suppress(&missed_event.key(), now, relevant_until, report)
                    .await?;
            }

            self.enqueue(ReminderEvent::Overdue { task, day }, report);
        }
        Ok(())
    }

    async fn digest_sweep(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let zone = self.config.zone;
        if zone.hour(now) != self.config.digest_hour {
            return Ok(());
        }

        let date = zone.date(now);
        let range = zone.day_range(date);
        let users = self
            .query("list_active_subscribers", self.directory.list_active_subscribers())
            .await?;

        let mut failures = 0usize;
        for user in users {
            let key = EventKey::digest(user.id, date);
            if self.ledger.is_fired(&key).await? {
                report.already_fired += 1;
                continue;
            }

            let stats = match self
                .query("task_stats", self.directory.task_stats(user.id, range, now))
                .await
            {
                Ok(stats) => stats,
                Err(e) => {
                    log::warn!("[Scheduler] Digest stats for user {} failed: {:#}", user.id, e);
                    failures += 1;
                    continue;
                }
            };

            self.enqueue(
                ReminderEvent::Digest {
                    user_id: user.id,
                    date,
                    stats,
                    day_end: range.end,
                },
                report,
            );
        }

        anyhow::ensure!(failures == 0, "{failures} digest stats queries failed");
        Ok(())
    }

    async fn prune_sweep(&mut self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let interval = chrono::Duration::from_std(self.config.prune_interval)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        if self.last_prune.is_some_and(|last| now - last < interval) {
            return Ok(());
        }

        let pruned = self.ledger.prune(now).await?;
        self.last_prune = Some(now);
        report.pruned = pruned;
        if pruned > 0 {
            log::info!("[Scheduler] Pruned {} ledger records", pruned);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, TaskStatus, User};
    use crate::ledger::MemoryLedger;
    use crate::notifications::push::PushSubscription;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc)
    }

    fn subscribed_user(id: i64) -> User {
        User {
            id,
            name: None,
            is_active: true,
            push_subscription: Some(PushSubscription {
                endpoint: format!("https://push.example.com/{id}"),
                p256dh: "p".to_string(),
                auth: "a".to_string(),
            }),
        }
    }

    fn task(id: i64, deadline: DateTime<Utc>) -> Task {
        Task {
            id,
            owner: 1,
            title: format!("task {id}"),
            deadline,
            status: TaskStatus::Pending,
        }
    }

    struct Harness {
        scheduler: Scheduler,
        directory: MemoryDirectory,
        ledger: Arc<MemoryLedger>,
        rx: mpsc::Receiver<ReminderEvent>,
    }

    fn harness(capacity: usize, config: SchedulerConfig) -> Harness {
        let directory = MemoryDirectory::new();
        directory.put_user(subscribed_user(1)).expect("user");
        let ledger = Arc::new(MemoryLedger::new());
        let (tx, rx) = mpsc::channel(capacity);
        let clock = Arc::new(ManualClock::new(at("2026-01-01T00:00:00Z")));
        let scheduler = Scheduler::new(
            Arc::new(directory.clone()),
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            clock,
            tx,
            config,
        );
        Harness {
            scheduler,
            directory,
            ledger,
            rx,
        }
    }

    fn utc_config() -> SchedulerConfig {
        SchedulerConfig {
            zone: LocalZone::from_offset_minutes(Some(0)).expect("utc"),
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_tightest_window_wins() {
        let mut h = harness(16, utc_config());
        let now = at("2026-05-01T12:00:00Z");
        h.directory
            .put_task(task(7, now + chrono::Duration::minutes(29)))
            .expect("task");

        let report = h.scheduler.tick(now).await;
        assert_eq!(report.enqueued, vec![EventKey::from_raw("task:7:t-30m")]);
        assert_eq!(report.suppressed, 2);

        // Wider windows are sealed, so they never fire later
        assert!(h.ledger.is_fired(&EventKey::from_raw("task:7:t-24h")).await.expect("check"));
        assert!(h.ledger.is_fired(&EventKey::from_raw("task:7:t-1h")).await.expect("check"));

        let event = h.rx.try_recv().expect("event");
        assert!(matches!(event, ReminderEvent::Deadline { threshold, .. } if threshold.minutes() == 30));
    }

    #[tokio::test]
    async fn test_already_fired_not_enqueued() {
        let mut h = harness(16, utc_config());
        let now = at("2026-05-01T12:00:00Z");
        h.directory
            .put_task(task(7, now + chrono::Duration::hours(5)))
            .expect("task");

        h.ledger
            .try_claim(&EventKey::from_raw("task:7:t-24h"), now, now)
            .await
            .expect("claim");

        let report = h.scheduler.tick(now).await;
        assert!(report.enqueued.is_empty());
        assert_eq!(report.already_fired, 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_claiming() {
        let mut h = harness(1, utc_config());
        let now = at("2026-05-01T12:00:00Z");
        h.directory
            .put_task(task(1, now + chrono::Duration::hours(2)))
            .expect("task");
        h.directory
            .put_task(task(2, now + chrono::Duration::hours(3)))
            .expect("task");

        let report = h.scheduler.tick(now).await;
        assert_eq!(report.enqueued.len(), 1);
        assert_eq!(report.dropped, 1);
        assert!(h.ledger.records().await.expect("records").is_empty());
    }

    #[tokio::test]
    async fn test_overdue_catch_up_claims_missed_days() {
        let mut h = harness(16, utc_config());
        let now = at("2026-05-04T00:00:00Z");
        h.directory
            .put_task(task(3, now - chrono::Duration::hours(60)))
            .expect("task");

        let report = h.scheduler.tick(now).await;
        assert_eq!(report.enqueued, vec![EventKey::from_raw("task:3:overdue-day-2")]);
        assert!(h.ledger.is_fired(&EventKey::from_raw("task:3:overdue-day-1")).await.expect("check"));
    }

    #[tokio::test]
    async fn test_overdue_beyond_limit_ignored() {
        let mut h = harness(16, SchedulerConfig {
            max_overdue_days: 2,
            ..utc_config()
        });
        let now = at("2026-05-10T00:00:00Z");
        h.directory
            .put_task(task(3, now - chrono::Duration::days(5)))
            .expect("task");

        let report = h.scheduler.tick(now).await;
        assert!(report.enqueued.is_empty());
    }

    #[tokio::test]
    async fn test_digest_only_in_digest_hour() {
        let mut h = harness(16, utc_config());

        let report = h.scheduler.tick(at("2026-05-01T08:59:00Z")).await;
        assert!(report.enqueued.is_empty());

        let report = h.scheduler.tick(at("2026-05-01T09:00:00Z")).await;
        assert_eq!(report.enqueued, vec![EventKey::from_raw("digest:1:2026-05-01")]);
    }

    #[tokio::test]
    async fn test_seal_sweep_claims_completed_tasks() {
        let mut h = harness(16, utc_config());
        let now = at("2026-05-01T12:00:00Z");
        let mut done = task(9, now + chrono::Duration::days(3));
        done.status = TaskStatus::Completed;
        h.directory.put_task(done).expect("task");
        // Past every overdue day, nothing left to seal
        let mut ancient = task(10, now - chrono::Duration::days(40));
        ancient.status = TaskStatus::Completed;
        h.directory.put_task(ancient).expect("task");

        let report = h.scheduler.tick(now).await;
        assert_eq!(report.suppressed, 1);
        assert!(report.enqueued.is_empty());
        assert!(h.ledger.is_fired(&EventKey::completed(9)).await.expect("check"));
        assert!(!h.ledger.is_fired(&EventKey::completed(10)).await.expect("check"));

        // Sealing again is a no-op
        assert_eq!(h.scheduler.tick(now + chrono::Duration::minutes(1)).await.suppressed, 0);
    }

    #[tokio::test]
    async fn test_reopened_task_never_fires_after_deadline() {
        let mut h = harness(16, utc_config());
        let now = at("2026-05-01T12:00:00Z");
        let deadline = now + chrono::Duration::hours(3);
        let mut done = task(5, deadline);
        done.status = TaskStatus::Completed;
        h.directory.put_task(done).expect("task");

        assert_eq!(h.scheduler.tick(now).await.suppressed, 1);
        assert!(h.directory.set_task_status(5, TaskStatus::Pending).expect("reopen"));

        // Inside the 30 minute window
        let report = h.scheduler.tick(deadline - chrono::Duration::minutes(20)).await;
        assert!(report.enqueued.is_empty());
        assert_eq!(report.already_fired, 1);

        // A day and a half overdue
        let report = h.scheduler.tick(deadline + chrono::Duration::hours(36)).await;
        assert!(report.enqueued.is_empty());
        assert_eq!(report.already_fired, 1);
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_completed_while_overdue_stays_sealed() {
        let mut h = harness(16, utc_config());
        let now = at("2026-05-01T12:00:00Z");
        let mut done = task(6, now - chrono::Duration::hours(12));
        done.status = TaskStatus::Completed;
        h.directory.put_task(done).expect("task");

        assert_eq!(h.scheduler.tick(now).await.suppressed, 1);
        assert!(h.directory.set_task_status(6, TaskStatus::InProgress).expect("reopen"));

        let report = h.scheduler.tick(now + chrono::Duration::days(5)).await;
        assert!(report.enqueued.is_empty());
        assert!(h.ledger.records().await.expect("records").iter().all(|r| r.event_key == EventKey::completed(6)));
    }

    #[tokio::test]
    async fn test_unsubscribed_owner_is_skipped_every_tick() {
        let mut h = harness(512, utc_config());
        let now = at("2026-05-01T12:00:00Z");
        h.directory
            .put_user(User {
                push_subscription: None,
                ..subscribed_user(2)
            })
            .expect("user");
        for id in 100..400 {
            h.directory
                .put_task(Task {
                    owner: 2,
                    ..task(id, now - chrono::Duration::hours(30))
                })
                .expect("task");
        }

        for minute in 0..3 {
            let report = h.scheduler.tick(now + chrono::Duration::minutes(minute)).await;
            assert!(report.enqueued.is_empty());
            assert_eq!(report.unsubscribed, 300);
        }
        assert!(h.rx.try_recv().is_err());

        // Subscribing makes the reminders due again
        h.directory.put_user(subscribed_user(2)).expect("user");
        let report = h.scheduler.tick(now + chrono::Duration::minutes(3)).await;
        assert_eq!(report.enqueued.len(), 300);
        assert_eq!(report.unsubscribed, 0);
    }

    #[tokio::test]
    async fn test_prune_runs_at_most_hourly() {
        let mut h = harness(16, utc_config());
        let now = at("2026-05-01T12:00:00Z");
        let stale = EventKey::from_raw("task:1:t-1h");
        h.ledger
            .try_claim(&stale, now, now - chrono::Duration::days(1))
            .await
            .expect("claim");

        assert_eq!(h.scheduler.tick(now).await.pruned, 1);

        h.ledger
            .try_claim(&stale, now, now - chrono::Duration::days(1))
            .await
            .expect("claim");
        assert_eq!(h.scheduler.tick(now + chrono::Duration::minutes(30)).await.pruned, 0);
        assert_eq!(h.scheduler.tick(now + chrono::Duration::minutes(61)).await.pruned, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(16, utc_config());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.scheduler.run(rx));

        tx.send(true).expect("send");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler stops")
            .expect("join");
    }
}
