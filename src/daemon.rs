//! Process wiring: builds every component from [`Config`] and runs them.
//!
//! # Lifecycle
//!
//! 1. [`Daemon::new`] validates the config, loads the VAPID keys and runs the
//!    signer self-test. Any failure here refuses startup.
//! 2. [`Daemon::run`] starts the delivery workers and the scheduler loop, then
//!    waits for the shutdown future (SIGINT/SIGTERM in production).
//! 3. On shutdown the scheduler stops first, which closes the queue, then the
//!    workers get [`Config::shutdown_grace_secs`] to drain.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::config::Config;
use crate::delivery::{Coordinator, DeliveryPipeline, DeliveryReport, ShutdownReport};
use crate::directory::{Directory, FileDirectory, SubscriptionStore, UserId};
use crate::ledger::{Ledger, SqliteLedger};
use crate::notifications::push::{PushClient, PushTransport};
use crate::notifications::signer::PushSigner;
use crate::scheduler::{Clock, Scheduler, SystemClock, TickReport};

/// Direct notification kinds for the `notify` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    /// "Push notifications are working."
    Test,
    /// Greeting after subscribing.
    Welcome,
}

/// A fully wired daemon.
pub struct Daemon {
    config: Config,
    directory: Arc<dyn Directory>,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    pipeline: Arc<DeliveryPipeline>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Build the production daemon: file directory, SQLite ledger, HTTP push
    /// client and the wall clock.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let directory_path = config.directory_path()?;
        let ledger_path = config.ledger_path()?;
        log::info!("[Daemon] Directory: {}", directory_path.display());
        log::info!("[Daemon] Ledger: {}", ledger_path.display());

        let directory = Arc::new(FileDirectory::new(directory_path));
        let ledger = Arc::new(SqliteLedger::open(&ledger_path)?);
        let transport = Arc::new(PushClient::new(config.delivery_timeout())?);

        Self::with_parts(
            config,
            Arc::clone(&directory) as Arc<dyn Directory>,
            directory,
            ledger,
            transport,
            Arc::new(SystemClock),
        )
    }

    /// Build a daemon around caller-supplied collaborators.
    pub fn with_parts(
        config: Config,
        directory: Arc<dyn Directory>,
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn Ledger>,
        transport: Arc<dyn PushTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let keys = config.vapid_keys()?;
        let signer = PushSigner::new(
            &keys,
            config.vapid_subject.clone(),
            Duration::from_secs(config.token_ttl_secs),
        )?;
        signer.self_test().context("VAPID self-test failed")?;
        log::info!(
            "[Daemon] VAPID keys loaded (public key {}...)",
            keys.public_key_base64url().chars().take(16).collect::<String>()
        );

        let pipeline = Arc::new(DeliveryPipeline::new(
            subscriptions,
            Arc::clone(&ledger),
            Arc::new(signer),
            transport,
            config.composer(),
            Arc::clone(&clock),
            config.retry_policy(),
            config.retention(),
        ));

        Ok(Self {
            config,
            directory,
            ledger,
            clock,
            pipeline,
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Delivery pipeline shared by all workers.
    pub fn pipeline(&self) -> &Arc<DeliveryPipeline> {
        &self.pipeline
    }

    fn start_coordinator(&self) -> Coordinator {
        Coordinator::start(
            Arc::clone(&self.pipeline),
            self.config.worker_count,
            self.config.queue_capacity,
        )
    }

    fn scheduler(&self, coordinator: &Coordinator) -> Result<Scheduler> {
        Ok(Scheduler::new(
            Arc::clone(&self.directory),
            Arc::clone(&self.ledger),
            Arc::clone(&self.clock),
            coordinator.sender(),
            self.config.scheduler_config()?,
        ))
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.config.shutdown_grace_secs)
    }

    /// Run the scheduler and workers until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<ShutdownReport> {
        let coordinator = self.start_coordinator();
        let scheduler = self.scheduler(&coordinator)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let scheduler_task = tokio::spawn(scheduler.run(stop_rx));

        log::info!("[Daemon] Running");
        shutdown.await;
        log::info!("[Daemon] Shutdown requested, stopping scheduler");

        // Receiver may already be gone if the scheduler task ended
        let _ = stop_tx.send(true);
        if let Err(e) = scheduler_task.await {
            log::warn!("[Daemon] Scheduler task ended abnormally: {}", e);
        }

        let report = coordinator.shutdown(self.grace()).await;
        log::info!(
            "[Daemon] Stopped ({})",
            if report.drained { "drained" } else { "forced" }
        );
        Ok(report)
    }

    /// Run one tick and wait for its deliveries.
    pub async fn tick_once(&self) -> Result<(TickReport, ShutdownReport)> {
        let coordinator = self.start_coordinator();
        let mut scheduler = self.scheduler(&coordinator)?;

        let tick = scheduler.tick(self.clock.now()).await;
        drop(scheduler);

        let shutdown = coordinator.shutdown(self.grace()).await;
        Ok((tick, shutdown))
    }

    /// Remove ledger records that are past their retention.
    pub async fn prune(&self) -> Result<usize> {
        let removed = self.ledger.prune(self.clock.now()).await?;
        log::info!("[Daemon] Pruned {} ledger records", removed);
        Ok(removed)
    }

    /// Deliver a direct notification to one user.
    pub async fn notify(&self, user_id: UserId, kind: NotifyKind) -> Result<DeliveryReport> {
        let now = self.clock.now();
        let composer = self.pipeline.composer();
        let payload = match kind {
            NotifyKind::Test => composer.test(now),
            NotifyKind::Welcome => {
                let name = self
                    .directory
                    .list_active_subscribers()
                    .await?
                    .into_iter()
                    .find(|user| user.id == user_id)
                    .and_then(|user| user.name);
                composer.welcome(name.as_deref(), now)
            }
        };
        self.pipeline.notify_user(user_id, &payload).await
    }
}

/// Resolve on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("[Daemon] Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("[Daemon] Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => log::info!("[Daemon] Received SIGINT"),
        () = terminate => log::info!("[Daemon] Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::testing::{subscriber, ScriptedTransport};
    use crate::directory::{MemoryDirectory, Task, TaskStatus};
    use crate::ledger::MemoryLedger;
    use crate::notifications::vapid::VapidKeys;
    use crate::scheduler::ManualClock;
    use chrono::{DateTime, Utc};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc)
    }

    fn config() -> Config {
        let keys = VapidKeys::generate();
        Config {
            vapid_private_key: keys.private_key_base64url().to_string(),
            vapid_public_key: keys.public_key_base64url().to_string(),
            utc_offset_minutes: Some(0),
            shutdown_grace_secs: 5,
            ..Config::default()
        }
    }

    fn daemon(directory: &MemoryDirectory, transport: &Arc<ScriptedTransport>, now: DateTime<Utc>) -> Daemon {
        Daemon::with_parts(
            config(),
            Arc::new(directory.clone()),
            Arc::new(directory.clone()),
            Arc::new(MemoryLedger::new()),
            Arc::clone(transport) as Arc<dyn PushTransport>,
            Arc::new(ManualClock::new(now)),
        )
        .expect("daemon")
    }

    #[test]
    fn test_startup_refuses_missing_keys() {
        let directory = MemoryDirectory::new();
        let err = Daemon::with_parts(
            Config::default(),
            Arc::new(directory.clone()),
            Arc::new(directory),
            Arc::new(MemoryLedger::new()),
            Arc::new(ScriptedTransport::default()),
            Arc::new(SystemClock),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("Invalid configuration"));
    }

    #[test]
    fn test_startup_refuses_mismatched_keys() {
        let directory = MemoryDirectory::new();
        let mut config = config();
        config.vapid_public_key = VapidKeys::generate().public_key_base64url().to_string();
        let result = Daemon::with_parts(
            config,
            Arc::new(directory.clone()),
            Arc::new(directory),
            Arc::new(MemoryLedger::new()),
            Arc::new(ScriptedTransport::default()),
            Arc::new(SystemClock),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tick_once_delivers_and_drains() {
        let now = at("2026-05-01T15:31:00Z");
        let directory = MemoryDirectory::new();
        directory.put_user(subscriber(1)).expect("user");
        directory
            .put_task(Task {
                id: 10,
                owner: 1,
                title: "Ship it".to_string(),
                deadline: at("2026-05-01T16:00:00Z"),
                status: TaskStatus::Pending,
            })
            .expect("task");
        let transport = Arc::new(ScriptedTransport::default());
        let daemon = daemon(&directory, &transport, now);

        let (tick, shutdown) = daemon.tick_once().await.expect("tick");

        assert_eq!(tick.enqueued.len(), 1);
        assert!(shutdown.drained);
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.sent()[0].topic.as_deref(), Some("deadline-10"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_future() {
        let directory = MemoryDirectory::new();
        let transport = Arc::new(ScriptedTransport::default());
        let daemon = daemon(&directory, &transport, Utc::now());

        let report = daemon
            .run(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .expect("run");

        assert!(report.drained);
        assert!(report.abandoned.is_empty());
    }

    #[tokio::test]
    async fn test_notify_welcome_uses_name() {
        let directory = MemoryDirectory::new();
        directory.put_user(subscriber(3)).expect("user");
        let transport = Arc::new(ScriptedTransport::default());
        let daemon = daemon(&directory, &transport, Utc::now());

        let report = daemon.notify(3, NotifyKind::Welcome).await.expect("notify");
        assert_eq!(report, DeliveryReport::Delivered { attempts: 1 });

        let missing = daemon.notify(4, NotifyKind::Test).await.expect("notify");
        assert_eq!(missing, DeliveryReport::NoSubscription);
    }
}
