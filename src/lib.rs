//! Deadline reminder scheduler and Web Push delivery engine.
//!
//! Watches tasks with deadlines and sends each owner browser push
//! notifications as a deadline approaches, once it has passed, and as a
//! daily digest. Every reminder is delivered at most once, across restarts
//! and concurrent instances.
//!
//! # Architecture
//!
//! - **Scheduler** - Periodic sweeps that turn Directory state into due events
//! - **Ledger** - Durable at-most-once record of fired events
//! - **Delivery** - Worker pool: claim, compose, sign, encrypt, push
//! - **Notifications** - Payload composer, VAPID signer, push transport
//! - **Directory** - Consumed view of users, tasks and subscriptions
//!
//! # Modules
//!
//! - [`scheduler`] - Reminder window scheduler and clocks
//! - [`ledger`] - Idempotency ledger (memory and SQLite)
//! - [`delivery`] - Delivery coordinator and retry policy
//! - [`notifications`] - Web Push payloads, crypto and HTTP transport
//! - [`directory`] - Directory and subscription store seams
//! - [`config`] - Configuration loading/saving

pub mod config;
pub mod constants;
pub mod daemon;
pub mod delivery;
pub mod directory;
pub mod env;
pub mod ledger;
pub mod notifications;
pub mod scheduler;

// Re-export commonly used types
pub use config::Config;
pub use daemon::{Daemon, NotifyKind};
pub use delivery::{Coordinator, DeliveryPipeline, DeliveryReport, RetryPolicy, ShutdownReport};
pub use ledger::{ClaimOutcome, EventKey, Ledger};
pub use scheduler::{Scheduler, SchedulerConfig, TickReport};
