//! Delivery coordinator.
//!
//! A fixed pool of async workers drains a bounded queue of [`ReminderEvent`]s.
//! Each worker runs one event at a time through the [`DeliveryPipeline`]:
//!
//! ```text
//! Scheduler ──try_send──> [queue] ──> worker 1 ─┐
//!                                 ──> worker 2 ─┼─> claim ─> compose ─> sign ─> push
//!                                 ──> worker N ─┘
//! ```
//!
//! The ledger claim inside the pipeline is what keeps two workers (or two
//! processes) from sending the same event. The queue itself makes no promise
//! about duplicates.

mod pipeline;
mod retry;
#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::{DeliveryPipeline, DeliveryReport, InFlight};
pub use retry::RetryPolicy;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ledger::EventKey;
use crate::scheduler::ReminderEvent;

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<ReminderEvent>>>;

/// How a coordinator shutdown went.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every worker finished within the grace period.
    pub drained: bool,
    /// Claimed events whose outcome is unknown because their worker was
    /// aborted. These stay recorded as fired.
    pub abandoned: Vec<EventKey>,
}

/// Worker pool that delivers queued events.
pub struct Coordinator {
    sender: mpsc::Sender<ReminderEvent>,
    workers: Vec<JoinHandle<()>>,
    in_flight: InFlight,
    pipeline: Arc<DeliveryPipeline>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("workers", &self.workers.len())
            .field("queue_capacity", &self.sender.max_capacity())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Spawn `worker_count` workers behind a queue of `queue_capacity`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(pipeline: Arc<DeliveryPipeline>, worker_count: usize, queue_capacity: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let in_flight: InFlight = Arc::new(Mutex::new(HashSet::new()));

        let workers = (0..worker_count)
            .map(|id| {
                tokio::spawn(Self::worker_loop(
                    id,
                    Arc::clone(&pipeline),
                    Arc::clone(&receiver),
                    Arc::clone(&in_flight),
                ))
            })
            .collect();

        log::info!(
            "[Coordinator] Started {} workers (queue capacity {})",
            worker_count,
            queue_capacity.max(1)
        );

        Self {
            sender,
            workers,
            in_flight,
            pipeline,
        }
    }

    async fn worker_loop(
        id: usize,
        pipeline: Arc<DeliveryPipeline>,
        receiver: SharedReceiver,
        in_flight: InFlight,
    ) {
        log::debug!("[Coordinator] Worker {} started", id);
        loop {
            // Only one worker waits on the channel at a time
            let next = receiver.lock().await.recv().await;
            let Some(event) = next else {
                break;
            };
            log::debug!("[Coordinator] Worker {} picked up {} ({})", id, event.key(), event.kind());
            pipeline.process(&event, &in_flight).await;
        }
        log::debug!("[Coordinator] Worker {} stopped: queue closed", id);
    }

    /// Queue handle for producers.
    pub fn sender(&self) -> mpsc::Sender<ReminderEvent> {
        self.sender.clone()
    }

    /// Pipeline shared by the workers.
    pub fn pipeline(&self) -> &Arc<DeliveryPipeline> {
        &self.pipeline
    }

    /// Keys currently being delivered.
    pub fn in_flight(&self) -> Vec<EventKey> {
        snapshot(&self.in_flight)
    }

    /// Close the queue and wait up to `grace` for workers to finish.
    ///
    /// Queued events are still delivered while the grace period lasts. The
    /// queue only closes once every other sender is dropped, so stop the
    /// scheduler first. On timeout the remaining workers are aborted and each
    /// claimed-but-unfinished key is logged.
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        let Self {
            sender,
            workers,
            in_flight,
            ..
        } = self;
        drop(sender);

        let abort_handles: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        let join_all = async move {
            for worker in workers {
                if let Err(e) = worker.await {
                    log::warn!("[Coordinator] Worker ended abnormally: {}", e);
                }
            }
        };

        let drained = tokio::time::timeout(grace, join_all).await.is_ok();
        if drained {
            log::info!("[Coordinator] All workers drained");
            return ShutdownReport {
                drained,
                abandoned: Vec::new(),
            };
        }

        for handle in &abort_handles {
            handle.abort();
        }
        let abandoned = snapshot(&in_flight);
        log::warn!(
            "[Coordinator] Grace period of {:?} elapsed, aborted workers with {} deliveries in flight",
            grace,
            abandoned.len()
        );
        for key in &abandoned {
            log::warn!("[Coordinator] Delivery outcome unknown for {}", key);
        }

        ShutdownReport { drained, abandoned }
    }
}

fn snapshot(in_flight: &InFlight) -> Vec<EventKey> {
    let mut keys: Vec<EventKey> = in_flight
        .lock()
        .map(|keys| keys.iter().cloned().collect())
        .unwrap_or_default();
    keys.sort();
    keys
}
