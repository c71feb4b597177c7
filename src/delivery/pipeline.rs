//! Per-event delivery: claim, compose, sign, send, reconcile.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::retry::RetryPolicy;
use crate::directory::{SubscriptionStore, UserId};
use crate::ledger::{ClaimOutcome, EventKey, Ledger};
use crate::notifications::composer::{Composer, NotificationPayload};
use crate::notifications::push::{topic_for_tag, DeliveryOutcome, PushRequest, PushSubscription, PushTransport};
use crate::notifications::signer::PushSigner;
use crate::scheduler::{Clock, ReminderEvent};

/// Keys claimed by a worker and not yet finished.
pub type InFlight = Arc<Mutex<HashSet<EventKey>>>;

/// How handling one event or direct notification ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReport {
    /// Accepted by the push service.
    Delivered {
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// The user has no subscription. Nothing was claimed.
    NoSubscription,
    /// Another worker or process already fired this event.
    AlreadyFired,
    /// The subscription was gone (404/410) and has been deleted.
    EndpointGone,
    /// The subscription's key material or endpoint was malformed; deleted.
    InvalidSubscription(String),
    /// Payload could not be prepared. The claim was rolled back.
    PreDeliveryFailed(String),
    /// Push service refused the request. Raised as an operational alert.
    Rejected(String),
    /// Transient or throttled failures outlasted the retry budget.
    GaveUp(String),
    /// Directory or ledger unavailable before anything was claimed.
    Skipped(String),
}

impl DeliveryReport {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::NoSubscription => "no_subscription",
            Self::AlreadyFired => "already_fired",
            Self::EndpointGone => "endpoint_gone",
            Self::InvalidSubscription(_) => "invalid_subscription",
            Self::PreDeliveryFailed(_) => "pre_delivery_failed",
            Self::Rejected(_) => "rejected",
            Self::GaveUp(_) => "gave_up",
            Self::Skipped(_) => "skipped",
        }
    }
}

/// Everything a worker needs to deliver one message.
pub struct DeliveryPipeline {
    subscriptions: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn Ledger>,
    signer: Arc<PushSigner>,
    transport: Arc<dyn PushTransport>,
    composer: Composer,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    retention: chrono::Duration,
}

impl std::fmt::Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPipeline")
            .field("signer", &self.signer)
            .field("composer", &self.composer)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl DeliveryPipeline {
    /// Assemble a pipeline.
    #[allow(clippy::too_many_arguments, reason = "wires every collaborator once at startup")]
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn Ledger>,
        signer: Arc<PushSigner>,
        transport: Arc<dyn PushTransport>,
        composer: Composer,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            signer,
            transport,
            composer,
            clock,
            retry,
            retention,
        }
    }

    /// Composer used for every payload.
    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    /// Current time according to the pipeline clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Handle one scheduled event end to end.
    ///
    /// The key stays in `in_flight` from the moment it is claimed until the
    /// outcome is reconciled.
    pub async fn process(&self, event: &ReminderEvent, in_flight: &InFlight) -> DeliveryReport {
        let user_id = event.user_id();
        let key = event.key();

        let subscription = match self.subscriptions.get(user_id).await {
            Ok(Some(subscription)) => subscription,
            Ok(None) => {
                log::debug!("[Delivery] User {} has no subscription, skipping {}", user_id, key);
                return DeliveryReport::NoSubscription;
            }
            Err(e) => {
                log::warn!("[Delivery] Subscription lookup for user {} failed: {:#}", user_id, e);
                return DeliveryReport::Skipped(format!("{e:#}"));
            }
        };

        let now = self.clock.now();
        match self
            .ledger
            .try_claim(&key, now, event.relevant_until(self.retention))
            .await
        {
            Ok(ClaimOutcome::Claimed) => {}
            Ok(ClaimOutcome::AlreadyFired) => {
                log::debug!("[Delivery] {} already fired", key);
                return DeliveryReport::AlreadyFired;
            }
            Err(e) => {
                log::warn!("[Delivery] Claim of {} failed: {:#}", key, e);
                return DeliveryReport::Skipped(format!("{e:#}"));
            }
        }

        track(in_flight, &key, true);
        let payload = self.composer.compose(event, now);
        let report = self.send(user_id, &subscription, &payload).await;

        let roll_back = matches!(
            report,
            DeliveryReport::PreDeliveryFailed(_) | DeliveryReport::InvalidSubscription(_)
        );
        if roll_back {
            match self.ledger.unclaim(&key).await {
                Ok(_) => log::info!("[Delivery] Released claim on {}", key),
                Err(e) => log::warn!("[Delivery] Failed to release claim on {}: {:#}", key, e),
            }
        }

        log::info!("[Delivery] {} for user {}: {}", key, user_id, report.label());
        track(in_flight, &key, false);
        report
    }

    /// Deliver `payload` to `user_id` directly, bypassing the ledger.
    pub async fn notify_user(&self, user_id: UserId, payload: &NotificationPayload) -> Result<DeliveryReport> {
        let Some(subscription) = self.subscriptions.get(user_id).await? else {
            return Ok(DeliveryReport::NoSubscription);
        };
        let report = self.send(user_id, &subscription, payload).await;
        log::info!("[Delivery] Direct '{}' to user {}: {}", payload.tag, user_id, report.label());
        Ok(report)
    }

    /// Prepare, deliver with retries, and reconcile the subscription.
    async fn send(
        &self,
        user_id: UserId,
        subscription: &PushSubscription,
        payload: &NotificationPayload,
    ) -> DeliveryReport {
        if let Err(e) = subscription.decode_keys().and_then(|_| subscription.audience()) {
            log::warn!("[Delivery] Subscription of user {} is invalid: {:#}", user_id, e);
            self.remove_subscription(user_id).await;
            return DeliveryReport::InvalidSubscription(format!("{e:#}"));
        }

        let plaintext = match payload.to_json() {
            Ok(plaintext) => plaintext,
            Err(e) => {
                log::warn!("[Delivery] Could not serialize message for user {}: {:#}", user_id, e);
                return DeliveryReport::PreDeliveryFailed(format!("{e:#}"));
            }
        };

        let mut attempts = 0u32;
        let mut transient_retries = 0u32;
        let mut throttle_retried = false;
        let outcome = loop {
            let now = self.clock.now();
            if attempts > 0 && payload.deliver_by.is_some_and(|by| now >= by) {
                log::warn!(
                    "[Delivery] Delivery window for user {} closed after {} attempts",
                    user_id,
                    attempts
                );
                return DeliveryReport::GaveUp("delivery window closed".to_string());
            }

            // Fresh token and TTL for every attempt
            let request = match self.prepare(subscription, &plaintext, payload, now) {
                Ok(request) => request,
                Err(e) if attempts == 0 => {
                    log::warn!("[Delivery] Could not prepare message for user {}: {:#}", user_id, e);
                    return DeliveryReport::PreDeliveryFailed(format!("{e:#}"));
                }
                Err(e) => {
                    log::warn!("[Delivery] Could not re-sign message for user {}: {:#}", user_id, e);
                    return DeliveryReport::GaveUp(format!("{e:#}"));
                }
            };

            attempts += 1;
            let outcome = self.transport.deliver(&request).await;

            let retry_delay = match &outcome {
                DeliveryOutcome::Transient(reason) if transient_retries < self.retry.max_retries => {
                    let delay = self.retry.backoff(transient_retries);
                    transient_retries += 1;
                    log::debug!(
                        "[Delivery] Transient failure for user {} ({}), retry {} in {:?}",
                        user_id,
                        reason,
                        transient_retries,
                        delay
                    );
                    Some(delay)
                }
                DeliveryOutcome::Throttled { retry_after } if !throttle_retried => {
                    let delay = self.retry.throttle_wait(*retry_after);
                    throttle_retried = true;
                    log::info!("[Delivery] Throttled for user {}, retrying once in {:?}", user_id, delay);
                    Some(delay)
                }
                _ => None,
            };

            match retry_delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => break outcome,
            }
        };

        match outcome {
            DeliveryOutcome::Delivered => DeliveryReport::Delivered { attempts },
            DeliveryOutcome::EndpointGone => {
                log::info!("[Delivery] Endpoint gone for user {}, removing subscription", user_id);
                self.remove_subscription(user_id).await;
                DeliveryReport::EndpointGone
            }
            DeliveryOutcome::Rejected(reason) => {
                log::error!(
                    target: "alert",
                    "[Delivery] Push service rejected message for user {}: {}",
                    user_id,
                    reason
                );
                DeliveryReport::Rejected(reason)
            }
            DeliveryOutcome::Transient(reason) => {
                log::warn!(
                    "[Delivery] Giving up on user {} after {} attempts: {}",
                    user_id,
                    attempts,
                    reason
                );
                DeliveryReport::GaveUp(reason)
            }
            DeliveryOutcome::Throttled { .. } => {
                log::warn!("[Delivery] Giving up on user {}: still throttled", user_id);
                DeliveryReport::GaveUp("throttled".to_string())
            }
        }
    }

    fn prepare(
        &self,
        subscription: &PushSubscription,
        plaintext: &[u8],
        payload: &NotificationPayload,
        now: DateTime<Utc>,
    ) -> Result<PushRequest> {
        let sealed = self.signer.seal(subscription, plaintext, now, payload.deliver_by)?;

        Ok(PushRequest {
            endpoint: subscription.endpoint.clone(),
            authorization: sealed.authorization,
            ttl_secs: payload.ttl_secs(now),
            urgency: payload.urgency,
            topic: topic_for_tag(&payload.tag),
            body: sealed.body,
        })
    }

    async fn remove_subscription(&self, user_id: UserId) {
        if let Err(e) = self.subscriptions.delete(user_id).await {
            log::warn!("[Delivery] Failed to delete subscription of user {}: {:#}", user_id, e);
        }
    }
}

fn track(in_flight: &InFlight, key: &EventKey, claimed: bool) {
    if let Ok(mut keys) = in_flight.lock() {
        if claimed {
            keys.insert(key.clone());
        } else {
            keys.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::testing::{fixture, subscriber, ScriptedTransport};
    use crate::directory::{Task, TaskStatus};
    use crate::notifications::signer::verify_authorization;
    use crate::scheduler::Threshold;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc)
    }

    fn deadline_event(owner: UserId, deadline: DateTime<Utc>) -> ReminderEvent {
        ReminderEvent::Deadline {
            task: Task {
                id: 42,
                owner,
                title: "Write report".to_string(),
                deadline,
                status: TaskStatus::Pending,
            },
            threshold: Threshold::from_minutes(30),
        }
    }

    fn in_flight() -> InFlight {
        Arc::new(Mutex::new(HashSet::new()))
    }

    #[tokio::test]
    async fn test_delivers_and_records_once() {
        let now = at("2026-05-01T09:31:00Z");
        let fx = fixture(vec![subscriber(1)], ScriptedTransport::default(), now);
        let event = deadline_event(1, at("2026-05-01T10:00:00Z"));
        let in_flight = in_flight();

        let first = fx.pipeline.process(&event, &in_flight).await;
        assert_eq!(first, DeliveryReport::Delivered { attempts: 1 });

        let second = fx.pipeline.process(&event, &in_flight).await;
        assert_eq!(second, DeliveryReport::AlreadyFired);

        let sent = fx.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic.as_deref(), Some("deadline-42"));
        assert!(fx.ledger.is_fired(&event.key()).await.expect("ledger"));
        assert!(in_flight.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_token_expiry_bounded_by_deadline() {
        let now = at("2026-05-01T09:31:00Z");
        let deadline = at("2026-05-01T10:00:00Z");
        let fx = fixture(vec![subscriber(1)], ScriptedTransport::default(), now);

        fx.pipeline
            .process(&deadline_event(1, deadline), &in_flight())
            .await;

        let sent = fx.transport.sent();
        let claims = verify_authorization(&sent[0].authorization, &fx.keys.public_key_bytes().expect("pub"))
            .expect("verifies");
        assert_eq!(claims.exp, deadline.timestamp());
        assert_eq!(sent[0].ttl_secs, 29 * 60);
    }

    #[tokio::test]
    async fn test_no_subscription_claims_nothing() {
        let now = at("2026-05-01T09:31:00Z");
        let mut user = subscriber(1);
        user.push_subscription = None;
        let fx = fixture(vec![user], ScriptedTransport::default(), now);
        let event = deadline_event(1, at("2026-05-01T10:00:00Z"));

        let report = fx.pipeline.process(&event, &in_flight()).await;

        assert_eq!(report, DeliveryReport::NoSubscription);
        assert!(!fx.ledger.is_fired(&event.key()).await.expect("ledger"));
        assert!(fx.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_gone_deletes_subscription_and_keeps_claim() {
        let now = at("2026-05-01T09:31:00Z");
        let fx = fixture(
            vec![subscriber(1)],
            ScriptedTransport::new(vec![DeliveryOutcome::EndpointGone]),
            now,
        );
        let event = deadline_event(1, at("2026-05-01T10:00:00Z"));

        let report = fx.pipeline.process(&event, &in_flight()).await;

        assert_eq!(report, DeliveryReport::EndpointGone);
        assert_eq!(fx.directory.get(1).await.expect("get"), None);
        assert!(fx.ledger.is_fired(&event.key()).await.expect("ledger"));
        assert_eq!(fx.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_give_up() {
        let now = at("2026-05-01T09:31:00Z");
        let script = vec![DeliveryOutcome::Transient("503".to_string()); 4];
        let fx = fixture(vec![subscriber(1)], ScriptedTransport::new(script), now);
        let event = deadline_event(1, at("2026-05-01T10:00:00Z"));

        let report = fx.pipeline.process(&event, &in_flight()).await;

        assert_eq!(report, DeliveryReport::GaveUp("503".to_string()));
        assert_eq!(fx.transport.sent().len(), 4);
        // Final failure keeps the claim
        assert!(fx.ledger.is_fired(&event.key()).await.expect("ledger"));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let now = at("2026-05-01T09:31:00Z");
        let script = vec![
            DeliveryOutcome::Transient("timeout".to_string()),
            DeliveryOutcome::Delivered,
        ];
        let fx = fixture(vec![subscriber(1)], ScriptedTransport::new(script), now);

        let report = fx
            .pipeline
            .process(&deadline_event(1, at("2026-05-01T10:00:00Z")), &in_flight())
            .await;

        assert_eq!(report, DeliveryReport::Delivered { attempts: 2 });
    }

    #[tokio::test]
    async fn test_throttled_retried_exactly_once() {
        let now = at("2026-05-01T09:31:00Z");
        let throttled = DeliveryOutcome::Throttled {
            retry_after: Some(std::time::Duration::from_millis(1)),
        };
        let fx = fixture(
            vec![subscriber(1)],
            ScriptedTransport::new(vec![throttled.clone(), throttled]),
            now,
        );

        let report = fx
            .pipeline
            .process(&deadline_event(1, at("2026-05-01T10:00:00Z")), &in_flight())
            .await;

        assert_eq!(report, DeliveryReport::GaveUp("throttled".to_string()));
        assert_eq!(fx.transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_each_attempt_carries_a_fresh_token() {
        let now = at("2026-05-01T09:00:00Z");
        let script = vec![DeliveryOutcome::Transient("503".to_string()), DeliveryOutcome::Delivered];
        let fx = fixture(
            vec![subscriber(1)],
            ScriptedTransport::advancing(script, chrono::Duration::minutes(10)),
            now,
        );

        let report = fx
            .pipeline
            .process(&deadline_event(1, at("2026-05-02T05:00:00Z")), &in_flight())
            .await;
        assert_eq!(report, DeliveryReport::Delivered { attempts: 2 });

        let public = fx.keys.public_key_bytes().expect("pub");
        let sent = fx.transport.sent();
        let first = verify_authorization(&sent[0].authorization, &public).expect("first verifies");
        let second = verify_authorization(&sent[1].authorization, &public).expect("second verifies");
        assert_eq!(first.exp, (now + chrono::Duration::hours(12)).timestamp());
        assert_eq!(second.exp, first.exp + 600);
        assert_eq!(sent[0].ttl_secs - sent[1].ttl_secs, 600);
    }

    #[tokio::test]
    async fn test_retry_stops_once_delivery_window_closes() {
        let now = at("2026-05-01T09:58:00Z");
        let throttled = DeliveryOutcome::Throttled {
            retry_after: Some(std::time::Duration::from_millis(1)),
        };
        let fx = fixture(
            vec![subscriber(1)],
            ScriptedTransport::advancing(vec![throttled], chrono::Duration::minutes(3)),
            now,
        );
        let event = deadline_event(1, at("2026-05-01T10:00:00Z"));

        let report = fx.pipeline.process(&event, &in_flight()).await;

        assert_eq!(report, DeliveryReport::GaveUp("delivery window closed".to_string()));
        assert_eq!(fx.transport.sent().len(), 1);
        assert_eq!(fx.clock.now(), at("2026-05-01T10:01:00Z"));
        assert!(fx.ledger.is_fired(&event.key()).await.expect("ledger"));
    }

    #[tokio::test]
    async fn test_rejected_is_not_retried() {
        let now = at("2026-05-01T09:31:00Z");
        let fx = fixture(
            vec![subscriber(1)],
            ScriptedTransport::new(vec![DeliveryOutcome::Rejected("403 bad jwt".to_string())]),
            now,
        );

        let report = fx
            .pipeline
            .process(&deadline_event(1, at("2026-05-01T10:00:00Z")), &in_flight())
            .await;

        assert_eq!(report, DeliveryReport::Rejected("403 bad jwt".to_string()));
        assert_eq!(fx.transport.sent().len(), 1);
        assert!(fx.directory.get(1).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn test_invalid_subscription_is_deleted_and_claim_released() {
        let now = at("2026-05-01T09:31:00Z");
        let mut user = subscriber(1);
        if let Some(subscription) = user.push_subscription.as_mut() {
            subscription.p256dh = "not-a-key".to_string();
        }
        let fx = fixture(vec![user], ScriptedTransport::default(), now);
        let event = deadline_event(1, at("2026-05-01T10:00:00Z"));

        let report = fx.pipeline.process(&event, &in_flight()).await;

        assert!(matches!(report, DeliveryReport::InvalidSubscription(_)));
        assert_eq!(fx.directory.get(1).await.expect("get"), None);
        assert!(!fx.ledger.is_fired(&event.key()).await.expect("ledger"));
        assert!(fx.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_notify_user_bypasses_ledger() {
        let now = at("2026-05-01T09:31:00Z");
        let fx = fixture(vec![subscriber(1)], ScriptedTransport::default(), now);
        let payload = fx.pipeline.composer().test(now);

        let first = fx.pipeline.notify_user(1, &payload).await.expect("notify");
        let second = fx.pipeline.notify_user(1, &payload).await.expect("notify");

        assert_eq!(first, DeliveryReport::Delivered { attempts: 1 });
        assert_eq!(second, DeliveryReport::Delivered { attempts: 1 });
        assert!(fx.ledger.records().await.expect("records").is_empty());
        assert_eq!(
            fx.pipeline.notify_user(9, &payload).await.expect("notify"),
            DeliveryReport::NoSubscription
        );
    }
}
