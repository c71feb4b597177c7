//! Test doubles shared by the delivery unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use chrono::{DateTime, Utc};
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::{OsRng, RngCore};

use super::{DeliveryPipeline, RetryPolicy};
use crate::directory::{MemoryDirectory, User, UserId};
use crate::ledger::MemoryLedger;
use crate::notifications::composer::Composer;
use crate::notifications::push::{DeliveryOutcome, PushRequest, PushSubscription, PushTransport};
use crate::notifications::signer::PushSigner;
use crate::notifications::vapid::VapidKeys;
use crate::scheduler::ManualClock;

/// A well-formed subscription with a fresh receiver key.
pub(crate) fn subscription(endpoint: &str) -> PushSubscription {
    let receiver = SigningKey::random(&mut OsRng);
    let public = receiver.verifying_key().to_encoded_point(false);
    let mut auth = [0u8; 16];
    OsRng.fill_bytes(&mut auth);
    PushSubscription {
        endpoint: endpoint.to_string(),
        p256dh: BASE64URL.encode(public.as_bytes()),
        auth: BASE64URL.encode(auth),
    }
}

pub(crate) fn subscriber(id: UserId) -> User {
    User {
        id,
        name: Some(format!("user-{id}")),
        is_active: true,
        push_subscription: Some(subscription(&format!("https://push.example.com/send/{id}"))),
    }
}

/// Retries without real waiting.
pub(crate) fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        factor: 2,
        max_throttle_wait: Duration::from_millis(5),
    }
}

/// Transport that replays scripted outcomes and records every request.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<DeliveryOutcome>>,
    sent: Mutex<Vec<PushRequest>>,
    delay: Option<Duration>,
    clock_step: Option<chrono::Duration>,
    clock: Option<Arc<ManualClock>>,
}

impl ScriptedTransport {
    pub(crate) fn new(script: Vec<DeliveryOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub(crate) fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Every attempt moves the fixture clock forward by `step`.
    pub(crate) fn advancing(script: Vec<DeliveryOutcome>, step: chrono::Duration) -> Self {
        Self {
            clock_step: Some(step),
            ..Self::new(script)
        }
    }

    pub(crate) fn sent(&self) -> Vec<PushRequest> {
        self.sent.lock().expect("sent").clone()
    }
}

#[async_trait]
impl PushTransport for ScriptedTransport {
    async fn deliver(&self, request: &PushRequest) -> DeliveryOutcome {
        self.sent.lock().expect("sent").push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let (Some(clock), Some(step)) = (&self.clock, self.clock_step) {
            clock.advance(step);
        }
        self.script
            .lock()
            .expect("script")
            .pop_front()
            .unwrap_or(DeliveryOutcome::Delivered)
    }
}

pub(crate) struct Fixture {
    pub directory: MemoryDirectory,
    pub ledger: Arc<MemoryLedger>,
    pub transport: Arc<ScriptedTransport>,
    pub keys: VapidKeys,
    pub clock: Arc<ManualClock>,
    pub pipeline: Arc<DeliveryPipeline>,
}

pub(crate) fn fixture(users: Vec<User>, transport: ScriptedTransport, now: DateTime<Utc>) -> Fixture {
    let directory = MemoryDirectory::new();
    for user in users {
        directory.put_user(user).expect("user");
    }
    let ledger = Arc::new(MemoryLedger::new());
    let clock = Arc::new(ManualClock::new(now));
    let mut transport = transport;
    transport.clock = Some(Arc::clone(&clock));
    let transport = Arc::new(transport);
    let keys = VapidKeys::generate();
    let signer = PushSigner::new(&keys, "mailto:ops@example.com", Duration::from_secs(12 * 3600))
        .expect("signer");

    let pipeline = Arc::new(DeliveryPipeline::new(
        Arc::new(directory.clone()),
        Arc::clone(&ledger) as _,
        Arc::new(signer),
        Arc::clone(&transport) as _,
        Composer::default(),
        Arc::clone(&clock) as _,
        fast_retry(),
        chrono::Duration::days(7),
    ));

    Fixture {
        directory,
        ledger,
        transport,
        keys,
        clock,
        pipeline,
    }
}
