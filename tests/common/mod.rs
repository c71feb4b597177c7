//! Shared helpers for integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use chrono::{DateTime, Utc};
use deadline_push::directory::{MemoryDirectory, User, UserId};
use deadline_push::ledger::Ledger;
use deadline_push::notifications::composer::Composer;
use deadline_push::notifications::push::{DeliveryOutcome, PushRequest, PushSubscription, PushTransport};
use deadline_push::notifications::signer::{decode_authorization, PushSigner, VapidClaims};
use deadline_push::notifications::vapid::VapidKeys;
use deadline_push::scheduler::{Clock, LocalZone, ManualClock, Scheduler, SchedulerConfig};
use deadline_push::{Coordinator, DeliveryPipeline, RetryPolicy, TickReport};
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::{OsRng, RngCore};

pub fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc)
}

/// A browser on the receiving end: holds the private half of a subscription.
pub struct Browser {
    key: SigningKey,
    auth: [u8; 16],
    pub subscription: PushSubscription,
}

impl Browser {
    pub fn new(endpoint: &str) -> Self {
        let key = SigningKey::random(&mut OsRng);
        let public = key.verifying_key().to_encoded_point(false);
        let mut auth = [0u8; 16];
        OsRng.fill_bytes(&mut auth);
        let subscription = PushSubscription {
            endpoint: endpoint.to_string(),
            p256dh: BASE64URL.encode(public.as_bytes()),
            auth: BASE64URL.encode(auth),
        };
        Self { key, auth, subscription }
    }

    /// Decrypt an aes128gcm body addressed to this browser.
    pub fn open(&self, body: &[u8]) -> serde_json::Value {
        let public = self.key.verifying_key().to_encoded_point(false);
        let components = ece::EcKeyComponents::new(self.key.to_bytes().to_vec(), public.as_bytes().to_vec());
        let plaintext = ece::decrypt(&components, &self.auth, body).expect("decrypts");
        serde_json::from_slice(&plaintext).expect("json payload")
    }

    pub fn user(&self, id: UserId) -> User {
        User {
            id,
            name: Some(format!("User {id}")),
            is_active: true,
            push_subscription: Some(self.subscription.clone()),
        }
    }
}

/// Transport that replays scripted outcomes and records every request.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    script: Mutex<VecDeque<DeliveryOutcome>>,
    sent: Mutex<Vec<PushRequest>>,
}

impl RecordingTransport {
    pub fn script(&self, outcomes: Vec<DeliveryOutcome>) {
        self.script.lock().expect("script").extend(outcomes);
    }

    pub fn sent(&self) -> Vec<PushRequest> {
        self.sent.lock().expect("sent").clone()
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn deliver(&self, request: &PushRequest) -> DeliveryOutcome {
        self.sent.lock().expect("sent").push(request.clone());
        self.script
            .lock()
            .expect("script")
            .pop_front()
            .unwrap_or(DeliveryOutcome::Delivered)
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        factor: 2,
        max_throttle_wait: Duration::from_millis(5),
    }
}

/// Check the ES256 signature of a `vapid t=..., k=...` header and return its
/// claims.
pub fn verify_authorization(header: &str, public_key: &[u8]) -> VapidClaims {
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::{Signature, VerifyingKey};

    let (claims, key) = decode_authorization(header).expect("vapid header");
    assert_eq!(key, public_key, "k= is not the server key");

    let token = header
        .split("t=")
        .nth(1)
        .and_then(|rest| rest.split(',').next())
        .expect("t= parameter");
    let (signing_input, signature) = token.rsplit_once('.').expect("signed JWT");
    let signature = Signature::from_slice(&BASE64URL.decode(signature).expect("base64url")).expect("signature");
    VerifyingKey::from_sec1_bytes(public_key)
        .expect("public key")
        .verify(signing_input.as_bytes(), &signature)
        .expect("JWT signature verifies");
    claims
}

pub fn signer() -> (PushSigner, VapidKeys) {
    let keys = VapidKeys::generate();
    let signer = PushSigner::new(&keys, "mailto:ops@example.com", Duration::from_secs(12 * 3600))
        .expect("signer");
    (signer, keys)
}

/// Scheduler, ledger and delivery pool around a memory directory and a
/// manual clock.
pub struct Harness {
    pub directory: MemoryDirectory,
    pub ledger: Arc<dyn Ledger>,
    pub transport: Arc<RecordingTransport>,
    pub clock: Arc<ManualClock>,
    pub pipeline: Arc<DeliveryPipeline>,
    pub config: SchedulerConfig,
}

impl Harness {
    pub fn new(now: DateTime<Utc>, ledger: Arc<dyn Ledger>) -> Self {
        let directory = MemoryDirectory::new();
        let transport = Arc::new(RecordingTransport::default());
        let clock = Arc::new(ManualClock::new(now));
        let (signer, _keys) = signer();

        let pipeline = Arc::new(DeliveryPipeline::new(
            Arc::new(directory.clone()),
            Arc::clone(&ledger),
            Arc::new(signer),
            Arc::clone(&transport) as Arc<dyn PushTransport>,
            Composer::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
            fast_retry(),
            chrono::Duration::days(30),
        ));

        let config = SchedulerConfig {
            zone: LocalZone::from_offset_minutes(Some(0)).expect("utc"),
            ..SchedulerConfig::default()
        };

        Self {
            directory,
            ledger,
            transport,
            clock,
            pipeline,
            config,
        }
    }

    /// One scheduler tick at the current clock time, then wait for every
    /// queued delivery.
    pub async fn tick(&self) -> TickReport {
        let coordinator = Coordinator::start(Arc::clone(&self.pipeline), 4, 64);
        let mut scheduler = Scheduler::new(
            Arc::new(self.directory.clone()),
            Arc::clone(&self.ledger),
            Arc::clone(&self.clock) as Arc<dyn Clock>,
            coordinator.sender(),
            self.config.clone(),
        );

        let report = scheduler.tick(self.clock.now()).await;
        drop(scheduler);

        let shutdown = coordinator.shutdown(Duration::from_secs(10)).await;
        assert!(shutdown.drained, "deliveries did not drain");
        report
    }

    pub async fn record_keys(&self) -> Vec<String> {
        self.ledger
            .records()
            .await
            .expect("records")
            .into_iter()
            .map(|r| r.event_key.as_str().to_string())
            .collect()
    }
}
