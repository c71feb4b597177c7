//! Web push message sending (RFC 8030).
//!
//! [`PushClient`] POSTs one already-encrypted message to one push endpoint
//! and maps the push service response to a [`DeliveryOutcome`]. It never
//! retries on its own; retry policy belongs to the delivery coordinator.

// Rust guideline compliant 2026-02

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::vapid::decode_b64url;
use crate::constants::{AUTH_SECRET_LEN, MAX_TOPIC_LEN, P256_POINT_LEN};

/// A browser's push subscription, created by the external subscribe flow.
///
/// Contains everything needed to send a web push message to that browser.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    /// Push service endpoint URL.
    pub endpoint: String,
    /// Browser's P-256 ECDH public key (base64url).
    pub p256dh: String,
    /// Shared auth secret (base64url).
    pub auth: String,
}

/// Decoded subscription key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionKeys {
    /// Uncompressed P-256 point (65 bytes).
    pub p256dh: Vec<u8>,
    /// Authentication secret (16 bytes).
    pub auth: Vec<u8>,
}

impl PushSubscription {
    /// Decode and validate the subscription's key material.
    ///
    /// A failure here means the subscription itself is unusable.
    pub fn decode_keys(&self) -> Result<SubscriptionKeys> {
        let p256dh = decode_b64url(&self.p256dh).context("Invalid base64url in p256dh")?;
        anyhow::ensure!(
            p256dh.len() == P256_POINT_LEN && p256dh[0] == 0x04,
            "p256dh must be a 65-byte uncompressed P-256 point, got {} bytes",
            p256dh.len()
        );
        p256::PublicKey::from_sec1_bytes(&p256dh).context("p256dh is not a point on P-256")?;

        let auth = decode_b64url(&self.auth).context("Invalid base64url in auth")?;
        anyhow::ensure!(
            auth.len() == AUTH_SECRET_LEN,
            "auth secret must be {} bytes, got {}",
            AUTH_SECRET_LEN,
            auth.len()
        );

        Ok(SubscriptionKeys { p256dh, auth })
    }

    /// Origin of the endpoint (`scheme://host[:port]`), the VAPID audience.
    pub fn audience(&self) -> Result<String> {
        endpoint_origin(&self.endpoint)
    }
}

/// Origin of an endpoint URL, as used for the JWT `aud` claim.
pub fn endpoint_origin(endpoint: &str) -> Result<String> {
    let url = reqwest::Url::parse(endpoint)
        .with_context(|| format!("Invalid push endpoint URL: {endpoint}"))?;
    anyhow::ensure!(
        matches!(url.scheme(), "https" | "http"),
        "Push endpoint must be http(s), got {}",
        url.scheme()
    );
    let origin = url.origin();
    anyhow::ensure!(origin.is_tuple(), "Push endpoint has no origin: {endpoint}");
    Ok(origin.ascii_serialization())
}

/// Push message urgency (RFC 8030 section 5.3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Urgency {
    /// Background updates.
    VeryLow,
    /// Low priority.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Time-sensitive, may wake the device.
    High,
}

impl Urgency {
    /// Header value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VeryLow => "very-low",
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

/// Derive a `Topic` header from a notification tag.
///
/// Topics are limited to 32 characters of the base64url alphabet. Tags that do
/// not fit are not sent as a topic.
pub fn topic_for_tag(tag: &str) -> Option<String> {
    let valid = !tag.is_empty()
        && tag.len() <= MAX_TOPIC_LEN
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    valid.then(|| tag.to_string())
}

/// A fully prepared push message: signed and encrypted.
#[derive(Clone)]
pub struct PushRequest {
    /// Subscription endpoint.
    pub endpoint: String,
    /// `Authorization` header value (`vapid t=..., k=...`).
    pub authorization: String,
    /// Seconds the push service may hold the message.
    pub ttl_secs: u64,
    /// Delivery urgency.
    pub urgency: Urgency,
    /// Optional replacement topic.
    pub topic: Option<String>,
    /// aes128gcm ciphertext.
    pub body: Vec<u8>,
}

impl std::fmt::Debug for PushRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushRequest")
            .field("endpoint", &self.endpoint)
            .field("ttl_secs", &self.ttl_secs)
            .field("urgency", &self.urgency)
            .field("topic", &self.topic)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Classified result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Push service accepted the message.
    Delivered,
    /// Subscription no longer exists (404/410).
    EndpointGone,
    /// Rate limited (429). Carries the server-indicated delay, if any.
    Throttled {
        /// Parsed `Retry-After`.
        retry_after: Option<Duration>,
    },
    /// Temporary failure: 5xx, 408, timeout, connection error.
    Transient(String),
    /// Request refused (other 4xx). Usually a configuration problem.
    Rejected(String),
}

impl DeliveryOutcome {
    /// Short label for logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::EndpointGone => "endpoint_gone",
            Self::Throttled { .. } => "throttled",
            Self::Transient(_) => "transient",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Sends prepared messages to push services.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Send one message. Never returns an error: failures are outcomes.
    async fn deliver(&self, request: &PushRequest) -> DeliveryOutcome;
}

/// reqwest-backed push transport.
///
/// Holds a single `reqwest::Client` so connections to the same push service
/// are pooled across deliveries.
#[derive(Debug, Clone)]
pub struct PushClient {
    client: reqwest::Client,
}

impl PushClient {
    /// Build a client with a per-attempt timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(crate::constants::user_agent())
            .build()
            .context("Failed to build push HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PushTransport for PushClient {
    async fn deliver(&self, request: &PushRequest) -> DeliveryOutcome {
        let mut builder = self
            .client
            .post(&request.endpoint)
            .header("Authorization", &request.authorization)
            .header("Content-Encoding", "aes128gcm")
            .header("Content-Type", "application/octet-stream")
            .header("TTL", request.ttl_secs.to_string())
            .header("Urgency", request.urgency.as_str());

        if let Some(topic) = &request.topic {
            builder = builder.header("Topic", topic);
        }

        let response = match builder.body(request.body.clone()).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return DeliveryOutcome::Transient(format!("request timed out: {e}"));
            }
            Err(e) => {
                return DeliveryOutcome::Transient(format!("request failed: {e}"));
            }
        };

        let status = response.status();
        let outcome = classify_status(status, response.headers(), Utc::now());
        let transient = matches!(outcome, DeliveryOutcome::Transient(_));
        if !transient && !matches!(outcome, DeliveryOutcome::Rejected(_)) {
            return outcome;
        }

        // Keep the response body for the operator
        let body = response.text().await.unwrap_or_default();
        let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
        log::debug!("[WebPush] {} response from {}", detail, request.endpoint);
        if transient {
            DeliveryOutcome::Transient(detail)
        } else {
            DeliveryOutcome::Rejected(detail)
        }
    }
}

/// Map a push service status code to an outcome.
pub fn classify_status(status: StatusCode, headers: &HeaderMap, now: DateTime<Utc>) -> DeliveryOutcome {
    match status.as_u16() {
        200..=299 => DeliveryOutcome::Delivered,
        404 | 410 => DeliveryOutcome::EndpointGone,
        429 => DeliveryOutcome::Throttled {
            retry_after: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, now)),
        },
        408 | 500..=599 => DeliveryOutcome::Transient(format!("HTTP {}", status.as_u16())),
        code => DeliveryOutcome::Rejected(format!("HTTP {code}")),
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
