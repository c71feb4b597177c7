//! VAPID request signing and aes128gcm payload encryption.
//!
//! [`PushSigner`] owns the server key pair for the life of the process and
//! seals every push message through the `web-push` crate:
//!
//! - an `Authorization: vapid t=<jwt>, k=<public key>` header (RFC 8292)
//! - an `aes128gcm` body encrypted to the subscription's keys (RFC 8291)
//!
//! Only the sealing happens here. The HTTP request itself goes through
//! [`PushClient`](super::push::PushClient) so every response status can be
//! classified.

use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use chrono::{DateTime, Utc};
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use super::push::{endpoint_origin, PushSubscription};
use super::vapid::{decode_b64url, VapidKeys};
use crate::constants::{AUTH_SECRET_LEN, MAX_PUSH_PLAINTEXT, MAX_VAPID_TOKEN_TTL};

/// Claims of a VAPID token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VapidClaims {
    /// Origin of the push endpoint.
    pub aud: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Contact URI of the operator.
    pub sub: String,
}

/// A push message ready for the wire.
#[derive(Clone)]
pub struct SealedMessage {
    /// `Authorization` header value.
    pub authorization: String,
    /// aes128gcm ciphertext.
    pub body: Vec<u8>,
}

impl std::fmt::Debug for SealedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedMessage")
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Signs push requests and encrypts payloads with the server VAPID keys.
pub struct PushSigner {
    private_key_b64: String,
    public_key_b64: String,
    subject: String,
    token_ttl: Duration,
}

impl std::fmt::Debug for PushSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushSigner")
            .field("public_key_b64", &self.public_key_b64)
            .field("subject", &self.subject)
            .field("token_ttl", &self.token_ttl)
            .finish_non_exhaustive()
    }
}

impl PushSigner {
    /// Create a signer. `token_ttl` is capped at 24 hours.
    pub fn new(keys: &VapidKeys, subject: impl Into<String>, token_ttl: Duration) -> Result<Self> {
        let subject = subject.into();
        anyhow::ensure!(
            subject.starts_with("mailto:") || subject.starts_with("https:"),
            "VAPID subject must be a mailto: or https: URI, got {subject:?}"
        );
        anyhow::ensure!(!token_ttl.is_zero(), "VAPID token TTL must be positive");

        Ok(Self {
            private_key_b64: keys.private_key_base64url().to_string(),
            public_key_b64: keys.public_key_base64url().to_string(),
            subject,
            token_ttl: token_ttl.min(MAX_VAPID_TOKEN_TTL),
        })
    }

    /// Base64url public key, the `k=` parameter.
    pub fn public_key_base64url(&self) -> &str {
        &self.public_key_b64
    }

    /// Expiry for a token signed at `now`.
    ///
    /// `now + token_ttl`, or `not_after` if that is earlier, so a token never
    /// outlives the message it authorizes. Always at least one second ahead.
    pub fn token_expiry(&self, now: DateTime<Utc>, not_after: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.token_ttl).unwrap_or_else(|_| chrono::Duration::hours(12));
        let exp = now + ttl;
        match not_after {
            Some(limit) => exp.min(limit.max(now + chrono::Duration::seconds(1))),
            None => exp,
        }
    }

    /// Sign and encrypt `plaintext` for `subscription`.
    ///
    /// Each call signs a fresh token and draws a fresh salt and ephemeral key,
    /// so call it again for every attempt.
    pub fn seal(
        &self,
        subscription: &PushSubscription,
        plaintext: &[u8],
        now: DateTime<Utc>,
        not_after: Option<DateTime<Utc>>,
    ) -> Result<SealedMessage> {
        use web_push::{ContentEncoding, SubscriptionInfo, VapidSignatureBuilder, WebPushMessageBuilder};

        anyhow::ensure!(
            plaintext.len() <= MAX_PUSH_PLAINTEXT,
            "Push payload too large: {} bytes (max {})",
            plaintext.len(),
            MAX_PUSH_PLAINTEXT
        );
        subscription.decode_keys()?;
        let audience = endpoint_origin(&subscription.endpoint)?;
        let exp = self.token_expiry(now, not_after);

        let sub_info = SubscriptionInfo::new(
            subscription.endpoint.as_str(),
            subscription.p256dh.as_str(),
            subscription.auth.as_str(),
        );

        let mut sig_builder = VapidSignatureBuilder::from_base64(&self.private_key_b64, &sub_info)
            .context("Failed to build VAPID signature")?;
        sig_builder.add_claim("sub", self.subject.as_str());
        // Full origin, port included
        sig_builder.add_claim("aud", audience.as_str());
        sig_builder.add_claim("exp", exp.timestamp());
        let signature = sig_builder.build().context("Failed to sign VAPID JWT")?;

        let mut builder = WebPushMessageBuilder::new(&sub_info);
        builder.set_payload(ContentEncoding::Aes128Gcm, plaintext);
        builder.set_vapid_signature(signature);
        let message = builder.build().context("Failed to build web push message")?;

        let payload = message.payload.context("Web push message has no payload")?;
        let authorization = payload
            .crypto_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("Authorization"))
            .map(|(_, value)| value.clone())
            .context("Web push message has no Authorization header")?;

        Ok(SealedMessage {
            authorization,
            body: payload.content,
        })
    }

    /// Startup key validation.
    ///
    /// Seals a message to a throwaway subscription, checks the token claims
    /// and decrypts the body.
    pub fn self_test(&self) -> Result<()> {
        let now = Utc::now();
        let receiver = SigningKey::random(&mut OsRng);
        let receiver_public = receiver.verifying_key().to_encoded_point(false);
        let mut auth = [0u8; AUTH_SECRET_LEN];
        OsRng.fill_bytes(&mut auth);

        let subscription = PushSubscription {
            endpoint: "https://self-test.invalid/push".to_string(),
            p256dh: BASE64URL.encode(receiver_public.as_bytes()),
            auth: BASE64URL.encode(auth),
        };
        let plaintext = b"self-test";
        let sealed = self
            .seal(&subscription, plaintext, now, None)
            .context("VAPID self-test: sealing failed")?;

        let (claims, key) = decode_authorization(&sealed.authorization)
            .context("VAPID self-test: malformed authorization")?;
        anyhow::ensure!(
            key == decode_b64url(&self.public_key_b64)?,
            "VAPID self-test: authorization carries the wrong public key"
        );
        anyhow::ensure!(
            claims.aud == "https://self-test.invalid" && claims.exp > now.timestamp(),
            "VAPID self-test: unexpected claims {claims:?}"
        );

        let components = ece::EcKeyComponents::new(
            receiver.to_bytes().to_vec(),
            receiver_public.as_bytes().to_vec(),
        );
        let decrypted = ece::decrypt(&components, &auth, &sealed.body)
            .context("VAPID self-test: decryption failed")?;
        anyhow::ensure!(decrypted == plaintext, "VAPID self-test: payload mismatch");

        log::info!("[WebPush] Key self-test passed (public key {})", short(&self.public_key_b64));
        Ok(())
    }
}

fn short(value: &str) -> &str {
    &value[..value.len().min(12)]
}

/// Split a `vapid t=..., k=...` header into its unverified claims and the
/// raw `k=` public key.
pub fn decode_authorization(header: &str) -> Result<(VapidClaims, Vec<u8>)> {
    let rest = header
        .strip_prefix("vapid ")
        .context("Authorization is not a vapid scheme")?;

    let mut token = None;
    let mut key = None;
    for part in rest.split(',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("t=") {
            token = Some(v);
        } else if let Some(v) = part.strip_prefix("k=") {
            key = Some(v);
        }
    }
    let token = token.context("Authorization is missing t=")?;
    let key = decode_b64url(key.context("Authorization is missing k=")?)?;

    let claims_b64 = token.split('.').nth(1).context("JWT has no claims segment")?;
    let claims = serde_json::from_slice(&decode_b64url(claims_b64)?).context("Invalid JWT claims")?;
    Ok((claims, key))
}

/// Check the ES256 signature of a `vapid t=..., k=...` header against
/// `public_key` and return its claims.
#[cfg(test)]
pub(crate) fn verify_authorization(header: &str, public_key: &[u8]) -> Result<VapidClaims> {
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::{Signature, VerifyingKey};

    let (claims, key) = decode_authorization(header)?;
    anyhow::ensure!(key == public_key, "Authorization k= does not match the public key");

    let token = header
        .split("t=")
        .nth(1)
        .and_then(|rest| rest.split(',').next())
        .context("Authorization is missing t=")?;
    let (signing_input, sig_b64) = token.rsplit_once('.').context("JWT has no signature")?;

    let verifying_key = VerifyingKey::from_sec1_bytes(public_key).context("Invalid verifying key")?;
    let signature = Signature::from_slice(&decode_b64url(sig_b64)?).context("Invalid JWT signature encoding")?;
    verifying_key
        .verify(signing_input.as_bytes(), &signature)
        .context("JWT signature does not verify")?;
    Ok(claims)
}
