//! VAPID key material for Web Push (RFC 8292).
//!
//! One P-256 ECDSA keypair identifies this server to every push service. It is
//! loaded once at startup from configuration and never changes while the
//! process runs.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::OsRng;
use p256::pkcs8::DecodePrivateKey;
use serde::{Deserialize, Serialize};

use crate::constants::P256_POINT_LEN;

/// VAPID keypair for web push authentication.
///
/// The private key is held as the raw 32-byte P-256 scalar (base64url). The
/// public key is the uncompressed SEC1 point (65 bytes, base64url). Every
/// accepted input format is normalised to these two strings.
#[derive(Clone, Serialize, Deserialize)]
pub struct VapidKeys {
    /// Raw 32-byte P-256 private key scalar (base64url).
    private_key_b64: String,
    /// Uncompressed public key bytes (base64url, 65 bytes decoded).
    public_key_b64: String,
}

impl std::fmt::Debug for VapidKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VapidKeys")
            .field("private_key_b64", &"<redacted>")
            .field("public_key_b64", &self.public_key_b64)
            .finish()
    }
}

impl VapidKeys {
    /// Generate a fresh VAPID keypair.
    pub fn generate() -> Self {
        Self::from_signing_key(&SigningKey::random(&mut OsRng))
    }

    fn from_signing_key(signing_key: &SigningKey) -> Self {
        // SEC1 uncompressed public key (65 bytes: 0x04 || x || y)
        let public_bytes = signing_key.verifying_key().to_encoded_point(false);
        Self {
            private_key_b64: BASE64URL.encode(signing_key.to_bytes().as_slice()),
            public_key_b64: BASE64URL.encode(public_bytes.as_bytes()),
        }
    }

    /// Base64url-encoded uncompressed public key (65 bytes decoded).
    ///
    /// This is the `applicationServerKey` browsers subscribe with, and the
    /// `k=` parameter of every authorization header.
    pub fn public_key_base64url(&self) -> &str {
        &self.public_key_b64
    }

    /// Base64url-encoded raw 32-byte private key scalar.
    pub fn private_key_base64url(&self) -> &str {
        &self.private_key_b64
    }

    /// Reconstruct from base64url-encoded raw keys.
    ///
    /// Validates both formats and that the private key derives the public key.
    pub fn from_base64url(public_key_b64: &str, private_key_b64: &str) -> Result<Self> {
        let pub_bytes = decode_b64url(public_key_b64).context("Invalid base64url for VAPID public key")?;
        anyhow::ensure!(
            pub_bytes.len() == P256_POINT_LEN && pub_bytes[0] == 0x04,
            "VAPID public key must be 65-byte uncompressed P-256 point"
        );

        let priv_bytes = decode_b64url(private_key_b64).context("Invalid base64url for VAPID private key")?;
        anyhow::ensure!(
            priv_bytes.len() == 32,
            "VAPID private key must be 32-byte P-256 scalar, got {} bytes",
            priv_bytes.len()
        );
        let signing_key = SigningKey::from_bytes(priv_bytes.as_slice().into())
            .context("VAPID private key is not a valid P-256 scalar")?;

        let keys = Self::from_signing_key(&signing_key);
        anyhow::ensure!(
            keys.public_key_b64 == BASE64URL.encode(&pub_bytes),
            "VAPID private key does not derive the configured public key"
        );
        Ok(keys)
    }

    /// Load keys from configuration.
    ///
    /// `private_material` may be any of:
    /// - raw 32-byte scalar (base64url)
    /// - SEC1 DER or PKCS#8 DER (base64url)
    /// - PEM text (`EC PRIVATE KEY` or `PRIVATE KEY`)
    /// - PEM text wrapped in base64url
    ///
    /// When `expected_public_b64` is given, the derived public key must match it.
    pub fn from_config(private_material: &str, expected_public_b64: Option<&str>) -> Result<Self> {
        let signing_key = parse_private_key(private_material.trim())?;
        let keys = Self::from_signing_key(&signing_key);

        if let Some(expected) = expected_public_b64.map(str::trim).filter(|s| !s.is_empty()) {
            let expected_bytes =
                decode_b64url(expected).context("Invalid base64url for VAPID public key")?;
            anyhow::ensure!(
                keys.public_key_bytes()? == expected_bytes,
                "VAPID private key does not derive the configured public key"
            );
        }

        Ok(keys)
    }

    /// Uncompressed public key bytes (65 bytes).
    pub fn public_key_bytes(&self) -> Result<Vec<u8>> {
        decode_b64url(&self.public_key_b64).context("Failed to decode VAPID public key")
    }
}

/// Decode base64url, tolerating trailing padding.
pub(crate) fn decode_b64url(value: &str) -> Result<Vec<u8>> {
    Ok(BASE64URL.decode(value.trim().trim_end_matches('='))?)
}

fn parse_private_key(material: &str) -> Result<SigningKey> {
    anyhow::ensure!(!material.is_empty(), "VAPID private key is empty");

    if material.starts_with("-----BEGIN") {
        return parse_pem(material);
    }

    let bytes = decode_b64url(material)
        .context("VAPID private key is neither PEM nor base64url")?;

    if bytes.len() == 32 {
        return SigningKey::from_bytes(bytes.as_slice().into())
            .context("VAPID private key is not a valid P-256 scalar");
    }

    // Base64url-wrapped PEM
    if bytes.starts_with(b"-----BEGIN") {
        let pem = std::str::from_utf8(&bytes).context("Wrapped VAPID PEM is not UTF-8")?;
        return parse_pem(pem);
    }

    if let Ok(sk) = p256::SecretKey::from_sec1_der(&bytes) {
        log::debug!("[WebPush] Loaded VAPID key from SEC1 DER ({} bytes)", bytes.len());
        return Ok(SigningKey::from(sk));
    }

    let sk = SigningKey::from_pkcs8_der(&bytes)
        .context("VAPID private key is not a 32-byte scalar, SEC1 DER, PKCS8 DER, or PEM")?;
    log::debug!("[WebPush] Loaded VAPID key from PKCS8 DER ({} bytes)", bytes.len());
    Ok(sk)
}

fn parse_pem(pem: &str) -> Result<SigningKey> {
    let pem = pem.trim();
    if let Ok(sk) = SigningKey::from_pkcs8_pem(pem) {
        return Ok(sk);
    }
    let sk = p256::SecretKey::from_sec1_pem(pem)
        .context("VAPID PEM is neither PKCS8 nor SEC1 P-256 key")?;
    Ok(SigningKey::from(sk))
}
