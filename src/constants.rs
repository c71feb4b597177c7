//! Application-wide constants for deadline-push.
//!
//! This module centralizes magic numbers and protocol limits. Values that an
//! operator may want to tune live in [`crate::config::Config`]; the constants
//! here are either protocol-mandated or used as config defaults.
//!
//! # Categories
//!
//! - **Web Push**: protocol limits from RFC 8030/8188/8291/8292
//! - **Scheduling**: tick bounds and housekeeping cadence
//! - **Delivery**: default retry and timeout settings

use std::time::Duration;

/// Crate version, embedded in the HTTP user agent and `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User agent sent with push service requests.
pub fn user_agent() -> String {
    format!("deadline-push/{VERSION}")
}

// ============================================================================
// Web Push
// ============================================================================

/// Upper bound for the VAPID token `exp` claim, relative to signing time.
///
/// RFC 8292 forbids tokens valid for more than 24 hours.
pub const MAX_VAPID_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Largest plaintext accepted for a single push message.
///
/// Push services must accept 4096-byte bodies. The aes128gcm header (86 bytes),
/// the padding delimiter and the 16-byte tag leave 3993 bytes of plaintext.
pub const MAX_PUSH_PLAINTEXT: usize = 3993;

/// Length of the random salt at the start of an aes128gcm body.
pub const AES128GCM_SALT_LEN: usize = 16;

/// Length of the uncompressed P-256 point carried as the aes128gcm key id.
pub const P256_POINT_LEN: usize = 65;

/// Length of a Web Push authentication secret.
pub const AUTH_SECRET_LEN: usize = 16;

/// Longest `Topic` header value push services accept.
pub const MAX_TOPIC_LEN: usize = 32;

// ============================================================================
// Scheduling
// ============================================================================

/// Shortest allowed scheduler tick.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Longest allowed scheduler tick.
///
/// Must stay well below the finest reminder threshold (30 minutes), otherwise
/// a task can cross a whole window between two ticks.
pub const MAX_TICK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How often the scheduler prunes stale ledger records.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Timeout applied to each Directory query made during a sweep.
pub const DIRECTORY_QUERY_TIMEOUT: Duration = Duration::from_secs(20);

// ============================================================================
// Delivery
// ============================================================================

/// HTTP request timeout for a single push delivery attempt.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Delay used when a 429 response carries no usable `Retry-After`.
pub const DEFAULT_THROTTLE_DELAY: Duration = Duration::from_secs(60);
