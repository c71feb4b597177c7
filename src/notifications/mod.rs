//! Web push notification infrastructure.
//!
//! Turns reminder events into encrypted, VAPID-signed web push messages.
//!
//! # Architecture
//!
//! ```text
//! ReminderEvent
//!     ↓ composer   (pure: event → NotificationPayload JSON)
//!     ↓ signer     (aes128gcm body + vapid Authorization header)
//!     ↓ push       (HTTPS POST, response → DeliveryOutcome)
//! Push service delivers to the browser's service worker
//! ```
//!
//! # VAPID Keys
//!
//! One P-256 ECDSA keypair (RFC 8292) is configured per deployment. Browsers
//! subscribe with its public key; every request is signed with its private
//! key. Keys are validated by a self-test before the daemon starts.
//!
//! # Push Subscriptions
//!
//! Subscriptions (endpoint + keys) come from the external subscribe flow and
//! are read through [`crate::directory::SubscriptionStore`]. When a push
//! service answers 404/410 the subscription is deleted.

// Rust guideline compliant 2026-02

pub mod composer;
pub mod push;
pub mod signer;
pub mod vapid;
