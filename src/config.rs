//! Configuration loading and persistence.
//!
//! Settings come from `config.json` in the config directory, then environment
//! overrides, then [`Config::validate`]. The VAPID private key is never written
//! back to disk; supply it through the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::str::FromStr;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants::{
    DIRECTORY_QUERY_TIMEOUT, HTTP_REQUEST_TIMEOUT, MAX_TICK_INTERVAL, MAX_VAPID_TOKEN_TTL, MIN_TICK_INTERVAL, PRUNE_INTERVAL,
};
use crate::delivery::RetryPolicy;
use crate::notifications::composer::{Composer, DEFAULT_BADGE, DEFAULT_ICON};
use crate::notifications::vapid::VapidKeys;
use crate::scheduler::{LocalZone, SchedulerConfig, Threshold};

/// Prefix for every environment override.
const ENV_PREFIX: &str = "DEADLINE_PUSH_";

/// Push services hold messages for at most four weeks.
const MAX_PUSH_TTL_SECS: u64 = 28 * 24 * 60 * 60;

/// Daemon configuration.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// VAPID private key (raw base64url scalar, DER or PEM). NOT serialized.
    #[serde(skip_serializing)]
    pub vapid_private_key: String,
    /// VAPID public key (base64url, uncompressed point).
    pub vapid_public_key: String,
    /// Contact URI sent as the JWT `sub` claim.
    pub vapid_subject: String,
    /// Seconds between scheduler ticks.
    pub tick_interval_secs: u64,
    /// Reminder offsets before a deadline, in minutes.
    pub thresholds_minutes: Vec<u32>,
    /// Local hour at which daily digests go out.
    pub digest_hour: u32,
    /// Fixed UTC offset for digest timing. Host zone when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utc_offset_minutes: Option<i32>,
    /// Transient-failure retries per delivery.
    pub max_retries: u32,
    /// First backoff delay in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff multiplier.
    pub backoff_factor: u32,
    /// Cap on a server-requested throttle delay.
    pub max_throttle_wait_secs: u64,
    /// Concurrent delivery workers.
    pub worker_count: usize,
    /// Bounded queue between scheduler and workers.
    pub queue_capacity: usize,
    /// Per-request HTTP timeout.
    pub delivery_timeout_secs: u64,
    /// Maximum TTL offered to push services.
    pub push_ttl_secs: u64,
    /// Lifetime of each VAPID token.
    pub token_ttl_secs: u64,
    /// Minimum pause after a tick with a failed sweep.
    pub error_backoff_secs: u64,
    /// How long shutdown waits for in-flight deliveries.
    pub shutdown_grace_secs: u64,
    /// Days a ledger record is kept after its event stops mattering.
    pub retention_days: u32,
    /// Overdue reminders stop after this many days.
    pub max_overdue_days: u32,
    /// Directory snapshot file. Defaults to `directory.json` in the config dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_path: Option<PathBuf>,
    /// Ledger database. Defaults to `ledger.sqlite3` in the config dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<PathBuf>,
    /// Absolute base prepended to notification target paths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
    /// Notification icon.
    pub icon: String,
    /// Notification badge.
    pub badge: String,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("vapid_private_key", &"[redacted]")
            .field("vapid_public_key", &self.vapid_public_key)
            .field("vapid_subject", &self.vapid_subject)
            .field("tick_interval_secs", &self.tick_interval_secs)
            .field("thresholds_minutes", &self.thresholds_minutes)
            .field("digest_hour", &self.digest_hour)
            .field("utc_offset_minutes", &self.utc_offset_minutes)
            .field("worker_count", &self.worker_count)
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vapid_private_key: String::new(),
            vapid_public_key: String::new(),
            vapid_subject: "mailto:admin@example.com".to_string(),
            tick_interval_secs: 60,
            thresholds_minutes: vec![1440, 60, 30],
            digest_hour: 9,
            utc_offset_minutes: None,
            max_retries: 3,
            backoff_base_ms: 2000,
            backoff_factor: 2,
            max_throttle_wait_secs: 300,
            worker_count: 4,
            queue_capacity: 256,
            delivery_timeout_secs: HTTP_REQUEST_TIMEOUT.as_secs(),
            push_ttl_secs: 86_400,
            token_ttl_secs: 43_200,
            error_backoff_secs: 30,
            shutdown_grace_secs: 30,
            retention_days: 30,
            max_overdue_days: 30,
            directory_path: None,
            ledger_path: None,
            app_url: None,
            icon: DEFAULT_ICON.to_string(),
            badge: DEFAULT_BADGE.to_string(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/deadline-push-test`
    /// 2. `DEADLINE_PUSH_CONFIG_DIR` env var: explicit override
    /// 3. `DEADLINE_PUSH_ENV=test`: `tmp/deadline-push-test` (integration tests)
    /// 4. Default: platform config dir (Linux: ~/.config/deadline-push)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/deadline-push-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(dir) = std::env::var("DEADLINE_PUSH_CONFIG_DIR") {
                    PathBuf::from(dir)
                } else if crate::env::is_any_test() {
                    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/deadline-push-test")
                } else {
                    dirs::config_dir()
                        .context("Could not determine config directory")?
                        .join("deadline-push")
                }
            }
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// Does not validate; call [`Config::validate`] before starting the daemon.
    pub fn load() -> Result<Self> {
        let mut config = match Self::load_from_file() {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                log::warn!("[Config] Ignoring unreadable config file: {:#}", e);
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Option<Self>> {
        let config_path = Self::config_dir()?.join("config.json");
        if !config_path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
        Ok(Some(config))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup`. Values that fail to parse are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let prefixed = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));
        // Bare VAPID_* names are what most web push tooling emits
        let vapid = |key: &str| prefixed(key).or_else(|| lookup(key));

        if let Some(value) = vapid("VAPID_PRIVATE_KEY") {
            self.vapid_private_key = value;
        }
        if let Some(value) = vapid("VAPID_PUBLIC_KEY") {
            self.vapid_public_key = value;
        }
        if let Some(value) = vapid("VAPID_SUBJECT") {
            self.vapid_subject = value;
        }

        set_parsed(&mut self.tick_interval_secs, prefixed("TICK_INTERVAL_SECS"));
        set_parsed(&mut self.digest_hour, prefixed("DIGEST_HOUR"));
        set_parsed(&mut self.max_retries, prefixed("MAX_RETRIES"));
        set_parsed(&mut self.backoff_base_ms, prefixed("BACKOFF_BASE_MS"));
        set_parsed(&mut self.backoff_factor, prefixed("BACKOFF_FACTOR"));
        set_parsed(&mut self.max_throttle_wait_secs, prefixed("MAX_THROTTLE_WAIT_SECS"));
        set_parsed(&mut self.worker_count, prefixed("WORKER_COUNT"));
        set_parsed(&mut self.queue_capacity, prefixed("QUEUE_CAPACITY"));
        set_parsed(&mut self.delivery_timeout_secs, prefixed("DELIVERY_TIMEOUT_SECS"));
        set_parsed(&mut self.push_ttl_secs, prefixed("PUSH_TTL_SECS"));
        set_parsed(&mut self.token_ttl_secs, prefixed("TOKEN_TTL_SECS"));
        set_parsed(&mut self.error_backoff_secs, prefixed("ERROR_BACKOFF_SECS"));
        set_parsed(&mut self.shutdown_grace_secs, prefixed("SHUTDOWN_GRACE_SECS"));
        set_parsed(&mut self.retention_days, prefixed("RETENTION_DAYS"));
        set_parsed(&mut self.max_overdue_days, prefixed("MAX_OVERDUE_DAYS"));

        if let Some(value) = prefixed("UTC_OFFSET_MINUTES") {
            if let Ok(minutes) = value.trim().parse::<i32>() {
                self.utc_offset_minutes = Some(minutes);
            }
        }

        if let Some(value) = prefixed("THRESHOLDS_MINUTES") {
            let thresholds: Result<Vec<u32>, _> = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect();
            if let Ok(thresholds) = thresholds {
                self.thresholds_minutes = thresholds;
            }
        }

        if let Some(value) = prefixed("DIRECTORY_PATH") {
            self.directory_path = Some(PathBuf::from(value));
        }
        if let Some(value) = prefixed("LEDGER_PATH") {
            self.ledger_path = Some(PathBuf::from(value));
        }
        if let Some(value) = prefixed("APP_URL") {
            self.app_url = Some(value);
        }
        if let Some(value) = prefixed("ICON") {
            self.icon = value;
        }
        if let Some(value) = prefixed("BADGE") {
            self.badge = value;
        }
    }

    /// Check every setting. The daemon refuses to start on failure.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.vapid_private_key.trim().is_empty(),
            "VAPID private key is not configured (set DEADLINE_PUSH_VAPID_PRIVATE_KEY or VAPID_PRIVATE_KEY)"
        );
        anyhow::ensure!(
            !self.vapid_public_key.trim().is_empty(),
            "VAPID public key is not configured (set DEADLINE_PUSH_VAPID_PUBLIC_KEY or VAPID_PUBLIC_KEY)"
        );
        anyhow::ensure!(
            self.vapid_subject.starts_with("mailto:") || self.vapid_subject.starts_with("https:"),
            "vapid_subject must be a mailto: or https: URI, got {:?}",
            self.vapid_subject
        );

        let tick = Duration::from_secs(self.tick_interval_secs);
        anyhow::ensure!(
            (MIN_TICK_INTERVAL..=MAX_TICK_INTERVAL).contains(&tick),
            "tick_interval_secs must be between {} and {}, got {}",
            MIN_TICK_INTERVAL.as_secs(),
            MAX_TICK_INTERVAL.as_secs(),
            self.tick_interval_secs
        );
        anyhow::ensure!(!self.thresholds_minutes.is_empty(), "At least one reminder threshold is required");
        anyhow::ensure!(
            self.thresholds_minutes.iter().all(|&m| m > 0),
            "Reminder thresholds must be positive"
        );
        anyhow::ensure!(self.digest_hour < 24, "digest_hour must be 0-23, got {}", self.digest_hour);
        self.zone()?;

        anyhow::ensure!(self.backoff_factor >= 1, "backoff_factor must be at least 1");
        anyhow::ensure!(self.backoff_base_ms > 0, "backoff_base_ms must be positive");
        anyhow::ensure!(self.worker_count >= 1, "worker_count must be at least 1");
        anyhow::ensure!(self.queue_capacity >= 1, "queue_capacity must be at least 1");
        anyhow::ensure!(self.delivery_timeout_secs > 0, "delivery_timeout_secs must be positive");
        anyhow::ensure!(
            self.push_ttl_secs > 0 && self.push_ttl_secs <= MAX_PUSH_TTL_SECS,
            "push_ttl_secs must be between 1 and {}, got {}",
            MAX_PUSH_TTL_SECS,
            self.push_ttl_secs
        );
        anyhow::ensure!(
            self.token_ttl_secs > 0 && self.token_ttl_secs <= MAX_VAPID_TOKEN_TTL.as_secs(),
            "token_ttl_secs must be between 1 and {}, got {}",
            MAX_VAPID_TOKEN_TTL.as_secs(),
            self.token_ttl_secs
        );
        anyhow::ensure!(self.max_overdue_days >= 1, "max_overdue_days must be at least 1");

        if let Some(url) = &self.app_url {
            anyhow::ensure!(
                url.starts_with("https://") || url.starts_with("http://"),
                "app_url must be an absolute http(s) URL, got {:?}",
                url
            );
        }

        Ok(())
    }

    /// Load and cross-check the VAPID key pair.
    pub fn vapid_keys(&self) -> Result<VapidKeys> {
        let public = Some(self.vapid_public_key.trim()).filter(|k| !k.is_empty());
        VapidKeys::from_config(self.vapid_private_key.trim(), public).context("Invalid VAPID key configuration")
    }

    /// Zone for digest timing.
    pub fn zone(&self) -> Result<LocalZone> {
        LocalZone::from_offset_minutes(self.utc_offset_minutes)
            .with_context(|| format!("utc_offset_minutes out of range: {:?}", self.utc_offset_minutes))
    }

    /// Scheduler settings derived from this config.
    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        Ok(SchedulerConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            thresholds: self
                .thresholds_minutes
                .iter()
                .map(|&m| Threshold::from_minutes(m))
                .collect(),
            digest_hour: self.digest_hour,
            zone: self.zone()?,
            retention: chrono::Duration::days(i64::from(self.retention_days)),
            max_overdue_days: self.max_overdue_days,
            error_backoff: Duration::from_secs(self.error_backoff_secs),
            query_timeout: DIRECTORY_QUERY_TIMEOUT,
            prune_interval: PRUNE_INTERVAL,
        })
    }

    /// Delivery retry settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            factor: self.backoff_factor,
            max_throttle_wait: Duration::from_secs(self.max_throttle_wait_secs),
        }
    }

    /// Payload composer.
    pub fn composer(&self) -> Composer {
        Composer::new(
            self.icon.clone(),
            self.badge.clone(),
            self.app_url.clone(),
            chrono::Duration::seconds(self.push_ttl_secs.min(MAX_PUSH_TTL_SECS) as i64),
        )
    }

    /// Timeout for a single push attempt.
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    /// Ledger retention.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    /// Directory snapshot path.
    pub fn directory_path(&self) -> Result<PathBuf> {
        match &self.directory_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("directory.json")),
        }
    }

    /// Ledger database path.
    pub fn ledger_path(&self) -> Result<PathBuf> {
        match &self.ledger_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("ledger.sqlite3")),
        }
    }

    /// Persists the current configuration to disk.
    /// Note: the VAPID private key is NOT saved.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }
}

fn set_parsed<T: FromStr>(target: &mut T, value: Option<String>) {
    if let Some(parsed) = value.and_then(|v| v.trim().parse().ok()) {
        *target = parsed;
    }
}
