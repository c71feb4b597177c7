//! Runtime environment detection.
//!
//! Provides a single source of truth for determining the runtime environment
//! (test, development, production) based on the `DEADLINE_PUSH_ENV`
//! environment variable.
//!
//! # Usage
//!
//! ```rust
//! use deadline_push::env::{Environment, is_any_test};
//!
//! if Environment::current().is_development() {
//!     // Verbose logging, etc.
//! }
//!
//! if is_any_test() {
//!     // Keep state under the project tmp/ directory
//! }
//! ```
//!
//! # Environment Variable
//!
//! Set `DEADLINE_PUSH_ENV` to one of:
//! - `test` - Test mode (config and ledger live under the project `tmp/`)
//! - `development` or `dev` - Development mode (debug logging by default)
//! - (anything else or unset) - Production mode

/// Environment variable that selects the runtime environment.
pub const ENV_VAR: &str = "DEADLINE_PUSH_ENV";

/// Runtime environment for the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Production environment (default).
    Production,
    /// Development environment.
    Development,
    /// Test environment - state is kept under the project tmp/ directory.
    Test,
}

impl Environment {
    /// Detect current environment from `DEADLINE_PUSH_ENV`.
    #[must_use]
    pub fn current() -> Self {
        Self::parse(std::env::var(ENV_VAR).ok().as_deref())
    }

    /// Map a raw `DEADLINE_PUSH_ENV` value to an environment.
    #[must_use]
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("test") => Self::Test,
            Some("development" | "dev") => Self::Development,
            _ => Self::Production,
        }
    }

    /// Returns `true` if this is the test environment.
    #[must_use]
    pub fn is_test(self) -> bool {
        self == Self::Test
    }

    /// Returns `true` if this is the production environment.
    #[must_use]
    pub fn is_production(self) -> bool {
        self == Self::Production
    }

    /// Returns `true` if this is the development environment.
    #[must_use]
    pub fn is_development(self) -> bool {
        self == Self::Development
    }

    /// Default `env_logger` filter for this environment.
    #[must_use]
    pub fn default_log_filter(self) -> &'static str {
        match self {
            Self::Development => "debug",
            Self::Production | Self::Test => "info",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Development => write!(f, "development"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Returns `true` if running in test mode.
///
/// Equivalent to `Environment::current().is_test()`.
#[must_use]
pub fn is_any_test() -> bool {
    Environment::current().is_test()
}
