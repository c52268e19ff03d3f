//! Cart sync configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `CART_API_BASE_URL` - Base URL of the cart API (e.g., `https://api.example.com`)
//!
//! ## Optional
//! - `CART_STORAGE_DIR` - Directory backing durable storage (default: .cart-sync)
//! - `CART_SYNC_BASE_DELAY_MS` - Debounce delay before a sync (default: 4000)
//! - `CART_SYNC_MAX_DELAY_MS` - Backoff ceiling (default: 20000)
//! - `CART_SYNC_IDLE_TIMEOUT_MS` - Ceiling on waiting for an idle slot (default: 8000)
//! - `CART_IDLE_LOGOUT_SECS` - Inactivity window before logout (default: 1200)
//! - `CART_TOKEN_CHECK_SECS` - Token expiry check interval (default: 60)
//! - `CART_PERSIST_PENDING` - Persist the pending-sync marker (default: true)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Cart sync engine configuration.
#[derive(Debug, Clone)]
pub struct CartSyncConfig {
    /// Base URL every cart endpoint is resolved against
    pub api_base_url: Url,
    /// Directory backing durable storage (`None` keeps storage in memory)
    pub storage_dir: Option<PathBuf>,
    /// Debounce and retry timing
    pub sync: SyncTiming,
    /// Session watchdog timing
    pub session: SessionTiming,
    /// Persist pending changes so they survive a reload
    pub persist_pending: bool,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment name
    pub sentry_environment: Option<String>,
}

/// Timing of the debounced sync path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTiming {
    pub backoff: BackoffPolicy,
    /// Longest wait for an idle slot before syncing anyway
    pub idle_timeout: Duration,
}

impl Default for SyncTiming {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            idle_timeout: Duration::from_millis(8000),
        }
    }
}

/// Exponential backoff: `min(base * 2^retry, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(4000),
            max: Duration::from_millis(20000),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt after `retry_count` consecutive failures.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Timing of the session watchdogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// Inactivity window after which the session is logged out
    pub idle_logout: Duration,
    /// How often the token expiry claim is checked
    pub token_check_interval: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            idle_logout: Duration::from_secs(20 * 60),
            token_check_interval: Duration::from_secs(60),
        }
    }
}

impl CartSyncConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let api_base_url = parse_base_url(&get_required_env("CART_API_BASE_URL")?)?;
        let storage_dir = PathBuf::from(get_env_or_default("CART_STORAGE_DIR", ".cart-sync"));

        let sync = SyncTiming {
            backoff: BackoffPolicy {
                base: get_millis("CART_SYNC_BASE_DELAY_MS", 4000)?,
                max: get_millis("CART_SYNC_MAX_DELAY_MS", 20000)?,
            },
            idle_timeout: get_millis("CART_SYNC_IDLE_TIMEOUT_MS", 8000)?,
        };
        let session = SessionTiming {
            idle_logout: get_secs("CART_IDLE_LOGOUT_SECS", 20 * 60)?,
            token_check_interval: get_secs("CART_TOKEN_CHECK_SECS", 60)?,
        };
        let persist_pending = get_env_or_default("CART_PERSIST_PENDING", "true")
            .parse::<bool>()
            .map_err(|e| {
                ConfigError::InvalidEnvVar("CART_PERSIST_PENDING".to_string(), e.to_string())
            })?;

        Ok(Self {
            api_base_url,
            storage_dir: Some(storage_dir),
            sync,
            session,
            persist_pending,
            sentry_dsn: get_optional_env("SENTRY_DSN"),
            sentry_environment: get_optional_env("SENTRY_ENVIRONMENT"),
        })
    }

    /// Build a configuration with every optional setting at its default and
    /// in-memory storage.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnvVar` if `base_url` is not a valid URL.
    pub fn default_for(base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            api_base_url: parse_base_url(base_url)?,
            storage_dir: None,
            sync: SyncTiming::default(),
            session: SessionTiming::default(),
            persist_pending: true,
            sentry_dsn: None,
            sentry_environment: None,
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Parse the API base URL, normalising it to end with a slash so relative
/// endpoint paths join underneath it.
fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    let url = Url::parse(&with_slash)
        .map_err(|e| ConfigError::InvalidEnvVar("CART_API_BASE_URL".to_string(), e.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidEnvVar(
            "CART_API_BASE_URL".to_string(),
            "must be an absolute http(s) URL".to_string(),
        ));
    }
    Ok(url)
}

/// Get a required environment variable.
fn get_required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Get an optional environment variable.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Get an environment variable with a default value.
fn get_env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    get_env_or_default(key, &default.to_string())
        .parse::<u64>()
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}

fn get_millis(key: &str, default: u64) -> Result<Duration, ConfigError> {
    get_u64(key, default).map(Duration::from_millis)
}

fn get_secs(key: &str, default: u64) -> Result<Duration, ConfigError> {
    get_u64(key, default).map(Duration::from_secs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u128> = (0..4).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![4000, 8000, 16000, 20000]);
    }

    #[test]
    fn test_backoff_never_overflows() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(40), Duration::from_millis(20000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(20000));
    }

    #[test]
    fn test_default_for_appends_slash() {
        let config = CartSyncConfig::default_for("http://localhost:8080/api").unwrap();
        assert_eq!(config.api_base_url.as_str(), "http://localhost:8080/api/");
        assert_eq!(
            config.api_base_url.join("cart/sync").unwrap().as_str(),
            "http://localhost:8080/api/cart/sync"
        );
    }

    #[test]
    fn test_default_for_rejects_garbage() {
        let result = CartSyncConfig::default_for("not a url");
        assert!(matches!(result, Err(ConfigError::InvalidEnvVar(_, _))));
    }

    #[test]
    fn test_default_timings() {
        let config = CartSyncConfig::default_for("http://localhost").unwrap();
        assert_eq!(config.sync.idle_timeout, Duration::from_millis(8000));
        assert_eq!(config.session.idle_logout, Duration::from_secs(1200));
        assert_eq!(config.session.token_check_interval, Duration::from_secs(60));
        assert!(config.storage_dir.is_none());
    }
}
