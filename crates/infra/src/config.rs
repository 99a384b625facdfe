//! Configuration loading and representation.
//!
//! Everything is read from environment variables (after an optional `.env`
//! file). Unset keys take the defaults below; set-but-malformed keys are
//! rejected rather than silently replaced.

use std::env;
use std::time::Duration;

use thiserror::Error;

use vectorsync_core::{DEFAULT_COLLECTION_KEY, RetryPolicy};

pub const DEFAULT_CHECKPOINT_NAME: &str = "entries";
pub const DEFAULT_CLAIM_LIMIT: usize = 5;
pub const DEFAULT_CHANGED_BATCH: usize = 5000;
pub const DEFAULT_DELETE_BATCH: usize = 2000;
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Queue behaviour shared by scanners and claimers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Checkpoint row used by the change scan
    pub checkpoint_name: String,
    /// Collection for source rows without a type alias
    pub default_collection_key: String,
    /// Minimum time between two enqueue runs
    pub min_interval: Duration,
    /// Source rows read per change scan
    pub changed_batch: usize,
    /// Vanished entries handled per deletion scan
    pub delete_batch: usize,
    /// Jobs claimed per claim call
    pub claim_limit: usize,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            checkpoint_name: DEFAULT_CHECKPOINT_NAME.to_string(),
            default_collection_key: DEFAULT_COLLECTION_KEY.to_string(),
            min_interval: DEFAULT_MIN_INTERVAL,
            changed_batch: DEFAULT_CHANGED_BATCH,
            delete_batch: DEFAULT_DELETE_BATCH,
            claim_limit: DEFAULT_CLAIM_LIMIT,
            retry: RetryPolicy::default(),
        }
    }
}

/// A claim limit of zero or less means "use the default".
pub fn normalize_claim_limit(limit: i64) -> usize {
    if limit <= 0 {
        DEFAULT_CLAIM_LIMIT
    } else {
        usize::try_from(limit).unwrap_or(DEFAULT_CLAIM_LIMIT)
    }
}

/// Postgres connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub queue: QueueConfig,
    /// `None` when `DATABASE_URL` is unset.
    pub database: Option<DatabaseConfig>,
}

impl Config {
    /// Build config from the process environment (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = QueueConfig::default();

        let claim_limit = match get("VECTORSYNC_CLAIM_LIMIT") {
            Some(raw) => normalize_claim_limit(parse_num::<i64>("VECTORSYNC_CLAIM_LIMIT", &raw)?),
            None => defaults.claim_limit,
        };

        let retry = RetryPolicy {
            max_attempts: opt_num(get("VECTORSYNC_MAX_ATTEMPTS"), "VECTORSYNC_MAX_ATTEMPTS")?
                .unwrap_or(defaults.retry.max_attempts),
            lease: opt_num(get("VECTORSYNC_LEASE_SECS"), "VECTORSYNC_LEASE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry.lease),
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "VECTORSYNC_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }

        let queue = QueueConfig {
            checkpoint_name: get("VECTORSYNC_CHECKPOINT").unwrap_or(defaults.checkpoint_name),
            default_collection_key: get("VECTORSYNC_DEFAULT_COLLECTION")
                .unwrap_or(defaults.default_collection_key),
            min_interval: opt_num(get("VECTORSYNC_MIN_INTERVAL_SECS"), "VECTORSYNC_MIN_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.min_interval),
            changed_batch: opt_num(get("VECTORSYNC_CHANGED_BATCH"), "VECTORSYNC_CHANGED_BATCH")?
                .unwrap_or(defaults.changed_batch),
            delete_batch: opt_num(get("VECTORSYNC_DELETE_BATCH"), "VECTORSYNC_DELETE_BATCH")?
                .unwrap_or(defaults.delete_batch),
            claim_limit,
            retry,
        };

        let database = match get("DATABASE_URL") {
            Some(url) => Some(DatabaseConfig {
                url,
                max_connections: opt_num(
                    get("VECTORSYNC_DB_MAX_CONNECTIONS"),
                    "VECTORSYNC_DB_MAX_CONNECTIONS",
                )?
                .unwrap_or(5),
                acquire_timeout: opt_num(
                    get("VECTORSYNC_DB_ACQUIRE_TIMEOUT_SECS"),
                    "VECTORSYNC_DB_ACQUIRE_TIMEOUT_SECS",
                )?
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(10)),
            }),
            None => None,
        };

        Ok(Self { queue, database })
    }

    /// Database settings, or an error naming the missing key.
    pub fn require_database(&self) -> Result<&DatabaseConfig, ConfigError> {
        self.database.as_ref().ok_or(ConfigError::Missing("DATABASE_URL"))
    }
}

fn parse_num<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn opt_num<T>(raw: Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|v| parse_num(key, &v)).transpose()
}
