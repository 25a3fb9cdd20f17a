//! Queue defaults resolved from stored configuration entries.

use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::{JobStore, QueueError};

/// Hardcoded retry budget when nothing is configured.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Hardcoded backoff base (seconds) when nothing is configured.
pub const DEFAULT_BASE_BACKOFF: u32 = 2;

/// Configuration keys the queue understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    /// Retry budget for jobs enqueued without `max_retries`.
    DefaultMaxRetries,
    /// Backoff base for jobs enqueued without `base_backoff_seconds`.
    DefaultBaseBackoff,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 2] = [ConfigKey::DefaultMaxRetries, ConfigKey::DefaultBaseBackoff];

    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKey::DefaultMaxRetries => "default_max_retries",
            ConfigKey::DefaultBaseBackoff => "default_base_backoff",
        }
    }

    fn fallback(self) -> u32 {
        match self {
            ConfigKey::DefaultMaxRetries => DEFAULT_MAX_RETRIES,
            ConfigKey::DefaultBaseBackoff => DEFAULT_BASE_BACKOFF,
        }
    }

    /// Parse a stored value for this key.
    pub fn parse_value(self, raw: &str) -> Result<u32, QueueError> {
        let value: u32 = raw.trim().parse().map_err(|_| {
            QueueError::InvalidConfig(format!(
                "{} must be a non-negative integer, got '{}'",
                self, raw
            ))
        })?;

        if self == ConfigKey::DefaultBaseBackoff && value == 0 {
            return Err(QueueError::InvalidConfig(format!(
                "{} must be positive",
                self
            )));
        }
        Ok(value)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| QueueError::InvalidConfig(format!("unknown config key '{s}'")))
    }
}

/// Effective defaults applied at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDefaults {
    pub max_retries: u32,
    pub base_backoff_seconds: u32,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff_seconds: DEFAULT_BASE_BACKOFF,
        }
    }
}

/// Resolve the current defaults from the store.
///
/// Never fails. An unreachable store yields the hardcoded defaults, and a
/// value that does not parse falls back to the hardcoded default for that key.
pub async fn resolve_defaults(store: &dyn JobStore) -> QueueDefaults {
    let mut resolved = [0u32; 2];

    for (slot, key) in resolved.iter_mut().zip(ConfigKey::ALL) {
        *slot = match store.get_config(key.as_str()).await {
            Ok(Some(raw)) => key.parse_value(&raw).unwrap_or_else(|e| {
                warn!(key = %key, error = %e, "ignoring stored config value");
                key.fallback()
            }),
            Ok(None) => key.fallback(),
            Err(e) => {
                warn!(error = %e, "could not load config from store, using defaults");
                return QueueDefaults::default();
            }
        };
    }

    QueueDefaults {
        max_retries: resolved[0],
        base_backoff_seconds: resolved[1],
    }
}

/// Store a configuration entry, validating values for recognized keys.
pub async fn set_config(store: &dyn JobStore, key: &str, value: &str) -> Result<(), QueueError> {
    if let Ok(known) = key.parse::<ConfigKey>() {
        known.parse_value(value)?;
    }
    store.set_config(key, value.trim()).await
}
