//! Telemetry configuration.
//!
//! A single duration, the cache cutoff, governs three things at once:
//! how long a completed round's results are served from cache, how long a
//! peer has to answer before it is timed out, and how long an unused
//! single-peer entry is kept around.
//!
//! # Example Configuration
//!
//! ```toml
//! cache_cutoff_ms = 3000
//! min_protocol_version = 18
//! ```
//!
//! # Environment Overrides
//!
//! - `HENYEY_TELEMETRY_CACHE_CUTOFF_MS` - Cache cutoff in milliseconds
//! - `HENYEY_TELEMETRY_MIN_PROTOCOL_VERSION` - Minimum peer protocol version

use crate::{Result, TelemetryError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default cache cutoff (3 seconds).
pub const DEFAULT_CACHE_CUTOFF_MS: u64 = 3_000;

/// First protocol version that understands telemetry requests.
pub const TELEMETRY_PROTOCOL_VERSION_MIN: u8 = 0x12;

const ENV_CACHE_CUTOFF_MS: &str = "HENYEY_TELEMETRY_CACHE_CUTOFF_MS";
const ENV_MIN_PROTOCOL_VERSION: &str = "HENYEY_TELEMETRY_MIN_PROTOCOL_VERSION";

/// Configuration for telemetry collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Cache validity, per-peer response timeout and idle-entry eviction,
    /// in milliseconds.
    #[serde(default = "default_cache_cutoff_ms")]
    pub cache_cutoff_ms: u64,

    /// Peers below this protocol version are never asked for telemetry.
    #[serde(default = "default_min_protocol_version")]
    pub min_protocol_version: u8,
}

fn default_cache_cutoff_ms() -> u64 {
    DEFAULT_CACHE_CUTOFF_MS
}

fn default_min_protocol_version() -> u8 {
    TELEMETRY_PROTOCOL_VERSION_MIN
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            cache_cutoff_ms: DEFAULT_CACHE_CUTOFF_MS,
            min_protocol_version: TELEMETRY_PROTOCOL_VERSION_MIN,
        }
    }
}

impl TelemetryConfig {
    /// Create a configuration with a custom cache cutoff.
    ///
    /// The cutoff is kept in whole milliseconds; anything shorter than 1 ms
    /// is rounded up to 1 ms.
    pub fn with_cache_cutoff(cache_cutoff: Duration) -> Self {
        let millis = cache_cutoff.as_millis().clamp(1, u64::MAX as u128);
        Self {
            cache_cutoff_ms: millis as u64,
            ..Default::default()
        }
    }

    /// The cache cutoff as a [`Duration`], never shorter than 1 ms.
    pub fn cache_cutoff(&self) -> Duration {
        Duration::from_millis(self.cache_cutoff_ms.max(1))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Environment variables take precedence over file configuration.
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var(ENV_CACHE_CUTOFF_MS) {
            self.cache_cutoff_ms = val.parse().map_err(|_| {
                TelemetryError::InvalidConfig(format!("{ENV_CACHE_CUTOFF_MS}={val}"))
            })?;
        }
        if let Ok(val) = std::env::var(ENV_MIN_PROTOCOL_VERSION) {
            self.min_protocol_version = val.parse().map_err(|_| {
                TelemetryError::InvalidConfig(format!("{ENV_MIN_PROTOCOL_VERSION}={val}"))
            })?;
        }
        self.validate()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.cache_cutoff_ms == 0 {
            return Err(TelemetryError::InvalidConfig(
                "cache_cutoff_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
