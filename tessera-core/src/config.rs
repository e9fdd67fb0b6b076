//! Runtime configuration.
//!
//! Configuration is small: it only tunes the state preservation manager.
//! It can be built in code, parsed from JSON (for example a dev-server
//! settings blob), or read from the environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};

/// Environment variable overriding [`TesseraConfig::snapshot_ttl_ms`].
pub const SNAPSHOT_TTL_ENV: &str = "TESSERA_SNAPSHOT_TTL_MS";

/// Default snapshot time-to-live: five minutes.
pub const DEFAULT_SNAPSHOT_TTL_MS: u64 = 5 * 60 * 1000;

/// Configuration for a state context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TesseraConfig {
    /// How long a preserved snapshot may wait before restoring it fails.
    #[serde(default = "default_snapshot_ttl_ms")]
    pub snapshot_ttl_ms: u64,
}

fn default_snapshot_ttl_ms() -> u64 {
    DEFAULT_SNAPSHOT_TTL_MS
}

impl Default for TesseraConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl_ms: DEFAULT_SNAPSHOT_TTL_MS,
        }
    }
}

impl TesseraConfig {
    /// Parse configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StateError::Config(e.to_string()))
    }

    /// Defaults, overridden by any environment variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup(SNAPSHOT_TTL_ENV) {
            config.snapshot_ttl_ms = raw.trim().parse().map_err(|e| {
                StateError::Config(format!("{SNAPSHOT_TTL_ENV}={raw:?}: {e}"))
            })?;
        }
        Ok(config)
    }

    /// The snapshot TTL as a `Duration`.
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_millis(self.snapshot_ttl_ms)
    }

    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.snapshot_ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self
    }
}
