// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dispatcher configuration.
//!
//! Loaded from three layers, later layers winning:
//!   1. Built-in defaults.
//!   2. Optional TOML file pointed to by `BATCHD_CONFIG_PATH`.
//!   3. `BATCHD_`-prefixed environment variables.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::{raise, Result};

/// ENV naming the optional TOML configuration file.
const CONFIG_PATH_ENV: &str = "BATCHD_CONFIG_PATH";

/// ENV prefix for configuration overrides.
const ENV_PREFIX: &str = "BATCHD_";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Recheck interval for Running AppWrappers whose pods are settling.
    pub creation_delay_secs: u64,

    /// Recheck interval while wrapped resources are being deleted.
    pub deletion_delay_secs: u64,

    /// Retry interval for dispatch attempts when nothing was dispatched.
    pub dispatch_delay_secs: u64,

    /// How long pods may take to come up before a requeue. Defaults to
    /// twice `creation_delay_secs`.
    pub creation_timeout_secs: Option<u64>,

    /// How long teardown may take before giving up. Defaults to twice
    /// `deletion_delay_secs`.
    pub deletion_timeout_secs: Option<u64>,

    /// Maximum age of the node-side capacity observation.
    pub capacity_refresh_secs: u64,

    /// How long a store/cache disagreement may persist before the cache
    /// entry is dropped.
    pub cache_conflict_timeout_secs: u64,

    /// Base delay for retrying failed reconciliations.
    pub retry_base_delay_millis: u64,

    /// Cap for the reconciliation retry backoff.
    pub retry_max_delay_secs: u64,

    /// Resource names counted against cluster capacity.
    pub resource_names: Vec<String>,

    /// Whether a user deletion may orphan wrapped resources whose template
    /// no longer parses, once teardown has exceeded the deletion timeout.
    /// When false the finalizer is never removed past such a template.
    pub orphan_unparseable: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            creation_delay_secs: 10,
            deletion_delay_secs: 10,
            dispatch_delay_secs: 30,
            creation_timeout_secs: None,
            deletion_timeout_secs: None,
            capacity_refresh_secs: 60,
            cache_conflict_timeout_secs: 60,
            retry_base_delay_millis: 1000,
            retry_max_delay_secs: 60,
            resource_names: vec!["nvidia.com/gpu".to_string()],
            orphan_unparseable: true,
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from defaults, file, and environment.
    pub fn from_settings() -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment.merge(Env::prefixed(ENV_PREFIX)).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.resource_names.is_empty() {
            raise!("at least one counted resource name is required");
        }
        if self.creation_delay_secs == 0
            || self.deletion_delay_secs == 0
            || self.dispatch_delay_secs == 0
        {
            raise!("delays must be non-zero");
        }
        Ok(())
    }

    pub fn creation_delay(&self) -> Duration {
        Duration::from_secs(self.creation_delay_secs)
    }

    pub fn deletion_delay(&self) -> Duration {
        Duration::from_secs(self.deletion_delay_secs)
    }

    pub fn dispatch_delay(&self) -> Duration {
        Duration::from_secs(self.dispatch_delay_secs)
    }

    pub fn creation_timeout(&self) -> Duration {
        match self.creation_timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => 2 * self.creation_delay(),
        }
    }

    pub fn deletion_timeout(&self) -> Duration {
        match self.deletion_timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => 2 * self.deletion_delay(),
        }
    }

    pub fn capacity_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.capacity_refresh_secs)
    }

    pub fn cache_conflict_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_conflict_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_millis)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.retry_max_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.creation_delay(), Duration::from_secs(10));
        assert_eq!(config.creation_timeout(), Duration::from_secs(20));
        assert_eq!(config.deletion_timeout(), Duration::from_secs(20));
        assert_eq!(config.resource_names, vec!["nvidia.com/gpu".to_string()]);
        assert!(config.orphan_unparseable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_timeouts_win() {
        let config = DispatcherConfig {
            creation_timeout_secs: Some(5),
            deletion_timeout_secs: Some(7),
            ..Default::default()
        };
        assert_eq!(config.creation_timeout(), Duration::from_secs(5));
        assert_eq!(config.deletion_timeout(), Duration::from_secs(7));
    }

    #[test]
    fn test_validation_rejects_empty_resources() {
        let config = DispatcherConfig {
            resource_names: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = DispatcherConfig::default();
        let toml = toml::to_string(&config).unwrap();
        let parsed: DispatcherConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.dispatch_delay_secs, config.dispatch_delay_secs);
    }
}
