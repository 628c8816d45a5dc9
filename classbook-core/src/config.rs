//! Configuration types
//!
//! All fields are required when loading from TOML. [`ClassbookConfig::defaults`]
//! centralizes the production values so callers do not hardcode policy.

use crate::{ClassbookResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Cache sizing and lifetime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    /// Maximum serialized size of one cache entry (single payload or chunk)
    pub max_entry_size_kb: u32,
    /// Hard per-entry ceiling of the cache medium
    pub medium_ceiling_kb: u32,
    /// Maximum number of chunks a dataset may be split into
    pub max_chunks: u32,
    /// Lifetime of every cache entry
    pub entry_ttl_secs: u64,
    /// How long a reader waits on a rebuild already running for its dataset
    pub rebuild_wait_timeout_ms: u64,
}

/// Reservation transaction settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BookingSettings {
    /// Bounded wait for the reservation mutex
    pub lock_timeout_ms: u64,
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassbookConfig {
    pub cache: CacheSettings,
    pub booking: BookingSettings,
}

impl ClassbookConfig {
    /// Production defaults: 90KB entries under a 100KB medium, 20 chunks,
    /// 6h TTL, 30s lock wait, 60s rebuild wait.
    pub fn defaults() -> Self {
        Self {
            cache: CacheSettings {
                max_entry_size_kb: 90,
                medium_ceiling_kb: 100,
                max_chunks: 20,
                entry_ttl_secs: 6 * 60 * 60,
                rebuild_wait_timeout_ms: 60_000,
            },
            booking: BookingSettings {
                lock_timeout_ms: 30_000,
            },
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(contents: &str) -> ClassbookResult<Self> {
        let config: ClassbookConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        Ok(config)
    }

    /// Load and parse a TOML file.
    pub fn from_path(path: &Path) -> ClassbookResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Apply `CLASSBOOK_*` environment overrides on top of this config.
    ///
    /// Environment variables:
    /// - `CLASSBOOK_CACHE_MAX_ENTRY_SIZE_KB`
    /// - `CLASSBOOK_CACHE_MEDIUM_CEILING_KB`
    /// - `CLASSBOOK_CACHE_MAX_CHUNKS`
    /// - `CLASSBOOK_CACHE_ENTRY_TTL_SECS`
    /// - `CLASSBOOK_CACHE_REBUILD_WAIT_TIMEOUT_MS`
    /// - `CLASSBOOK_BOOKING_LOCK_TIMEOUT_MS`
    ///
    /// Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        override_from_env(
            "CLASSBOOK_CACHE_MAX_ENTRY_SIZE_KB",
            &mut self.cache.max_entry_size_kb,
        );
        override_from_env(
            "CLASSBOOK_CACHE_MEDIUM_CEILING_KB",
            &mut self.cache.medium_ceiling_kb,
        );
        override_from_env("CLASSBOOK_CACHE_MAX_CHUNKS", &mut self.cache.max_chunks);
        override_from_env(
            "CLASSBOOK_CACHE_ENTRY_TTL_SECS",
            &mut self.cache.entry_ttl_secs,
        );
        override_from_env(
            "CLASSBOOK_CACHE_REBUILD_WAIT_TIMEOUT_MS",
            &mut self.cache.rebuild_wait_timeout_ms,
        );
        override_from_env(
            "CLASSBOOK_BOOKING_LOCK_TIMEOUT_MS",
            &mut self.booking.lock_timeout_ms,
        );
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - every size, count and duration is positive
    /// - max_entry_size_kb stays below medium_ceiling_kb
    pub fn validate(&self) -> ClassbookResult<()> {
        let cache = &self.cache;

        if cache.max_entry_size_kb == 0 {
            return Err(invalid(
                "cache.max_entry_size_kb",
                cache.max_entry_size_kb,
                "must be greater than 0",
            ));
        }

        if cache.max_entry_size_kb >= cache.medium_ceiling_kb {
            return Err(invalid(
                "cache.max_entry_size_kb",
                cache.max_entry_size_kb,
                &format!(
                    "must be below medium_ceiling_kb ({}) to leave room for the envelope",
                    cache.medium_ceiling_kb
                ),
            ));
        }

        if cache.max_chunks == 0 {
            return Err(invalid(
                "cache.max_chunks",
                cache.max_chunks,
                "must be greater than 0",
            ));
        }

        if cache.entry_ttl_secs == 0 {
            return Err(invalid(
                "cache.entry_ttl_secs",
                cache.entry_ttl_secs,
                "must be positive",
            ));
        }

        if cache.rebuild_wait_timeout_ms == 0 {
            return Err(invalid(
                "cache.rebuild_wait_timeout_ms",
                cache.rebuild_wait_timeout_ms,
                "must be positive",
            ));
        }

        if self.booking.lock_timeout_ms == 0 {
            return Err(invalid(
                "booking.lock_timeout_ms",
                self.booking.lock_timeout_ms,
                "must be positive",
            ));
        }

        Ok(())
    }

    pub fn max_entry_bytes(&self) -> usize {
        self.cache.max_entry_size_kb as usize * 1024
    }

    pub fn medium_ceiling_bytes(&self) -> usize {
        self.cache.medium_ceiling_kb as usize * 1024
    }

    pub fn max_chunks(&self) -> usize {
        self.cache.max_chunks as usize
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.entry_ttl_secs)
    }

    pub fn rebuild_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.cache.rebuild_wait_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.booking.lock_timeout_ms)
    }
}

fn override_from_env<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Some(value) = std::env::var(var).ok().and_then(|s| s.trim().parse().ok()) {
        *target = value;
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> crate::ClassbookError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

// =============================================================================
// TESTS
// =============================================================================
