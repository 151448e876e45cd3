//! Cache configuration
use crate::errors::{CacheError, Result};
use kiln_core::serde_duration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Limits and layout of a [`crate::CacheStore`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether the scheduler consults the cache at all
    pub enabled: bool,
    /// Base directory for durable storage
    pub base_dir: PathBuf,
    /// Maximum number of stored entries
    pub max_entries: usize,
    /// Maximum estimated size of all entries, in bytes
    pub max_bytes: u64,
    /// Entries older than this are removed regardless of use
    #[serde(with = "serde_duration::secs")]
    pub max_age: Duration,
    /// Fraction of either maximum at which `put` schedules a pressure sweep
    pub high_water_ratio: f64,
    /// Fraction of either maximum the pressure sweep aims to get under
    pub target_ratio: f64,
    /// Capacity of the in-memory layer
    pub memory_entries: usize,
    /// Period of the background age sweep
    #[serde(with = "serde_duration::secs")]
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: default_cache_dir(),
            max_entries: 1000,
            max_bytes: 512 * 1024 * 1024, // 512MB
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            high_water_ratio: 0.9,
            target_ratio: 0.75,
            memory_entries: 256,
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// `$XDG_CACHE_HOME/kiln`, or the platform cache dir, or the temp dir
pub fn default_cache_dir() -> PathBuf {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("kiln")
}

impl CacheConfig {
    /// Default limits rooted at `base_dir`
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn memory_entries(mut self, memory_entries: usize) -> Self {
        self.memory_entries = memory_entries;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CacheError::configuration("max_entries must be at least 1"));
        }
        if self.max_bytes == 0 {
            return Err(CacheError::configuration("max_bytes must be at least 1"));
        }
        if self.max_age.is_zero() {
            return Err(CacheError::configuration("max_age must be non-zero"));
        }
        if self.memory_entries == 0 {
            return Err(CacheError::configuration("memory_entries must be at least 1"));
        }
        for (name, ratio) in [
            ("high_water_ratio", self.high_water_ratio),
            ("target_ratio", self.target_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(CacheError::configuration(format!(
                    "{name} must be in (0, 1], got {ratio}"
                )));
            }
        }
        if self.target_ratio > self.high_water_ratio {
            return Err(CacheError::configuration(
                "target_ratio must not exceed high_water_ratio",
            ));
        }
        Ok(())
    }

    pub(crate) fn high_water_entries(&self) -> usize {
        scaled(self.max_entries as u64, self.high_water_ratio) as usize
    }

    pub(crate) fn high_water_bytes(&self) -> u64 {
        scaled(self.max_bytes, self.high_water_ratio)
    }

    pub(crate) fn target_entries(&self) -> usize {
        scaled(self.max_entries as u64, self.target_ratio) as usize
    }

    pub(crate) fn target_bytes(&self) -> u64 {
        scaled(self.max_bytes, self.target_ratio)
    }
}

fn scaled(max: u64, ratio: f64) -> u64 {
    ((max as f64) * ratio).floor().max(1.0) as u64
}
