//! Scheduler configuration and layered config loading
//!
//! Precedence, lowest to highest: built-in defaults, the JSON config file
//! (`$XDG_CONFIG_HOME/kiln/config.json`), `KILN_*` environment variables,
//! and finally whatever the caller applies on top (CLI flags).

use kiln_cache::CacheConfig;
use kiln_core::{serde_duration, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_MAX_CONCURRENT: &str = "KILN_MAX_CONCURRENT";
pub const ENV_TASK_TIMEOUT_SECS: &str = "KILN_TASK_TIMEOUT_SECS";
pub const ENV_CACHE_DIR: &str = "KILN_CACHE_DIR";
pub const ENV_CACHE_MAX_ENTRIES: &str = "KILN_CACHE_MAX_ENTRIES";
pub const ENV_CACHE_MAX_BYTES: &str = "KILN_CACHE_MAX_BYTES";
pub const ENV_CACHE_MAX_AGE_SECS: &str = "KILN_CACHE_MAX_AGE_SECS";

/// Dispatch loop tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tasks running at once
    pub max_concurrent: usize,
    /// Sleep between dispatch ticks
    #[serde(with = "serde_duration::millis")]
    pub tick_interval: Duration,
    /// Sleep after a tick that failed or panicked
    #[serde(with = "serde_duration::millis")]
    pub error_backoff: Duration,
    /// Running tasks older than this are cancelled
    #[serde(with = "serde_duration::secs")]
    pub task_timeout: Duration,
    /// Capacity of the event bus ring buffer
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            tick_interval: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
            task_timeout: Duration::from_secs(5 * 60),
            event_capacity: 1024,
        }
    }
}

impl SchedulerConfig {
    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::configuration("max_concurrent must be at least 1"));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::configuration("tick_interval must be non-zero"));
        }
        if self.task_timeout.is_zero() {
            return Err(Error::configuration("task_timeout must be non-zero"));
        }
        if self.event_capacity == 0 {
            return Err(Error::configuration("event_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Everything a kiln process needs to build its scheduler and cache
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
}

impl KilnConfig {
    /// Defaults, then the user config file, then the environment
    pub fn load() -> Result<Self> {
        let mut config = match default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Defaults overlaid with the JSON file at `path`
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_system(path, "read config file", e))?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::Json {
            message: format!("invalid config file {}", path.display()),
            source: e,
        })?;
        tracing::debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Apply `KILN_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_CONCURRENT) {
            self.scheduler.max_concurrent = parse_env(ENV_MAX_CONCURRENT, &value)?;
        }
        if let Some(value) = lookup(ENV_TASK_TIMEOUT_SECS) {
            self.scheduler.task_timeout =
                Duration::from_secs(parse_env(ENV_TASK_TIMEOUT_SECS, &value)?);
        }
        if let Some(value) = lookup(ENV_CACHE_DIR) {
            if !value.is_empty() {
                self.cache.base_dir = PathBuf::from(value);
            }
        }
        if let Some(value) = lookup(ENV_CACHE_MAX_ENTRIES) {
            self.cache.max_entries = parse_env(ENV_CACHE_MAX_ENTRIES, &value)?;
        }
        if let Some(value) = lookup(ENV_CACHE_MAX_BYTES) {
            self.cache.max_bytes = parse_env(ENV_CACHE_MAX_BYTES, &value)?;
        }
        if let Some(value) = lookup(ENV_CACHE_MAX_AGE_SECS) {
            self.cache.max_age = Duration::from_secs(parse_env(ENV_CACHE_MAX_AGE_SECS, &value)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}

/// `$XDG_CONFIG_HOME/kiln/config.json`, falling back to the platform config dir
pub fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .map(|dir| dir.join("kiln").join("config.json"))
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::configuration(format!("{name} has an invalid value '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.tick_interval, Duration::from_millis(100));
        assert_eq!(config.task_timeout, Duration::from_secs(300));
        assert!(KilnConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(SchedulerConfig::default()
            .max_concurrent(0)
            .validate()
            .is_err());
    }

    #[test]
    fn file_values_overlay_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"scheduler": {"max_concurrent": 8, "tick_interval": 20}, "cache": {"max_entries": 50}}"#,
        )
        .unwrap();

        let config = KilnConfig::from_file(&path).unwrap();
        assert_eq!(config.scheduler.max_concurrent, 8);
        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(20));
        assert_eq!(config.scheduler.task_timeout, Duration::from_secs(300));
        assert_eq!(config.cache.max_entries, 50);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ scheduler: ").unwrap();
        assert!(matches!(
            KilnConfig::from_file(&path),
            Err(Error::Json { .. })
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let vars = HashMap::from([
            (ENV_MAX_CONCURRENT, "6"),
            (ENV_TASK_TIMEOUT_SECS, "10"),
            (ENV_CACHE_DIR, "/tmp/kiln-cache"),
            (ENV_CACHE_MAX_AGE_SECS, "60"),
        ]);
        let mut config = KilnConfig::default();
        config
            .apply_env(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.scheduler.max_concurrent, 6);
        assert_eq!(config.scheduler.task_timeout, Duration::from_secs(10));
        assert_eq!(config.cache.base_dir, PathBuf::from("/tmp/kiln-cache"));
        assert_eq!(config.cache.max_age, Duration::from_secs(60));
    }

    #[test]
    fn bad_env_value_names_the_variable() {
        let mut config = KilnConfig::default();
        let err = config
            .apply_env(|name| (name == ENV_CACHE_MAX_ENTRIES).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_CACHE_MAX_ENTRIES));
    }

    #[test]
    #[serial]
    fn load_reads_xdg_config_home() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("kiln")).unwrap();
        std::fs::write(
            dir.path().join("kiln/config.json"),
            r#"{"scheduler": {"max_concurrent": 5}}"#,
        )
        .unwrap();

        let previous = std::env::var_os("XDG_CONFIG_HOME");
        std::env::set_var("XDG_CONFIG_HOME", dir.path());
        std::env::remove_var(ENV_MAX_CONCURRENT);
        let config = KilnConfig::load();
        match previous {
            Some(value) => std::env::set_var("XDG_CONFIG_HOME", value),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }

        assert_eq!(config.unwrap().scheduler.max_concurrent, 5);
    }
}
