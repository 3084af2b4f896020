//! Daemon configuration (`~/.turnwatch/daemon.toml`).
//!
//! Every field has a default, so a missing file or an empty one is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};

use crate::admission::DEFAULT_FOREGROUND_HANDLERS;
use crate::error::ConfigError;
use crate::workers::BACKGROUND_WORKER_COUNT;

pub const TURNWATCH_DIR: &str = ".turnwatch";
pub const CONFIG_FILE: &str = "daemon.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Foreground signal handlers.
    pub lock_wait_timeout_secs: u64,
    /// Signals flagged `deferred`.
    pub deferred_lock_wait_timeout_secs: u64,
    pub pool_size: usize,
    pub pool_checkout_timeout_secs: u64,
    pub peak_foreground_handlers: usize,
    pub reconcile_interval_secs: u64,
    pub reconcile_window_secs: u64,
    pub gap_threshold_secs: u64,
    pub watchdog_interval_secs: u64,
    pub reaper_interval_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub context_poll_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout_secs: 15,
            deferred_lock_wait_timeout_secs: 30,
            pool_size: 24,
            pool_checkout_timeout_secs: 10,
            peak_foreground_handlers: DEFAULT_FOREGROUND_HANDLERS,
            reconcile_interval_secs: 10,
            reconcile_window_secs: 30,
            gap_threshold_secs: 5,
            watchdog_interval_secs: 2,
            reaper_interval_secs: 60,
            inactivity_timeout_secs: 600,
            context_poll_interval_secs: 15,
        }
    }
}

impl DaemonConfig {
    /// Every critical section holds a work connection and a lock session, so
    /// the pool must cover twice the peak number of concurrent lock holders.
    pub fn required_pool_size(&self) -> usize {
        2 * self.lock_holders()
    }

    pub fn lock_holders(&self) -> usize {
        self.peak_foreground_handlers + BACKGROUND_WORKER_COUNT
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("lock_wait_timeout_secs", self.lock_wait_timeout_secs),
            (
                "deferred_lock_wait_timeout_secs",
                self.deferred_lock_wait_timeout_secs,
            ),
            ("pool_checkout_timeout_secs", self.pool_checkout_timeout_secs),
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("reconcile_window_secs", self.reconcile_window_secs),
            ("gap_threshold_secs", self.gap_threshold_secs),
            ("watchdog_interval_secs", self.watchdog_interval_secs),
            ("reaper_interval_secs", self.reaper_interval_secs),
            ("inactivity_timeout_secs", self.inactivity_timeout_secs),
            ("context_poll_interval_secs", self.context_poll_interval_secs),
        ];
        if let Some((field, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroDuration { field: *field });
        }

        if self.peak_foreground_handlers == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "peak_foreground_handlers",
            });
        }

        let required = self.required_pool_size();
        if self.pool_size < required {
            return Err(ConfigError::PoolTooSmall {
                pool_size: self.pool_size,
                required,
                holders: self.lock_holders(),
            });
        }
        Ok(())
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_wait_timeout_secs)
    }

    pub fn deferred_lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.deferred_lock_wait_timeout_secs)
    }

    pub fn pool_checkout_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_checkout_timeout_secs)
    }

    pub fn reconcile_window(&self) -> ChronoDuration {
        seconds(self.reconcile_window_secs)
    }

    pub fn gap_threshold(&self) -> ChronoDuration {
        seconds(self.gap_threshold_secs)
    }

    pub fn inactivity_timeout(&self) -> ChronoDuration {
        seconds(self.inactivity_timeout_secs)
    }
}

/// Keeps `now - duration` representable.
const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn seconds(value: u64) -> ChronoDuration {
    ChronoDuration::seconds(value.min(MAX_DURATION_SECS) as i64)
}

pub fn turnwatch_home(home_override: Option<&Path>) -> Result<PathBuf, String> {
    let home = match home_override {
        Some(path) => path.to_path_buf(),
        None => dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?,
    };
    Ok(home.join(TURNWATCH_DIR))
}

/// Missing file yields defaults. The result is validated.
pub fn load_config(path: &Path) -> Result<DaemonConfig, ConfigError> {
    if !path.exists() {
        let config = DaemonConfig::default();
        config.validate()?;
        return Ok(config);
    }

    let content = fs_err::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config =
        toml::from_str::<DaemonConfig>(&content).map_err(|err| ConfigError::Malformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(&temp_dir.path().join("missing.toml")).expect("load");
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.lock_wait_timeout(), Duration::from_secs(15));
        assert_eq!(config.deferred_lock_wait_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn default_pool_covers_default_holders() {
        let config = DaemonConfig::default();
        assert_eq!(config.required_pool_size(), 2 * (8 + BACKGROUND_WORKER_COUNT));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("daemon.toml");
        fs_err::write(&path, "gap_threshold_secs = 9\nreconcile_interval_secs = 3\n")
            .expect("write");

        let config = load_config(&path).expect("load");
        assert_eq!(config.gap_threshold_secs, 9);
        assert_eq!(config.reconcile_interval_secs, 3);
        assert_eq!(config.pool_size, 24);
    }

    #[test]
    fn undersized_pool_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("daemon.toml");
        fs_err::write(&path, "pool_size = 4\npeak_foreground_handlers = 8\n").expect("write");

        let err = load_config(&path).expect_err("too small");
        assert!(matches!(
            err,
            ConfigError::PoolTooSmall {
                pool_size: 4,
                required: 24,
                ..
            }
        ));
    }

    #[test]
    fn zero_durations_are_rejected() {
        let config = DaemonConfig {
            gap_threshold_secs: 0,
            ..DaemonConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration {
                field: "gap_threshold_secs"
            })
        ));
    }

    #[test]
    fn zero_foreground_handlers_are_rejected() {
        let config = DaemonConfig {
            peak_foreground_handlers: 0,
            ..DaemonConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroLimit {
                field: "peak_foreground_handlers"
            })
        ));
    }

    #[test]
    fn unknown_keys_are_malformed() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("daemon.toml");
        fs_err::write(&path, "pool_sise = 40\n").expect("write");
        assert!(matches!(
            load_config(&path),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn home_override_is_respected() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let home = turnwatch_home(Some(temp_dir.path())).expect("home");
        assert_eq!(home, temp_dir.path().join(TURNWATCH_DIR));
    }
}
