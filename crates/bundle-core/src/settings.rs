//! Tunable settings for sync, locking and background flushing.
//!
//! Settings are read from `<targetDir>/bundle-settings.toml` (or `.json`)
//! through [`ConfigStore`]; every field has a default so an absent file
//! means "defaults everywhere".

use std::path::Path;
use std::time::Duration;

use bundle_fs::ConfigStore;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// File name looked up in a target directory.
pub const SETTINGS_FILE: &str = "bundle-settings.toml";

/// A bounded retry policy: how many attempts and how long to wait between
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate(5)
    }
}

impl RetryPolicy {
    /// Retry up to `max_attempts` times without waiting.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_ms: 0,
        }
    }

    pub const fn with_backoff(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_ms,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Run `op` until it succeeds, its error is not `retryable`, or the
    /// attempts are exhausted, sleeping the constant backoff in between.
    pub fn run<T>(
        &self,
        retryable: impl Fn(&Error) -> bool,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let max = self.attempts();
        let mut attempt = 0;
        let schedule = backoff::backoff::Constant::new(self.backoff());

        backoff::retry(schedule, || {
            attempt += 1;
            op().map_err(|e| {
                if attempt < max && retryable(&e) {
                    tracing::debug!(attempt, max, error = %e, "Retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .map_err(|e| match e {
            backoff::Error::Permanent(err) => err,
            backoff::Error::Transient { err, .. } => err,
        })
    }
}

/// Settings for one target directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Bound on `sync_up`/`sync_down` loops
    pub sync_retry: RetryPolicy,
    /// Write-lock acquisition for ordinary directories
    pub lock_retry: RetryPolicy,
    /// Write-lock acquisition for contention-prone shared directories
    pub shared_lock_retry: RetryPolicy,
    /// Interval between background worker wake-ups
    pub flush_tick_secs: u64,
    /// Wake-ups between background flushes
    pub flush_frequency: u32,
    /// Background flushes between full flushes
    pub full_flush_frequency: u32,
    /// How long cached file timestamps are trusted
    pub cache_staleness_ms: u64,
    /// Age after which another device's lock file is no longer a conflict
    pub device_lock_freshness_hours: u64,
    /// Override for this device's identifier
    pub device_id: Option<String>,
    /// Override for the directory kind's background-flush default
    pub background_flush: Option<bool>,
    /// Overrides the tick interval with milliseconds, for tests
    pub flush_tick_ms: Option<u64>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_retry: RetryPolicy::immediate(5),
            lock_retry: RetryPolicy::with_backoff(1, 1500),
            shared_lock_retry: RetryPolicy::with_backoff(5, 1500),
            flush_tick_secs: 60,
            flush_frequency: 5,
            full_flush_frequency: 12,
            cache_staleness_ms: 5000,
            device_lock_freshness_hours: 24,
            device_id: None,
            background_flush: None,
            flush_tick_ms: None,
        }
    }
}

impl SyncSettings {
    /// Load `bundle-settings.toml` from `target_dir`, or defaults.
    pub fn load(target_dir: &Path) -> Result<Self> {
        Ok(ConfigStore::new().load_or_default(&target_dir.join(SETTINGS_FILE))?)
    }

    pub fn flush_tick(&self) -> Duration {
        match self.flush_tick_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.flush_tick_secs),
        }
    }

    pub fn cache_staleness(&self) -> Duration {
        Duration::from_millis(self.cache_staleness_ms)
    }

    pub fn device_lock_freshness(&self) -> Duration {
        Duration::from_secs(self.device_lock_freshness_hours * 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::path::PathBuf;

    fn lock_error() -> Error {
        Error::LockFailed {
            path: PathBuf::from("/t"),
            reason: "busy".into(),
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = SyncSettings::default();
        assert_eq!(s.sync_retry.attempts(), 5);
        assert_eq!(s.flush_tick(), Duration::from_secs(60));
        assert_eq!(s.flush_frequency, 5);
        assert_eq!(s.full_flush_frequency, 12);
        assert_eq!(s.shared_lock_retry.backoff(), Duration::from_millis(1500));
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            "flush_frequency = 2\n[sync_retry]\nmax_attempts = 3\n",
        )
        .unwrap();

        let s = SyncSettings::load(dir.path()).unwrap();
        assert_eq!(s.flush_frequency, 2);
        assert_eq!(s.sync_retry.attempts(), 3);
        assert_eq!(s.full_flush_frequency, 12);
    }

    #[test]
    fn run_stops_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<()> = RetryPolicy::immediate(3).run(Error::is_lock_failure, || {
            calls.set(calls.get() + 1);
            Err(lock_error())
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn run_does_not_retry_permanent_errors() {
        let calls = Cell::new(0);
        let result: Result<()> = RetryPolicy::immediate(5).run(Error::is_lock_failure, || {
            calls.set(calls.get() + 1);
            Err(Error::InvalidRefName { name: "x".into() })
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn run_returns_first_success() {
        let calls = Cell::new(0);
        let value = RetryPolicy::immediate(5)
            .run(Error::is_lock_failure, || {
                calls.set(calls.get() + 1);
                if calls.get() < 2 { Err(lock_error()) } else { Ok(42) }
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.get(), 2);
    }
}
