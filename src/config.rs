//! Locker and recovery options, plus TOML loading.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::UmbralError;

/// Default settle window between writing a claim and verifying seniority.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(100);
/// Default number of claim write/read/delete attempts.
pub const DEFAULT_LOCK_RETRY: usize = 3;
/// Default lifetime of a lock claim.
pub const DEFAULT_LOCK_EXPIRE: Duration = Duration::from_secs(300);
/// Default namespace prefix for local lock mediators.
pub const DEFAULT_MEDIATOR_GROUP: &str = "umbral";
/// Shortest time a transaction stays cached, whatever `max_commit_time` says.
pub const MIN_TX_LENGTH: Duration = Duration::from_secs(5);
/// Name of the system log carrying transaction status records.
pub const SYSTEM_TX_LOG_NAME: &str = "txlog";

/// Configuration for [`crate::locking::ConsistentKeyLocker`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockerOptions {
    /// Settle period; also the maximum duration of a claim write.
    pub lock_wait: Duration,
    /// Attempts for each claim write, claim read, and claim delete.
    pub lock_retry_count: usize,
    /// Claims older than this are ignored by verification.
    pub lock_expire: Duration,
    /// Prefix combined with the lock store name to pick a mediator namespace.
    pub local_mediator_group: String,
    /// Whether verification deletes expired claims it encounters.
    pub clean_expired: bool,
}

impl Default for LockerOptions {
    fn default() -> Self {
        Self {
            lock_wait: DEFAULT_LOCK_WAIT,
            lock_retry_count: DEFAULT_LOCK_RETRY,
            lock_expire: DEFAULT_LOCK_EXPIRE,
            local_mediator_group: DEFAULT_MEDIATOR_GROUP.to_string(),
            clean_expired: false,
        }
    }
}

impl LockerOptions {
    /// Sets the settle period.
    pub fn lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Sets the per-operation attempt count.
    pub fn lock_retry_count(mut self, attempts: usize) -> Self {
        self.lock_retry_count = attempts;
        self
    }

    /// Sets the claim lifetime.
    pub fn lock_expire(mut self, expire: Duration) -> Self {
        self.lock_expire = expire;
        self
    }

    /// Sets the mediator namespace prefix.
    pub fn local_mediator_group(mut self, group: impl Into<String>) -> Self {
        self.local_mediator_group = group.into();
        self
    }

    /// Enables or disables expired-claim cleaning.
    pub fn clean_expired(mut self, enabled: bool) -> Self {
        self.clean_expired = enabled;
        self
    }

    /// Rejects settings the locker cannot operate with.
    pub fn validate(&self) -> Result<(), UmbralError> {
        if self.lock_retry_count == 0 {
            return Err(ConfigError::Invalid {
                key: "locking.lock_retry_count",
                reason: "must be at least 1",
            }
            .into());
        }
        if self.lock_expire <= self.lock_wait {
            return Err(ConfigError::Invalid {
                key: "locking.lock_expire_ms",
                reason: "must exceed lock_wait_ms",
            }
            .into());
        }
        Ok(())
    }
}

/// Configuration for [`crate::recovery::TransactionLogProcessor`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryOptions {
    /// Time a transaction has to confirm its secondary effects.
    pub max_commit_time: Duration,
    /// Budget for each repair write (index commit, user-log append).
    pub max_write_time: Duration,
    /// Budget for reading affected elements during index repair.
    pub read_time: Duration,
    /// Interval of the cache sweep.
    pub cleanup_interval: Duration,
    /// Lower bound on how long a transaction stays cached.
    pub min_tx_length: Duration,
    /// Logs every recovery message at info level.
    pub verbose: bool,
    /// Number of threads draining the repair queue.
    pub repair_workers: usize,
    /// Log that carries transaction status records.
    pub system_log: String,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            max_commit_time: Duration::from_secs(10),
            max_write_time: Duration::from_secs(100),
            read_time: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(5),
            min_tx_length: MIN_TX_LENGTH,
            verbose: false,
            repair_workers: 1,
            system_log: SYSTEM_TX_LOG_NAME.to_string(),
        }
    }
}

impl RecoveryOptions {
    /// Sets the commit-time bound.
    pub fn max_commit_time(mut self, d: Duration) -> Self {
        self.max_commit_time = d;
        self
    }

    /// Sets the repair write budget.
    pub fn max_write_time(mut self, d: Duration) -> Self {
        self.max_write_time = d;
        self
    }

    /// Sets the repair read budget.
    pub fn read_time(mut self, d: Duration) -> Self {
        self.read_time = d;
        self
    }

    /// Sets the sweep interval.
    pub fn cleanup_interval(mut self, d: Duration) -> Self {
        self.cleanup_interval = d;
        self
    }

    /// Sets the cache lifetime floor; values below [`MIN_TX_LENGTH`] are rejected.
    pub fn min_tx_length(mut self, d: Duration) -> Self {
        self.min_tx_length = d;
        self
    }

    /// Enables verbose recovery logging.
    pub fn verbose(mut self, enabled: bool) -> Self {
        self.verbose = enabled;
        self
    }

    /// Sets the number of repair threads.
    pub fn repair_workers(mut self, workers: usize) -> Self {
        self.repair_workers = workers;
        self
    }

    /// Lifetime of a cached transaction entry.
    pub fn tx_lifetime(&self) -> Duration {
        self.max_commit_time.max(self.min_tx_length).max(MIN_TX_LENGTH)
    }

    /// Rejects settings the recovery processor cannot operate with.
    pub fn validate(&self) -> Result<(), UmbralError> {
        let checks: [(bool, &'static str, &'static str); 5] = [
            (
                self.max_commit_time.is_zero(),
                "recovery.max_commit_time_ms",
                "must be positive",
            ),
            (
                self.min_tx_length < MIN_TX_LENGTH,
                "recovery.min_tx_length_ms",
                "must be at least 5000",
            ),
            (
                self.cleanup_interval.is_zero(),
                "recovery.cleanup_interval_ms",
                "must be positive",
            ),
            (
                self.repair_workers == 0,
                "recovery.repair_workers",
                "must be at least 1",
            ),
            (
                self.system_log.is_empty(),
                "recovery.system_log",
                "must not be empty",
            ),
        ];
        for (bad, key, reason) in checks {
            if bad {
                return Err(ConfigError::Invalid { key, reason }.into());
            }
        }
        Ok(())
    }
}

/// Combined options loaded from a TOML document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UmbralConfig {
    /// `[locking]` table.
    pub locking: LockerOptions,
    /// `[recovery]` table.
    pub recovery: RecoveryOptions,
}

impl UmbralConfig {
    /// Reads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, UmbralError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, Some(path))
    }

    /// Parses and validates a configuration document.
    pub fn from_toml_str(contents: &str) -> Result<Self, UmbralError> {
        Self::parse(contents, None)
    }

    fn parse(contents: &str, path: Option<&Path>) -> Result<Self, UmbralError> {
        let raw: RawConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.map_or_else(|| PathBuf::from("<inline>"), Path::to_path_buf),
            source,
        })?;
        let config = raw.into_config();
        config.locking.validate()?;
        config.recovery.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    locking: RawLocking,
    #[serde(default)]
    recovery: RawRecovery,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RawLocking {
    lock_wait_ms: Option<u64>,
    lock_retry_count: Option<usize>,
    lock_expire_ms: Option<u64>,
    local_mediator_group: Option<String>,
    clean_expired: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RawRecovery {
    max_commit_time_ms: Option<u64>,
    max_write_time_ms: Option<u64>,
    read_time_ms: Option<u64>,
    cleanup_interval_ms: Option<u64>,
    min_tx_length_ms: Option<u64>,
    verbose: Option<bool>,
    repair_workers: Option<usize>,
    system_log: Option<String>,
}

impl RawConfig {
    fn into_config(self) -> UmbralConfig {
        let mut locking = LockerOptions::default();
        let l = self.locking;
        if let Some(ms) = l.lock_wait_ms {
            locking.lock_wait = Duration::from_millis(ms);
        }
        if let Some(n) = l.lock_retry_count {
            locking.lock_retry_count = n;
        }
        if let Some(ms) = l.lock_expire_ms {
            locking.lock_expire = Duration::from_millis(ms);
        }
        if let Some(group) = l.local_mediator_group {
            locking.local_mediator_group = group;
        }
        if let Some(clean) = l.clean_expired {
            locking.clean_expired = clean;
        }

        let mut recovery = RecoveryOptions::default();
        let r = self.recovery;
        if let Some(ms) = r.max_commit_time_ms {
            recovery.max_commit_time = Duration::from_millis(ms);
        }
        if let Some(ms) = r.max_write_time_ms {
            recovery.max_write_time = Duration::from_millis(ms);
        }
        if let Some(ms) = r.read_time_ms {
            recovery.read_time = Duration::from_millis(ms);
        }
        if let Some(ms) = r.cleanup_interval_ms {
            recovery.cleanup_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = r.min_tx_length_ms {
            recovery.min_tx_length = Duration::from_millis(ms);
        }
        if let Some(verbose) = r.verbose {
            recovery.verbose = verbose;
        }
        if let Some(n) = r.repair_workers {
            recovery.repair_workers = n;
        }
        if let Some(name) = r.system_log {
            recovery.system_log = name;
        }
        UmbralConfig { locking, recovery }
    }
}

#[derive(Debug, Error)]
enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{key} {reason}")]
    Invalid {
        key: &'static str,
        reason: &'static str,
    },
}

impl From<ConfigError> for UmbralError {
    fn from(err: ConfigError) -> Self {
        UmbralError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = UmbralConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.locking.lock_wait, Duration::from_millis(100));
        assert_eq!(cfg.locking.lock_retry_count, 3);
        assert_eq!(cfg.locking.lock_expire, Duration::from_secs(300));
        assert_eq!(cfg.recovery.max_commit_time, Duration::from_secs(10));
        assert_eq!(cfg.recovery.tx_lifetime(), Duration::from_secs(10));
        assert_eq!(cfg.recovery.system_log, "txlog");
    }

    #[test]
    fn lifetime_has_floor() {
        let opts = RecoveryOptions::default().max_commit_time(Duration::from_millis(10));
        assert_eq!(opts.tx_lifetime(), Duration::from_secs(5));
    }

    #[test]
    fn lifetime_floor_cannot_be_lowered() {
        let opts = RecoveryOptions::default()
            .max_commit_time(Duration::from_millis(1))
            .min_tx_length(Duration::ZERO);
        assert_eq!(opts.tx_lifetime(), MIN_TX_LENGTH);
        let err = opts.validate().unwrap_err();
        assert!(matches!(err, UmbralError::Config(ref m) if m.contains("min_tx_length")));
        let err =
            UmbralConfig::from_toml_str("[recovery]\nmin_tx_length_ms = 10\n").unwrap_err();
        assert!(matches!(err, UmbralError::Config(_)));
        let cfg =
            UmbralConfig::from_toml_str("[recovery]\nmin_tx_length_ms = 30000\n").unwrap();
        assert_eq!(cfg.recovery.tx_lifetime(), Duration::from_secs(30));
    }

    #[test]
    fn parses_tables_in_millis() {
        let cfg = UmbralConfig::from_toml_str(
            r#"
            [locking]
            lock_wait_ms = 250
            lock_retry_count = 5
            clean_expired = true

            [recovery]
            max_commit_time_ms = 20000
            verbose = true
            repair_workers = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.locking.lock_wait, Duration::from_millis(250));
        assert_eq!(cfg.locking.lock_retry_count, 5);
        assert!(cfg.locking.clean_expired);
        assert_eq!(cfg.recovery.max_commit_time, Duration::from_secs(20));
        assert!(cfg.recovery.verbose);
        assert_eq!(cfg.recovery.repair_workers, 2);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = UmbralConfig::from_toml_str("[locking]\nlock_retry_count = 0\n").unwrap_err();
        assert!(matches!(err, UmbralError::Config(ref m) if m.contains("lock_retry_count")));
        let err =
            UmbralConfig::from_toml_str("[recovery]\nmax_commit_time_ms = 0\n").unwrap_err();
        assert!(matches!(err, UmbralError::Config(_)));
        let err = UmbralConfig::from_toml_str("[locking]\nbogus = 1\n").unwrap_err();
        assert!(matches!(err, UmbralError::Config(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[locking]\nlock_expire_ms = 60000").unwrap();
        let cfg = UmbralConfig::load(file.path()).unwrap();
        assert_eq!(cfg.locking.lock_expire, Duration::from_secs(60));
        assert!(UmbralConfig::load(file.path().with_extension("missing")).is_err());
    }
}
