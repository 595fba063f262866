//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables for locking, logging and recovery.
///
/// Construct with [`EngineConfig::new`] for production defaults or
/// [`EngineConfig::for_testing`] for small, fast-flush settings, then adjust
/// with the `with_*` builders.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Home directory; transaction logs live in `<home>/txlogs`, heavy-write
    /// shadow copies in `<home>/backup`.
    pub home: PathBuf,
    /// Maximum size of one transaction log file before rotation.
    pub max_log_file_size: u64,
    /// Cumulative queued bytes that trigger a batched log flush.
    pub log_flush_threshold: usize,
    /// Default wait for a contended lock.
    pub lock_wait_timeout: Duration,
    /// Default transaction lifetime; `None` disables the timeout detector
    /// for sessions that do not set their own.
    pub transaction_timeout: Option<Duration>,
    /// How often the deadlock detector scans the wait-for graph.
    pub deadlock_detector_interval: Duration,
    /// How often the timeout detector scans live sessions.
    pub timeout_detector_interval: Duration,
    /// Ceiling on bytes held in unflushed record buffers before flushed
    /// records are dropped from memory and re-read from the log on demand.
    pub max_buffered_bytes: usize,
    /// Whether directory metadata changes are fsynced.
    pub sync_directory_changes: bool,
    /// Byte volume after which a buffered file is switched to heavy-write.
    pub heavy_write_threshold: u64,
}

impl EngineConfig {
    /// Production defaults rooted at `home`.
    pub fn new(home: impl AsRef<Path>) -> Self {
        EngineConfig {
            home: home.as_ref().to_path_buf(),
            max_log_file_size: 1024 * 1024 * 1024,
            log_flush_threshold: 4096,
            lock_wait_timeout: Duration::from_secs(10),
            transaction_timeout: Some(Duration::from_secs(60)),
            deadlock_detector_interval: Duration::from_secs(2),
            timeout_detector_interval: Duration::from_secs(1),
            max_buffered_bytes: 16 * 1024 * 1024,
            sync_directory_changes: true,
            heavy_write_threshold: 8 * 1024 * 1024,
        }
    }

    /// Small limits and short intervals, suitable for tests over a temp dir.
    pub fn for_testing(home: impl AsRef<Path>) -> Self {
        EngineConfig {
            max_log_file_size: 64 * 1024,
            log_flush_threshold: 256,
            lock_wait_timeout: Duration::from_millis(500),
            transaction_timeout: None,
            deadlock_detector_interval: Duration::from_millis(50),
            timeout_detector_interval: Duration::from_millis(50),
            max_buffered_bytes: 64 * 1024,
            heavy_write_threshold: 4 * 1024,
            ..EngineConfig::new(home)
        }
    }

    /// Directory holding the sequentially numbered transaction log files.
    pub fn log_dir(&self) -> PathBuf {
        self.home.join("txlogs")
    }

    /// Path of the log file with the given index.
    pub fn log_file_path(&self, index: u64) -> PathBuf {
        self.log_dir().join(format!("txlog_{index}"))
    }

    /// Directory holding pre-image shadow copies of heavy-write files.
    pub fn backup_dir(&self) -> PathBuf {
        self.home.join("backup")
    }

    /// Override the log rotation size.
    pub fn with_max_log_file_size(mut self, bytes: u64) -> Self {
        self.max_log_file_size = bytes;
        self
    }

    /// Override the batched-flush threshold.
    pub fn with_log_flush_threshold(mut self, bytes: usize) -> Self {
        self.log_flush_threshold = bytes;
        self
    }

    /// Override the default lock wait timeout.
    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    /// Override the default transaction timeout.
    pub fn with_transaction_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Override the deadlock detector interval.
    pub fn with_deadlock_detector_interval(mut self, interval: Duration) -> Self {
        self.deadlock_detector_interval = interval;
        self
    }

    /// Enable or disable directory-metadata fsync.
    pub fn with_sync_directory_changes(mut self, on: bool) -> Self {
        self.sync_directory_changes = on;
        self
    }

    /// Override the heavy-write switch-over volume.
    pub fn with_heavy_write_threshold(mut self, bytes: u64) -> Self {
        self.heavy_write_threshold = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_derive_from_home() {
        let cfg = EngineConfig::new("/var/txfs");
        assert_eq!(cfg.log_dir(), PathBuf::from("/var/txfs/txlogs"));
        assert_eq!(cfg.log_file_path(3), PathBuf::from("/var/txfs/txlogs/txlog_3"));
        assert_eq!(cfg.backup_dir(), PathBuf::from("/var/txfs/backup"));
    }

    #[test]
    fn builders_override_defaults() {
        let cfg = EngineConfig::for_testing("/tmp/t")
            .with_max_log_file_size(1234)
            .with_sync_directory_changes(false);
        assert_eq!(cfg.max_log_file_size, 1234);
        assert!(!cfg.sync_directory_changes);
    }
}
