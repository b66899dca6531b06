//! Service configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Deadlines for agent round-trips and handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Key-value backup call.
    pub key_value_backup: Duration,
    /// Full-data backup call.
    pub full_backup: Duration,
    /// Full-data backup of the shared-storage pseudo-package.
    pub shared_backup: Duration,
    /// Key-value restore call.
    pub restore: Duration,
    /// Finish-restore call.
    pub restore_finished: Duration,
    /// Application data clearing handshake.
    pub clear_data: Duration,
    /// Delivery of one file during a full-data restore.
    pub restore_file: Duration,
    /// A whole package's full-data restore stream.
    pub full_restore: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            key_value_backup: Duration::from_secs(30),
            full_backup: Duration::from_secs(5 * 60),
            shared_backup: Duration::from_secs(30 * 60),
            restore: Duration::from_secs(60),
            restore_finished: Duration::from_secs(30),
            clear_data: Duration::from_secs(10),
            restore_file: Duration::from_secs(5 * 60),
            full_restore: Duration::from_secs(30 * 60),
        }
    }
}

impl Timeouts {
    /// Uses one deadline for everything. Handy in tests.
    #[must_use]
    pub const fn uniform(timeout: Duration) -> Self {
        Self {
            key_value_backup: timeout,
            full_backup: timeout,
            shared_backup: timeout,
            restore: timeout,
            restore_finished: timeout,
            clear_data: timeout,
            restore_file: timeout,
            full_restore: timeout,
        }
    }
}

/// Configuration for a backup service instance.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root directory for bookkeeping and per-transport state files.
    pub state_dir: PathBuf,

    /// Directory for transient data blobs.
    pub data_dir: PathBuf,

    /// Agent deadlines.
    pub timeouts: Timeouts,

    /// Capacity of the in-memory pipes between producers and consumers.
    pub pipe_capacity: usize,

    /// Largest manifest or metadata record buffered during decode.
    pub max_record_size: u64,

    /// Whether full-data backups include the application package file.
    pub include_apks: bool,

    /// Whether full-data restores may install package files from the archive.
    pub allow_apk_install: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new("appbackup-state")
    }
}

impl ServiceConfig {
    /// Creates a configuration rooted at `state_dir`.
    #[must_use]
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        let data_dir = state_dir.join("data");
        Self {
            state_dir,
            data_dir,
            timeouts: Timeouts::default(),
            pipe_capacity: 64 * 1024,
            max_record_size: appbackup_codec::DEFAULT_MAX_RECORD_SIZE,
            include_apks: false,
            allow_apk_install: false,
        }
    }

    /// Sets the transient data directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Sets the agent deadlines.
    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the pipe capacity.
    #[must_use]
    pub const fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }

    /// Sets the largest buffered manifest or metadata record.
    #[must_use]
    pub const fn with_max_record_size(mut self, size: u64) -> Self {
        self.max_record_size = size;
        self
    }

    /// Sets whether full-data backups include the package file.
    #[must_use]
    pub const fn with_include_apks(mut self, value: bool) -> Self {
        self.include_apks = value;
        self
    }

    /// Sets whether full-data restores may install package files.
    #[must_use]
    pub const fn with_apk_install(mut self, value: bool) -> Self {
        self.allow_apk_install = value;
        self
    }

    /// Directory holding the per-package state files of one transport.
    #[must_use]
    pub fn transport_state_dir(&self, transport_dir_name: &str) -> PathBuf {
        self.state_dir.join(transport_dir_name)
    }

    /// Directory holding request journals.
    #[must_use]
    pub fn journal_dir(&self) -> PathBuf {
        self.state_dir.join("journal")
    }

    /// The bookkeeping file.
    #[must_use]
    pub fn bookkeeping_path(&self) -> PathBuf {
        self.state_dir.join("bookkeeping.json")
    }

    /// Root state directory.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.timeouts.key_value_backup, Duration::from_secs(30));
        assert_eq!(config.timeouts.shared_backup, Duration::from_secs(1800));
        assert_eq!(config.pipe_capacity, 64 * 1024);
        assert!(!config.include_apks);
        assert!(!config.allow_apk_install);
    }

    #[test]
    fn builder_pattern() {
        let config = ServiceConfig::new("/tmp/state")
            .with_timeouts(Timeouts::uniform(Duration::from_millis(50)))
            .with_pipe_capacity(1024)
            .with_apk_install(true);

        assert_eq!(config.timeouts.restore_file, Duration::from_millis(50));
        assert_eq!(config.pipe_capacity, 1024);
        assert!(config.allow_apk_install);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/state/data"));
        assert_eq!(
            config.transport_state_dir("local"),
            PathBuf::from("/tmp/state/local")
        );
    }
}
