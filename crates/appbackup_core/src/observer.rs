//! Progress callbacks for callers.

use crate::status::{PackageOutcome, PassStatus};

/// Observes a backup pass.
pub trait BackupObserver: Send + Sync {
    /// One package reached a terminal result.
    fn on_result(&self, package: &str, outcome: PackageOutcome);

    /// The pass ended.
    fn backup_finished(&self, status: PassStatus);
}

/// Observes a restore session.
pub trait RestoreObserver: Send + Sync {
    /// The session is about to restore up to `count` packages.
    fn restore_starting(&self, count: usize);

    /// Package number `index` is being restored.
    fn on_update(&self, index: usize, package: &str);

    /// The session ended.
    fn restore_finished(&self, status: PassStatus);
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl BackupObserver for NoopObserver {
    fn on_result(&self, _package: &str, _outcome: PackageOutcome) {}

    fn backup_finished(&self, _status: PassStatus) {}
}

impl RestoreObserver for NoopObserver {
    fn restore_starting(&self, _count: usize) {}

    fn on_update(&self, _index: usize, _package: &str) {}

    fn restore_finished(&self, _status: PassStatus) {}
}
