//! Observers that record what they are told.

use appbackup_core::{BackupObserver, PackageOutcome, PassStatus, RestoreObserver};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Log {
    results: Vec<(String, PackageOutcome)>,
    backups_finished: Vec<PassStatus>,
    restore_counts: Vec<usize>,
    updates: Vec<(usize, String)>,
    restores_finished: Vec<PassStatus>,
}

/// Records every notification and lets tests wait for the terminal ones.
#[derive(Default)]
pub struct RecordingObserver {
    log: Mutex<Log>,
    changed: Condvar,
}

impl RecordingObserver {
    /// Creates an empty observer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-package backup results.
    pub fn results(&self) -> Vec<(String, PackageOutcome)> {
        self.log.lock().results.clone()
    }

    /// Result reported for `package`, if any. The last one wins.
    pub fn result_for(&self, package: &str) -> Option<PackageOutcome> {
        self.log
            .lock()
            .results
            .iter()
            .rev()
            .find(|(p, _)| p == package)
            .map(|(_, o)| *o)
    }

    /// Backup passes finished.
    pub fn backups_finished(&self) -> Vec<PassStatus> {
        self.log.lock().backups_finished.clone()
    }

    /// Package counts announced by starting restore sessions.
    pub fn restore_counts(&self) -> Vec<usize> {
        self.log.lock().restore_counts.clone()
    }

    /// Restore progress updates.
    pub fn updates(&self) -> Vec<(usize, String)> {
        self.log.lock().updates.clone()
    }

    /// Restore sessions finished.
    pub fn restores_finished(&self) -> Vec<PassStatus> {
        self.log.lock().restores_finished.clone()
    }

    /// Waits until `count` backup passes have finished.
    pub fn wait_for_backups(&self, count: usize, timeout: Duration) -> Vec<PassStatus> {
        self.wait(timeout, |log| log.backups_finished.len() >= count);
        self.backups_finished()
    }

    /// Waits until `count` restore sessions have finished.
    pub fn wait_for_restores(&self, count: usize, timeout: Duration) -> Vec<PassStatus> {
        self.wait(timeout, |log| log.restores_finished.len() >= count);
        self.restores_finished()
    }

    fn wait(&self, timeout: Duration, done: impl Fn(&Log) -> bool) {
        let deadline = Instant::now() + timeout;
        let mut log = self.log.lock();
        while !done(&log) {
            if self.changed.wait_until(&mut log, deadline).timed_out() {
                return;
            }
        }
    }

    fn update(&self, f: impl FnOnce(&mut Log)) {
        f(&mut self.log.lock());
        self.changed.notify_all();
    }
}

impl BackupObserver for RecordingObserver {
    fn on_result(&self, package: &str, outcome: PackageOutcome) {
        self.update(|log| log.results.push((package.to_string(), outcome)));
    }

    fn backup_finished(&self, status: PassStatus) {
        self.update(|log| log.backups_finished.push(status));
    }
}

impl RestoreObserver for RecordingObserver {
    fn restore_starting(&self, count: usize) {
        self.update(|log| log.restore_counts.push(count));
    }

    fn on_update(&self, index: usize, package: &str) {
        self.update(|log| log.updates.push((index, package.to_string())));
    }

    fn restore_finished(&self, status: PassStatus) {
        self.update(|log| log.restores_finished.push(status));
    }
}
