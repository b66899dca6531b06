//! The pluggable storage destination.

use crate::status::TransportStatus;
use std::io::{Read, Write};
use std::time::Duration;

/// How a package's data is stored in a restore set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Named records restored through a key-value agent.
    KeyValue,
    /// An archive stream restored through the full-data path.
    Full,
}

/// One package offered by the transport during restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreDescriptor {
    /// Package name.
    pub package_name: String,
    /// How the data is stored.
    pub data_type: DataType,
}

impl RestoreDescriptor {
    /// Key-value descriptor.
    pub fn key_value(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            data_type: DataType::KeyValue,
        }
    }

    /// Full-data descriptor.
    pub fn full(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            data_type: DataType::Full,
        }
    }
}

/// Answer to [`Transport::next_restore_package`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPackage {
    /// The next package to restore.
    Package(RestoreDescriptor),
    /// Every package has been offered.
    NoMorePackages,
    /// The session failed.
    Error,
}

/// Answer to [`Transport::next_full_restore_chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullRestoreChunk {
    /// This many bytes were written to the sink.
    Data(usize),
    /// The current package's stream is complete.
    NoMoreData,
    /// The transport refuses to continue with this package.
    PackageRejected,
    /// Transport failure.
    Error,
}

/// Options for one backup call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupFlags {
    /// The caller asked for a non-incremental pass.
    pub non_incremental: bool,
}

/// Storage destination for backed-up data.
///
/// Calls are made from the service worker and from the full-data producer
/// threads, so implementations use interior mutability.
pub trait Transport: Send + Sync {
    /// Human-readable name.
    fn name(&self) -> String;

    /// Name of the directory holding this transport's local state files.
    fn transport_dir_name(&self) -> String;

    /// Wipes and initializes the remote dataset.
    fn initialize_device(&self) -> TransportStatus;

    /// Stores one package's key-value data.
    fn perform_backup(&self, package: &str, data: &mut dyn Read, flags: BackupFlags) -> TransportStatus;

    /// Commits everything sent since the last call.
    fn finish_backup(&self) -> TransportStatus;

    /// Largest payload accepted for a package.
    fn backup_quota(&self, package: &str, is_full: bool) -> u64;

    /// Validates the total size of a full-data backup.
    fn check_full_backup_size(&self, bytes: u64) -> TransportStatus;

    /// Delay the transport wants before the next scheduled pass.
    fn request_backup_time(&self) -> Duration;

    /// Token of the dataset currently being written.
    fn current_restore_set(&self) -> u64;

    /// Opens a full-data backup stream for a package.
    fn perform_full_backup(&self, package: &str, flags: BackupFlags) -> TransportStatus;

    /// Appends bytes to the open full-data backup stream.
    fn send_backup_data(&self, data: &[u8]) -> TransportStatus;

    /// Discards the open full-data backup stream.
    fn cancel_full_backup(&self);

    /// Starts a restore session over `packages` from restore set `token`.
    fn start_restore(&self, token: u64, packages: &[String]) -> TransportStatus;

    /// Returns the next package of the session.
    fn next_restore_package(&self) -> NextPackage;

    /// Writes the current package's key-value data to `sink`.
    fn restore_data(&self, sink: &mut dyn Write) -> TransportStatus;

    /// Writes the next chunk of the current package's archive stream.
    fn next_full_restore_chunk(&self, sink: &mut dyn Write) -> FullRestoreChunk;

    /// Skips the rest of the current package's archive stream.
    fn abort_full_restore(&self) -> TransportStatus;

    /// Ends the restore session.
    fn finish_restore(&self);
}
