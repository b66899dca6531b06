//! Installed-package queries and package-level side effects.

use crate::registry::Completion;
use appbackup_codec::AppInfo;
use std::path::{Path, PathBuf};

/// The device's package manager.
pub trait PackageManager: Send + Sync {
    /// Looks up an installed package.
    fn package_info(&self, package: &str) -> Option<AppInfo>;

    /// Every installed package.
    fn installed_packages(&self) -> Vec<AppInfo>;

    /// Platform version of the device.
    fn platform_version(&self) -> i32;

    /// Location of an installed package's package file.
    fn package_file(&self, package: &str) -> Option<PathBuf>;

    /// Installs a package file staged at `path`. Returns true on success.
    fn install_package(&self, package: &str, path: &Path, installer: Option<&str>) -> bool;

    /// Clears an application's data, reporting through `done`.
    fn clear_application_data(&self, package: &str, done: Completion);

    /// Lets a pending install continue after its restore finished.
    fn finish_package_install(&self, token: u32, success: bool);
}

/// Out-of-band per-package state carried alongside application data.
pub trait SideChannel: Send + Sync {
    /// Current state for a package, if any.
    fn snapshot(&self, package: &str) -> Option<Vec<u8>>;

    /// Hands restored state back.
    fn restore(&self, package: &str, blob: &[u8]);
}

/// A side channel that carries nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSideChannel;

impl SideChannel for NoSideChannel {
    fn snapshot(&self, _package: &str) -> Option<Vec<u8>> {
        None
    }

    fn restore(&self, package: &str, blob: &[u8]) {
        tracing::debug!(package, len = blob.len(), "side-channel state discarded");
    }
}
