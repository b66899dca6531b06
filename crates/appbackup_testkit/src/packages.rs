//! In-memory package manager and side channel.

use appbackup_codec::AppInfo;
use appbackup_core::{Completion, PackageManager, SideChannel};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Installed applications held in memory.
pub struct MemoryPackageManager {
    platform: i32,
    apps: Mutex<BTreeMap<String, AppInfo>>,
    files: Mutex<HashMap<String, PathBuf>>,
    installable: Mutex<HashMap<String, AppInfo>>,
    installs: Mutex<Vec<(String, Option<String>)>>,
    cleared: Mutex<Vec<String>>,
    finished_installs: Mutex<Vec<(u32, bool)>>,
}

impl Default for MemoryPackageManager {
    fn default() -> Self {
        Self::new(34)
    }
}

impl MemoryPackageManager {
    /// Creates an empty package manager reporting `platform`.
    pub fn new(platform: i32) -> Self {
        Self {
            platform,
            apps: Mutex::new(BTreeMap::new()),
            files: Mutex::new(HashMap::new()),
            installable: Mutex::new(HashMap::new()),
            installs: Mutex::new(Vec::new()),
            cleared: Mutex::new(Vec::new()),
            finished_installs: Mutex::new(Vec::new()),
        }
    }

    /// Installs or replaces an application.
    pub fn install(&self, app: AppInfo) {
        self.apps.lock().insert(app.package_name.clone(), app);
    }

    /// Removes an application.
    pub fn uninstall(&self, package: &str) {
        self.apps.lock().remove(package);
    }

    /// Sets the package file reported for `package`.
    pub fn set_package_file(&self, package: &str, path: PathBuf) {
        self.files.lock().insert(package.to_string(), path);
    }

    /// Lets a package file for `app` be installed; the installed app is
    /// `app` itself.
    pub fn allow_install(&self, app: AppInfo) {
        self.installable
            .lock()
            .insert(app.package_name.clone(), app);
    }

    /// Installs performed, with the installer named.
    pub fn installs(&self) -> Vec<(String, Option<String>)> {
        self.installs.lock().clone()
    }

    /// Packages whose data was cleared, in order.
    pub fn cleared(&self) -> Vec<String> {
        self.cleared.lock().clone()
    }

    /// Install sessions released.
    pub fn finished_installs(&self) -> Vec<(u32, bool)> {
        self.finished_installs.lock().clone()
    }
}

impl PackageManager for MemoryPackageManager {
    fn package_info(&self, package: &str) -> Option<AppInfo> {
        self.apps.lock().get(package).cloned()
    }

    fn installed_packages(&self) -> Vec<AppInfo> {
        self.apps.lock().values().cloned().collect()
    }

    fn platform_version(&self) -> i32 {
        self.platform
    }

    fn package_file(&self, package: &str) -> Option<PathBuf> {
        self.files.lock().get(package).cloned()
    }

    fn install_package(&self, package: &str, path: &Path, installer: Option<&str>) -> bool {
        if !path.exists() {
            return false;
        }
        self.installs
            .lock()
            .push((package.to_string(), installer.map(str::to_string)));
        let Some(app) = self.installable.lock().remove(package) else {
            return false;
        };
        self.install(app);
        true
    }

    fn clear_application_data(&self, package: &str, done: Completion) {
        self.cleared.lock().push(package.to_string());
        done.complete(0);
    }

    fn finish_package_install(&self, token: u32, success: bool) {
        self.finished_installs.lock().push((token, success));
    }
}

/// Side-channel state held in memory.
#[derive(Default)]
pub struct MemorySideChannel {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
    restored: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemorySideChannel {
    /// Creates an empty side channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the live state of `package`. `None` removes it.
    pub fn set(&self, package: &str, blob: Option<Vec<u8>>) {
        let mut snapshots = self.snapshots.lock();
        match blob {
            Some(blob) => {
                snapshots.insert(package.to_string(), blob);
            }
            None => {
                snapshots.remove(package);
            }
        }
    }

    /// State handed back during restore.
    pub fn restored(&self) -> Vec<(String, Vec<u8>)> {
        self.restored.lock().clone()
    }
}

impl SideChannel for MemorySideChannel {
    fn snapshot(&self, package: &str) -> Option<Vec<u8>> {
        self.snapshots.lock().get(package).cloned()
    }

    fn restore(&self, package: &str, blob: &[u8]) {
        self.restored.lock().push((package.to_string(), blob.to_vec()));
    }
}
