//! Test environments and archive builders.

use crate::agents::{MockAgent, MockAgentHost};
use crate::packages::{MemoryPackageManager, MemorySideChannel};
use crate::transport::MemoryTransport;
use appbackup_codec::{encode_package, AppInfo, FileInfo, Manifest, PackageSegment};
use appbackup_core::{BackupContext, BackupService, PackageManager, ServiceConfig, Timeouts};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Timeout used by [`TestEnv`] for every agent call.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A context wired to in-memory collaborators, with a temporary state
/// directory that lives as long as the value.
pub struct TestEnv {
    /// Shared context.
    pub ctx: Arc<BackupContext>,
    /// Transport.
    pub transport: Arc<MemoryTransport>,
    /// Package manager.
    pub packages: Arc<MemoryPackageManager>,
    /// Agent host.
    pub agents: Arc<MockAgentHost>,
    /// Side channel.
    pub side_channel: Arc<MemorySideChannel>,
    dir: TempDir,
}

impl TestEnv {
    /// Creates an environment with the default test configuration.
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Creates an environment after adjusting the configuration.
    pub fn with_config(adjust: impl FnOnce(ServiceConfig) -> ServiceConfig) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let config = adjust(ServiceConfig::new(dir.path()).with_timeouts(Timeouts::uniform(TEST_TIMEOUT)));
        let transport = Arc::new(MemoryTransport::new());
        let packages = Arc::new(MemoryPackageManager::default());
        let agents = Arc::new(MockAgentHost::new());
        let side_channel = Arc::new(MemorySideChannel::new());
        let ctx = BackupContext::new(
            config,
            transport.clone(),
            packages.clone(),
            agents.clone(),
            side_channel.clone(),
        )
        .expect("create context");
        Self {
            ctx: Arc::new(ctx),
            transport,
            packages,
            agents,
            side_channel,
            dir,
        }
    }

    /// Starts a service over the same collaborators and state directory.
    /// `ctx` must not be used while the service runs; use
    /// [`BackupService::context`] instead.
    pub fn start_service(&self) -> BackupService {
        let ctx = BackupContext::new(
            self.ctx.config.clone(),
            self.transport.clone(),
            self.packages.clone(),
            self.agents.clone(),
            self.side_channel.clone(),
        )
        .expect("create service context");
        BackupService::start(ctx).expect("start service")
    }

    /// Root of the temporary state directory.
    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Installs `app`.
    pub fn install(&self, app: AppInfo) {
        self.packages.install(app);
    }

    /// The mock agent of `package`.
    pub fn agent(&self, package: &str) -> Arc<MockAgent> {
        self.agents.agent(package)
    }

    /// Queues key-value backups for `packages`.
    pub fn request(&self, packages: &[&str]) {
        let mut book = self.ctx.bookkeeping.lock();
        for package in packages {
            book.enqueue(package).expect("enqueue backup request");
        }
    }

    /// Returns true if a key-value backup of `package` is pending.
    pub fn is_pending(&self, package: &str) -> bool {
        self.ctx.bookkeeping.lock().is_pending(package)
    }

    /// Stores package metadata for every installed package in the
    /// transport.
    pub fn seed_package_metadata(&self) {
        let packages: Arc<dyn PackageManager> = self.packages.clone();
        self.transport.seed_package_metadata(packages);
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// A third-party application with a key-value agent and one signature.
pub fn app(package: &str, version: i64) -> AppInfo {
    AppInfo::new(package, version).with_signatures(vec![signature(package)])
}

/// An application backed up through full-data backup.
pub fn full_data_app(package: &str, version: i64) -> AppInfo {
    let mut app = app(package, version);
    app.full_backup_only = true;
    app
}

/// The signature [`app`] gives `package`.
pub fn signature(package: &str) -> Vec<u8> {
    format!("cert:{package}").into_bytes()
}

/// Encodes a single-package archive for `app` carrying `files` as
/// `(domain, path, content)`.
pub fn package_archive(app: &AppInfo, platform: i32, files: &[(&str, &str, &[u8])]) -> Vec<u8> {
    let manifest = Manifest::new(app.package_name.as_str(), app.version_code, platform)
        .with_signatures(app.signatures.clone());
    let records = files.iter().map(|(domain, path, content)| {
        (
            FileInfo::file(app.package_name.as_str(), *domain, *path, content.len() as u64),
            content.to_vec(),
        )
    });
    encode_package(Vec::new(), PackageSegment::new(&manifest), records).expect("encode archive")
}

/// Encodes a single-package archive that also carries a package file.
pub fn package_archive_with_apk(app: &AppInfo, platform: i32, apk: &[u8], files: &[(&str, &str, &[u8])]) -> Vec<u8> {
    let manifest = Manifest::new(app.package_name.as_str(), app.version_code, platform)
        .with_signatures(app.signatures.clone())
        .with_apk(true);
    let mut segment = PackageSegment::new(&manifest);
    segment.apk = Some(apk);
    let records = files.iter().map(|(domain, path, content)| {
        (
            FileInfo::file(app.package_name.as_str(), *domain, *path, content.len() as u64),
            content.to_vec(),
        )
    });
    encode_package(Vec::new(), segment, records).expect("encode archive")
}
