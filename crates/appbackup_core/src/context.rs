//! Collaborators shared by every orchestrator.

use crate::agent::AgentHost;
use crate::bookkeeping::Bookkeeping;
use crate::config::ServiceConfig;
use crate::error::CoreResult;
use crate::package_manager::{PackageManager, SideChannel};
use crate::registry::{Completion, OperationKind, OperationRegistry};
use crate::transport::Transport;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything an orchestrator needs to talk to.
pub struct BackupContext {
    /// Service configuration.
    pub config: ServiceConfig,
    /// Operation registry.
    pub registry: OperationRegistry,
    /// Storage destination.
    pub transport: Arc<dyn Transport>,
    /// Package manager.
    pub packages: Arc<dyn PackageManager>,
    /// Agent binder.
    pub agents: Arc<dyn AgentHost>,
    /// Out-of-band per-package state.
    pub side_channel: Arc<dyn SideChannel>,
    /// Scheduling state.
    pub bookkeeping: Mutex<Bookkeeping>,
}

impl BackupContext {
    /// Assembles a context, loading bookkeeping from the configured state
    /// directory.
    pub fn new(
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
        packages: Arc<dyn PackageManager>,
        agents: Arc<dyn AgentHost>,
        side_channel: Arc<dyn SideChannel>,
    ) -> CoreResult<Self> {
        let bookkeeping = Bookkeeping::open(config.bookkeeping_path(), config.journal_dir())?;
        Ok(Self {
            config,
            registry: OperationRegistry::new(),
            transport,
            packages,
            agents,
            side_channel,
            bookkeeping: Mutex::new(bookkeeping),
        })
    }

    /// State directory of the active transport.
    #[must_use]
    pub fn transport_state_dir(&self) -> PathBuf {
        self.config
            .transport_state_dir(&self.transport.transport_dir_name())
    }

    /// Clears an application's data and waits for the package manager to
    /// confirm. Returns false on timeout or if the handshake could not be
    /// started.
    pub fn clear_app_data(&self, package: &str) -> bool {
        let token = self.registry.generate_token();
        if let Err(e) = self.registry.prepare(
            token,
            OperationKind::BackupWait,
            self.config.timeouts.clear_data,
            None,
        ) {
            tracing::warn!(package, error = %e, "could not start clear-data handshake");
            return false;
        }
        tracing::info!(package, "clearing application data");
        self.packages
            .clear_application_data(package, Completion::new(token, self.registry.clone()));
        let cleared = self.registry.block_until_complete(token);
        if !cleared {
            tracing::warn!(package, "clearing application data timed out");
        }
        cleared
    }

    /// Decides whether side-channel state for `package` must be sent.
    ///
    /// The hash of the current snapshot is stored next to the package's
    /// state files and compared on the next pass. The hash is written
    /// before the caller has delivered the blob, so a delivery that fails
    /// afterwards suppresses the blob on the next pass as well.
    pub fn side_channel_delta(&self, package: &str) -> SideChannelDelta {
        let hash_path = self.transport_state_dir().join(format!("{package}.sidechannel"));
        let previous = fs::read(&hash_path).ok();
        match self.side_channel.snapshot(package) {
            Some(blob) => {
                let digest = Sha256::digest(&blob);
                if previous.as_deref() == Some(digest.as_slice()) {
                    return SideChannelDelta::Unchanged;
                }
                if let Err(e) = write_hash(&hash_path, digest.as_slice()) {
                    tracing::warn!(package, error = %e, "failed to record side-channel hash");
                }
                tracing::debug!(package, hash = %hex::encode(digest), "side-channel state changed");
                SideChannelDelta::Changed(blob)
            }
            None if previous.is_some() => {
                if let Err(e) = fs::remove_file(&hash_path) {
                    tracing::warn!(package, error = %e, "failed to remove side-channel hash");
                }
                SideChannelDelta::Removed
            }
            None => SideChannelDelta::Unchanged,
        }
    }
}

fn write_hash(path: &std::path::Path, digest: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, digest)
}

/// What to do with side-channel state on this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideChannelDelta {
    /// Nothing to send.
    Unchanged,
    /// Send this blob.
    Changed(Vec<u8>),
    /// State existed before and is gone now.
    Removed,
}
