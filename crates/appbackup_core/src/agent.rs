//! Application backup agents and how they are bound.

use crate::pipe::{PipeReader, PipeWriter};
use crate::registry::Completion;
use appbackup_codec::{AppInfo, ArchiveWriter, CodecError, CodecResult, EntryKind, FileInfo};
use parking_lot::Mutex;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;

/// Why an agent is being bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// Key-value backup.
    Backup,
    /// Key-value restore.
    Restore,
    /// Full-data backup.
    FullBackup,
    /// Full-data restore.
    FullRestore,
}

/// One file delivered to an agent during a full-data restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreFileRequest {
    /// Content size.
    pub size: u64,
    /// File or directory.
    pub kind: EntryKind,
    /// Domain token.
    pub domain: String,
    /// Path relative to the domain root.
    pub path: String,
    /// Permission bits.
    pub mode: u32,
    /// Modification time in seconds.
    pub mtime: u64,
}

/// Archive output handed to an agent during a full-data backup.
///
/// Clones share the same underlying stream. Once the orchestrator has
/// finished the archive, writes fail.
#[derive(Clone)]
pub struct FullBackupOutput {
    package: String,
    writer: Arc<Mutex<Option<ArchiveWriter<PipeWriter>>>>,
}

impl FullBackupOutput {
    pub(crate) fn new(package: impl Into<String>, writer: ArchiveWriter<PipeWriter>) -> Self {
        Self {
            package: package.into(),
            writer: Arc::new(Mutex::new(Some(writer))),
        }
    }

    /// Package being backed up.
    #[must_use]
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Writes one file record in `domain`.
    pub fn write_file(&self, domain: &str, path: &str, mode: u32, mtime: u64, content: &[u8]) -> CodecResult<()> {
        let info = FileInfo::file(self.package.as_str(), domain, path, content.len() as u64)
            .with_mode(mode)
            .with_mtime(mtime);
        self.write_record(&info, &mut &content[..])
    }

    /// Writes one directory record in `domain`.
    pub fn write_directory(&self, domain: &str, path: &str, mode: u32, mtime: u64) -> CodecResult<()> {
        let info = FileInfo::directory(self.package.as_str(), domain, path)
            .with_mode(mode)
            .with_mtime(mtime);
        self.write_record(&info, &mut std::io::empty())
    }

    /// Writes a record whose content comes from a reader.
    pub fn write_record(&self, info: &FileInfo, content: &mut dyn Read) -> CodecResult<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or_else(|| {
            CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "full backup stream already finished",
            ))
        })?;
        writer.write_file(info, content)
    }

    /// Bytes written to the stream so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.writer.lock().as_ref().map_or(0, ArchiveWriter::bytes_written)
    }

    /// Writes the end-of-archive marker and closes the stream.
    pub(crate) fn finish(&self) -> CodecResult<()> {
        let taken = self.writer.lock().take();
        if let Some(mut writer) = taken {
            writer.finish()?;
        }
        Ok(())
    }

    /// Closes the stream without an end marker.
    pub(crate) fn abandon(&self) {
        self.writer.lock().take();
    }
}

/// An application's backup agent.
///
/// Every call returns immediately; the agent reports the outcome through
/// the [`Completion`] it was given, from any thread.
pub trait BackupAgent: Send + Sync {
    /// Writes key-value data for the current state to `data`, reading the
    /// previous state from `old_state` and recording the new one.
    fn do_backup(&self, old_state: Option<File>, data: File, new_state: File, quota: u64, done: Completion);

    /// Streams the application's files to `output`.
    fn do_full_backup(&self, output: FullBackupOutput, quota: u64, done: Completion);

    /// Restores key-value data written by version `app_version`.
    fn do_restore(&self, data: File, app_version: i64, new_state: File, done: Completion);

    /// Restores one file whose content is read from `source`.
    fn do_restore_file(&self, source: PipeReader, request: RestoreFileRequest, done: Completion);

    /// All data has been delivered.
    fn do_restore_finished(&self, done: Completion);

    /// The last backup exceeded the quota.
    fn do_quota_exceeded(&self, used: u64, quota: u64);

    /// The agent misbehaved and is being shut down.
    fn fail(&self, message: &str);
}

/// Binds applications' agents.
pub trait AgentHost: Send + Sync {
    /// Binds the agent of an installed application. Blocks until the agent
    /// is connected; `None` if it could not be bound.
    fn bind_agent(&self, app: &AppInfo, mode: BindMode) -> Option<Arc<dyn BackupAgent>>;

    /// Releases a binding.
    fn unbind_agent(&self, package: &str);

    /// Kills the application process hosting the agent.
    fn kill_agent_process(&self, package: &str);
}

/// A bound agent, unbound when dropped.
pub struct AgentBinding {
    package: String,
    agent: Arc<dyn BackupAgent>,
    host: Arc<dyn AgentHost>,
}

impl AgentBinding {
    /// Binds the agent of `app`.
    pub fn bind(host: &Arc<dyn AgentHost>, app: &AppInfo, mode: BindMode) -> Option<Self> {
        let agent = host.bind_agent(app, mode)?;
        tracing::debug!(package = %app.package_name, ?mode, "agent bound");
        Some(Self {
            package: app.package_name.clone(),
            agent,
            host: host.clone(),
        })
    }

    /// The bound package.
    #[must_use]
    pub fn package(&self) -> &str {
        &self.package
    }

    /// The agent.
    #[must_use]
    pub fn agent(&self) -> &dyn BackupAgent {
        self.agent.as_ref()
    }

    /// Tells the agent it failed and kills its process. The binding is
    /// released when the value is dropped.
    pub fn fail(&self, message: &str) {
        tracing::warn!(package = %self.package, message, "failing agent");
        self.agent.fail(message);
        self.host.kill_agent_process(&self.package);
    }
}

impl Drop for AgentBinding {
    fn drop(&mut self) {
        tracing::debug!(package = %self.package, "agent unbound");
        self.host.unbind_agent(&self.package);
    }
}

impl std::fmt::Debug for AgentBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBinding")
            .field("package", &self.package)
            .finish()
    }
}
