//! Full-data backup phase.
//!
//! Runs after a key-value pass on its own thread and blocks on every agent
//! round-trip. For each package a producer writes the archive (manifest,
//! optional metadata and package file, then the agent's own records) into
//! an in-memory pipe while a consumer forwards the pipe to the transport
//! and enforces the package's quota.

use crate::agent::{AgentBinding, BindMode, FullBackupOutput};
use crate::context::{BackupContext, SideChannelDelta};
use crate::error::CoreResult;
use crate::observer::BackupObserver;
use crate::pipe::{pipe, PipeCloser, PipeReader, PipeWriter};
use crate::registry::{Completion, OperationCallback, OperationKind, OperationRegistry};
use crate::status::{PackageOutcome, PassStatus, TransportStatus};
use crate::transport::{BackupFlags, Transport};
use crate::bookkeeping::now_millis;
use appbackup_codec::path::SHARED_STORAGE_PACKAGE;
use appbackup_codec::{AppInfo, ArchiveWriter, Manifest, MetadataRecord};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const SEND_CHUNK: usize = 32 * 1024;

/// Outcome of a full-data phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullPassResult {
    /// Overall status.
    pub status: PassStatus,
    /// Per-package results in the order they were reached.
    pub outcomes: Vec<(String, PackageOutcome)>,
}

/// Cancels the phase and the agent call in flight.
struct PhaseCancel {
    registry: OperationRegistry,
    cancelled: AtomicBool,
    current: Mutex<Option<u32>>,
}

impl OperationCallback for PhaseCancel {
    fn operation_complete(&self, _token: u32, _result: i64) {}

    fn handle_cancel(&self, token: u32, _cancel_all: bool) {
        tracing::info!(token, "full-data backup phase cancelled");
        self.cancelled.store(true, Ordering::SeqCst);
        let current = *self.current.lock();
        if let Some(current) = current {
            self.registry.cancel(current, true);
        }
    }
}

enum Step {
    Done(PackageOutcome),
    Abort(TransportStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Complete,
    QuotaExceeded,
    Transport(TransportStatus),
    Aborted,
}

/// Schedules every installed package that wants full-data backup and
/// drops packages that are gone.
pub fn refresh_full_queue(ctx: &BackupContext) -> CoreResult<()> {
    let installed = ctx.packages.installed_packages();
    let mut book = ctx.bookkeeping.lock();
    let stale: Vec<String> = book
        .full_queue()
        .iter()
        .filter(|e| !installed.iter().any(|a| a.package_name == e.package_name))
        .map(|e| e.package_name.clone())
        .collect();
    for package in stale {
        book.unschedule_full(&package)?;
    }
    for app in installed
        .iter()
        .filter(|a| a.is_eligible() && a.wants_full_backup())
    {
        book.schedule_full(&app.package_name, 0)?;
    }
    Ok(())
}

/// Packages due for full-data backup, least recently backed up first.
#[must_use]
pub fn full_backup_candidates(ctx: &BackupContext) -> Vec<String> {
    ctx.bookkeeping
        .lock()
        .full_queue()
        .iter()
        .map(|e| e.package_name.clone())
        .collect()
}

/// A full-data backup phase over a list of packages.
pub struct FullBackupPhase {
    ctx: Arc<BackupContext>,
    observer: Arc<dyn BackupObserver>,
    flags: BackupFlags,
    cancel: Arc<PhaseCancel>,
}

impl FullBackupPhase {
    /// Creates a phase.
    #[must_use]
    pub fn new(ctx: Arc<BackupContext>, observer: Arc<dyn BackupObserver>, flags: BackupFlags) -> Self {
        let cancel = Arc::new(PhaseCancel {
            registry: ctx.registry.clone(),
            cancelled: AtomicBool::new(false),
            current: Mutex::new(None),
        });
        Self {
            ctx,
            observer,
            flags,
            cancel,
        }
    }

    /// Backs up `packages` in order. Blocks until done.
    pub fn run(&self, packages: &[String]) -> FullPassResult {
        let registry = &self.ctx.registry;
        let token = registry.generate_token();
        let callback: Arc<dyn OperationCallback> = self.cancel.clone();
        if let Err(e) = registry.register(token, OperationKind::BackupTask, Some(Arc::downgrade(&callback))) {
            tracing::error!(error = %e, "could not register full-data phase");
            return FullPassResult {
                status: PassStatus::TransportError,
                outcomes: Vec::new(),
            };
        }
        tracing::info!(packages = packages.len(), token, "full-data backup phase started");

        let mut status = PassStatus::Ok;
        let mut outcomes = Vec::new();
        for package in packages {
            if self.cancel.cancelled.load(Ordering::SeqCst) {
                status = PassStatus::Cancelled;
                break;
            }
            let outcome = match self.ctx.packages.package_info(package) {
                None => PackageOutcome::NotFound,
                Some(app) if !app.is_eligible() || !app.wants_full_backup() || app.stopped => {
                    PackageOutcome::Rejected
                }
                Some(app) => match self.backup_one(&app) {
                    Step::Done(outcome) => outcome,
                    Step::Abort(transport_status) => {
                        tracing::warn!(package, status = ?transport_status, "transport failure, aborting full-data phase");
                        status = PassStatus::TransportError;
                        break;
                    }
                },
            };
            tracing::info!(package, ?outcome, "package full-data backup result");
            self.observer.on_result(package, outcome);
            outcomes.push((package.clone(), outcome));
        }
        if status == PassStatus::Ok && self.cancel.cancelled.load(Ordering::SeqCst) {
            status = PassStatus::Cancelled;
        }
        registry.remove(token);
        tracing::info!(?status, "full-data backup phase finished");
        FullPassResult { status, outcomes }
    }

    fn backup_one(&self, app: &AppInfo) -> Step {
        let package = app.package_name.as_str();
        let transport = self.ctx.transport.as_ref();

        match transport.perform_full_backup(package, self.flags) {
            TransportStatus::Ok => {}
            TransportStatus::PackageRejected => return Step::Done(PackageOutcome::Rejected),
            other => return Step::Abort(other),
        }
        let quota = transport.backup_quota(package, true);

        let Some(binding) = AgentBinding::bind(&self.ctx.agents, app, BindMode::FullBackup) else {
            tracing::warn!(package, "could not bind agent");
            transport.cancel_full_backup();
            return Step::Done(PackageOutcome::AgentFailure);
        };

        let (writer, reader) = pipe(self.ctx.config.pipe_capacity);
        let closer = writer.closer();
        let (produced, sent) = thread::scope(|scope| {
            let consumer = scope.spawn(move || send_stream(transport, reader, quota, &closer));
            let produced = self.produce(app, writer, &binding, quota);
            let sent = consumer
                .join()
                .unwrap_or((0, SendOutcome::Transport(TransportStatus::Error)));
            (produced, sent)
        });
        let (bytes, outcome) = sent;
        tracing::debug!(package, bytes, ?outcome, "full-data stream sent");

        match outcome {
            SendOutcome::QuotaExceeded => {
                transport.cancel_full_backup();
                binding.agent().do_quota_exceeded(bytes, quota);
                return Step::Done(PackageOutcome::QuotaExceeded);
            }
            SendOutcome::Transport(TransportStatus::PackageRejected) => {
                transport.cancel_full_backup();
                return Step::Done(PackageOutcome::Rejected);
            }
            SendOutcome::Transport(status) => {
                transport.cancel_full_backup();
                return Step::Abort(status);
            }
            SendOutcome::Aborted | SendOutcome::Complete => {}
        }

        match produced {
            Ok(true) if outcome == SendOutcome::Complete => {}
            Ok(_) => {
                tracing::warn!(package, "agent did not finish full-data backup");
                transport.cancel_full_backup();
                return Step::Done(PackageOutcome::AgentFailure);
            }
            Err(e) => {
                tracing::warn!(package, error = %e, "full-data backup stream failed");
                transport.cancel_full_backup();
                return Step::Done(PackageOutcome::AgentFailure);
            }
        }

        match transport.check_full_backup_size(bytes) {
            TransportStatus::Ok => {}
            TransportStatus::QuotaExceeded => {
                transport.cancel_full_backup();
                binding.agent().do_quota_exceeded(bytes, quota);
                return Step::Done(PackageOutcome::QuotaExceeded);
            }
            TransportStatus::PackageRejected => {
                transport.cancel_full_backup();
                return Step::Done(PackageOutcome::Rejected);
            }
            other => {
                transport.cancel_full_backup();
                return Step::Abort(other);
            }
        }

        match transport.finish_backup() {
            TransportStatus::Ok => {
                let mut book = self.ctx.bookkeeping.lock();
                if let Err(e) = book.mark_full_backed_up(package, now_millis()) {
                    tracing::warn!(package, error = %e, "failed to update full-data schedule");
                }
                if let Err(e) = book.mark_stored(package) {
                    tracing::warn!(package, error = %e, "failed to record stored package");
                }
                Step::Done(PackageOutcome::Success)
            }
            TransportStatus::PackageRejected => Step::Done(PackageOutcome::Rejected),
            other => Step::Abort(other),
        }
    }

    /// Writes the archive for `app` into `writer`. Returns whether the
    /// agent acknowledged its part before the deadline.
    fn produce(&self, app: &AppInfo, writer: PipeWriter, binding: &AgentBinding, quota: u64) -> CoreResult<bool> {
        let package = app.package_name.as_str();
        let packages = &self.ctx.packages;
        let mut archive = ArchiveWriter::new(writer);

        let apk = if self.ctx.config.include_apks {
            packages.package_file(package)
        } else {
            None
        };
        let mut manifest = Manifest::new(package, app.version_code, packages.platform_version())
            .with_signatures(app.signatures.clone())
            .with_apk(apk.is_some());
        if let Some(installer) = &app.installer {
            manifest = manifest.with_installer(installer.as_str());
        }
        archive.write_manifest(&manifest)?;

        if let SideChannelDelta::Changed(blob) = self.ctx.side_channel_delta(package) {
            archive.write_metadata(&MetadataRecord::with_widget_state(package, blob))?;
        }
        if let Some(path) = apk {
            let mut file = File::open(&path)?;
            let size = file.metadata()?.len();
            archive.write_apk(package, size, &mut file)?;
        }

        let output = FullBackupOutput::new(package, archive);
        let registry = &self.ctx.registry;
        let token = registry.generate_token();
        let timeout = if package == SHARED_STORAGE_PACKAGE {
            self.ctx.config.timeouts.shared_backup
        } else {
            self.ctx.config.timeouts.full_backup
        };
        registry.prepare(token, OperationKind::BackupWait, timeout, None)?;
        *self.cancel.current.lock() = Some(token);
        tracing::debug!(package, token, quota, "invoking agent full-data backup");
        binding
            .agent()
            .do_full_backup(output.clone(), quota, Completion::new(token, registry.clone()));
        let acknowledged = registry.block_until_complete(token);
        *self.cancel.current.lock() = None;

        if acknowledged {
            output.finish()?;
        } else {
            output.abandon();
        }
        Ok(acknowledged)
    }
}

/// Forwards the pipe to the transport. Returns bytes read and how the
/// stream ended.
fn send_stream(transport: &dyn Transport, mut reader: PipeReader, quota: u64, closer: &PipeCloser) -> (u64, SendOutcome) {
    let mut buf = vec![0u8; SEND_CHUNK];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return (total, SendOutcome::Complete),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(error = %e, "full-data stream aborted");
                return (total, SendOutcome::Aborted);
            }
        };
        total += n as u64;
        if total > quota {
            tracing::warn!(total, quota, "full-data backup exceeds quota");
            closer.abort();
            return (total, SendOutcome::QuotaExceeded);
        }
        let status = transport.send_backup_data(&buf[..n]);
        if !status.is_ok() {
            closer.abort();
            return (total, SendOutcome::Transport(status));
        }
    }
}
