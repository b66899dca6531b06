//! The backup service and its worker thread.
//!
//! One worker drives every key-value pass and restore session, one at a
//! time, in the order they were requested. A key-value pass that succeeds
//! hands off to a full-data phase on its own thread, and the service
//! counts as busy until that phase ends too.

use crate::context::BackupContext;
use crate::error::{CoreError, CoreResult};
use crate::full_backup::{full_backup_candidates, refresh_full_queue, FullBackupPhase};
use crate::kv_backup::KeyValueBackupTask;
use crate::observer::{BackupObserver, NoopObserver};
use crate::registry::OperationKind;
use crate::restore::RestoreParams;
use crate::restore::RestoreTask;
use crate::status::PassStatus;
use crate::task::{drive_task, TaskMailbox};
use crate::transport::BackupFlags;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

enum Command {
    BackupPass {
        observer: Arc<dyn BackupObserver>,
        flags: BackupFlags,
    },
    Restore(RestoreParams),
    Shutdown,
}

/// Counters shared between the service handle and its threads.
#[derive(Default)]
struct Shared {
    backup_running: AtomicBool,
    queued_restores: AtomicUsize,
}

/// Runs backup passes and restore sessions on a dedicated worker.
pub struct BackupService {
    ctx: Arc<BackupContext>,
    tx: Sender<Command>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackupService {
    /// Starts the worker.
    pub fn start(ctx: BackupContext) -> CoreResult<Self> {
        let ctx = Arc::new(ctx);
        let shared = Arc::new(Shared::default());
        let (tx, rx) = mpsc::channel();
        let worker = Worker {
            ctx: ctx.clone(),
            shared: shared.clone(),
            tx: tx.clone(),
        };
        let handle = thread::Builder::new()
            .name("appbackup-worker".into())
            .spawn(move || worker.run(rx))?;
        tracing::info!(transport = %ctx.transport.name(), "backup service started");
        Ok(Self {
            ctx,
            tx,
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Shared collaborators.
    #[must_use]
    pub fn context(&self) -> &Arc<BackupContext> {
        &self.ctx
    }

    /// Asks for a key-value backup of `package` on the next pass. Returns
    /// false if the package cannot be backed up that way.
    pub fn request_backup(&self, package: &str) -> CoreResult<bool> {
        let Some(app) = self.ctx.packages.package_info(package) else {
            tracing::debug!(package, "backup requested for unknown package");
            return Ok(false);
        };
        if !app.is_eligible() || !app.wants_key_value() {
            tracing::debug!(package, "backup requested for ineligible package");
            return Ok(false);
        }
        let queued = self.ctx.bookkeeping.lock().enqueue(package)?;
        if queued {
            tracing::debug!(package, "backup requested");
        }
        Ok(true)
    }

    /// Starts a backup pass over the pending requests.
    ///
    /// Fails with [`CoreError::PassInProgress`] while a key-value pass or
    /// its full-data phase is still running.
    pub fn run_backup_pass(&self, observer: Arc<dyn BackupObserver>) -> CoreResult<()> {
        self.run_backup_pass_with(observer, BackupFlags::default())
    }

    /// Same as [`run_backup_pass`](Self::run_backup_pass) with explicit flags.
    pub fn run_backup_pass_with(&self, observer: Arc<dyn BackupObserver>, flags: BackupFlags) -> CoreResult<()> {
        if self
            .shared
            .backup_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::PassInProgress);
        }
        if self.tx.send(Command::BackupPass { observer, flags }).is_err() {
            self.shared.backup_running.store(false, Ordering::SeqCst);
            return Err(CoreError::ServiceStopped);
        }
        Ok(())
    }

    /// Queues a restore session. Sessions run one after another.
    pub fn begin_restore(&self, params: RestoreParams) -> CoreResult<()> {
        self.shared.queued_restores.fetch_add(1, Ordering::SeqCst);
        tracing::info!(token = params.token, "restore session queued");
        if self.tx.send(Command::Restore(params)).is_err() {
            self.shared.queued_restores.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::ServiceStopped);
        }
        Ok(())
    }

    /// Restores a package that is being installed, releasing the install
    /// once the session ends.
    ///
    /// Data comes from the current dataset if this device ever stored the
    /// package, otherwise from the dataset the device was set up from if
    /// that dataset carried it. With neither, the install is released at
    /// once. Returns true if a session was queued.
    pub fn restore_at_install(&self, package: &str, install_token: u32) -> CoreResult<bool> {
        let token = {
            let book = self.ctx.bookkeeping.lock();
            let (ancestral, offered) = book.ancestral();
            if book.ever_stored(package) && book.current_token() != 0 {
                Some(book.current_token())
            } else if ancestral != 0 && offered.contains(package) {
                Some(ancestral)
            } else {
                None
            }
        };

        let Some(token) = token else {
            tracing::debug!(package, install_token, "no dataset holds package, releasing install");
            self.ctx.packages.finish_package_install(install_token, false);
            return Ok(false);
        };
        tracing::info!(package, install_token, token, "restoring at install");
        let params = RestoreParams::new(token, Arc::new(NoopObserver)).for_install(package, install_token);
        if let Err(e) = self.begin_restore(params) {
            self.ctx.packages.finish_package_install(install_token, false);
            return Err(e);
        }
        Ok(true)
    }

    /// Cancels every running backup pass. Returns how many were cancelled.
    pub fn cancel_backups(&self) -> usize {
        let cancelled = self
            .ctx
            .registry
            .cancel_all_of_kind(OperationKind::BackupTask, true);
        tracing::info!(cancelled, "backup cancellation requested");
        cancelled
    }

    /// Returns true while a key-value pass or its full-data phase runs.
    #[must_use]
    pub fn is_backup_running(&self) -> bool {
        self.shared.backup_running.load(Ordering::SeqCst)
    }

    /// Restore sessions queued or running.
    #[must_use]
    pub fn queued_restores(&self) -> usize {
        self.shared.queued_restores.load(Ordering::SeqCst)
    }

    /// How long the transport wants to wait before the next pass.
    #[must_use]
    pub fn next_pass_delay(&self) -> Duration {
        self.ctx.transport.request_backup_time()
    }

    /// Stops the worker after the work already queued. Idempotent.
    pub fn shutdown(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        let _ = self.tx.send(Command::Shutdown);
        if handle.join().is_err() {
            tracing::error!("backup worker panicked");
        }
        tracing::info!("backup service stopped");
    }
}

impl Drop for BackupService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    ctx: Arc<BackupContext>,
    shared: Arc<Shared>,
    tx: Sender<Command>,
}

impl Worker {
    fn run(self, rx: Receiver<Command>) {
        while let Ok(command) = rx.recv() {
            match command {
                Command::BackupPass { observer, flags } => self.backup_pass(observer, flags),
                Command::Restore(params) => {
                    self.restore(params);
                    self.shared.queued_restores.fetch_sub(1, Ordering::SeqCst);
                }
                Command::Shutdown => break,
            }
        }
        tracing::debug!("backup worker exiting");
    }

    fn backup_pass(&self, observer: Arc<dyn BackupObserver>, flags: BackupFlags) {
        let (packages, journal) = self.ctx.bookkeeping.lock().take_pending();
        let mailbox = TaskMailbox::new();
        let mut task = match KeyValueBackupTask::new(
            self.ctx.clone(),
            mailbox.callback(),
            observer.clone(),
            packages,
            journal,
            flags,
        ) {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(error = %e, "could not start backup pass");
                self.end_backup(observer.as_ref(), PassStatus::TransportError);
                return;
            }
        };
        drive_task(&mut task, &mailbox);
        let Some(result) = task.take_result() else {
            self.end_backup(observer.as_ref(), PassStatus::TransportError);
            return;
        };

        if result.rearm {
            tracing::info!("re-arming backup pass after transport reset");
            if self
                .tx
                .send(Command::BackupPass { observer: observer.clone(), flags })
                .is_err()
            {
                self.end_backup(observer.as_ref(), result.status);
            }
            return;
        }
        if result.status != PassStatus::Ok {
            self.end_backup(observer.as_ref(), result.status);
            return;
        }
        self.hand_off_full(observer, flags);
    }

    fn hand_off_full(&self, observer: Arc<dyn BackupObserver>, flags: BackupFlags) {
        if let Err(e) = refresh_full_queue(&self.ctx) {
            tracing::warn!(error = %e, "failed to refresh full-data schedule");
        }
        let packages = full_backup_candidates(&self.ctx);
        if packages.is_empty() {
            self.end_backup(observer.as_ref(), PassStatus::Ok);
            return;
        }
        let ctx = self.ctx.clone();
        let shared = self.shared.clone();
        let phase_observer = observer.clone();
        let spawned = thread::Builder::new()
            .name("appbackup-full-backup".into())
            .spawn(move || {
                let result = FullBackupPhase::new(ctx, phase_observer.clone(), flags).run(&packages);
                shared.backup_running.store(false, Ordering::SeqCst);
                phase_observer.backup_finished(result.status);
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "could not start full-data phase");
            self.end_backup(observer.as_ref(), PassStatus::Ok);
        }
    }

    fn end_backup(&self, observer: &dyn BackupObserver, status: PassStatus) {
        self.shared.backup_running.store(false, Ordering::SeqCst);
        observer.backup_finished(status);
    }

    fn restore(&self, params: RestoreParams) {
        let mailbox = TaskMailbox::new();
        let mut task = RestoreTask::new(self.ctx.clone(), mailbox.callback(), params);
        drive_task(&mut task, &mailbox);
        if let Some(result) = task.take_result() {
            tracing::debug!(status = ?result.status, restored = result.restored.len(), "restore session done");
        }
    }
}
