//! Key-value backup pass.
//!
//! ```text
//! Initial --(queue non-empty)--> RunningQueue --(queue empty)--> Final
//! Initial --(queue empty or transport failure)--> Final
//! ```
//!
//! `RunningQueue` serves one package per step. Agent calls suspend the
//! machine until the registry posts the outcome; nothing blocks the driving
//! thread. A transport failure re-queues the whole original worklist,
//! including packages already stored during this pass.

use crate::agent::{AgentBinding, BindMode};
use crate::bookkeeping::Journal;
use crate::context::{BackupContext, SideChannelDelta};
use crate::error::{CoreError, CoreResult};
use crate::observer::BackupObserver;
use crate::pm_agent::{PmAgent, PM_PACKAGE};
use crate::registry::{Completion, OperationCallback, OperationKind, OperationState};
use crate::state_files::PackageFiles;
use crate::status::{PackageOutcome, PassStatus, TransportStatus};
use crate::task::{Next, Task, TaskEvent};
use crate::transport::BackupFlags;
use appbackup_codec::kv::{self, Entity, KeyValueWriter, WIDGET_KEY};
use std::collections::VecDeque;
use std::fs;
use std::io::Read;
use std::sync::{Arc, Weak};

/// States of a key-value backup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    /// Establishing the dataset and backing up package metadata.
    Initial,
    /// Serving the worklist.
    RunningQueue,
    /// Cleaning up.
    Final,
}

/// Outcome of a finished key-value pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValuePassResult {
    /// Overall status.
    pub status: PassStatus,
    /// Last transport status that decided the pass.
    pub transport_status: TransportStatus,
    /// The pass was cancelled.
    pub cancelled: bool,
    /// The transport's storage was wiped and another pass should run.
    pub rearm: bool,
    /// Per-package results in the order they were reached.
    pub outcomes: Vec<(String, PackageOutcome)>,
}

struct InFlight {
    package: String,
    token: u32,
    quota: u64,
    binding: AgentBinding,
    files: PackageFiles,
}

/// One key-value backup pass over a worklist.
pub struct KeyValueBackupTask {
    ctx: Arc<BackupContext>,
    callback: Weak<dyn OperationCallback>,
    observer: Arc<dyn BackupObserver>,
    state: BackupState,
    original: Vec<String>,
    queue: VecDeque<String>,
    journal: Option<Journal>,
    flags: BackupFlags,
    backup_pm: bool,
    task_token: u32,
    current: Option<InFlight>,
    status: TransportStatus,
    cancel_all: bool,
    outcomes: Vec<(String, PackageOutcome)>,
    result: Option<KeyValuePassResult>,
}

impl KeyValueBackupTask {
    /// Creates a pass over `packages` and registers it for cancellation.
    ///
    /// `journal` is the request journal the worklist was taken from; it is
    /// deleted when the pass ends.
    pub fn new(
        ctx: Arc<BackupContext>,
        callback: Weak<dyn OperationCallback>,
        observer: Arc<dyn BackupObserver>,
        packages: Vec<String>,
        journal: Option<Journal>,
        flags: BackupFlags,
    ) -> CoreResult<Self> {
        let pm_requested = packages.iter().any(|p| p == PM_PACKAGE);
        let queue: VecDeque<String> = packages
            .iter()
            .filter(|p| *p != PM_PACKAGE)
            .cloned()
            .collect();
        let task_token = ctx.registry.generate_token();
        ctx.registry
            .register(task_token, OperationKind::BackupTask, Some(callback.clone()))?;
        tracing::info!(packages = queue.len(), token = task_token, non_incremental = flags.non_incremental, "key-value backup pass created");
        Ok(Self {
            ctx,
            callback,
            observer,
            state: BackupState::Initial,
            original: packages,
            queue,
            journal,
            flags,
            backup_pm: pm_requested || !flags.non_incremental,
            task_token,
            current: None,
            status: TransportStatus::Ok,
            cancel_all: false,
            outcomes: Vec::new(),
            result: None,
        })
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BackupState {
        self.state
    }

    /// Token the pass is registered under.
    #[must_use]
    pub fn token(&self) -> u32 {
        self.task_token
    }

    /// Takes the result once the pass has finished.
    pub fn take_result(&mut self) -> Option<KeyValuePassResult> {
        self.result.take()
    }

    fn transition(&mut self, next: BackupState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "backup state");
            self.state = next;
        }
    }

    fn report(&mut self, package: &str, outcome: PackageOutcome) {
        tracing::info!(package, ?outcome, "package backup result");
        self.outcomes.push((package.to_string(), outcome));
        self.observer.on_result(package, outcome);
    }

    fn cancelled(&self) -> bool {
        self.cancel_all || self.ctx.registry.state(self.task_token) == Some(OperationState::TimedOut)
    }

    /// Puts every package of the original worklist back to pending.
    fn revert_all(&mut self) {
        tracing::warn!(status = ?self.status, packages = self.original.len(), "transport failure, reverting pass");
        if let Err(e) = self.ctx.bookkeeping.lock().requeue(&self.original) {
            tracing::error!(error = %e, "failed to re-queue worklist");
        }
        self.queue.clear();
    }

    fn requeue(&self, package: &str) {
        if let Err(e) = self.ctx.bookkeeping.lock().enqueue(package) {
            tracing::error!(package, error = %e, "failed to re-queue package");
        }
    }

    // Initial

    fn begin(&mut self) -> Next {
        let status = match self.prepare_dataset() {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(error = %e, "package metadata backup failed");
                TransportStatus::Error
            }
        };
        if !status.is_ok() {
            self.status = status;
            self.revert_all();
            self.transition(BackupState::Final);
            return Next::Execute;
        }
        if self.queue.is_empty() {
            self.transition(BackupState::Final);
        } else {
            self.transition(BackupState::RunningQueue);
        }
        Next::Execute
    }

    fn prepare_dataset(&mut self) -> CoreResult<TransportStatus> {
        let state_dir = self.ctx.transport_state_dir();
        let files = PackageFiles::create(&state_dir, &self.ctx.config.data_dir, PM_PACKAGE, "data")?;

        if files.saved_state_is_empty() {
            tracing::info!(transport = %self.ctx.transport.name(), "no package metadata state, initializing transport");
            let status = self.ctx.transport.initialize_device();
            if !status.is_ok() {
                return Ok(status);
            }
            self.backup_pm = true;
        }
        if !self.backup_pm {
            tracing::debug!("skipping package metadata backup");
            return Ok(TransportStatus::Ok);
        }

        let mut old_state = if self.flags.non_incremental {
            None
        } else {
            files.open_saved_state()?
        };
        {
            let mut data = files.open_data_for_write()?;
            let mut new_state = files.open_new_state()?;
            PmAgent::new(self.ctx.packages.clone()).backup(
                old_state.as_mut().map(|f| f as &mut dyn Read),
                &mut data,
                &mut new_state,
            )?;
        }

        let mut status = self
            .ctx
            .transport
            .perform_backup(PM_PACKAGE, &mut files.open_data()?, self.flags);
        if status.is_ok() {
            status = self.ctx.transport.finish_backup();
        }
        if status.is_ok() {
            files.commit()?;
            self.ctx.bookkeeping.lock().mark_stored(PM_PACKAGE)?;
        }
        Ok(status)
    }

    // RunningQueue

    fn run_next(&mut self) -> Next {
        if self.cancelled() {
            self.cancel_all = true;
            self.transition(BackupState::Final);
            return Next::Execute;
        }
        let Some(package) = self.queue.pop_front() else {
            self.transition(BackupState::Final);
            return Next::Execute;
        };

        let Some(app) = self.ctx.packages.package_info(&package) else {
            self.report(&package, PackageOutcome::NotFound);
            return Next::Execute;
        };
        if !app.is_eligible() {
            self.report(&package, PackageOutcome::Rejected);
            return Next::Execute;
        }
        if app.stopped {
            tracing::debug!(package, "package is stopped, skipping key-value backup");
            self.report(&package, PackageOutcome::Rejected);
            return Next::Execute;
        }
        if !app.wants_key_value() {
            tracing::debug!(package, "package wants full-data backup");
            self.report(&package, PackageOutcome::Rejected);
            return Next::Execute;
        }

        let Some(binding) = AgentBinding::bind(&self.ctx.agents, &app, BindMode::Backup) else {
            tracing::warn!(package, "could not bind agent");
            self.requeue(&package);
            self.report(&package, PackageOutcome::AgentFailure);
            return Next::Execute;
        };

        match self.start_agent(&package, binding) {
            Ok(()) => Next::Wait,
            Err(e) => {
                tracing::warn!(package, error = %e, "could not start agent backup");
                self.requeue(&package);
                self.report(&package, PackageOutcome::AgentFailure);
                Next::Execute
            }
        }
    }

    fn start_agent(&mut self, package: &str, binding: AgentBinding) -> CoreResult<()> {
        let files = PackageFiles::create(
            &self.ctx.transport_state_dir(),
            &self.ctx.config.data_dir,
            package,
            "data",
        )?;
        if self.flags.non_incremental {
            files.discard_saved_state()?;
        }
        let old_state = files.open_saved_state()?;
        let data = files.open_data_for_write()?;
        let new_state = files.open_new_state()?;
        let quota = self.ctx.transport.backup_quota(package, false);

        let registry = &self.ctx.registry;
        let token = registry.generate_token();
        registry.prepare(
            token,
            OperationKind::BackupWait,
            self.ctx.config.timeouts.key_value_backup,
            Some(self.callback.clone()),
        )?;
        tracing::debug!(package, token, quota, "invoking agent backup");

        let inflight = self.current.insert(InFlight {
            package: package.to_string(),
            token,
            quota,
            binding,
            files,
        });
        inflight.binding.agent().do_backup(
            old_state,
            data,
            new_state,
            quota,
            Completion::new(token, registry.clone()),
        );
        Ok(())
    }

    fn agent_finished(&mut self) -> Next {
        let Some(inflight) = self.current.take() else {
            return Next::Execute;
        };
        self.ctx.registry.remove(inflight.token);
        let package = inflight.package.clone();

        let data = match self.collect_output(&inflight) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(package, error = %e, "agent output rejected");
                self.requeue(&package);
                self.report(&package, PackageOutcome::AgentFailure);
                return Next::Execute;
            }
        };

        let size = data.len() as u64;
        let mut status = if size == 0 {
            tracing::debug!(package, "no data to send");
            TransportStatus::Ok
        } else {
            self.ctx
                .transport
                .perform_backup(&package, &mut data.as_slice(), self.flags)
        };
        if status.is_ok() && size > 0 {
            status = self.ctx.transport.finish_backup();
        }

        match status {
            TransportStatus::Ok => {
                if let Err(e) = inflight.files.commit() {
                    tracing::error!(package, error = %e, "failed to rotate state file");
                }
                if let Err(e) = self.ctx.bookkeeping.lock().mark_stored(&package) {
                    tracing::warn!(package, error = %e, "failed to record stored package");
                }
                self.report(&package, PackageOutcome::Success);
            }
            TransportStatus::PackageRejected => {
                self.report(&package, PackageOutcome::Rejected);
            }
            TransportStatus::QuotaExceeded => {
                inflight
                    .binding
                    .agent()
                    .do_quota_exceeded(size, inflight.quota);
                self.report(&package, PackageOutcome::QuotaExceeded);
            }
            other => {
                self.status = other;
                drop(inflight);
                self.revert_all();
                self.transition(BackupState::Final);
            }
        }
        Next::Execute
    }

    /// Reads the agent's data, rejecting protected keys, and appends the
    /// side-channel record when it changed.
    fn collect_output(&self, inflight: &InFlight) -> CoreResult<Vec<u8>> {
        let mut data = inflight.files.read_data()?;
        if let Some(key) = kv::find_protected_key(&data)? {
            inflight.binding.fail("illegal backup key");
            return Err(CoreError::agent(
                inflight.package.as_str(),
                format!("agent wrote protected key {key:?}"),
            ));
        }

        let piggyback = match self.ctx.side_channel_delta(&inflight.package) {
            SideChannelDelta::Unchanged => None,
            SideChannelDelta::Changed(blob) => Some(Entity::put(WIDGET_KEY, blob)),
            SideChannelDelta::Removed => Some(Entity::delete(WIDGET_KEY)),
        };
        if let Some(entity) = piggyback {
            let mut writer = KeyValueWriter::new(&mut data);
            writer.write_entity(&entity)?;
            writer.into_inner()?;
            inflight.files.write_data(&data)?;
        }
        Ok(data)
    }

    fn agent_cancelled(&mut self, cancel_all: bool) -> Next {
        if let Some(inflight) = self.current.take() {
            self.ctx.registry.remove(inflight.token);
            tracing::warn!(package = %inflight.package, cancel_all, "agent backup cancelled or timed out");
            self.requeue(&inflight.package);
            let package = inflight.package.clone();
            drop(inflight);
            self.report(&package, PackageOutcome::AgentFailure);
        }
        if cancel_all {
            self.cancel_all = true;
            self.transition(BackupState::Final);
        }
        Next::Execute
    }

    // Final

    fn finish(&mut self) -> Next {
        let cancelled = self.cancelled();
        let never_served: Vec<String> = self.queue.drain(..).collect();
        if !never_served.is_empty() {
            tracing::info!(count = never_served.len(), "re-queuing packages that did not get a turn");
            if let Err(e) = self.ctx.bookkeeping.lock().requeue(&never_served) {
                tracing::error!(error = %e, "failed to re-queue packages");
            }
        }
        if let Some(journal) = self.journal.take() {
            journal.delete();
        }

        if self.status.is_ok() && !cancelled {
            let mut book = self.ctx.bookkeeping.lock();
            if book.current_token() == 0 {
                let token = self.ctx.transport.current_restore_set();
                tracing::info!(token, "first successful pass, recording dataset");
                if let Err(e) = book.set_current_token(token) {
                    tracing::warn!(error = %e, "failed to record dataset token");
                }
            }
        }

        let rearm = self.status == TransportStatus::NotInitialized;
        if rearm {
            tracing::warn!("transport storage was wiped, resetting local state");
            if let Err(e) = self.ctx.bookkeeping.lock().reset_dataset() {
                tracing::error!(error = %e, "failed to reset bookkeeping");
            }
            let state_dir = self.ctx.transport_state_dir();
            if let Err(e) = fs::remove_dir_all(&state_dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %state_dir.display(), error = %e, "failed to wipe transport state");
                }
            }
        }

        self.ctx.registry.remove(self.task_token);
        let status = if cancelled {
            PassStatus::Cancelled
        } else {
            PassStatus::from(self.status)
        };
        tracing::info!(?status, packages = self.outcomes.len(), "key-value backup pass finished");
        self.result = Some(KeyValuePassResult {
            status,
            transport_status: self.status,
            cancelled,
            rearm,
            outcomes: std::mem::take(&mut self.outcomes),
        });
        Next::Finished
    }
}

impl Task for KeyValueBackupTask {
    fn name(&self) -> &'static str {
        "key-value-backup"
    }

    fn step(&mut self, event: TaskEvent) -> Next {
        match event {
            TaskEvent::Execute => match self.state {
                BackupState::Initial => self.begin(),
                BackupState::RunningQueue => self.run_next(),
                BackupState::Final => self.finish(),
            },
            TaskEvent::OperationComplete { token, .. } => {
                if self.current.as_ref().is_some_and(|c| c.token == token) {
                    self.agent_finished()
                } else {
                    tracing::debug!(token, "stale completion ignored");
                    self.resume()
                }
            }
            TaskEvent::Cancel { token, cancel_all } => {
                if token == self.task_token {
                    self.agent_cancelled(true)
                } else if self.current.as_ref().is_some_and(|c| c.token == token) {
                    self.agent_cancelled(cancel_all)
                } else {
                    tracing::debug!(token, "stale cancel ignored");
                    self.resume()
                }
            }
        }
    }
}

impl KeyValueBackupTask {
    fn resume(&self) -> Next {
        if self.current.is_some() {
            Next::Wait
        } else {
            Next::Execute
        }
    }
}
