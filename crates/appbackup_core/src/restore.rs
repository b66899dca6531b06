//! Restore session.
//!
//! ```text
//! Initial -> RunningQueue -> {RestoreKeyValue | RestoreFull} -> RestoreFinished -> RunningQueue -> ... -> Final
//! ```
//!
//! The transport decides the order of packages. Key-value packages are
//! handed to their agent as one blob; full-data packages are streamed
//! through a feeder thread and a decode thread joined by a pipe while the
//! machine waits on a registry token.

use crate::agent::{AgentBinding, BindMode};
use crate::context::BackupContext;
use crate::error::{CoreError, CoreResult};
use crate::full_restore::{FullRestoreEngine, RestoreSummary};
use crate::observer::RestoreObserver;
use crate::pipe::{pipe, PipeCloser, PipeWriter, TrackedWriter};
use crate::pm_agent::{PmAgent, RestoreMetadata, PM_PACKAGE};
use crate::registry::{Completion, OperationCallback, OperationKind};
use crate::state_files::PackageFiles;
use crate::status::PassStatus;
use crate::task::{Next, Task, TaskEvent};
use crate::transport::{DataType, FullRestoreChunk, NextPackage, Transport};
use appbackup_codec::kv::split_side_channel;
use appbackup_codec::{signature_hashes_match, AppInfo, RestorePolicy};
use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// States of a restore session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    /// Starting the session and reading package metadata.
    Initial,
    /// Asking the transport for the next package.
    RunningQueue,
    /// Handing a key-value blob to an agent.
    RestoreKeyValue,
    /// Streaming a full-data archive to an agent.
    RestoreFull,
    /// Telling the agent its restore is over.
    RestoreFinished,
    /// Cleaning up.
    Final,
}

/// What to restore and for whom.
#[derive(Clone)]
pub struct RestoreParams {
    /// Dataset to restore from.
    pub token: u64,
    /// Packages to restore. `None` restores every eligible installed package.
    pub packages: Option<Vec<String>>,
    /// The session restores a whole device; the dataset's package set is
    /// recorded as the ancestral set on success.
    pub whole_device: bool,
    /// Install session waiting on this restore.
    pub install_token: Option<u32>,
    /// Progress observer.
    pub observer: Arc<dyn RestoreObserver>,
}

impl RestoreParams {
    /// Restores every eligible installed package from `token`.
    #[must_use]
    pub fn new(token: u64, observer: Arc<dyn RestoreObserver>) -> Self {
        Self {
            token,
            packages: None,
            whole_device: false,
            install_token: None,
            observer,
        }
    }

    /// Restricts the session to `packages`.
    #[must_use]
    pub fn with_packages(mut self, packages: Vec<String>) -> Self {
        self.packages = Some(packages);
        self
    }

    /// Marks the session as a whole-device restore.
    #[must_use]
    pub fn whole_device(mut self) -> Self {
        self.whole_device = true;
        self
    }

    /// Restores one freshly installed package and reports back to the
    /// package manager when done.
    #[must_use]
    pub fn for_install(mut self, package: impl Into<String>, install_token: u32) -> Self {
        self.packages = Some(vec![package.into()]);
        self.install_token = Some(install_token);
        self
    }
}

impl std::fmt::Debug for RestoreParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreParams")
            .field("token", &self.token)
            .field("packages", &self.packages)
            .field("whole_device", &self.whole_device)
            .field("install_token", &self.install_token)
            .finish_non_exhaustive()
    }
}

/// Outcome of a restore session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePassResult {
    /// Overall status.
    pub status: PassStatus,
    /// Packages whose restore reached its finish step.
    pub restored: Vec<String>,
    /// Packages the transport offered.
    pub offered: Vec<String>,
    /// States visited, without consecutive repeats.
    pub history: Vec<RestoreState>,
}

struct Current {
    package: String,
    app: AppInfo,
    version_code: i64,
    signature_hashes: Vec<[u8; 32]>,
    data_type: DataType,
}

/// A key-value restore waiting on its agent.
struct KeyValueWait {
    token: u32,
    binding: AgentBinding,
    _files: PackageFiles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedOutcome {
    Complete,
    Rejected,
    TransportFailed,
    ConsumerGone,
}

/// A full-data restore in progress on its two threads.
struct FullStream {
    token: u32,
    closer: PipeCloser,
    engine: JoinHandle<CoreResult<RestoreSummary>>,
    feeder: JoinHandle<FeedOutcome>,
}

/// Completes the full-stream token however the engine thread exits,
/// unwinding included.
struct SignalOnExit(Completion);

impl Drop for SignalOnExit {
    fn drop(&mut self) {
        self.0.complete(0);
    }
}

/// One restore session.
pub struct RestoreTask {
    ctx: Arc<BackupContext>,
    callback: Weak<dyn OperationCallback>,
    params: RestoreParams,
    state: RestoreState,
    history: Vec<RestoreState>,
    metadata: RestoreMetadata,
    index: usize,
    offered: Vec<String>,
    restored: Vec<String>,
    current: Option<Current>,
    key_value: Option<KeyValueWait>,
    full: Option<FullStream>,
    finishing: Option<(u32, AgentBinding)>,
    status: PassStatus,
    result: Option<RestorePassResult>,
}

impl RestoreTask {
    /// Creates a session. Nothing happens until it is driven.
    #[must_use]
    pub fn new(ctx: Arc<BackupContext>, callback: Weak<dyn OperationCallback>, params: RestoreParams) -> Self {
        Self {
            ctx,
            callback,
            params,
            state: RestoreState::Initial,
            history: vec![RestoreState::Initial],
            metadata: RestoreMetadata::default(),
            index: 0,
            offered: Vec::new(),
            restored: Vec::new(),
            current: None,
            key_value: None,
            full: None,
            finishing: None,
            status: PassStatus::Ok,
            result: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RestoreState {
        self.state
    }

    /// States visited so far.
    #[must_use]
    pub fn history(&self) -> &[RestoreState] {
        &self.history
    }

    /// Takes the result once the session has finished.
    pub fn take_result(&mut self) -> Option<RestorePassResult> {
        self.result.take()
    }

    fn transition(&mut self, next: RestoreState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "restore state");
            self.state = next;
            self.history.push(next);
        }
    }

    fn fail_session(&mut self, reason: &str) -> Next {
        tracing::error!(reason, "restore session failed");
        self.status = PassStatus::TransportError;
        self.transition(RestoreState::Final);
        Next::Execute
    }

    // Initial

    fn accept_set(&self) -> Vec<String> {
        let mut set = vec![PM_PACKAGE.to_string()];
        let requested: Vec<String> = match &self.params.packages {
            Some(packages) => packages.clone(),
            None => self
                .ctx
                .packages
                .installed_packages()
                .into_iter()
                .filter(AppInfo::is_eligible)
                .map(|app| app.package_name)
                .collect(),
        };
        for package in requested {
            if !set.contains(&package) {
                set.push(package);
            }
        }
        set
    }

    fn begin(&mut self) -> Next {
        let accept_set = self.accept_set();
        tracing::info!(token = self.params.token, packages = accept_set.len() - 1, "restore session starting");
        self.params.observer.restore_starting(accept_set.len() - 1);

        let transport = self.ctx.transport.clone();
        if !transport.start_restore(self.params.token, &accept_set).is_ok() {
            return self.fail_session("transport refused to start restore");
        }
        match transport.next_restore_package() {
            NextPackage::Package(desc) if desc.package_name == PM_PACKAGE => {}
            other => {
                tracing::warn!(?other, "dataset does not start with package metadata");
                return self.fail_session("missing package metadata");
            }
        }
        let mut blob = Vec::new();
        if !transport.restore_data(&mut blob).is_ok() {
            return self.fail_session("could not read package metadata");
        }
        match PmAgent::restore(&blob) {
            Ok(metadata) => {
                tracing::debug!(platform = metadata.platform_version, packages = metadata.packages.len(), "package metadata restored");
                self.metadata = metadata;
            }
            Err(e) => {
                tracing::warn!(error = %e, "unusable package metadata");
                return self.fail_session("unusable package metadata");
            }
        }
        self.transition(RestoreState::RunningQueue);
        Next::Execute
    }

    // RunningQueue

    fn next_package(&mut self) -> Next {
        let desc = match self.ctx.transport.next_restore_package() {
            NextPackage::NoMorePackages => {
                tracing::info!("no more packages to restore");
                self.transition(RestoreState::Final);
                return Next::Execute;
            }
            NextPackage::Error => return self.fail_session("transport failed to name the next package"),
            NextPackage::Package(desc) => desc,
        };
        let package = desc.package_name;
        self.index += 1;
        self.params.observer.on_update(self.index, &package);
        if package != PM_PACKAGE {
            self.offered.push(package.clone());
        }

        let Some(metadata) = self.metadata.get(&package) else {
            tracing::info!(package, "no metadata for package, skipping");
            return Next::Execute;
        };
        let Some(app) = self.ctx.packages.package_info(&package) else {
            tracing::info!(package, "package not installed, skipping");
            return Next::Execute;
        };
        if metadata.version_code > app.version_code && !app.restore_any_version {
            tracing::info!(package, stored = metadata.version_code, installed = app.version_code, "dataset is from a newer version, skipping");
            return Next::Execute;
        }

        self.current = Some(Current {
            package,
            version_code: metadata.version_code,
            signature_hashes: metadata.signature_hashes.clone(),
            data_type: desc.data_type,
            app,
        });
        match desc.data_type {
            DataType::KeyValue => self.transition(RestoreState::RestoreKeyValue),
            DataType::Full => self.transition(RestoreState::RestoreFull),
        }
        Next::Execute
    }

    // RestoreKeyValue

    fn start_key_value(&mut self) -> Next {
        let Some(current) = self.current.as_ref() else {
            self.transition(RestoreState::RunningQueue);
            return Next::Execute;
        };
        let package = current.package.clone();
        if !current.app.has_agent {
            tracing::warn!(package, "package has no agent, skipping key-value restore");
            return self.skip_current();
        }
        if !signature_hashes_match(&current.signature_hashes, &current.app) {
            tracing::warn!(package, "signature mismatch, skipping key-value restore");
            return self.skip_current();
        }
        let Some(binding) = AgentBinding::bind(&self.ctx.agents, &current.app, BindMode::Restore) else {
            tracing::warn!(package, "could not bind agent for restore");
            return self.skip_current();
        };
        let version = current.version_code;

        match self.begin_key_value(&package, binding, version) {
            Ok(true) => Next::Wait,
            Ok(false) => self.fail_session("transport failed to deliver key-value data"),
            Err(e) => {
                tracing::warn!(package, error = %e, "key-value restore failed");
                self.ctx.clear_app_data(&package);
                self.skip_current()
            }
        }
    }

    /// Fetches the blob and hands it to the agent. `Ok(false)` is a
    /// transport failure.
    fn begin_key_value(&mut self, package: &str, binding: AgentBinding, version: i64) -> CoreResult<bool> {
        let files = PackageFiles::create(
            &self.ctx.transport_state_dir(),
            &self.ctx.config.data_dir,
            package,
            "restore",
        )?;
        {
            let mut sink = files.open_data_for_write()?;
            if !self.ctx.transport.restore_data(&mut sink).is_ok() {
                return Ok(false);
            }
        }
        let (side_channel, rest) = split_side_channel(&files.read_data()?)?;
        if let Some(blob) = side_channel {
            tracing::debug!(package, len = blob.len(), "restoring side-channel state");
            self.ctx.side_channel.restore(package, &blob);
            files.write_data(&rest)?;
        }

        let registry = &self.ctx.registry;
        let token = registry.generate_token();
        registry.prepare(
            token,
            OperationKind::RestoreWait,
            self.ctx.config.timeouts.restore,
            Some(self.callback.clone()),
        )?;
        tracing::debug!(package, token, version, "invoking agent restore");
        binding.agent().do_restore(
            files.open_data()?,
            version,
            files.open_new_state()?,
            Completion::new(token, registry.clone()),
        );
        self.key_value = Some(KeyValueWait {
            token,
            binding,
            _files: files,
        });
        Ok(true)
    }

    fn key_value_done(&mut self, acknowledged: bool) -> Next {
        let Some(wait) = self.key_value.take() else {
            return Next::Execute;
        };
        self.ctx.registry.remove(wait.token);
        if acknowledged {
            self.enter_finished(wait.binding)
        } else {
            let package = wait.binding.package().to_string();
            tracing::warn!(package, "key-value restore timed out or was cancelled");
            drop(wait);
            self.ctx.clear_app_data(&package);
            self.skip_current()
        }
    }

    fn skip_current(&mut self) -> Next {
        self.current = None;
        self.transition(RestoreState::RunningQueue);
        Next::Execute
    }

    // RestoreFull

    fn start_full(&mut self) -> Next {
        let Some(package) = self.current.as_ref().map(|c| c.package.clone()) else {
            self.transition(RestoreState::RunningQueue);
            return Next::Execute;
        };
        match self.spawn_full(&package) {
            Ok(stream) => {
                self.full = Some(stream);
                Next::Wait
            }
            Err(e) => {
                tracing::error!(package, error = %e, "could not start full-data restore");
                self.ctx.clear_app_data(&package);
                self.skip_current()
            }
        }
    }

    fn spawn_full(&self, package: &str) -> CoreResult<FullStream> {
        let registry = &self.ctx.registry;
        let token = registry.generate_token();
        registry.prepare(
            token,
            OperationKind::RestoreWait,
            self.ctx.config.timeouts.full_restore,
            Some(self.callback.clone()),
        )?;

        let (writer, reader) = pipe(self.ctx.config.pipe_capacity);
        let closer = writer.closer();

        let transport = self.ctx.transport.clone();
        let feeder = match thread::Builder::new()
            .name("appbackup-restore-feeder".into())
            .spawn(move || feed(transport.as_ref(), writer))
        {
            Ok(handle) => handle,
            Err(e) => {
                registry.remove(token);
                return Err(e.into());
            }
        };

        let engine = FullRestoreEngine::new(self.ctx.clone()).only_package(package);
        let done = Completion::new(token, registry.clone());
        let spawned = thread::Builder::new()
            .name("appbackup-restore-engine".into())
            .spawn(move || {
                let _signal = SignalOnExit(done);
                engine.restore_stream(reader)
            });
        match spawned {
            Ok(engine) => {
                tracing::debug!(package, token, "full-data restore streaming");
                Ok(FullStream {
                    token,
                    closer,
                    engine,
                    feeder,
                })
            }
            Err(e) => {
                closer.abort();
                registry.remove(token);
                Err(e.into())
            }
        }
    }

    fn full_done(&mut self, acknowledged: bool) -> Next {
        let Some(stream) = self.full.take() else {
            return Next::Execute;
        };
        self.ctx.registry.remove(stream.token);
        if !acknowledged {
            stream.closer.abort();
        }
        let engine = stream.engine.join().unwrap_or_else(|_| {
            Err(CoreError::invalid_state("restore engine panicked"))
        });
        let fed = stream.feeder.join().unwrap_or(FeedOutcome::TransportFailed);

        let Some(package) = self.current.as_ref().map(|c| c.package.clone()) else {
            return self.skip_current();
        };

        if fed == FeedOutcome::TransportFailed {
            tracing::error!(package, "transport failed during full-data restore");
            self.ctx.clear_app_data(&package);
            return self.fail_session("transport read failed");
        }

        match engine {
            Ok(mut summary) if summary.failed_packages.is_empty() && fed != FeedOutcome::Rejected => {
                match (summary.policy(&package), summary.last_agent.take()) {
                    (Some(RestorePolicy::Accept), Some(binding)) => self.enter_finished(binding),
                    (policy, _) => {
                        tracing::info!(package, ?policy, "nothing restored from full-data stream");
                        self.skip_current()
                    }
                }
            }
            Ok(summary) => {
                tracing::warn!(package, failed = ?summary.failed_packages, ?fed, "full-data restore incomplete");
                self.abort_full(&package)
            }
            Err(e) => {
                tracing::warn!(package, error = %e, ?fed, "full-data restore failed");
                self.abort_full(&package)
            }
        }
    }

    /// Wipes whatever part of the package's data arrived and tells the
    /// transport to drop the rest of the stream.
    fn abort_full(&mut self, package: &str) -> Next {
        self.ctx.clear_app_data(package);
        let status = self.ctx.transport.abort_full_restore();
        if !status.is_ok() {
            tracing::warn!(package, ?status, "transport could not abort full-data restore");
        }
        self.skip_current()
    }

    // RestoreFinished

    fn enter_finished(&mut self, binding: AgentBinding) -> Next {
        self.transition(RestoreState::RestoreFinished);
        let registry = &self.ctx.registry;
        let token = registry.generate_token();
        if let Err(e) = registry.prepare(
            token,
            OperationKind::RestoreWait,
            self.ctx.config.timeouts.restore_finished,
            Some(self.callback.clone()),
        ) {
            tracing::warn!(package = %binding.package(), error = %e, "could not finish agent restore");
            return self.finished_done(false);
        }
        binding
            .agent()
            .do_restore_finished(Completion::new(token, registry.clone()));
        self.finishing = Some((token, binding));
        Next::Wait
    }

    fn finished_done(&mut self, acknowledged: bool) -> Next {
        if let Some((token, binding)) = self.finishing.take() {
            self.ctx.registry.remove(token);
            if !acknowledged {
                tracing::warn!(package = %binding.package(), "agent did not finish restore in time");
            }
        }
        if let Some(current) = self.current.take() {
            tracing::info!(package = %current.package, data = ?current.data_type, "package restored");
            self.restored.push(current.package);
        }
        self.transition(RestoreState::RunningQueue);
        Next::Execute
    }

    // Final

    fn finish(&mut self) -> Next {
        self.ctx.transport.finish_restore();
        self.params.observer.restore_finished(self.status);

        if self.params.whole_device && self.status == PassStatus::Ok {
            let offered = self.offered.clone();
            if let Err(e) = self
                .ctx
                .bookkeeping
                .lock()
                .set_ancestral(self.params.token, offered)
            {
                tracing::warn!(error = %e, "failed to record ancestral dataset");
            }
        }
        if let Some(install_token) = self.params.install_token {
            self.ctx
                .packages
                .finish_package_install(install_token, self.status == PassStatus::Ok);
        }

        tracing::info!(status = ?self.status, restored = self.restored.len(), "restore session finished");
        self.result = Some(RestorePassResult {
            status: self.status,
            restored: std::mem::take(&mut self.restored),
            offered: std::mem::take(&mut self.offered),
            history: self.history.clone(),
        });
        Next::Finished
    }

    fn waiting_on(&self, token: u32) -> Option<RestoreState> {
        if self.key_value.as_ref().is_some_and(|w| w.token == token) {
            Some(RestoreState::RestoreKeyValue)
        } else if self.full.as_ref().is_some_and(|f| f.token == token) {
            Some(RestoreState::RestoreFull)
        } else if self.finishing.as_ref().is_some_and(|(t, _)| *t == token) {
            Some(RestoreState::RestoreFinished)
        } else {
            None
        }
    }

    fn resolve(&mut self, token: u32, acknowledged: bool) -> Next {
        match self.waiting_on(token) {
            Some(RestoreState::RestoreKeyValue) => self.key_value_done(acknowledged),
            Some(RestoreState::RestoreFull) => self.full_done(acknowledged),
            Some(RestoreState::RestoreFinished) => self.finished_done(acknowledged),
            _ => {
                tracing::debug!(token, "stale restore event ignored");
                if self.key_value.is_some() || self.full.is_some() || self.finishing.is_some() {
                    Next::Wait
                } else {
                    Next::Execute
                }
            }
        }
    }
}

impl Task for RestoreTask {
    fn name(&self) -> &'static str {
        "restore"
    }

    fn step(&mut self, event: TaskEvent) -> Next {
        match event {
            TaskEvent::Execute => match self.state {
                RestoreState::Initial => self.begin(),
                RestoreState::RunningQueue => self.next_package(),
                RestoreState::RestoreKeyValue => self.start_key_value(),
                RestoreState::RestoreFull => self.start_full(),
                // Entered together with its agent call; nothing to run.
                RestoreState::RestoreFinished => Next::Wait,
                RestoreState::Final => self.finish(),
            },
            TaskEvent::OperationComplete { token, .. } => self.resolve(token, true),
            TaskEvent::Cancel { token, .. } => self.resolve(token, false),
        }
    }
}

/// Pulls the transport's full-data stream into the pipe.
fn feed(transport: &dyn Transport, writer: PipeWriter) -> FeedOutcome {
    let closer = writer.closer();
    let mut sink = TrackedWriter::new(writer);
    loop {
        match transport.next_full_restore_chunk(&mut sink) {
            FullRestoreChunk::Data(_) => {}
            FullRestoreChunk::NoMoreData => return FeedOutcome::Complete,
            FullRestoreChunk::PackageRejected => {
                tracing::warn!("transport rejected full-data package");
                closer.fail(io::ErrorKind::ConnectionAborted, "transport rejected package");
                return FeedOutcome::Rejected;
            }
            FullRestoreChunk::Error if sink.failed() => {
                tracing::debug!("restore stream consumer went away");
                return FeedOutcome::ConsumerGone;
            }
            FullRestoreChunk::Error => {
                closer.fail(io::ErrorKind::Other, "transport read failed");
                return FeedOutcome::TransportFailed;
            }
        }
    }
}
