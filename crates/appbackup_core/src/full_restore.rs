//! Streams an archive into application agents.
//!
//! The engine reads records one at a time, decides each package's policy
//! from its manifest and hands accepted files to the package's agent
//! through a per-file pipe. Every delivery is bounded by a registry token;
//! a failed or late delivery drops the package for the rest of the stream
//! unless the engine was asked for a single package, in which case the
//! whole stream fails.

use crate::agent::{AgentBinding, BindMode, RestoreFileRequest};
use crate::context::BackupContext;
use crate::error::{CoreError, CoreResult};
use crate::pipe::{pipe, TrackedWriter};
use crate::registry::{Completion, OperationKind};
use appbackup_codec::path::{is_excluded_domain, is_sane_path, DOMAIN_APK, SHARED_STORAGE_PACKAGE};
use appbackup_codec::{
    evaluate_manifest, signatures_match, ArchiveEntry, ArchiveReader, Manifest, PolicyTable, RecordRole,
    RestorePolicy,
};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Read;
use std::sync::Arc;
use std::thread;

/// What a restore stream did.
#[derive(Debug, Default)]
pub struct RestoreSummary {
    /// Content bytes handed to agents.
    pub delivered_bytes: u64,
    /// Records handed to agents.
    pub delivered_files: usize,
    /// Final policy of every package seen, in order of first appearance.
    pub policies: Vec<(String, RestorePolicy)>,
    /// Packages dropped after a failed delivery or install.
    pub failed_packages: Vec<String>,
    /// Agent still bound when the stream ended. Only kept for single-package
    /// restores so the caller can finish it.
    pub last_agent: Option<AgentBinding>,
}

impl RestoreSummary {
    /// Final policy of `package`, if it was seen.
    #[must_use]
    pub fn policy(&self, package: &str) -> Option<RestorePolicy> {
        self.policies
            .iter()
            .find(|(name, _)| name == package)
            .map(|(_, policy)| *policy)
    }
}

/// Decodes one archive stream against the installed packages.
pub struct FullRestoreEngine {
    ctx: Arc<BackupContext>,
    only_package: Option<String>,
    allow_apks: bool,
    policies: PolicyTable,
    manifests: HashMap<String, Manifest>,
    seen: Vec<String>,
    agent: Option<AgentBinding>,
    cleared: HashSet<String>,
    summary: RestoreSummary,
}

impl FullRestoreEngine {
    /// Creates an engine. Package-file installation follows the service
    /// configuration.
    #[must_use]
    pub fn new(ctx: Arc<BackupContext>) -> Self {
        let allow_apks = ctx.config.allow_apk_install;
        Self {
            ctx,
            only_package: None,
            allow_apks,
            policies: PolicyTable::new(),
            manifests: HashMap::new(),
            seen: Vec::new(),
            agent: None,
            cleared: HashSet::new(),
            summary: RestoreSummary::default(),
        }
    }

    /// Restores only `package`; records of other packages are skipped and a
    /// failed delivery fails the stream.
    #[must_use]
    pub fn only_package(mut self, package: impl Into<String>) -> Self {
        self.only_package = Some(package.into());
        self
    }

    /// Overrides whether package files carried in the archive may be
    /// installed.
    #[must_use]
    pub fn allow_apks(mut self, allow: bool) -> Self {
        self.allow_apks = allow;
        self
    }

    /// Consumes `source` up to its end-of-archive marker.
    pub fn restore_stream<R: Read>(mut self, source: R) -> CoreResult<RestoreSummary> {
        let mut reader = ArchiveReader::new(source).with_max_record_size(self.ctx.config.max_record_size);
        while let Some(entry) = reader.next_entry()? {
            if let Some(only) = &self.only_package {
                if &entry.package != only {
                    tracing::debug!(package = %entry.package, "skipping record of another package");
                    continue;
                }
            }
            if !self.seen.contains(&entry.package) {
                self.seen.push(entry.package.clone());
            }
            match entry.role {
                RecordRole::Manifest => self.on_manifest(&entry, &mut reader)?,
                RecordRole::Metadata => self.on_metadata(&entry, &mut reader)?,
                RecordRole::Data => match self.policies.get(&entry.package) {
                    RestorePolicy::Ignore => {}
                    RestorePolicy::AcceptIfApk => self.on_install_candidate(&entry, &mut reader)?,
                    RestorePolicy::Accept => self.on_accepted(&entry, &mut reader)?,
                },
            }
        }

        if self.only_package.is_some() {
            self.summary.last_agent = self.agent.take();
        } else {
            self.finish_agent();
        }
        let mut summary = self.summary;
        summary.policies = self
            .seen
            .iter()
            .map(|name| (name.clone(), self.policies.get(name)))
            .collect();
        tracing::info!(
            files = summary.delivered_files,
            bytes = summary.delivered_bytes,
            failed = summary.failed_packages.len(),
            "restore stream finished"
        );
        Ok(summary)
    }

    fn on_manifest<R: Read>(&mut self, entry: &ArchiveEntry, reader: &mut ArchiveReader<R>) -> CoreResult<()> {
        let package = entry.package.as_str();
        let manifest = match reader.read_manifest() {
            Ok(manifest) => manifest,
            Err(e) if e.is_malformed() => {
                tracing::warn!(package, error = %e, "unreadable manifest, ignoring package");
                self.policies.degrade(package);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if manifest.package_name != package {
            tracing::warn!(package, named = %manifest.package_name, "manifest names another package, ignoring");
            self.policies.degrade(package);
            return Ok(());
        }
        let installed = self.ctx.packages.package_info(package);
        let decision = evaluate_manifest(&manifest, installed.as_ref(), self.allow_apks);
        let policy = self.policies.admit(package, decision.policy);
        tracing::info!(package, ?policy, reason = ?decision.reason, "restore policy decided");
        self.manifests.insert(package.to_string(), manifest);
        Ok(())
    }

    fn on_metadata<R: Read>(&mut self, entry: &ArchiveEntry, reader: &mut ArchiveReader<R>) -> CoreResult<()> {
        let package = entry.package.as_str();
        if self.policies.get(package) != RestorePolicy::Accept {
            return Ok(());
        }
        match reader.read_metadata() {
            Ok(record) => {
                if let Some(blob) = record.widget_state() {
                    tracing::debug!(package, len = blob.len(), "restoring side-channel state");
                    self.ctx.side_channel.restore(package, blob);
                }
                Ok(())
            }
            Err(e) if e.is_malformed() => {
                tracing::warn!(package, error = %e, "unreadable metadata record");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The first data record of an `AcceptIfApk` package must be its
    /// package file. Anything else is dropped.
    fn on_install_candidate<R: Read>(&mut self, entry: &ArchiveEntry, reader: &mut ArchiveReader<R>) -> CoreResult<()> {
        let package = entry.package.as_str();
        if entry.domain != DOMAIN_APK {
            tracing::debug!(package, path = %entry.path, "dropping record before package file");
            return Ok(());
        }

        fs::create_dir_all(&self.ctx.config.data_dir)?;
        let staged = self.ctx.config.data_dir.join(format!("{package}.apk"));
        {
            let mut file = File::create(&staged)?;
            reader.copy_content(&mut file)?;
            file.sync_all()?;
        }

        let installer = self
            .manifests
            .get(package)
            .and_then(|m| m.installer.clone())
            .or_else(|| entry.installer_package.clone());
        let installed = self
            .ctx
            .packages
            .install_package(package, &staged, installer.as_deref());
        if let Err(e) = fs::remove_file(&staged) {
            tracing::debug!(package, error = %e, "could not remove staged package file");
        }

        let accepted = installed && self.verify_install(package);
        let policy = self.policies.resolve_install(package, accepted);
        if accepted {
            tracing::info!(package, ?policy, "package installed from archive");
        } else {
            tracing::warn!(package, installed, "package install from archive rejected");
            self.fail_package(package);
        }
        Ok(())
    }

    fn verify_install(&self, package: &str) -> bool {
        let (Some(manifest), Some(app)) = (self.manifests.get(package), self.ctx.packages.package_info(package)) else {
            return false;
        };
        if !signatures_match(&manifest.signatures, &app) {
            tracing::warn!(package, "installed package signatures do not match archive");
            return false;
        }
        if manifest.version_code > app.version_code && !app.restore_any_version {
            tracing::warn!(package, "installed package older than archive");
            return false;
        }
        true
    }

    fn on_accepted<R: Read>(&mut self, entry: &ArchiveEntry, reader: &mut ArchiveReader<R>) -> CoreResult<()> {
        let package = entry.package.as_str();
        if entry.domain == DOMAIN_APK {
            return Ok(());
        }
        if !is_sane_path(&entry.path) {
            tracing::warn!(package, path = %entry.path, "dropping record with unsafe path");
            return Ok(());
        }
        if is_excluded_domain(&entry.domain) {
            tracing::debug!(package, domain = %entry.domain, "dropping record in excluded domain");
            return Ok(());
        }

        if !self.ensure_agent(package) {
            return self.delivery_failed(package, "no agent");
        }
        if self.deliver(entry, reader)? {
            self.summary.delivered_files += 1;
            self.summary.delivered_bytes += entry.size;
            Ok(())
        } else {
            self.delivery_failed(package, "delivery failed")
        }
    }

    /// Binds the agent for `package`, finishing the previous package's agent
    /// and clearing the new package's data the first time it is seen.
    fn ensure_agent(&mut self, package: &str) -> bool {
        if self.agent.as_ref().is_some_and(|a| a.package() == package) {
            return true;
        }
        self.finish_agent();

        let Some(app) = self.ctx.packages.package_info(package) else {
            tracing::warn!(package, "package vanished during restore");
            return false;
        };
        if package != SHARED_STORAGE_PACKAGE && self.cleared.insert(package.to_string()) {
            self.ctx.clear_app_data(package);
        }
        self.agent = AgentBinding::bind(&self.ctx.agents, &app, BindMode::FullRestore);
        if self.agent.is_none() {
            tracing::warn!(package, "could not bind agent for restore");
        }
        self.agent.is_some()
    }

    /// Delivers the current record. `Ok(false)` means the agent failed or
    /// timed out; errors come from the source stream.
    fn deliver<R: Read>(&self, entry: &ArchiveEntry, reader: &mut ArchiveReader<R>) -> CoreResult<bool> {
        let Some(binding) = &self.agent else {
            return Ok(false);
        };
        let registry = &self.ctx.registry;
        let token = registry.generate_token();
        registry.prepare(token, OperationKind::RestoreWait, self.ctx.config.timeouts.restore_file, None)?;

        let (writer, source) = pipe(self.ctx.config.pipe_capacity);
        let closer = writer.closer();
        let request = RestoreFileRequest {
            size: entry.size,
            kind: entry.kind,
            domain: entry.domain.clone(),
            path: entry.path.clone(),
            mode: entry.mode,
            mtime: entry.mtime,
        };
        tracing::debug!(package = %entry.package, domain = %entry.domain, path = %entry.path, size = entry.size, token, "delivering file");
        binding
            .agent()
            .do_restore_file(source, request, Completion::new(token, registry.clone()));

        let (copied, acknowledged) = thread::scope(|scope| {
            let waiter_registry = registry.clone();
            let waiter = scope.spawn(move || {
                let acknowledged = waiter_registry.block_until_complete(token);
                closer.abort();
                acknowledged
            });
            let mut sink = TrackedWriter::new(writer);
            let copied = reader.copy_content(&mut sink);
            let write_failed = sink.failed();
            drop(sink);
            let acknowledged = waiter.join().unwrap_or(false);
            ((copied, write_failed), acknowledged)
        });

        match copied {
            (Ok(_), _) => Ok(acknowledged),
            (Err(e), true) => {
                tracing::debug!(package = %entry.package, error = %e, "agent stopped reading");
                Ok(acknowledged)
            }
            (Err(e), false) => Err(e.into()),
        }
    }

    fn delivery_failed(&mut self, package: &str, reason: &str) -> CoreResult<()> {
        if self.only_package.as_deref() == Some(package) {
            return Err(CoreError::agent(package, reason));
        }
        tracing::warn!(package, reason, "dropping package for the rest of the stream");
        if let Some(binding) = self.agent.take() {
            binding.fail(reason);
        }
        self.fail_package(package);
        Ok(())
    }

    fn fail_package(&mut self, package: &str) {
        self.policies.degrade(package);
        if !self.summary.failed_packages.iter().any(|p| p == package) {
            self.summary.failed_packages.push(package.to_string());
        }
    }

    /// Tells the bound agent its restore is over and unbinds it.
    fn finish_agent(&mut self) {
        let Some(binding) = self.agent.take() else {
            return;
        };
        let registry = &self.ctx.registry;
        let token = registry.generate_token();
        if let Err(e) = registry.prepare(
            token,
            OperationKind::RestoreWait,
            self.ctx.config.timeouts.restore_finished,
            None,
        ) {
            tracing::warn!(package = %binding.package(), error = %e, "could not finish agent");
            return;
        }
        binding
            .agent()
            .do_restore_finished(Completion::new(token, registry.clone()));
        if !registry.block_until_complete(token) {
            tracing::warn!(package = %binding.package(), "agent did not finish restore in time");
        }
    }
}
