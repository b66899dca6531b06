//! Mock agents and the host that binds them.
//!
//! Every agent call runs on its own thread and reports through the
//! completion handle, the way an agent in another process would.

use appbackup_codec::kv::{KeyValueReader, KeyValueWriter};
use appbackup_codec::{AppInfo, Entity};
use appbackup_core::{AgentHost, BackupAgent, BindMode, Completion, FullBackupOutput, PipeReader, RestoreFileRequest};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;

/// One call received by a mock agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    /// `do_backup` with the quota.
    Backup {
        /// Quota passed.
        quota: u64,
    },
    /// `do_full_backup` with the quota.
    FullBackup {
        /// Quota passed.
        quota: u64,
    },
    /// `do_restore` with the dataset's version code.
    Restore {
        /// Version passed.
        app_version: i64,
    },
    /// `do_restore_file`.
    RestoreFile {
        /// Domain token.
        domain: String,
        /// Relative path.
        path: String,
        /// Declared size.
        size: u64,
    },
    /// `do_restore_finished`.
    RestoreFinished,
    /// `do_quota_exceeded`.
    QuotaExceeded {
        /// Bytes produced.
        used: u64,
        /// Quota in force.
        quota: u64,
    },
    /// `fail`.
    Fail(String),
}

/// A file an agent received during a full-data restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredFile {
    /// Domain token.
    pub domain: String,
    /// Relative path.
    pub path: String,
    /// Content received.
    pub content: Vec<u8>,
    /// Permission bits.
    pub mode: u32,
    /// Modification time.
    pub mtime: u64,
}

/// What a mock agent does when called.
#[derive(Debug, Clone)]
pub struct AgentBehavior {
    /// Records written by `do_backup`.
    pub backup_entities: Vec<Entity>,
    /// Files written by `do_full_backup` as `(domain, path, content)`.
    pub full_files: Vec<(String, String, Vec<u8>)>,
    /// Whether calls complete. A silent agent lets every call time out.
    pub responds: bool,
    /// Whether `do_restore_file` reads its input before completing.
    pub reads_files: bool,
}

impl Default for AgentBehavior {
    fn default() -> Self {
        Self {
            backup_entities: vec![Entity::put("key", b"value".to_vec())],
            full_files: Vec::new(),
            responds: true,
            reads_files: true,
        }
    }
}

/// Records every call and answers per its [`AgentBehavior`].
pub struct MockAgent {
    package: String,
    behavior: Mutex<AgentBehavior>,
    calls: Mutex<Vec<AgentCall>>,
    restored_files: Mutex<Vec<RestoredFile>>,
    restored_entities: Mutex<Vec<Entity>>,
}

impl MockAgent {
    /// Creates an agent for `package` with default behavior.
    pub fn new(package: &str) -> Self {
        Self {
            package: package.to_string(),
            behavior: Mutex::new(AgentBehavior::default()),
            calls: Mutex::new(Vec::new()),
            restored_files: Mutex::new(Vec::new()),
            restored_entities: Mutex::new(Vec::new()),
        }
    }

    /// Package the agent belongs to.
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Changes the agent's behavior.
    pub fn configure(&self, f: impl FnOnce(&mut AgentBehavior)) {
        f(&mut self.behavior.lock());
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().clone()
    }

    /// Quota notifications received.
    pub fn quota_exceeded_calls(&self) -> Vec<(u64, u64)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                AgentCall::QuotaExceeded { used, quota } => Some((*used, *quota)),
                _ => None,
            })
            .collect()
    }

    /// Files received during full-data restores.
    pub fn restored_files(&self) -> Vec<RestoredFile> {
        self.restored_files.lock().clone()
    }

    /// Records received during key-value restores.
    pub fn restored_entities(&self) -> Vec<Entity> {
        self.restored_entities.lock().clone()
    }

    fn behavior(&self) -> AgentBehavior {
        self.behavior.lock().clone()
    }

    fn record(&self, call: AgentCall) {
        self.calls.lock().push(call);
    }
}

fn spawn(work: impl FnOnce() + Send + 'static) {
    thread::Builder::new()
        .name("mock-agent".into())
        .spawn(work)
        .expect("spawn mock agent thread");
}

/// Handle that keeps the agent alive on its worker threads.
#[derive(Clone)]
struct AgentHandle(Arc<MockAgent>);

impl BackupAgent for AgentHandle {
    fn do_backup(&self, _old_state: Option<File>, mut data: File, mut new_state: File, quota: u64, done: Completion) {
        let agent = self.0.clone();
        agent.record(AgentCall::Backup { quota });
        spawn(move || {
            let behavior = agent.behavior();
            let mut writer = KeyValueWriter::new(&mut data);
            for entity in &behavior.backup_entities {
                writer.write_entity(entity).expect("write backup entity");
            }
            writer.into_inner().expect("finish backup data");
            data.flush().expect("flush backup data");
            writeln!(new_state, "{} entities", behavior.backup_entities.len()).expect("write new state");
            if behavior.responds {
                done.complete(0);
            }
        });
    }

    fn do_full_backup(&self, output: FullBackupOutput, quota: u64, done: Completion) {
        let agent = self.0.clone();
        agent.record(AgentCall::FullBackup { quota });
        spawn(move || {
            let behavior = agent.behavior();
            for (domain, path, content) in &behavior.full_files {
                if let Err(e) = output.write_file(domain, path, 0o600, 0, content) {
                    tracing::debug!(error = %e, "mock agent full-data write failed");
                    break;
                }
            }
            if behavior.responds {
                done.complete(0);
            }
        });
    }

    fn do_restore(&self, mut data: File, app_version: i64, _new_state: File, done: Completion) {
        let agent = self.0.clone();
        agent.record(AgentCall::Restore { app_version });
        spawn(move || {
            let mut blob = Vec::new();
            data.read_to_end(&mut blob).expect("read restore data");
            let entities = KeyValueReader::new(blob.as_slice())
                .read_all()
                .expect("decode restore data");
            agent.restored_entities.lock().extend(entities);
            if agent.behavior().responds {
                done.complete(0);
            }
        });
    }

    fn do_restore_file(&self, mut source: PipeReader, request: RestoreFileRequest, done: Completion) {
        let agent = self.0.clone();
        agent.record(AgentCall::RestoreFile {
            domain: request.domain.clone(),
            path: request.path.clone(),
            size: request.size,
        });
        spawn(move || {
            let behavior = agent.behavior();
            if behavior.reads_files {
                let mut content = Vec::new();
                if source.read_to_end(&mut content).is_ok() {
                    agent.restored_files.lock().push(RestoredFile {
                        domain: request.domain,
                        path: request.path,
                        content,
                        mode: request.mode,
                        mtime: request.mtime,
                    });
                }
            }
            if behavior.responds {
                done.complete(0);
            }
        });
    }

    fn do_restore_finished(&self, done: Completion) {
        self.0.record(AgentCall::RestoreFinished);
        if self.0.behavior().responds {
            spawn(move || done.complete(0));
        }
    }

    fn do_quota_exceeded(&self, used: u64, quota: u64) {
        self.0.record(AgentCall::QuotaExceeded { used, quota });
    }

    fn fail(&self, message: &str) {
        self.0.record(AgentCall::Fail(message.to_string()));
    }
}

/// Binds [`MockAgent`]s, creating them on first use.
#[derive(Default)]
pub struct MockAgentHost {
    agents: Mutex<HashMap<String, Arc<MockAgent>>>,
    refused: Mutex<HashSet<String>>,
    binds: Mutex<Vec<(String, BindMode)>>,
    unbinds: Mutex<Vec<String>>,
    killed: Mutex<Vec<String>>,
}

impl MockAgentHost {
    /// Creates a host with no agents.
    pub fn new() -> Self {
        Self::default()
    }

    /// The agent for `package`, created if needed.
    pub fn agent(&self, package: &str) -> Arc<MockAgent> {
        self.agents
            .lock()
            .entry(package.to_string())
            .or_insert_with(|| Arc::new(MockAgent::new(package)))
            .clone()
    }

    /// Makes binding `package` fail.
    pub fn refuse(&self, package: &str) {
        self.refused.lock().insert(package.to_string());
    }

    /// Bind requests so far.
    pub fn binds(&self) -> Vec<(String, BindMode)> {
        self.binds.lock().clone()
    }

    /// Unbind requests so far.
    pub fn unbinds(&self) -> Vec<String> {
        self.unbinds.lock().clone()
    }

    /// Packages whose agent process was killed.
    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().clone()
    }
}

impl AgentHost for MockAgentHost {
    fn bind_agent(&self, app: &AppInfo, mode: BindMode) -> Option<Arc<dyn BackupAgent>> {
        self.binds.lock().push((app.package_name.clone(), mode));
        if self.refused.lock().contains(&app.package_name) {
            return None;
        }
        Some(Arc::new(AgentHandle(self.agent(&app.package_name))))
    }

    fn unbind_agent(&self, package: &str) {
        self.unbinds.lock().push(package.to_string());
    }

    fn kill_agent_process(&self, package: &str) {
        self.killed.lock().push(package.to_string());
    }
}
