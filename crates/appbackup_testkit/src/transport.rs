//! Scriptable in-memory transport.
//!
//! Key-value data is merged per package the way a real transport keeps a
//! dataset; full-data archives are stored whole. Restore sessions offer
//! requested packages in request order. Statuses can be scripted per
//! package to exercise failure paths.

use appbackup_codec::kv::{decode_entities, encode_entities};
use appbackup_codec::Entity;
use appbackup_core::{
    BackupFlags, FullRestoreChunk, NextPackage, PackageManager, PmAgent, RestoreDescriptor, Transport,
    TransportStatus, PM_PACKAGE,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::time::Duration;

/// One call made to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `initialize_device`.
    InitializeDevice,
    /// `perform_backup` with the blob size.
    PerformBackup(String, usize),
    /// `finish_backup`.
    FinishBackup,
    /// `perform_full_backup`.
    PerformFullBackup(String),
    /// `cancel_full_backup`.
    CancelFullBackup,
    /// `start_restore` with the dataset token and requested packages.
    StartRestore(u64, Vec<String>),
    /// `abort_full_restore`.
    AbortFullRestore,
    /// `finish_restore`.
    FinishRestore,
}

enum Pending {
    KeyValue(String, Vec<Entity>),
    Full(String, Vec<u8>),
}

struct Session {
    queue: VecDeque<RestoreDescriptor>,
    current: Option<RestoreDescriptor>,
    cursor: usize,
}

#[derive(Default)]
struct State {
    initialized: bool,
    key_value: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    full: BTreeMap<String, Vec<u8>>,
    pending: Option<Pending>,
    backup_script: HashMap<String, VecDeque<TransportStatus>>,
    full_script: HashMap<String, VecDeque<TransportStatus>>,
    quota: Option<u64>,
    chunk_size: Option<usize>,
    failing_reads: HashSet<String>,
    session: Option<Session>,
    calls: Vec<TransportCall>,
}

/// In-memory transport.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

const DEFAULT_QUOTA: u64 = 64 * 1024 * 1024;
const DEFAULT_CHUNK: usize = 4096;

impl MemoryTransport {
    /// Creates an empty, uninitialized transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `perform_backup` for `package` return `status`
    /// without storing anything.
    pub fn script_backup(&self, package: &str, status: TransportStatus) {
        self.state
            .lock()
            .backup_script
            .entry(package.to_string())
            .or_default()
            .push_back(status);
    }

    /// Makes the next `perform_full_backup` for `package` return `status`.
    pub fn script_full_backup(&self, package: &str, status: TransportStatus) {
        self.state
            .lock()
            .full_script
            .entry(package.to_string())
            .or_default()
            .push_back(status);
    }

    /// Sets the quota reported for every package.
    pub fn set_quota(&self, quota: u64) {
        self.state.lock().quota = Some(quota);
    }

    /// Sets the size of full-data restore chunks.
    pub fn set_chunk_size(&self, size: usize) {
        self.state.lock().chunk_size = Some(size.max(1));
    }

    /// Makes full-data restore reads of `package` fail after the first chunk.
    pub fn fail_full_reads(&self, package: &str) {
        self.state.lock().failing_reads.insert(package.to_string());
    }

    /// Stores one key-value record directly.
    pub fn put_key_value(&self, package: &str, key: &str, value: &[u8]) {
        self.state
            .lock()
            .key_value
            .entry(package.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
    }

    /// Stores a full-data archive directly.
    pub fn put_full_archive(&self, package: &str, archive: Vec<u8>) {
        self.state.lock().full.insert(package.to_string(), archive);
    }

    /// Stores package metadata for the packages `packages` reports.
    pub fn seed_package_metadata(&self, packages: std::sync::Arc<dyn PackageManager>) {
        let mut data = Vec::new();
        let mut new_state = Vec::new();
        PmAgent::new(packages)
            .backup(None, &mut data, &mut new_state)
            .expect("package metadata backup");
        let entities = decode_entities(&data).expect("package metadata blob");
        let mut state = self.state.lock();
        state.initialized = true;
        merge(&mut state.key_value, PM_PACKAGE, entities);
    }

    /// Key-value records stored for `package`.
    pub fn key_values(&self, package: &str) -> BTreeMap<String, Vec<u8>> {
        self.state
            .lock()
            .key_value
            .get(package)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns true if any key-value data is stored for `package`.
    pub fn has_key_values(&self, package: &str) -> bool {
        self.state.lock().key_value.contains_key(package)
    }

    /// Full-data archive stored for `package`.
    pub fn full_archive(&self, package: &str) -> Option<Vec<u8>> {
        self.state.lock().full.get(package).cloned()
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    /// Packages passed to `perform_backup`, in order.
    pub fn backed_up(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::PerformBackup(p, _) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }
}

fn merge(store: &mut BTreeMap<String, BTreeMap<String, Vec<u8>>>, package: &str, entities: Vec<Entity>) {
    let records = store.entry(package.to_string()).or_default();
    for entity in entities {
        match entity.value {
            Some(value) => {
                records.insert(entity.key, value);
            }
            None => {
                records.remove(&entity.key);
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> String {
        "memory".into()
    }

    fn transport_dir_name(&self) -> String {
        "memory".into()
    }

    fn initialize_device(&self) -> TransportStatus {
        let mut state = self.state.lock();
        state.calls.push(TransportCall::InitializeDevice);
        state.initialized = true;
        state.key_value.clear();
        state.full.clear();
        TransportStatus::Ok
    }

    fn perform_backup(&self, package: &str, data: &mut dyn Read, _flags: BackupFlags) -> TransportStatus {
        let mut blob = Vec::new();
        if data.read_to_end(&mut blob).is_err() {
            return TransportStatus::Error;
        }
        let mut state = self.state.lock();
        state
            .calls
            .push(TransportCall::PerformBackup(package.to_string(), blob.len()));
        if let Some(status) = state
            .backup_script
            .get_mut(package)
            .and_then(VecDeque::pop_front)
        {
            return status;
        }
        if !state.initialized {
            return TransportStatus::NotInitialized;
        }
        let Ok(entities) = decode_entities(&blob) else {
            return TransportStatus::Error;
        };
        state.pending = Some(Pending::KeyValue(package.to_string(), entities));
        TransportStatus::Ok
    }

    fn finish_backup(&self) -> TransportStatus {
        let mut state = self.state.lock();
        state.calls.push(TransportCall::FinishBackup);
        match state.pending.take() {
            Some(Pending::KeyValue(package, entities)) => merge(&mut state.key_value, &package, entities),
            Some(Pending::Full(package, archive)) => {
                state.full.insert(package, archive);
            }
            None => {}
        }
        TransportStatus::Ok
    }

    fn backup_quota(&self, _package: &str, _is_full: bool) -> u64 {
        self.state.lock().quota.unwrap_or(DEFAULT_QUOTA)
    }

    fn check_full_backup_size(&self, bytes: u64) -> TransportStatus {
        if bytes > self.state.lock().quota.unwrap_or(DEFAULT_QUOTA) {
            TransportStatus::QuotaExceeded
        } else {
            TransportStatus::Ok
        }
    }

    fn request_backup_time(&self) -> Duration {
        Duration::ZERO
    }

    fn current_restore_set(&self) -> u64 {
        1
    }

    fn perform_full_backup(&self, package: &str, _flags: BackupFlags) -> TransportStatus {
        let mut state = self.state.lock();
        state
            .calls
            .push(TransportCall::PerformFullBackup(package.to_string()));
        if let Some(status) = state
            .full_script
            .get_mut(package)
            .and_then(VecDeque::pop_front)
        {
            return status;
        }
        state.pending = Some(Pending::Full(package.to_string(), Vec::new()));
        TransportStatus::Ok
    }

    fn send_backup_data(&self, data: &[u8]) -> TransportStatus {
        match self.state.lock().pending.as_mut() {
            Some(Pending::Full(_, archive)) => {
                archive.extend_from_slice(data);
                TransportStatus::Ok
            }
            _ => TransportStatus::Error,
        }
    }

    fn cancel_full_backup(&self) {
        let mut state = self.state.lock();
        state.calls.push(TransportCall::CancelFullBackup);
        state.pending = None;
    }

    fn start_restore(&self, token: u64, packages: &[String]) -> TransportStatus {
        let mut state = self.state.lock();
        state
            .calls
            .push(TransportCall::StartRestore(token, packages.to_vec()));
        let queue = packages
            .iter()
            .filter_map(|p| {
                if state.key_value.contains_key(p) {
                    Some(RestoreDescriptor::key_value(p.as_str()))
                } else if state.full.contains_key(p) {
                    Some(RestoreDescriptor::full(p.as_str()))
                } else {
                    None
                }
            })
            .collect();
        state.session = Some(Session {
            queue,
            current: None,
            cursor: 0,
        });
        TransportStatus::Ok
    }

    fn next_restore_package(&self) -> NextPackage {
        let mut state = self.state.lock();
        let Some(session) = state.session.as_mut() else {
            return NextPackage::Error;
        };
        session.cursor = 0;
        session.current = session.queue.pop_front();
        match &session.current {
            Some(desc) => NextPackage::Package(desc.clone()),
            None => NextPackage::NoMorePackages,
        }
    }

    fn restore_data(&self, sink: &mut dyn Write) -> TransportStatus {
        let blob = {
            let state = self.state.lock();
            let Some(package) = state
                .session
                .as_ref()
                .and_then(|s| s.current.as_ref())
                .map(|d| d.package_name.clone())
            else {
                return TransportStatus::Error;
            };
            let entities: Vec<Entity> = state
                .key_value
                .get(&package)
                .map(|records| {
                    records
                        .iter()
                        .map(|(k, v)| Entity::put(k.as_str(), v.clone()))
                        .collect()
                })
                .unwrap_or_default();
            encode_entities(&entities)
        };
        match sink.write_all(&blob) {
            Ok(()) => TransportStatus::Ok,
            Err(_) => TransportStatus::Error,
        }
    }

    fn next_full_restore_chunk(&self, sink: &mut dyn Write) -> FullRestoreChunk {
        let chunk = {
            let mut state = self.state.lock();
            let chunk_size = state.chunk_size.unwrap_or(DEFAULT_CHUNK);
            let Some(package) = state
                .session
                .as_ref()
                .and_then(|s| s.current.as_ref())
                .map(|d| d.package_name.clone())
            else {
                return FullRestoreChunk::Error;
            };
            let failing = state.failing_reads.contains(&package);
            let Some(archive) = state.full.get(&package).cloned() else {
                return FullRestoreChunk::Error;
            };
            let Some(session) = state.session.as_mut() else {
                return FullRestoreChunk::Error;
            };
            if session.cursor >= archive.len() {
                return FullRestoreChunk::NoMoreData;
            }
            if failing && session.cursor > 0 {
                return FullRestoreChunk::Error;
            }
            let end = (session.cursor + chunk_size).min(archive.len());
            let chunk = archive[session.cursor..end].to_vec();
            session.cursor = end;
            chunk
        };
        match sink.write_all(&chunk) {
            Ok(()) => FullRestoreChunk::Data(chunk.len()),
            Err(_) => FullRestoreChunk::Error,
        }
    }

    fn abort_full_restore(&self) -> TransportStatus {
        self.state.lock().calls.push(TransportCall::AbortFullRestore);
        TransportStatus::Ok
    }

    fn finish_restore(&self) {
        let mut state = self.state.lock();
        state.calls.push(TransportCall::FinishRestore);
        state.session = None;
    }
}
