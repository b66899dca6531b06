//! Full-data backup phase tests.

use appbackup_codec::{ArchiveReader, RecordRole};
use appbackup_core::{
    full_backup_candidates, refresh_full_queue, BackupFlags, FullBackupPhase, PackageOutcome, PassStatus,
    TransportStatus,
};
use appbackup_testkit::prelude::*;
use std::sync::Arc;

fn phase(env: &TestEnv, observer: Arc<RecordingObserver>) -> FullBackupPhase {
    FullBackupPhase::new(env.ctx.clone(), observer, BackupFlags::default())
}

/// `(role, domain, path, content)` of every record in `archive`.
fn records(archive: &[u8]) -> Vec<(RecordRole, String, String, Vec<u8>)> {
    let mut reader = ArchiveReader::new(archive);
    let mut out = Vec::new();
    while let Some(entry) = reader.next_entry().expect("entry") {
        let content = reader.read_content().expect("content");
        out.push((entry.role, entry.domain, entry.path, content));
    }
    out
}

fn with_files(env: &TestEnv, package: &str, files: &[(&str, &str, &[u8])]) {
    let files: Vec<(String, String, Vec<u8>)> = files
        .iter()
        .map(|(d, p, c)| (d.to_string(), p.to_string(), c.to_vec()))
        .collect();
    env.agent(package).configure(|b| b.full_files = files);
}

#[test]
fn archive_starts_with_manifest_and_carries_agent_files() {
    let env = TestEnv::new();
    env.install(full_data_app("com.full", 7));
    with_files(&env, "com.full", &[("f", "notes.txt", b"hello"), ("db", "main.db", &[7u8; 700])]);
    let observer = Arc::new(RecordingObserver::new());

    let result = phase(&env, observer.clone()).run(&["com.full".to_string()]);

    assert_eq!(result.status, PassStatus::Ok);
    assert_eq!(observer.result_for("com.full"), Some(PackageOutcome::Success));
    let archive = env.transport.full_archive("com.full").expect("archive stored");
    let records = records(&archive);
    assert_eq!(records[0].0, RecordRole::Manifest);
    let data: Vec<_> = records.iter().filter(|r| r.0 == RecordRole::Data).collect();
    assert_eq!(data.len(), 2);
    assert_eq!((data[0].1.as_str(), data[0].2.as_str(), data[0].3.as_slice()), ("f", "notes.txt", &b"hello"[..]));
    assert_eq!(data[1].3.len(), 700);
    assert!(env.ctx.bookkeeping.lock().ever_stored("com.full"));
}

#[test]
fn side_channel_state_travels_as_metadata_record() {
    let env = TestEnv::new();
    env.install(full_data_app("com.full", 1));
    env.side_channel.set("com.full", Some(b"widgets".to_vec()));

    phase(&env, Arc::new(RecordingObserver::new())).run(&["com.full".to_string()]);

    let archive = env.transport.full_archive("com.full").expect("archive stored");
    let roles: Vec<RecordRole> = records(&archive).into_iter().map(|r| r.0).collect();
    assert_eq!(roles, vec![RecordRole::Manifest, RecordRole::Metadata]);
}

#[test]
fn quota_exceeded_notifies_agent_once_and_moves_on() {
    let env = TestEnv::new();
    env.install(full_data_app("com.big", 1));
    env.install(full_data_app("com.small", 1));
    with_files(&env, "com.big", &[("f", "blob", &[1u8; 16 * 1024])]);
    env.transport.set_quota(4 * 1024);
    let observer = Arc::new(RecordingObserver::new());

    let result = phase(&env, observer.clone()).run(&["com.big".to_string(), "com.small".to_string()]);

    assert_eq!(result.status, PassStatus::Ok);
    let notified = env.agent("com.big").quota_exceeded_calls();
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0].1, 4 * 1024);
    assert_eq!(observer.result_for("com.big"), Some(PackageOutcome::QuotaExceeded));
    assert_eq!(observer.result_for("com.small"), Some(PackageOutcome::Success));
    assert!(env.transport.full_archive("com.big").is_none());
    assert!(env.transport.calls().contains(&TransportCall::CancelFullBackup));
}

#[test]
fn transport_failure_aborts_the_phase() {
    let env = TestEnv::new();
    env.install(full_data_app("com.a", 1));
    env.install(full_data_app("com.b", 1));
    env.transport.script_full_backup("com.a", TransportStatus::Error);
    let observer = Arc::new(RecordingObserver::new());

    let result = phase(&env, observer.clone()).run(&["com.a".to_string(), "com.b".to_string()]);

    assert_eq!(result.status, PassStatus::TransportError);
    assert!(result.outcomes.is_empty());
    assert!(env.agents.binds().is_empty());
}

#[test]
fn key_value_apps_and_missing_packages_are_skipped() {
    let env = TestEnv::new();
    env.install(app("com.kv", 1));
    let observer = Arc::new(RecordingObserver::new());

    let result = phase(&env, observer.clone()).run(&["com.kv".to_string(), "com.gone".to_string()]);

    assert_eq!(result.status, PassStatus::Ok);
    assert_eq!(observer.result_for("com.kv"), Some(PackageOutcome::Rejected));
    assert_eq!(observer.result_for("com.gone"), Some(PackageOutcome::NotFound));
}

#[test]
fn silent_agent_is_an_agent_failure() {
    let env = TestEnv::with_config(|c| {
        c.with_timeouts(appbackup_core::Timeouts::uniform(std::time::Duration::from_millis(100)))
    });
    env.install(full_data_app("com.slow", 1));
    env.agent("com.slow").configure(|b| b.responds = false);
    let observer = Arc::new(RecordingObserver::new());

    let result = phase(&env, observer.clone()).run(&["com.slow".to_string()]);

    assert_eq!(result.status, PassStatus::Ok);
    assert_eq!(observer.result_for("com.slow"), Some(PackageOutcome::AgentFailure));
    assert!(env.transport.full_archive("com.slow").is_none());
}

#[test]
fn queue_tracks_installed_full_data_apps() {
    let env = TestEnv::new();
    env.install(full_data_app("com.one", 1));
    env.install(full_data_app("com.two", 1));
    env.install(app("com.kv", 1));

    refresh_full_queue(&env.ctx).expect("refresh");
    let mut candidates = full_backup_candidates(&env.ctx);
    candidates.sort();
    assert_eq!(candidates, vec!["com.one".to_string(), "com.two".to_string()]);

    env.packages.uninstall("com.one");
    refresh_full_queue(&env.ctx).expect("refresh");
    assert_eq!(full_backup_candidates(&env.ctx), vec!["com.two".to_string()]);
}

#[test]
fn backed_up_package_moves_to_the_back_of_the_queue() {
    let env = TestEnv::new();
    env.install(full_data_app("com.one", 1));
    env.install(full_data_app("com.two", 1));
    refresh_full_queue(&env.ctx).expect("refresh");
    let first = full_backup_candidates(&env.ctx)[0].clone();

    phase(&env, Arc::new(RecordingObserver::new())).run(&[first.clone()]);

    let candidates = full_backup_candidates(&env.ctx);
    assert_eq!(candidates.last(), Some(&first));
}
