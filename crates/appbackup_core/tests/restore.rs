//! Restore session tests.

use appbackup_codec::{encode_package, FileInfo, Manifest, MetadataRecord, PackageSegment};
use appbackup_core::{
    drive_task, BackupContext, BindMode, PassStatus, RestoreParams, RestorePassResult, RestoreState, RestoreTask,
    SideChannel, TaskMailbox,
};
use appbackup_testkit::prelude::*;
use std::collections::BTreeSet;
use std::sync::{mpsc, Arc};
use std::time::Duration;

fn run_restore(env: &TestEnv, params: RestoreParams) -> (RestorePassResult, Vec<RestoreState>) {
    let mailbox = TaskMailbox::new();
    let mut task = RestoreTask::new(env.ctx.clone(), mailbox.callback(), params);
    drive_task(&mut task, &mailbox);
    let history = task.history().to_vec();
    (task.take_result().expect("restore result"), history)
}

fn params(packages: &[&str], observer: &Arc<RecordingObserver>) -> RestoreParams {
    RestoreParams::new(1, observer.clone()).with_packages(packages.iter().map(|p| p.to_string()).collect())
}

/// One key-value and one full-data package, both stored and installed.
fn mixed_env() -> TestEnv {
    let env = TestEnv::new();
    let full = full_data_app("com.full", 2);
    env.install(app("com.kv", 3));
    env.install(full.clone());
    env.seed_package_metadata();
    env.transport.put_key_value("com.kv", "greeting", b"hi");
    env.transport
        .put_full_archive("com.full", package_archive(&full, 34, &[("f", "notes.txt", b"hello")]));
    env
}

#[test]
fn mixed_session_visits_every_state_in_order() {
    let env = mixed_env();
    let observer = Arc::new(RecordingObserver::new());

    let (result, history) = run_restore(&env, params(&["com.kv", "com.full"], &observer));

    assert_eq!(result.status, PassStatus::Ok);
    assert_eq!(
        history[1..],
        [
            RestoreState::RunningQueue,
            RestoreState::RestoreKeyValue,
            RestoreState::RestoreFinished,
            RestoreState::RunningQueue,
            RestoreState::RestoreFull,
            RestoreState::RestoreFinished,
            RestoreState::RunningQueue,
            RestoreState::Final,
        ]
    );
    assert_eq!(result.history, history);
    assert_eq!(result.restored, vec!["com.kv".to_string(), "com.full".to_string()]);
    assert_eq!(result.offered, result.restored);
}

#[test]
fn mixed_session_delivers_data_to_agents() {
    let env = mixed_env();
    let observer = Arc::new(RecordingObserver::new());

    run_restore(&env, params(&["com.kv", "com.full"], &observer));

    let kv = env.agent("com.kv");
    assert!(kv.calls().contains(&AgentCall::Restore { app_version: 3 }));
    assert!(kv.calls().contains(&AgentCall::RestoreFinished));
    let entities = kv.restored_entities();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].key, "greeting");
    assert_eq!(entities[0].value.as_deref(), Some(&b"hi"[..]));

    let full = env.agent("com.full");
    let files = full.restored_files();
    assert_eq!(files.len(), 1);
    assert_eq!((files[0].domain.as_str(), files[0].path.as_str()), ("f", "notes.txt"));
    assert_eq!(files[0].content, b"hello");
    assert!(full.calls().contains(&AgentCall::RestoreFinished));
    assert_eq!(env.packages.cleared(), vec!["com.full".to_string()]);

    let binds = env.agents.binds();
    assert!(binds.contains(&("com.kv".to_string(), BindMode::Restore)));
    assert!(binds.contains(&("com.full".to_string(), BindMode::FullRestore)));

    assert_eq!(observer.restore_counts(), vec![2]);
    assert_eq!(
        observer.updates(),
        vec![(1, "com.kv".to_string()), (2, "com.full".to_string())]
    );
    assert_eq!(observer.restores_finished(), vec![PassStatus::Ok]);
    assert!(env.transport.calls().contains(&TransportCall::FinishRestore));
}

#[test]
fn dataset_from_newer_version_is_skipped() {
    let env = TestEnv::new();
    env.install(app("com.kv", 5));
    env.seed_package_metadata();
    env.install(app("com.kv", 3));
    env.transport.put_key_value("com.kv", "k", b"v");
    let observer = Arc::new(RecordingObserver::new());

    let (result, history) = run_restore(&env, params(&["com.kv"], &observer));

    assert_eq!(result.status, PassStatus::Ok);
    assert!(!history.contains(&RestoreState::RestoreKeyValue));
    assert!(result.restored.is_empty());
    assert_eq!(result.offered, vec!["com.kv".to_string()]);
    assert!(env.agents.binds().is_empty());
}

#[test]
fn restore_any_version_accepts_newer_dataset() {
    let env = TestEnv::new();
    env.install(app("com.kv", 5));
    env.seed_package_metadata();
    let mut older = app("com.kv", 3);
    older.restore_any_version = true;
    env.install(older);
    env.transport.put_key_value("com.kv", "k", b"v");
    let observer = Arc::new(RecordingObserver::new());

    let (result, _) = run_restore(&env, params(&["com.kv"], &observer));

    assert_eq!(result.restored, vec!["com.kv".to_string()]);
    assert!(env
        .agent("com.kv")
        .calls()
        .contains(&AgentCall::Restore { app_version: 5 }));
}

#[test]
fn signature_mismatch_skips_key_value_package() {
    let env = TestEnv::new();
    env.install(app("com.kv", 1));
    env.seed_package_metadata();
    env.install(app("com.kv", 1).with_signatures(vec![b"other-cert".to_vec()]));
    env.transport.put_key_value("com.kv", "k", b"v");
    let observer = Arc::new(RecordingObserver::new());

    let (result, history) = run_restore(&env, params(&["com.kv"], &observer));

    assert_eq!(result.status, PassStatus::Ok);
    assert!(history.contains(&RestoreState::RestoreKeyValue));
    assert!(!history.contains(&RestoreState::RestoreFinished));
    assert!(result.restored.is_empty());
    assert!(env.agents.binds().is_empty());
}

#[test]
fn side_channel_state_is_split_from_key_value_data() {
    let env = TestEnv::new();
    env.install(app("com.kv", 1));
    env.seed_package_metadata();
    env.transport.put_key_value("com.kv", "k", b"v");
    env.transport
        .put_key_value("com.kv", appbackup_codec::kv::WIDGET_KEY, b"widgets");
    let observer = Arc::new(RecordingObserver::new());

    run_restore(&env, params(&["com.kv"], &observer));

    assert_eq!(env.side_channel.restored(), vec![("com.kv".to_string(), b"widgets".to_vec())]);
    let entities = env.agent("com.kv").restored_entities();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].key, "k");
}

#[test]
fn missing_package_metadata_fails_the_session() {
    let env = TestEnv::new();
    env.install(app("com.kv", 1));
    env.transport.put_key_value("com.kv", "k", b"v");
    let observer = Arc::new(RecordingObserver::new());

    let (result, history) = run_restore(&env, params(&["com.kv"], &observer));

    assert_eq!(result.status, PassStatus::TransportError);
    assert_eq!(history, vec![RestoreState::Initial, RestoreState::Final]);
    assert_eq!(observer.restores_finished(), vec![PassStatus::TransportError]);
    assert!(env.transport.calls().contains(&TransportCall::FinishRestore));
}

#[test]
fn transport_read_failure_wipes_partial_data_and_fails() {
    let env = TestEnv::new();
    let full = full_data_app("com.full", 1);
    env.install(full.clone());
    env.seed_package_metadata();
    env.transport.put_full_archive(
        "com.full",
        package_archive(&full, 34, &[("f", "big.bin", &[9u8; 4096])]),
    );
    env.transport.set_chunk_size(512);
    env.transport.fail_full_reads("com.full");
    let observer = Arc::new(RecordingObserver::new());

    let (result, history) = run_restore(&env, params(&["com.full"], &observer));

    assert_eq!(result.status, PassStatus::TransportError);
    assert_eq!(history.last(), Some(&RestoreState::Final));
    assert!(!history.contains(&RestoreState::RestoreFinished));
    assert!(env.packages.cleared().contains(&"com.full".to_string()));
    assert!(result.restored.is_empty());
}

#[test]
fn failed_delivery_aborts_the_package_and_continues() {
    let env = TestEnv::with_config(|c| {
        c.with_timeouts(appbackup_core::Timeouts::uniform(std::time::Duration::from_millis(100)))
    });
    let full = full_data_app("com.full", 1);
    env.install(full.clone());
    env.install(app("com.kv", 1));
    env.seed_package_metadata();
    env.transport
        .put_full_archive("com.full", package_archive(&full, 34, &[("f", "a", b"abc")]));
    env.transport.put_key_value("com.kv", "k", b"v");
    env.agent("com.full").configure(|b| b.responds = false);
    let observer = Arc::new(RecordingObserver::new());

    let (result, _) = run_restore(&env, params(&["com.full", "com.kv"], &observer));

    assert_eq!(result.status, PassStatus::Ok);
    assert_eq!(result.restored, vec!["com.kv".to_string()]);
    assert!(env.transport.calls().contains(&TransportCall::AbortFullRestore));
    let cleared = env.packages.cleared();
    assert!(cleared.iter().filter(|p| *p == "com.full").count() >= 2);
}

#[test]
fn whole_device_restore_records_ancestral_set() {
    let env = mixed_env();
    let observer = Arc::new(RecordingObserver::new());
    let params = RestoreParams::new(9, observer.clone()).whole_device();

    let (result, _) = run_restore(&env, params);

    assert_eq!(result.status, PassStatus::Ok);
    let book = env.ctx.bookkeeping.lock();
    let (token, packages) = book.ancestral();
    assert_eq!(token, 9);
    let expected: BTreeSet<String> = ["com.full", "com.kv"].iter().map(|p| p.to_string()).collect();
    assert_eq!(packages, &expected);
}

#[test]
fn install_session_is_released_when_done() {
    let env = mixed_env();
    let observer = Arc::new(RecordingObserver::new());
    let params = RestoreParams::new(1, observer.clone()).for_install("com.kv", 42);

    let (result, _) = run_restore(&env, params);

    assert_eq!(result.restored, vec!["com.kv".to_string()]);
    assert_eq!(env.packages.finished_installs(), vec![(42, true)]);
}

/// Side channel whose restore path unwinds the thread calling it.
struct ExplodingSideChannel;

impl SideChannel for ExplodingSideChannel {
    fn snapshot(&self, _package: &str) -> Option<Vec<u8>> {
        None
    }

    fn restore(&self, package: &str, _blob: &[u8]) {
        panic!("side-channel restore for {package} blew up");
    }
}

#[test]
fn engine_panic_aborts_package_instead_of_hanging() {
    let env = TestEnv::with_config(|mut config| {
        config.timeouts.full_restore = Duration::from_secs(600);
        config
    });
    let full = full_data_app("com.full", 2);
    env.install(app("com.kv", 3));
    env.install(full.clone());
    env.seed_package_metadata();
    env.transport.put_key_value("com.kv", "k", b"v");

    let manifest = Manifest::new("com.full", 2, 34).with_signatures(full.signatures.clone());
    let widgets = MetadataRecord::with_widget_state("com.full", b"widgets".to_vec());
    let mut segment = PackageSegment::new(&manifest);
    segment.metadata = Some(&widgets);
    let files = vec![(FileInfo::file("com.full", "f", "notes.txt", 5), b"hello".to_vec())];
    env.transport
        .put_full_archive("com.full", encode_package(Vec::new(), segment, files).unwrap());

    let ctx = BackupContext::new(
        env.ctx.config.clone(),
        env.transport.clone(),
        env.packages.clone(),
        env.agents.clone(),
        Arc::new(ExplodingSideChannel),
    )
    .unwrap();
    let observer = Arc::new(RecordingObserver::new());
    let params = params(&["com.full", "com.kv"], &observer);

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mailbox = TaskMailbox::new();
        let mut task = RestoreTask::new(Arc::new(ctx), mailbox.callback(), params);
        drive_task(&mut task, &mailbox);
        let _ = tx.send(task.take_result());
    });
    let result = rx
        .recv_timeout(Duration::from_secs(60))
        .expect("restore session finished")
        .expect("restore result");

    assert_eq!(result.status, PassStatus::Ok);
    assert_eq!(result.restored, vec!["com.kv".to_string()]);
    assert!(env.transport.calls().contains(&TransportCall::AbortFullRestore));
    assert!(env.packages.cleared().contains(&"com.full".to_string()));
    assert!(env.agent("com.full").restored_files().is_empty());
}
