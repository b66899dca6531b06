//! Key-value backup pass tests against in-memory collaborators.

use appbackup_codec::kv::WIDGET_KEY;
use appbackup_codec::Entity;
use appbackup_core::{
    drive_task, BackupFlags, KeyValueBackupTask, KeyValuePassResult, OperationKind, PackageOutcome, PassStatus,
    TaskMailbox, Timeouts, TransportStatus, PM_PACKAGE,
};
use appbackup_testkit::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn run_pass(env: &TestEnv, observer: Arc<RecordingObserver>) -> KeyValuePassResult {
    let mailbox = TaskMailbox::new();
    let (packages, journal) = env.ctx.bookkeeping.lock().take_pending();
    let mut task = KeyValueBackupTask::new(
        env.ctx.clone(),
        mailbox.callback(),
        observer,
        packages,
        journal,
        BackupFlags::default(),
    )
    .expect("create pass");
    drive_task(&mut task, &mailbox);
    task.take_result().expect("pass result")
}

fn env_with(packages: &[&str]) -> TestEnv {
    let env = TestEnv::new();
    for package in packages {
        env.install(app(package, 1));
    }
    env.request(packages);
    env
}

#[test]
fn stores_agent_data_for_requested_packages() {
    let env = env_with(&["com.a", "com.b"]);
    let observer = Arc::new(RecordingObserver::new());

    let result = run_pass(&env, observer.clone());

    assert_eq!(result.status, PassStatus::Ok);
    assert!(!result.rearm);
    for package in ["com.a", "com.b"] {
        assert_eq!(observer.result_for(package), Some(PackageOutcome::Success));
        assert_eq!(env.transport.key_values(package).get("key"), Some(&b"value".to_vec()));
        assert!(!env.is_pending(package));
    }
    assert!(env.transport.has_key_values(PM_PACKAGE));
    assert!(env.transport.calls().contains(&TransportCall::InitializeDevice));
    assert_eq!(env.ctx.bookkeeping.lock().current_token(), 1);
}

#[test]
fn second_pass_does_not_reinitialize() {
    let env = env_with(&["com.a"]);
    run_pass(&env, Arc::new(RecordingObserver::new()));
    env.request(&["com.a"]);
    run_pass(&env, Arc::new(RecordingObserver::new()));

    let initializations = env
        .transport
        .calls()
        .iter()
        .filter(|c| **c == TransportCall::InitializeDevice)
        .count();
    assert_eq!(initializations, 1);
}

#[test]
fn transport_error_reverts_the_whole_worklist() {
    let packages = ["p1", "p2", "p3", "p4", "p5"];
    let env = env_with(&packages);
    env.transport.script_backup("p3", TransportStatus::Error);

    let result = run_pass(&env, Arc::new(RecordingObserver::new()));

    assert_eq!(result.status, PassStatus::TransportError);
    for package in packages {
        assert!(env.is_pending(package), "{package} should be pending again");
    }
    let backed_up = env.transport.backed_up();
    assert!(backed_up.contains(&"p3".to_string()));
    assert!(!backed_up.contains(&"p4".to_string()));
    assert!(!backed_up.contains(&"p5".to_string()));
}

#[test]
fn quota_exceeded_notifies_agent_once_and_continues() {
    let env = env_with(&["com.a", "com.b", "com.c"]);
    env.transport.script_backup("com.b", TransportStatus::QuotaExceeded);
    let observer = Arc::new(RecordingObserver::new());

    let result = run_pass(&env, observer.clone());

    assert_eq!(result.status, PassStatus::Ok);
    assert_eq!(env.agent("com.b").quota_exceeded_calls().len(), 1);
    assert!(env.agent("com.a").quota_exceeded_calls().is_empty());
    assert_eq!(observer.result_for("com.b"), Some(PackageOutcome::QuotaExceeded));
    assert_eq!(observer.result_for("com.c"), Some(PackageOutcome::Success));
}

#[test]
fn rejected_package_does_not_stop_the_pass() {
    let env = env_with(&["com.a", "com.b"]);
    env.transport.script_backup("com.a", TransportStatus::PackageRejected);
    let observer = Arc::new(RecordingObserver::new());

    let result = run_pass(&env, observer.clone());

    assert_eq!(result.status, PassStatus::Ok);
    assert_eq!(observer.result_for("com.a"), Some(PackageOutcome::Rejected));
    assert_eq!(observer.result_for("com.b"), Some(PackageOutcome::Success));
}

#[test]
fn protected_key_fails_the_agent() {
    let env = env_with(&["com.a"]);
    env.agent("com.a").configure(|b| {
        b.backup_entities = vec![Entity::put(WIDGET_KEY, b"forged".to_vec())];
    });
    let observer = Arc::new(RecordingObserver::new());

    run_pass(&env, observer.clone());

    assert_eq!(observer.result_for("com.a"), Some(PackageOutcome::AgentFailure));
    assert!(env
        .agent("com.a")
        .calls()
        .iter()
        .any(|c| matches!(c, AgentCall::Fail(_))));
    assert!(!env.transport.has_key_values("com.a"));
    assert!(env.is_pending("com.a"));
}

#[test]
fn unbindable_agent_is_requeued() {
    let env = env_with(&["com.a", "com.b"]);
    env.agents.refuse("com.a");
    let observer = Arc::new(RecordingObserver::new());

    let result = run_pass(&env, observer.clone());

    assert_eq!(result.status, PassStatus::Ok);
    assert_eq!(observer.result_for("com.a"), Some(PackageOutcome::AgentFailure));
    assert_eq!(observer.result_for("com.b"), Some(PackageOutcome::Success));
    assert!(env.is_pending("com.a"));
    assert!(!env.is_pending("com.b"));
}

#[test]
fn side_channel_state_is_sent_once_per_change() {
    let env = env_with(&["com.a"]);
    env.side_channel.set("com.a", Some(b"widgets".to_vec()));
    run_pass(&env, Arc::new(RecordingObserver::new()));
    assert_eq!(env.transport.key_values("com.a").get(WIDGET_KEY), Some(&b"widgets".to_vec()));

    env.request(&["com.a"]);
    run_pass(&env, Arc::new(RecordingObserver::new()));
    let sizes: Vec<usize> = env
        .transport
        .calls()
        .iter()
        .filter_map(|c| match c {
            TransportCall::PerformBackup(p, size) if p == "com.a" => Some(*size),
            _ => None,
        })
        .collect();
    assert_eq!(sizes.len(), 2);
    assert!(sizes[1] < sizes[0]);
}

#[test]
fn ineligible_and_missing_packages_are_reported() {
    let env = TestEnv::new();
    env.install(full_data_app("com.full", 1));
    let mut stopped = app("com.stopped", 1);
    stopped.stopped = true;
    env.install(stopped);
    env.request(&["com.full", "com.stopped", "com.gone"]);
    let observer = Arc::new(RecordingObserver::new());

    let result = run_pass(&env, observer.clone());

    assert_eq!(result.status, PassStatus::Ok);
    assert_eq!(observer.result_for("com.full"), Some(PackageOutcome::Rejected));
    assert_eq!(observer.result_for("com.stopped"), Some(PackageOutcome::Rejected));
    assert_eq!(observer.result_for("com.gone"), Some(PackageOutcome::NotFound));
    assert!(env.agents.binds().is_empty());
}

#[test]
fn silent_agent_times_out_and_is_requeued() {
    let env = TestEnv::with_config(|c| c.with_timeouts(Timeouts::uniform(Duration::from_millis(100))));
    env.install(app("com.slow", 1));
    env.install(app("com.fast", 1));
    env.request(&["com.fast", "com.slow"]);
    env.agent("com.slow").configure(|b| b.responds = false);
    let observer = Arc::new(RecordingObserver::new());

    let result = run_pass(&env, observer.clone());

    assert_eq!(result.status, PassStatus::Ok);
    assert_eq!(observer.result_for("com.slow"), Some(PackageOutcome::AgentFailure));
    assert_eq!(observer.result_for("com.fast"), Some(PackageOutcome::Success));
    assert!(env.is_pending("com.slow"));
    assert!(!env.is_pending("com.fast"));
}

#[test]
fn wiped_transport_rearms_the_pass() {
    let env = env_with(&["com.a"]);
    run_pass(&env, Arc::new(RecordingObserver::new()));
    env.request(&["com.a"]);
    env.transport.script_backup(PM_PACKAGE, TransportStatus::NotInitialized);

    let result = run_pass(&env, Arc::new(RecordingObserver::new()));

    assert!(result.rearm);
    assert_eq!(result.status, PassStatus::TransportError);
    assert!(env.is_pending("com.a"));
    assert_eq!(env.ctx.bookkeeping.lock().current_token(), 0);
}

#[test]
fn cancelling_the_pass_stops_it() {
    let env = env_with(&["com.a", "com.b"]);
    env.agent("com.a").configure(|b| b.responds = false);

    let ctx = env.ctx.clone();
    let agent = env.agent("com.a");
    let canceller = thread::spawn(move || {
        let deadline = Instant::now() + TEST_TIMEOUT;
        while agent.calls().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        ctx.registry.cancel_all_of_kind(OperationKind::BackupTask, true)
    });
    let result = run_pass(&env, Arc::new(RecordingObserver::new()));

    assert_eq!(canceller.join().expect("canceller"), 1);
    assert_eq!(result.status, PassStatus::Cancelled);
    assert!(env.is_pending("com.a"));
    assert!(env.is_pending("com.b"));
    assert!(env.ctx.registry.is_empty());
}
