//! Backup service tests.

use appbackup_core::{CoreError, PackageOutcome, PassStatus, RestoreParams, Timeouts, TransportStatus, PM_PACKAGE};
use appbackup_testkit::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn wait_until(what: &str, done: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn only_key_value_apps_can_request_backup() {
    let env = TestEnv::new();
    env.install(app("com.kv", 1));
    env.install(full_data_app("com.full", 1));
    let mut opted_out = app("com.private", 1);
    opted_out.allow_backup = false;
    env.install(opted_out);
    let service = env.start_service();

    assert!(service.request_backup("com.kv").expect("request"));
    assert!(!service.request_backup("com.full").expect("request"));
    assert!(!service.request_backup("com.private").expect("request"));
    assert!(!service.request_backup("com.gone").expect("request"));
    assert!(service.context().bookkeeping.lock().is_pending("com.kv"));
    assert!(!service.context().bookkeeping.lock().is_pending("com.full"));
}

#[test]
fn pass_backs_up_key_value_then_full_data() {
    let env = TestEnv::new();
    env.install(app("com.kv", 1));
    env.install(full_data_app("com.full", 1));
    env.agent("com.full")
        .configure(|b| b.full_files = vec![("f".into(), "a".into(), b"data".to_vec())]);
    let service = env.start_service();
    service.request_backup("com.kv").expect("request");
    let observer = Arc::new(RecordingObserver::new());

    service.run_backup_pass(observer.clone()).expect("start pass");

    assert_eq!(observer.wait_for_backups(1, WAIT), vec![PassStatus::Ok]);
    assert!(!service.is_backup_running());
    assert_eq!(observer.result_for("com.kv"), Some(PackageOutcome::Success));
    assert_eq!(observer.result_for("com.full"), Some(PackageOutcome::Success));
    assert!(env.transport.has_key_values("com.kv"));
    assert!(env.transport.full_archive("com.full").is_some());
}

#[test]
fn second_pass_is_refused_while_one_runs() {
    let env = TestEnv::with_config(|c| c.with_timeouts(Timeouts::uniform(Duration::from_millis(300))));
    env.install(app("com.slow", 1));
    env.agent("com.slow").configure(|b| b.responds = false);
    let service = env.start_service();
    service.request_backup("com.slow").expect("request");
    let observer = Arc::new(RecordingObserver::new());

    service.run_backup_pass(observer.clone()).expect("start pass");
    let second = service.run_backup_pass(observer.clone());

    assert!(matches!(second, Err(CoreError::PassInProgress)));
    assert!(service.is_backup_running());
    assert_eq!(observer.wait_for_backups(1, WAIT), vec![PassStatus::Ok]);
    assert_eq!(observer.result_for("com.slow"), Some(PackageOutcome::AgentFailure));
    assert!(service.context().bookkeeping.lock().is_pending("com.slow"));
}

#[test]
fn cancel_stops_the_running_pass() {
    let env = TestEnv::new();
    env.install(app("com.slow", 1));
    env.agent("com.slow").configure(|b| b.responds = false);
    let service = env.start_service();
    service.request_backup("com.slow").expect("request");
    let observer = Arc::new(RecordingObserver::new());

    service.run_backup_pass(observer.clone()).expect("start pass");
    let agent = env.agent("com.slow");
    wait_until("agent call", || !agent.calls().is_empty());

    assert_eq!(service.cancel_backups(), 1);
    assert_eq!(observer.wait_for_backups(1, WAIT), vec![PassStatus::Cancelled]);
    assert!(!service.is_backup_running());
}

#[test]
fn wiped_transport_reruns_the_pass() {
    let env = TestEnv::new();
    env.install(app("com.kv", 1));
    let service = env.start_service();
    let observer = Arc::new(RecordingObserver::new());
    service.request_backup("com.kv").expect("request");
    service.run_backup_pass(observer.clone()).expect("first pass");
    observer.wait_for_backups(1, WAIT);

    service.request_backup("com.kv").expect("request");
    env.transport.script_backup(PM_PACKAGE, TransportStatus::NotInitialized);
    service.run_backup_pass(observer.clone()).expect("second pass");

    assert_eq!(observer.wait_for_backups(2, WAIT), vec![PassStatus::Ok, PassStatus::Ok]);
    let initializations = env
        .transport
        .calls()
        .iter()
        .filter(|c| **c == TransportCall::InitializeDevice)
        .count();
    assert_eq!(initializations, 2);
    assert!(!service.context().bookkeeping.lock().is_pending("com.kv"));
}

#[test]
fn restore_sessions_run_on_the_worker() {
    let env = TestEnv::new();
    let full = full_data_app("com.full", 1);
    env.install(full.clone());
    env.install(app("com.kv", 1));
    env.seed_package_metadata();
    env.transport
        .put_full_archive("com.full", package_archive(&full, 34, &[("f", "a", b"data")]));
    env.transport.put_key_value("com.kv", "k", b"v");
    let service = env.start_service();
    let observer = Arc::new(RecordingObserver::new());

    service
        .begin_restore(RestoreParams::new(1, observer.clone()).whole_device())
        .expect("begin restore");
    service
        .begin_restore(RestoreParams::new(1, observer.clone()).with_packages(vec!["com.kv".into()]))
        .expect("begin restore");

    assert_eq!(observer.wait_for_restores(2, WAIT), vec![PassStatus::Ok, PassStatus::Ok]);
    wait_until("restore queue to drain", || service.queued_restores() == 0);
    assert_eq!(env.agent("com.full").restored_files().len(), 1);
    assert_eq!(env.agent("com.kv").restored_entities().len(), 2);
}

#[test]
fn stopped_service_refuses_work() {
    let env = TestEnv::new();
    let service = env.start_service();

    service.shutdown();
    service.shutdown();

    let observer = Arc::new(RecordingObserver::new());
    assert!(matches!(service.run_backup_pass(observer.clone()), Err(CoreError::ServiceStopped)));
    assert!(!service.is_backup_running());
    assert!(matches!(
        service.begin_restore(RestoreParams::new(1, observer)),
        Err(CoreError::ServiceStopped)
    ));
    assert_eq!(service.queued_restores(), 0);
    assert_eq!(service.next_pass_delay(), Duration::ZERO);
}

/// Installed `com.kv` with key-value data waiting in the transport.
fn install_env() -> TestEnv {
    let env = TestEnv::new();
    env.install(app("com.kv", 1));
    env.seed_package_metadata();
    env.transport.put_key_value("com.kv", "k", b"v");
    env
}

fn restore_tokens(env: &TestEnv) -> Vec<u64> {
    env.transport
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            TransportCall::StartRestore(token, _) => Some(token),
            _ => None,
        })
        .collect()
}

#[test]
fn install_restores_from_current_dataset_when_stored() {
    let env = install_env();
    {
        let mut book = env.ctx.bookkeeping.lock();
        book.set_current_token(7).expect("token");
        book.set_ancestral(3, vec!["com.kv".to_string()]).expect("ancestral");
        book.mark_stored("com.kv").expect("stored");
    }
    let service = env.start_service();

    assert!(service.restore_at_install("com.kv", 11).expect("restore at install"));

    wait_until("install to be released", || !env.packages.finished_installs().is_empty());
    assert_eq!(env.packages.finished_installs(), vec![(11, true)]);
    assert_eq!(restore_tokens(&env), vec![7]);
    assert_eq!(env.agent("com.kv").restored_entities().len(), 1);
}

#[test]
fn install_falls_back_to_ancestral_dataset() {
    let env = install_env();
    {
        let mut book = env.ctx.bookkeeping.lock();
        book.set_current_token(7).expect("token");
        book.set_ancestral(3, vec!["com.kv".to_string()]).expect("ancestral");
    }
    let service = env.start_service();

    assert!(service.restore_at_install("com.kv", 12).expect("restore at install"));

    wait_until("install to be released", || !env.packages.finished_installs().is_empty());
    assert_eq!(env.packages.finished_installs(), vec![(12, true)]);
    assert_eq!(restore_tokens(&env), vec![3]);
}

#[test]
fn install_without_any_dataset_is_released_at_once() {
    let env = install_env();
    env.ctx
        .bookkeeping
        .lock()
        .set_ancestral(3, vec!["com.other".to_string()])
        .expect("ancestral");
    let service = env.start_service();

    assert!(!service.restore_at_install("com.kv", 13).expect("restore at install"));

    assert_eq!(env.packages.finished_installs(), vec![(13, false)]);
    assert_eq!(service.queued_restores(), 0);
    assert!(restore_tokens(&env).is_empty());
    assert!(env.agents.binds().is_empty());
}
