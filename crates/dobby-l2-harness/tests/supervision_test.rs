//! Integration test: daemon and helper supervision edge cases
//!
//! Validates that:
//! 1. A daemon that crashes while settling is one anomaly, and every case of
//!    the group fails with the startup error.
//! 2. A daemon that exits cleanly-but-early is an environment error, not an
//!    anomaly.
//! 3. The checkpoint helper is stopped by its interrupt handler, not killed.
//! 4. `pkill` finds a daemon configured by full path.
//!
//! Run: cargo test -p dobby-l2-harness --test supervision_test

mod common;

use common::{FakeDobby, LONG_RUNNING};
use dobby_l2_harness::groups::ContainerManipulations;
use dobby_l2_harness::process::ExitClass;
use dobby_l2_harness::runner::{HarnessContext, TestGroup, TestRunner};
use dobby_l2_harness::{DaemonLogging, HarnessError, Platform};

#[test]
fn startup_crash_is_recorded_once() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    fake.add_spec("sleepy", LONG_RUNNING);
    fake.inject_fault("startup_segv");
    let runner = TestRunner::new(HarnessContext::new(&fake.config));

    let groups: [&dyn TestGroup; 1] = [&ContainerManipulations];
    let suite = runner.run(&groups);
    assert_eq!(suite.anomalies.len(), 1, "{:?}", suite.anomalies);
    let anomaly = &suite.anomalies[0].anomaly;
    assert!(anomaly.exit.is_memory_fault());
    assert!(anomaly.detail.ends_with("during startup"), "{}", anomaly.detail);

    let group = suite.group("container_manipulations").unwrap();
    assert_eq!(group.tests, 9);
    assert_eq!(group.passed, 0);
    for verdict in &group.testsuite {
        assert!(verdict.message.contains("stopped during startup"), "{}", verdict.message);
    }
    assert!(!runner.context().supervisor.daemon_running());
}

#[test]
fn early_exit_is_an_environment_error() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    fake.inject_fault("startup_exit");
    let ctx = HarnessContext::new(&fake.config);

    match ctx.supervisor.start_daemon(DaemonLogging::JournalOnly) {
        Err(HarnessError::DaemonExited { exit, .. }) => assert_eq!(exit, ExitClass::Code(3)),
        Err(other) => panic!("expected DaemonExited, got {other}"),
        Ok(_) => panic!("daemon should not have started"),
    }
    assert!(ctx.supervisor.take_anomalies().is_empty());
    assert!(!ctx.supervisor.daemon_running());

    let verdicts = ContainerManipulations.execute(&ctx);
    assert!(verdicts.iter().all(|v| !v.passed));
    assert!(verdicts[0].message.contains("exited with code 3"), "{}", verdicts[0].message);
}

#[test]
fn helper_stops_through_its_interrupt_handler() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    let ctx = HarnessContext::new(&fake.config);

    let helper = ctx.supervisor.start_checkpoint_helper().unwrap();
    assert!(helper.pid().is_some());
    assert_eq!(helper.stop(), Some(ExitClass::Clean));
    assert!(fake.helper_interrupted(), "helper should see SIGINT before exiting");
    assert!(ctx.supervisor.take_anomalies().is_empty());
}

#[test]
fn pkill_targets_daemon_file_name() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    let mut config = fake.config.clone();
    // `env` runs its arguments unchanged, standing in for sudo.
    config.privilege_wrapper = Some(String::from("env"));
    assert!(config.daemon_program.contains('/'));
    let ctx = HarnessContext::new(&config);

    let daemon = ctx.supervisor.start_daemon(DaemonLogging::JournalOnly).unwrap();
    assert!(daemon.wait_for_log("started Dobby daemon"));
    let exit = daemon.stop().unwrap();
    assert_eq!(exit.exit, ExitClass::Clean, "daemon should stop on SIGTERM, not be killed");
    assert!(exit.log.contains("stopped Dobby daemon"));
}
