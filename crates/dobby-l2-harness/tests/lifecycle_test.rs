//! Integration test: test groups against a fake daemon and control tool
//!
//! Validates that:
//! 1. The scripted container sequence passes against a well-behaved tool.
//! 2. The hibernate/wakeup protocol passes and leaves no dump files behind.
//! 3. Every failed protocol step is reported with its own message.
//! 4. Bundle-started containers, pid limits and annotations are checked.
//! 5. Spec-launched containers fail cleanly when their spec is missing, and
//!    pass whether the workload exits or keeps running.
//! 6. Launches report exited, still running and not launched distinctly.
//! 7. Daemon banners, the process table and the host listener are checked.
//! 8. A daemon memory fault is an anomaly, not a failed verdict.
//!
//! Run: cargo test -p dobby-l2-harness --test lifecycle_test

mod common;

use common::{FakeDobby, LONG_RUNNING};
use dobby_l2_harness::groups::{
    Annotation, BasicSanity, CommandLineContainers, ContainerManipulations, Hibernation, Network,
    PidLimit, StartFromBundle,
};
use dobby_l2_harness::poller::PollSpec;
use dobby_l2_harness::process::ExitClass;
use dobby_l2_harness::runner::{HarnessContext, TestGroup, TestRunner};
use dobby_l2_harness::{DaemonLogging, LaunchOutcome, Platform};

fn messages(verdicts: &[dobby_l2_harness::TestVerdict]) -> Vec<String> {
    verdicts
        .iter()
        .map(|v| format!("{}: {} ({})", v.name, v.passed, v.message))
        .collect()
}

#[test]
fn container_manipulations_pass_against_fake_tool() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    fake.add_spec("sleepy", LONG_RUNNING);
    let ctx = HarnessContext::new(&fake.config);

    let verdicts = ContainerManipulations.execute(&ctx);
    assert_eq!(verdicts.len(), 9);
    assert!(verdicts.iter().all(|v| v.passed), "{:?}", messages(&verdicts));
    assert!(!fake.daemon_up(), "daemon should be stopped after the group");
    assert!(!ctx.supervisor.daemon_running());
}

#[test]
fn hibernation_protocol_round_trip() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    fake.add_bundle("sleepy", LONG_RUNNING, &[]);
    let ctx = HarnessContext::new(&fake.config);

    let verdicts = Hibernation.execute(&ctx);
    assert_eq!(verdicts.len(), 1);
    assert!(verdicts[0].passed, "{:?}", messages(&verdicts));
    assert_eq!(fake.dump_entries(), 0);
    assert!(!fake.config.bundle_path("sleepy").exists());
    assert!(!fake.daemon_up());
}

#[test]
fn hibernation_reports_missing_checkpoints() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    fake.add_bundle("sleepy", LONG_RUNNING, &[]);
    fake.inject_fault("hibernate");
    let ctx = HarnessContext::new(&fake.config);

    let verdicts = Hibernation.execute(&ctx);
    assert!(!verdicts[0].passed);
    assert_eq!(verdicts[0].message, "Not all pids checkpointed");
    assert!(!fake.config.bundle_path("sleepy").exists(), "bundle released on failure");
    assert!(!fake.daemon_up(), "daemon released on failure");
}

/// Run the hibernation group with `fault` injected and return its message.
fn hibernation_failure(fault: &str) -> String {
    let fake = FakeDobby::new(Platform::VagrantVm);
    fake.add_bundle("sleepy", LONG_RUNNING, &[]);
    fake.inject_fault(fault);
    let ctx = HarnessContext::new(&fake.config);

    let verdicts = Hibernation.execute(&ctx);
    assert_eq!(verdicts.len(), 1);
    assert!(!verdicts[0].passed, "{fault}: {}", verdicts[0].message);
    assert!(!fake.config.bundle_path("sleepy").exists());
    assert!(!fake.daemon_up());
    verdicts[0].message.clone()
}

#[test]
fn hibernation_reports_each_failed_step() {
    assert_eq!(hibernation_failure("hibernate_state"), "Failed to hibernate container");
    assert_eq!(hibernation_failure("wakeup"), "Failed to wakeup container");
    assert_eq!(hibernation_failure("restore"), "Not all pids restored");
    assert_eq!(
        hibernation_failure("pids"),
        "Restored pids [2001, 2002] differ from pids before hibernation [1001, 1002]"
    );
}

#[test]
fn launch_distinguishes_exit_from_still_running() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    fake.add_spec("echo", "Hello World");
    fake.add_spec("sleepy", LONG_RUNNING);
    let ctx = HarnessContext::new(&fake.config);
    let timings = &fake.config.timings;
    let window = PollSpec::new(timings.launch_timeout, timings.launch_poll);
    let daemon = ctx.supervisor.start_daemon(DaemonLogging::JournalOnly).unwrap();
    let tool = ctx.tool();

    let exited = tool.launch_and_await("echo", &fake.config.spec_path("echo"), window).unwrap();
    assert_eq!(exited, LaunchOutcome::Exited);

    let running = tool.launch_and_await("sleepy", &fake.config.spec_path("sleepy"), window).unwrap();
    assert_eq!(running, LaunchOutcome::StillRunning);
    assert!(running.is_launched());

    let absent = tool.launch_and_await("absent", &fake.config.spec_path("absent"), window).unwrap();
    match absent {
        LaunchOutcome::NotLaunched { diagnostic } => {
            assert!(diagnostic.starts_with("Container did not launch successfully"), "{diagnostic}");
        }
        other => panic!("expected NotLaunched, got {other:?}"),
    }

    tool.stop("sleepy").unwrap();
    let _ = daemon.stop();
}

#[test]
fn command_line_containers_pass_for_exited_and_running_workloads() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    fake.add_spec("echo", &format!("Hello World\n{LONG_RUNNING}"));
    fake.add_spec("mounts-vm", "Lorem ipsum dolor sit amet");
    fake.add_spec("envvar", "FOO=12345");
    fake.add_spec("wget-private", "wget: unable to resolve host address 'example.com'");
    fake.add_spec("wget", "HTTP request sent, awaiting response... 200 OK");
    let ctx = HarnessContext::new(&fake.config);

    let verdicts = CommandLineContainers.execute(&ctx);
    assert_eq!(verdicts.len(), 5);
    assert!(verdicts.iter().all(|v| v.passed), "{:?}", messages(&verdicts));
    assert!(!fake.daemon_up());
}

#[test]
fn basic_sanity_watches_banners_and_process_table() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    let ctx = HarnessContext::new(&fake.config);

    let verdicts = BasicSanity.execute(&ctx);
    assert_eq!(verdicts.len(), 4);
    assert!(verdicts.iter().all(|v| v.passed), "{:?}", messages(&verdicts));
    assert!(!fake.daemon_up());
    assert!(!ctx.supervisor.daemon_running());
}

#[test]
fn network_group_receives_container_message() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    fake.add_spec("network1", "DOBBY_TEST");
    let ctx = HarnessContext::new(&fake.config);

    let verdicts = Network.execute(&ctx);
    assert_eq!(verdicts.len(), 1);
    assert!(verdicts[0].passed, "{:?}", messages(&verdicts));
}

#[test]
fn network_group_fails_when_nothing_arrives() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    fake.add_spec("network1", "no message");
    let ctx = HarnessContext::new(&fake.config);

    let verdicts = Network.execute(&ctx);
    assert!(!verdicts[0].passed);
    assert!(verdicts[0].message.contains("DOBBY_TEST"), "{}", verdicts[0].message);
    assert!(ctx.supervisor.take_anomalies().is_empty());
}

#[test]
fn start_from_bundle_matches_logs() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    let lines: Vec<String> = (1..=10).map(|i| format!("Hello World {i}")).collect();
    fake.add_bundle("filelogging", &lines.join("\n"), &[]);
    fake.add_bundle("nolog", "", &[]);
    let ctx = HarnessContext::new(&fake.config);

    let verdicts = StartFromBundle.execute(&ctx);
    assert_eq!(verdicts.len(), 2);
    assert!(verdicts.iter().all(|v| v.passed), "{:?}", messages(&verdicts));
    assert!(!fake.config.bundle_path("filelogging").exists());
}

#[test]
fn pid_limit_and_annotation_groups() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    fake.add_bundle("sleepy", LONG_RUNNING, &[]);
    fake.add_bundle("sleepy_pid_limit", LONG_RUNNING, &[("pids.limit", "1000")]);
    let ctx = HarnessContext::new(&fake.config);

    let verdicts = PidLimit.execute(&ctx);
    assert!(verdicts.iter().all(|v| v.passed), "{:?}", messages(&verdicts));

    let verdicts = Annotation.execute(&ctx);
    assert_eq!(verdicts.len(), 1);
    assert!(verdicts[0].passed, "{:?}", messages(&verdicts));
}

#[test]
fn pid_limit_mismatch_names_both_values() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    fake.add_bundle("sleepy", LONG_RUNNING, &[("pids.limit", "4096")]);
    fake.add_bundle("sleepy_pid_limit", LONG_RUNNING, &[("pids.limit", "1000")]);
    let ctx = HarnessContext::new(&fake.config);

    let verdicts = PidLimit.execute(&ctx);
    assert!(!verdicts[0].passed);
    assert_eq!(
        verdicts[0].message,
        "Pid limit different than expected (expected: '256', actual: '4096')"
    );
    assert!(verdicts[1].passed);
}

#[test]
fn missing_specs_fail_each_case_without_aborting() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    let ctx = HarnessContext::new(&fake.config);

    let verdicts = CommandLineContainers.execute(&ctx);
    assert_eq!(verdicts.len(), 5);
    for verdict in &verdicts {
        assert!(!verdict.passed);
        assert!(verdict.message.contains("spec"), "{}", verdict.message);
    }
}

#[test]
fn missing_bundle_archive_is_an_environment_failure() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    let ctx = HarnessContext::new(&fake.config);

    let verdicts = Hibernation.execute(&ctx);
    assert!(!verdicts[0].passed);
    assert!(verdicts[0].message.contains("sleepy_bundle.tar.gz"), "{}", verdicts[0].message);
    assert!(!fake.daemon_up());
}

#[test]
fn second_daemon_is_refused() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    let ctx = HarnessContext::new(&fake.config);

    let daemon = ctx.supervisor.start_daemon(DaemonLogging::JournalAndConsole).unwrap();
    assert!(daemon.wait_for_log("started Dobby daemon"));
    assert!(ctx.supervisor.start_daemon(DaemonLogging::JournalOnly).is_err());

    let exit = daemon.stop().unwrap();
    assert_eq!(exit.exit, ExitClass::Clean);
    assert!(exit.log.contains("stopped Dobby daemon"));
    assert!(ctx.supervisor.start_daemon(DaemonLogging::JournalOnly).is_ok());
}

#[test]
fn daemon_memory_fault_is_an_anomaly() {
    let fake = FakeDobby::new(Platform::VagrantVm);
    fake.add_spec("sleepy", LONG_RUNNING);
    fake.inject_fault("segv");
    let runner = TestRunner::new(HarnessContext::new(&fake.config));

    let groups: [&dyn TestGroup; 1] = [&ContainerManipulations];
    let suite = runner.run(&groups);
    assert!(suite.all_passed(), "verdicts do not depend on daemon teardown");
    assert_eq!(suite.anomalies.len(), 1);
    assert_eq!(suite.anomalies[0].group, "container_manipulations");
    assert!(suite.anomalies[0].anomaly.exit.is_memory_fault());
}
