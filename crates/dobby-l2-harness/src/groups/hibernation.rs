//! Checkpoint and restore of a running container through the memcr helper.

use crate::bundle::ScopedBundle;
use crate::case::{Matcher, Subject, TestCase};
use crate::config::Platform;
use crate::runner::{HarnessContext, TestGroup};
use crate::supervisor::DaemonLogging;
use crate::verify::{CaseOutcome, TestVerdict};

#[derive(Debug, Clone, Copy, Default)]
pub struct Hibernation;

/// Daemon, helper and bundle are acquired in that order and released in
/// reverse, whichever step fails.
fn basic_memcr_test(ctx: &HarnessContext<'_>, case: &TestCase) -> CaseOutcome {
    let id = case.container_id();
    let daemon = match ctx.supervisor.start_daemon(DaemonLogging::JournalOnly) {
        Ok(daemon) => daemon,
        Err(err) => return CaseOutcome::fail(err.to_string()),
    };
    let helper = match ctx.supervisor.start_checkpoint_helper() {
        Ok(helper) => helper,
        Err(err) => return CaseOutcome::fail(err.to_string()),
    };
    let bundle = match ScopedBundle::acquire(ctx.config, id) {
        Ok(bundle) => bundle,
        Err(err) => return CaseOutcome::fail(err.to_string()),
    };

    let outcome = match ctx.hibernation().run(id, bundle.path()) {
        Ok(trace) => {
            tracing::debug!(container = id, phases = ?trace.phases, "hibernation protocol completed");
            CaseOutcome::pass()
        }
        Err(failure) => {
            tracing::debug!(container = id, phase = %failure.phase, "hibernation protocol failed");
            CaseOutcome::fail(failure.reason)
        }
    };

    drop(bundle);
    let _ = helper.stop();
    let _ = daemon.stop();
    outcome
}

impl TestGroup for Hibernation {
    fn name(&self) -> &'static str {
        "hibernation"
    }

    fn cases(&self, _platform: Platform) -> Vec<TestCase> {
        vec![
            TestCase::new(
                "Basic memcr test",
                Subject::container("sleepy"),
                Matcher::literal("hibernated"),
                "Starts container, hibernates it and wakes it up",
            )
            .procedure(basic_memcr_test),
        ]
    }

    fn execute(&self, ctx: &HarnessContext<'_>) -> Vec<TestVerdict> {
        self.cases(ctx.config.platform)
            .iter()
            .map(|case| {
                let outcome = crate::runner::run_case(ctx, case, |_| Ok(String::new()));
                ctx.record(case, outcome)
            })
            .collect()
    }
}
