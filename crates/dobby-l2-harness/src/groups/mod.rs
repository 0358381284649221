//! The L2 test groups, in execution order.
//!
//! Every group that talks to the daemon starts its own instance and stops it
//! before returning, so no group observes state left by another.

mod annotation;
mod basic_sanity;
mod bundle_generation;
mod command_line_containers;
mod container_manipulations;
mod hibernation;
mod network;
mod pid_limit;
mod start_from_bundle;

use std::path::Path;

pub use annotation::Annotation;
pub use basic_sanity::BasicSanity;
pub use bundle_generation::BundleGeneration;
pub use command_line_containers::CommandLineContainers;
pub use container_manipulations::ContainerManipulations;
pub use hibernation::Hibernation;
pub use network::Network;
pub use pid_limit::PidLimit;
pub use start_from_bundle::StartFromBundle;

use crate::case::TestCase;
use crate::error::Result;
use crate::poller::PollSpec;
use crate::runner::{HarnessContext, TestGroup};
use crate::supervisor::DaemonLogging;
use crate::tool::LaunchOutcome;
use crate::verify::{CaseOutcome, TestVerdict};

pub(crate) const LAUNCH_FAILED: &str = "Container did not launch successfully";
pub(crate) const LOG_MISMATCH: &str = "Output file did not contain expected text";

/// Every group, in the order `run-all` executes them.
#[must_use]
pub fn all_groups() -> Vec<Box<dyn TestGroup>> {
    vec![
        Box::new(BasicSanity),
        Box::new(ContainerManipulations),
        Box::new(CommandLineContainers),
        Box::new(StartFromBundle),
        Box::new(BundleGeneration),
        Box::new(PidLimit),
        Box::new(Annotation),
        Box::new(Hibernation),
        Box::new(Network),
    ]
}

#[must_use]
pub fn find_group(name: &str) -> Option<Box<dyn TestGroup>> {
    all_groups().into_iter().find(|g| g.name() == name)
}

#[must_use]
pub fn group_names() -> Vec<&'static str> {
    all_groups().iter().map(|g| g.name()).collect()
}

/// Start a daemon, run `body` for each case in order, then stop it. If the
/// daemon cannot be started every case fails with the startup error.
pub(crate) fn run_with_daemon(
    ctx: &HarnessContext<'_>,
    cases: &[TestCase],
    mut body: impl FnMut(&TestCase) -> CaseOutcome,
) -> Vec<TestVerdict> {
    let daemon = match ctx.supervisor.start_daemon(DaemonLogging::JournalOnly) {
        Ok(daemon) => daemon,
        Err(err) => return fail_all(ctx, cases, &err.to_string()),
    };
    let verdicts = cases
        .iter()
        .map(|case| {
            let outcome = body(case);
            ctx.record(case, outcome)
        })
        .collect();
    let _ = daemon.stop();
    verdicts
}

pub(crate) fn fail_all(ctx: &HarnessContext<'_>, cases: &[TestCase], message: &str) -> Vec<TestVerdict> {
    tracing::error!("{message}");
    cases
        .iter()
        .map(|case| ctx.record(case, CaseOutcome::fail(message)))
        .collect()
}

pub(crate) fn launch_window(ctx: &HarnessContext<'_>) -> PollSpec {
    let timings = &ctx.config.timings;
    PollSpec::new(timings.launch_timeout, timings.launch_poll)
}

/// Turn a launch result into a failed outcome, or `None` when the container
/// launched.
pub(crate) fn launch_failure(launched: Result<LaunchOutcome>) -> Option<CaseOutcome> {
    match launched {
        Ok(LaunchOutcome::NotLaunched { diagnostic }) => {
            Some(CaseOutcome::fail(LAUNCH_FAILED).with_log(diagnostic))
        }
        Ok(_) => None,
        Err(err) => Some(CaseOutcome::fail(format!("{LAUNCH_FAILED}: {err}"))),
    }
}

/// Case-insensitive match of the case's expectation against the
/// container's log file.
pub(crate) fn check_container_log(ctx: &HarnessContext<'_>, case: &TestCase) -> CaseOutcome {
    let log = ctx.container_log(case.container_id());
    if case.expected.is_match_ignore_case(&log) {
        CaseOutcome::pass().with_log(log)
    } else {
        CaseOutcome::fail(LOG_MISMATCH).with_log(log)
    }
}

/// Launch from `path` and, once launched, check the container log.
pub(crate) fn launch_and_check_log(ctx: &HarnessContext<'_>, case: &TestCase, path: &Path) -> CaseOutcome {
    tracing::debug!("Running {} container test", case.container_id());
    let launched = ctx
        .tool()
        .launch_and_await(case.container_id(), path, launch_window(ctx));
    launch_failure(launched).unwrap_or_else(|| check_container_log(ctx, case))
}
