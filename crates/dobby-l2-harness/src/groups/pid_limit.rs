//! The pids cgroup limit a started container ends up with.

use std::fs;
use std::path::PathBuf;

use crate::bundle;
use crate::case::{Matcher, Subject, TestCase};
use crate::config::Platform;
use crate::runner::{HarnessContext, TestGroup};
use crate::tool::start_acknowledged;
use crate::verify::{CaseOutcome, TestVerdict};

#[derive(Debug, Clone, Copy, Default)]
pub struct PidLimit;

fn pids_max_path(ctx: &HarnessContext<'_>, container_id: &str) -> PathBuf {
    ctx.config.cgroup_pids_root.join(container_id).join("pids.max")
}

/// Compare the first line of `pids.max` with the expected limit.
fn validate_pid_limit(ctx: &HarnessContext<'_>, case: &TestCase) -> CaseOutcome {
    let path = pids_max_path(ctx, case.container_id());
    if !path.exists() {
        return CaseOutcome::fail(format!("{} not found", path.display()));
    }
    let actual = match fs::read_to_string(&path) {
        Ok(text) => text.lines().next().unwrap_or_default().trim().to_string(),
        Err(err) => return CaseOutcome::fail(format!("{}: {err}", path.display())),
    };
    if case.expected.matches_exactly(&actual) {
        CaseOutcome::pass()
    } else {
        CaseOutcome::fail(format!(
            "Pid limit different than expected (expected: '{}', actual: '{actual}')",
            case.expected.text()
        ))
    }
}

fn test_container(ctx: &HarnessContext<'_>, case: &TestCase) -> CaseOutcome {
    let id = case.container_id();
    tracing::debug!("Running {id} container test");
    let tool = ctx.tool();
    let result = bundle::with_bundle(ctx.config, id, |path| {
        let capture = match tool.start(id, path) {
            Ok(capture) => capture,
            Err(err) => return CaseOutcome::fail(format!("{}: {err}", super::LAUNCH_FAILED)),
        };
        if !start_acknowledged(&capture.stdout, id) {
            return CaseOutcome::fail(super::LAUNCH_FAILED).with_log(capture.describe());
        }
        let outcome = validate_pid_limit(ctx, case);
        if let Err(err) = tool.stop(id) {
            tracing::warn!(container = id, error = %err, "failed to stop container");
        }
        outcome
    });
    result.unwrap_or_else(|err| CaseOutcome::fail(err.to_string()))
}

impl TestGroup for PidLimit {
    fn name(&self) -> &'static str {
        "pid_limit"
    }

    fn cases(&self, _platform: Platform) -> Vec<TestCase> {
        vec![
            TestCase::new(
                "Pid limit default",
                Subject::container("sleepy"),
                Matcher::literal("256"),
                "Starts container with no pid limit specified, checks if default pid limit is set for container",
            )
            .procedure(test_container),
            TestCase::new(
                "Pid limit no override",
                Subject::container("sleepy_pid_limit"),
                Matcher::literal("1000"),
                "Starts container with pid limit specified in config.json, checks if that pid limit was not overriden",
            )
            .procedure(test_container),
        ]
    }

    fn execute(&self, ctx: &HarnessContext<'_>) -> Vec<TestVerdict> {
        let cases = self.cases(ctx.config.platform);
        super::run_with_daemon(ctx, &cases, |case| crate::runner::run_case(ctx, case, |_| Ok(String::new())))
    }
}
