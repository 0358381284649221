//! Scripted control-tool sequence against one container started from its
//! spec: info, start, pause, resume, stop.

use std::sync::LazyLock;

use regex::Regex;

use crate::case::{Matcher, Subject, TestCase};
use crate::config::Platform;
use crate::runner::{self, HarnessContext, TestGroup};
use crate::tool::Verb;
use crate::verify::{CaseOutcome, TestVerdict};

const CONTAINER: &str = "sleepy";

/// The control tool pretty-prints `info`, so spacing around the colon varies.
static RUNNING_STATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""state"\s*:\s*"running""#).expect("running-state pattern is valid")
});

#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerManipulations;

fn scripted(name: &str, expected: Matcher, description: &str, verb: Verb) -> TestCase {
    TestCase::new(name, Subject::container(CONTAINER), expected, description).scripted(verb)
}

fn running() -> Matcher {
    Matcher::Pattern(RUNNING_STATE.clone())
}

fn confirm_removed(ctx: &HarnessContext<'_>, case: &TestCase) -> CaseOutcome {
    match ctx.poller().wait_until_gone(case.container_id(), super::launch_window(ctx)) {
        Ok(outcome) if outcome.satisfied => CaseOutcome::pass(),
        Ok(outcome) => CaseOutcome::fail("container still listed after stop").with_log(
            outcome.last.map(|s| s.raw).unwrap_or_default(),
        ),
        Err(err) => CaseOutcome::fail(err.to_string()),
    }
}

impl TestGroup for ContainerManipulations {
    fn name(&self) -> &'static str {
        "container_manipulations"
    }

    fn cases(&self, _platform: Platform) -> Vec<TestCase> {
        vec![
            scripted(
                "Check container not exists",
                Matcher::literal("failed to find container"),
                "Check if container is not running before tests",
                Verb::Info,
            ),
            scripted(
                "Start container",
                Matcher::literal(format!("started '{CONTAINER}' container")),
                "Starts container and check if it was started",
                Verb::Start,
            ),
            scripted(
                "Check container running",
                running(),
                "Check if container is running",
                Verb::Info,
            ),
            scripted(
                "Pause container",
                Matcher::literal(format!("paused container '{CONTAINER}'")),
                "Pauses container and check if it was paused",
                Verb::Pause,
            ),
            // Known inconsistency: the paused state string is not pinned down,
            // so only the absence of "running" is asserted.
            scripted(
                "Check container not running",
                running(),
                "Check if container is not running",
                Verb::Info,
            )
            .negated(),
            scripted(
                "Resume container",
                Matcher::literal(format!("resumed container '{CONTAINER}'")),
                "Resumes container and check if it was resumed",
                Verb::Resume,
            ),
            scripted(
                "Check container running",
                running(),
                "Check if container is running",
                Verb::Info,
            ),
            scripted(
                "Stop container",
                Matcher::literal(format!("stopped container '{CONTAINER}'")),
                "Stops container and check if it was stopped",
                Verb::Stop,
            ),
            TestCase::new(
                "Check container removed",
                Subject::container(CONTAINER),
                Matcher::literal("failed to find container"),
                "Check the stopped container is no longer listed",
            )
            .procedure(confirm_removed),
        ]
    }

    fn execute(&self, ctx: &HarnessContext<'_>) -> Vec<TestVerdict> {
        let cases = self.cases(ctx.config.platform);
        super::run_with_daemon(ctx, &cases, |case| {
            runner::run_case(ctx, case, |case| Ok(ctx.tool().info(case.container_id())?.stdout))
        })
    }
}
