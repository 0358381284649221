//! Container-to-host networking: a container sends a token to a listener
//! on the host.

use std::thread;

use crate::case::{Matcher, Subject, TestCase};
use crate::config::Platform;
use crate::runner::{HarnessContext, TestGroup};
use crate::verify::{CaseOutcome, TestVerdict};

const LISTEN_PORT: &str = "7357";

#[derive(Debug, Clone, Copy, Default)]
pub struct Network;

fn listener_argv(ctx: &HarnessContext<'_>) -> Vec<String> {
    let mut argv = vec![ctx.config.listener_program.clone()];
    argv.extend(["-l", "localhost", LISTEN_PORT].map(String::from));
    argv
}

fn test_container(ctx: &HarnessContext<'_>, case: &TestCase) -> CaseOutcome {
    let id = case.container_id();
    let listener = match ctx.supervisor.start_listener(&listener_argv(ctx)) {
        Ok(listener) => listener,
        Err(err) => return CaseOutcome::fail(err.to_string()),
    };
    let spec = ctx.config.spec_path(id);
    let launched = ctx.tool().launch_and_await(id, &spec, super::launch_window(ctx));
    if let Some(failed) = super::launch_failure(launched) {
        return failed;
    }
    thread::sleep(ctx.config.timings.listener_settle);

    let received = listener.collect();
    tracing::debug!("listener received {received:?}");
    if case.expected.is_match(&received) {
        CaseOutcome::pass()
    } else {
        CaseOutcome::fail(format!("expected {} from container", case.expected.describe())).with_log(received)
    }
}

impl TestGroup for Network {
    fn name(&self) -> &'static str {
        "network"
    }

    fn supported_platforms(&self) -> &'static [Platform] {
        &[Platform::NoSelection, Platform::VagrantVm, Platform::GithubWorkflowVm]
    }

    fn cases(&self, _platform: Platform) -> Vec<TestCase> {
        vec![
            TestCase::new(
                "Container to host",
                Subject::container("network1"),
                Matcher::literal("DOBBY_TEST"),
                "Container sends a message to a listener on the host",
            )
            .procedure(test_container),
        ]
    }

    fn execute(&self, ctx: &HarnessContext<'_>) -> Vec<TestVerdict> {
        let cases = self.cases(ctx.config.platform);
        super::run_with_daemon(ctx, &cases, |case| crate::runner::run_case(ctx, case, |_| Ok(String::new())))
    }
}
