//! Containers launched from an extracted OCI bundle.

use crate::bundle;
use crate::case::{Matcher, Subject, TestCase};
use crate::config::Platform;
use crate::runner::{HarnessContext, TestGroup};
use crate::verify::TestVerdict;

#[derive(Debug, Clone, Copy, Default)]
pub struct StartFromBundle;

impl TestGroup for StartFromBundle {
    fn name(&self) -> &'static str {
        "start_from_bundle"
    }

    fn supported_platforms(&self) -> &'static [Platform] {
        &[Platform::VagrantVm, Platform::Xi6, Platform::GithubWorkflowVm]
    }

    fn cases(&self, _platform: Platform) -> Vec<TestCase> {
        vec![
            TestCase::new(
                "Logging to file",
                Subject::container("filelogging"),
                Matcher::all_of(["hello world 1", "hello world 2", "hello world 10"]),
                "Prints hello world 10 times, output should be contained in the logfile",
            ),
            TestCase::new(
                "No logging",
                Subject::container("nolog"),
                Matcher::literal(""),
                "Starts a container without any logfile",
            ),
        ]
    }

    fn execute(&self, ctx: &HarnessContext<'_>) -> Vec<TestVerdict> {
        let cases = self.cases(ctx.config.platform);
        super::run_with_daemon(ctx, &cases, |case| {
            let id = case.container_id();
            tracing::debug!("Running {id} container test");
            // The bundle is gone by the time the log is read.
            let launched = bundle::with_bundle(ctx.config, id, |path| {
                ctx.tool().launch_and_await(id, path, super::launch_window(ctx))
            })
            .and_then(|launched| launched);
            super::launch_failure(launched).unwrap_or_else(|| super::check_container_log(ctx, case))
        })
    }
}
