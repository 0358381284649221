//! Containers launched from their JSON spec; each one writes its result to
//! its log file.

use crate::case::{Matcher, Subject, TestCase};
use crate::config::Platform;
use crate::error::HarnessError;
use crate::runner::{HarnessContext, TestGroup};
use crate::verify::{CaseOutcome, TestVerdict};

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLineContainers;

fn case(name: &str, container: &str, expected: &str, description: &str) -> TestCase {
    TestCase::new(
        name,
        Subject::container(container),
        Matcher::literal(expected),
        description,
    )
}

impl TestGroup for CommandLineContainers {
    fn name(&self) -> &'static str {
        "command_line_containers"
    }

    fn supported_platforms(&self) -> &'static [Platform] {
        &[Platform::VagrantVm, Platform::Xi6, Platform::GithubWorkflowVm]
    }

    fn cases(&self, platform: Platform) -> Vec<TestCase> {
        let mounts = if platform == Platform::Xi6 {
            case(
                "Check mounts",
                "mounts-xi6",
                "JENKINS_BUILD_NUMBER=",
                "Mounts a sample text file into the container and attempts to read it",
            )
        } else {
            case(
                "Check mounts",
                "mounts-vm",
                "lorem ipsum",
                "Mounts a sample text file into the container and attempts to read it",
            )
        };
        vec![
            case(
                "Check echo",
                "echo",
                "hello world",
                "Prints \"Hello World\" to the console as a baseline functionality test",
            ),
            mounts,
            case(
                "Check environment variables",
                "envvar",
                "12345",
                "Set environment variables",
            ),
            case(
                "Check private network",
                "wget-private",
                "unable to resolve host address",
                "With Private networking, the container should not be able to reach external webpages",
            ),
            case(
                "Check network",
                "wget",
                "HTTP request sent, awaiting response... 200 OK",
                "With NAT networking, the container should be able to fetch webpages",
            ),
        ]
    }

    fn execute(&self, ctx: &HarnessContext<'_>) -> Vec<TestVerdict> {
        let cases = self.cases(ctx.config.platform);
        super::run_with_daemon(ctx, &cases, |case| {
            let spec = ctx.config.spec_path(case.container_id());
            tracing::debug!("Container spec path is {}", spec.display());
            if !spec.is_file() {
                return CaseOutcome::fail(HarnessError::MissingSpec(spec).to_string());
            }
            super::launch_and_check_log(ctx, case, &spec)
        })
    }
}
