//! Daemon start/stop banners and process presence.

use crate::case::{Matcher, Subject, TestCase};
use crate::config::Platform;
use crate::runner::{HarnessContext, TestGroup};
use crate::supervisor::DaemonLogging;
use crate::verify::{CaseOutcome, TestVerdict};

const LOGGING: DaemonLogging = DaemonLogging::JournalAndConsole;

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicSanity;

/// `ps -ax` output, or the error text when it could not be run.
fn process_table(ctx: &HarnessContext<'_>) -> Result<String, String> {
    let argv = [String::from("ps"), String::from("-ax")];
    ctx.tool().run(&argv).map(|c| c.stdout).map_err(|e| e.to_string())
}

fn check_processes(ctx: &HarnessContext<'_>, case: &TestCase) -> CaseOutcome {
    match process_table(ctx) {
        Ok(table) => CaseOutcome::from_bool(case.check(&table)),
        Err(err) => CaseOutcome::fail(err),
    }
}

impl TestGroup for BasicSanity {
    fn name(&self) -> &'static str {
        "basic_sanity"
    }

    fn supported_platforms(&self) -> &'static [Platform] {
        &[Platform::VagrantVm, Platform::GithubWorkflowVm]
    }

    fn cases(&self, _platform: Platform) -> Vec<TestCase> {
        let flags = LOGGING.flags().join(" ");
        vec![
            TestCase::new(
                "Start daemon",
                Subject::None,
                Matcher::literal("started Dobby daemon"),
                "Starts the daemon and waits for its startup message",
            ),
            TestCase::new(
                "Check daemon running",
                Subject::None,
                Matcher::literal(flags.clone()),
                "Checks the daemon shows up in the process table",
            ),
            TestCase::new(
                "Stop daemon",
                Subject::None,
                Matcher::literal("stopped Dobby daemon"),
                "Stops the daemon and waits for its shutdown message",
            ),
            TestCase::new(
                "Check daemon not running",
                Subject::None,
                Matcher::literal(flags),
                "Checks the daemon is gone from the process table",
            )
            .negated(),
        ]
    }

    fn execute(&self, ctx: &HarnessContext<'_>) -> Vec<TestVerdict> {
        let cases = self.cases(ctx.config.platform);
        let [start, running, stop, gone] = cases.as_slice() else {
            return Vec::new();
        };

        let daemon = match ctx.supervisor.start_daemon(LOGGING) {
            Ok(daemon) => daemon,
            Err(err) => return super::fail_all(ctx, &cases, &err.to_string()),
        };
        let mut verdicts = Vec::with_capacity(cases.len());

        let banner = start.expected.text();
        let outcome = if daemon.wait_for_log(&banner) {
            CaseOutcome::pass()
        } else {
            CaseOutcome::fail(format!("'{banner}' not printed")).with_log(daemon.log_tail(50))
        };
        verdicts.push(ctx.record(start, outcome));
        verdicts.push(ctx.record(running, check_processes(ctx, running)));

        let banner = stop.expected.text();
        let outcome = match daemon.stop() {
            Some(exit) if exit.log.wait_for(&banner, ctx.config.timings.banner_timeout) => {
                CaseOutcome::pass()
            }
            Some(exit) => CaseOutcome::fail(format!("'{banner}' not printed, daemon {}", exit.exit)),
            None => CaseOutcome::fail("daemon was not running"),
        };
        verdicts.push(ctx.record(stop, outcome));
        verdicts.push(ctx.record(gone, check_processes(ctx, gone)));
        verdicts
    }
}
