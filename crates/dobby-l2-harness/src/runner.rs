//! Test execution engine.
//!
//! Groups run strictly one after another and cases within a group run in
//! order. A group that panics or hits an environment error yields failed
//! verdicts; it never stops the groups after it.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;

use crate::case::{CaseKind, TestCase};
use crate::config::{HarnessConfig, Platform};
use crate::error::Result;
use crate::hibernation::HibernationProtocol;
use crate::poller::StatePoller;
use crate::report::{self, SuiteReport};
use crate::structured_log::{Event, LogEmitter, LogEntry, LogLevel, Outcome};
use crate::supervisor::{ProcessAnomaly, Supervisor};
use crate::tool::ControlTool;
use crate::verify::{CaseOutcome, GroupTally, TestVerdict};

/// A named, ordered collection of test cases with its own daemon lifecycle.
pub trait TestGroup {
    fn name(&self) -> &'static str;

    /// Platforms the group may run on. Checked statically before execution.
    fn supported_platforms(&self) -> &'static [Platform] {
        &Platform::ALL
    }

    /// Case descriptors as they would run on `platform`.
    fn cases(&self, platform: Platform) -> Vec<TestCase>;

    fn execute(&self, ctx: &HarnessContext<'_>) -> Vec<TestVerdict>;

    fn supports(&self, platform: Platform) -> bool {
        self.supported_platforms().contains(&platform)
    }
}

/// Everything a group needs while it runs.
#[derive(Debug)]
pub struct HarnessContext<'a> {
    pub config: &'a HarnessConfig,
    pub supervisor: Supervisor<'a>,
    events: Mutex<Option<LogEmitter>>,
    group: Mutex<Option<&'static str>>,
}

impl<'a> HarnessContext<'a> {
    #[must_use]
    pub fn new(config: &'a HarnessConfig) -> Self {
        Self {
            config,
            supervisor: Supervisor::new(config),
            events: Mutex::new(None),
            group: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_event_log(self, emitter: LogEmitter) -> Self {
        *self.events.lock() = Some(emitter);
        self
    }

    #[must_use]
    pub fn tool(&self) -> ControlTool<'a> {
        ControlTool::new(self.config)
    }

    #[must_use]
    pub fn poller(&self) -> StatePoller<'a> {
        StatePoller::new(self.tool())
    }

    #[must_use]
    pub fn hibernation(&self) -> HibernationProtocol<'a> {
        HibernationProtocol::new(self.tool())
    }

    /// Contents of the container's log file, or empty when there is none.
    #[must_use]
    pub fn container_log(&self, container_id: &str) -> String {
        crate::config::read_optional(&self.config.container_log_path(container_id))
    }

    /// Bind `outcome` to `case`, print it and log the verdict event.
    pub fn record(&self, case: &TestCase, mut outcome: CaseOutcome) -> TestVerdict {
        if outcome.log.is_empty()
            && let Some(id) = case.subject.id()
        {
            outcome.log = self.container_log(id);
        }
        let verdict = TestVerdict::new(&case.name, &case.description, outcome);
        report::print_verdict(&verdict);

        let group = self.group.lock().unwrap_or_default();
        let level = if verdict.passed {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        self.emit(
            LogEntry::new(level, Event::CaseVerdict)
                .with_group(group)
                .with_case(&verdict.name)
                .with_outcome(Outcome::from_passed(verdict.passed))
                .with_details(serde_json::json!({
                    "subject": case.subject.to_string(),
                    "message": verdict.message,
                })),
        );
        verdict
    }

    /// Write an event if an event log is configured. Write failures are
    /// logged and otherwise ignored.
    pub fn emit(&self, entry: LogEntry) {
        let mut events = self.events.lock();
        if let Some(emitter) = events.as_mut() {
            let entry = entry.with_platform(self.config.platform.name());
            if let Err(err) = emitter.emit(entry) {
                tracing::warn!(error = %err, "failed to write event log entry");
            }
        }
    }

    fn flush_events(&self) {
        if let Some(emitter) = self.events.lock().as_mut()
            && let Err(err) = emitter.flush()
        {
            tracing::warn!(error = %err, "failed to flush event log");
        }
    }
}

/// Dispatch one case on its kind. `observe` supplies the text to match for
/// plain match cases.
pub fn run_case(
    ctx: &HarnessContext<'_>,
    case: &TestCase,
    observe: impl FnOnce(&TestCase) -> Result<String>,
) -> CaseOutcome {
    match &case.kind {
        CaseKind::NamedProcedure(procedure) => procedure(ctx, case),
        CaseKind::ScriptedCommand { verb, .. } => {
            match ctx.tool().command(*verb, case.container_id(), &[]) {
                Ok(capture) => {
                    tracing::debug!("command output = {}", capture.stdout);
                    CaseOutcome::from_bool(case.check(&capture.stdout))
                }
                Err(err) => CaseOutcome::fail(err.to_string()),
            }
        }
        CaseKind::SimpleMatch | CaseKind::NegatedMatch => match observe(case) {
            Ok(observed) => CaseOutcome::from_bool(case.check(&observed)),
            Err(err) => CaseOutcome::fail(err.to_string()),
        },
    }
}

/// Runs groups in order and aggregates their verdicts.
pub struct TestRunner<'a> {
    ctx: HarnessContext<'a>,
}

impl<'a> TestRunner<'a> {
    #[must_use]
    pub fn new(ctx: HarnessContext<'a>) -> Self {
        Self { ctx }
    }

    #[must_use]
    pub fn context(&self) -> &HarnessContext<'a> {
        &self.ctx
    }

    /// Run every group in `groups`, pausing between executed groups.
    pub fn run(&self, groups: &[&dyn TestGroup]) -> SuiteReport {
        let ctx = &self.ctx;
        let platform = ctx.config.platform;
        let mut suite = SuiteReport::new(platform);
        ctx.emit(
            LogEntry::new(LogLevel::Info, Event::RunStart)
                .with_details(serde_json::json!({
                    "groups": groups.iter().map(|g| g.name()).collect::<Vec<_>>(),
                    "verbosity": ctx.config.verbosity.name(),
                })),
        );

        for (index, group) in groups.iter().enumerate() {
            let name = group.name();
            tracing::info!("Executing test Test Group: \"{name}\"");
            if !group.supports(platform) {
                report::print_unsupported_platform(name, platform);
                ctx.emit(
                    LogEntry::new(LogLevel::Warn, Event::GroupSkipped)
                        .with_group(name)
                        .with_outcome(Outcome::Skip),
                );
                suite.skip_group(name);
                continue;
            }

            let (verdicts, anomalies) = self.run_group(*group);
            suite.push_group(name, verdicts);
            for anomaly in anomalies {
                suite.push_anomaly(name, anomaly);
            }
            if index + 1 < groups.len() {
                thread::sleep(ctx.config.timings.group_pause);
            }
        }

        let totals = suite.totals();
        ctx.emit(
            LogEntry::new(LogLevel::Info, Event::RunEnd)
                .with_outcome(Outcome::from_passed(totals.all_passed()))
                .with_details(serde_json::json!({
                    "total": totals.total,
                    "passed": totals.passed,
                    "skipped_groups": suite.skipped_groups.len(),
                    "anomalies": suite.anomalies.len(),
                })),
        );
        ctx.flush_events();
        report::print_summary(&suite);
        suite
    }

    fn run_group(&self, group: &dyn TestGroup) -> (Vec<TestVerdict>, Vec<ProcessAnomaly>) {
        let ctx = &self.ctx;
        let name = group.name();
        *ctx.group.lock() = Some(name);
        ctx.emit(
            LogEntry::new(LogLevel::Info, Event::GroupStart)
                .with_group(name),
        );
        let started = Instant::now();

        let verdicts = match panic::catch_unwind(AssertUnwindSafe(|| group.execute(ctx))) {
            Ok(verdicts) => verdicts,
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| String::from("unknown panic"));
                tracing::error!(group = name, %reason, "test group aborted");
                let verdict = TestVerdict::new(
                    name,
                    "Test group aborted before completing",
                    CaseOutcome::fail(format!("group panicked: {reason}")),
                );
                report::print_verdict(&verdict);
                vec![verdict]
            }
        };

        let anomalies = ctx.supervisor.take_anomalies();
        for anomaly in &anomalies {
            ctx.emit(
                LogEntry::new(LogLevel::Fatal, Event::DaemonAnomaly)
                    .with_group(name)
                    .with_details(serde_json::to_value(anomaly).unwrap_or_default()),
            );
        }

        let tally = GroupTally::from_verdicts(&verdicts);
        report::print_group_totals(name, tally);
        ctx.emit(
            LogEntry::new(LogLevel::Info, Event::GroupEnd)
                .with_group(name)
                .with_outcome(Outcome::from_passed(tally.all_passed()))
                .with_duration_ms(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX))
                .with_details(serde_json::json!({
                    "total": tally.total,
                    "passed": tally.passed,
                })),
        );
        *ctx.group.lock() = None;
        (verdicts, anomalies)
    }
}
