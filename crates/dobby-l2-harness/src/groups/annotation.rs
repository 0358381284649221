//! Annotate a running container, read the annotation back, remove it.

use crate::bundle;
use crate::case::{Matcher, Subject, TestCase};
use crate::config::Platform;
use crate::error::Result;
use crate::runner::{self, HarnessContext, TestGroup};
use crate::tool::{CommandCapture, ControlTool, start_acknowledged};
use crate::verify::{CaseOutcome, TestVerdict};

const KEY: &str = "Key1";
const VALUE: &str = "Value1";

#[derive(Debug, Clone, Copy, Default)]
pub struct Annotation;

/// Stdout of a finished command; an environment error becomes the outcome.
fn step(result: Result<CommandCapture>) -> std::result::Result<String, CaseOutcome> {
    match result {
        Ok(capture) => {
            tracing::debug!("command returned {}", capture.stdout);
            Ok(capture.stdout)
        }
        Err(err) => Err(CaseOutcome::fail(err.to_string())),
    }
}

fn validate_annotation(tool: ControlTool<'_>, case: &TestCase) -> CaseOutcome {
    let id = case.container_id();
    let check = || -> std::result::Result<CaseOutcome, CaseOutcome> {
        let annotated = step(tool.annotate(id, KEY, VALUE))?;
        if !annotated.contains(&format!("annotate successful for container '{id}'")) {
            return Ok(CaseOutcome::fail("annotation failed").with_log(annotated));
        }
        let info = step(tool.info(id))?;
        if !case.expected.is_match(&info) {
            return Ok(CaseOutcome::fail("annotation is not found in container info").with_log(info));
        }
        let removed = step(tool.remove_annotation(id, KEY))?;
        if !removed.contains(&format!("removed {KEY} key from container '{id}'")) {
            return Ok(CaseOutcome::fail("remove annotation failed").with_log(removed));
        }
        let info = step(tool.info(id))?;
        if case.expected.is_match(&info) {
            return Ok(CaseOutcome::fail("annotation is still found in container info after removal")
                .with_log(info));
        }
        Ok(CaseOutcome::pass())
    };
    check().unwrap_or_else(|failed| failed)
}

fn test_container(ctx: &HarnessContext<'_>, case: &TestCase) -> CaseOutcome {
    let id = case.container_id();
    tracing::debug!("Running {id} container test");
    let tool = ctx.tool();
    bundle::with_bundle(ctx.config, id, |path| {
        let capture = match tool.start(id, path) {
            Ok(capture) => capture,
            Err(err) => return CaseOutcome::fail(format!("{}: {err}", super::LAUNCH_FAILED)),
        };
        if !start_acknowledged(&capture.stdout, id) {
            return CaseOutcome::fail(super::LAUNCH_FAILED).with_log(capture.describe());
        }
        let outcome = validate_annotation(tool, case);
        if let Err(err) = tool.stop(id) {
            tracing::warn!(container = id, error = %err, "failed to stop container");
        }
        outcome
    })
    .unwrap_or_else(|err| CaseOutcome::fail(err.to_string()))
}

impl TestGroup for Annotation {
    fn name(&self) -> &'static str {
        "annotation"
    }

    fn cases(&self, _platform: Platform) -> Vec<TestCase> {
        vec![
            TestCase::new(
                "annotations",
                Subject::container("sleepy"),
                Matcher::literal(format!("\"{KEY}\" : \"{VALUE}\"")),
                "Starts container, adds a key&value pair, confirms annotation, then removes the annotation and confirms removal",
            )
            .procedure(test_container),
        ]
    }

    fn execute(&self, ctx: &HarnessContext<'_>) -> Vec<TestVerdict> {
        let cases = self.cases(ctx.config.platform);
        super::run_with_daemon(ctx, &cases, |case| runner::run_case(ctx, case, |_| Ok(String::new())))
    }
}
