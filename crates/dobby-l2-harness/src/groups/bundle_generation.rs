//! Bundle generator output compared against a reference bundle.
//!
//! The reference is shipped as a tarball so empty directories survive
//! version control; it is extracted for the duration of the group.

use std::path::PathBuf;

use crate::bundle::ScopedBundle;
use crate::case::{Matcher, Subject, TestCase};
use crate::config::{HarnessConfig, Platform};
use crate::runner::{HarnessContext, TestGroup};
use crate::tool::run_command;
use crate::verify::{CaseOutcome, TestVerdict};

const CONTAINER: &str = "sleepy";

#[derive(Debug, Clone, Copy, Default)]
pub struct BundleGeneration;

/// Where the generator writes its bundle.
fn generated_path(config: &HarnessConfig) -> PathBuf {
    config.bundle_dir.join(CONTAINER)
}

fn run(config: &HarnessConfig, argv: &[String]) -> Result<crate::tool::CommandCapture, CaseOutcome> {
    run_command(argv, config.timings.command_timeout).map_err(|e| CaseOutcome::fail(e.to_string()))
}

fn create_bundle(config: &HarnessConfig, case: &TestCase) -> CaseOutcome {
    let argv = vec![
        config.bundle_generator_program.clone(),
        String::from("-i"),
        config.spec_path(CONTAINER).display().to_string(),
        String::from("-o"),
        generated_path(config).display().to_string(),
    ];
    let status = match run(config, &argv) {
        Ok(status) => status,
        Err(failed) => return failed,
    };
    let outcome = if status.stderr.to_lowercase().contains("failed to create bundle") {
        CaseOutcome::fail("Failed to create bundle")
    } else if !case.expected.is_match_ignore_case(&status.stdout) {
        CaseOutcome::fail("Failed to run Dobby Bundle Generator Tool")
    } else {
        CaseOutcome::pass()
    };
    outcome.with_log(status.stderr)
}

fn diff_bundles(config: &HarnessConfig, reference: &ScopedBundle) -> CaseOutcome {
    let argv = vec![
        String::from("diff"),
        String::from("-r"),
        String::from("--ignore-space-change"),
        generated_path(config).display().to_string(),
        reference.path().display().to_string(),
    ];
    match run(config, &argv) {
        Ok(status) => CaseOutcome::from_bool(status.stdout.is_empty()).with_log(status.stdout),
        Err(failed) => failed,
    }
}

fn remove_bundle(config: &HarnessConfig) -> CaseOutcome {
    let argv = vec![
        String::from("rm"),
        String::from("-rf"),
        generated_path(config).display().to_string(),
    ];
    match run(config, &argv) {
        Ok(status) => CaseOutcome::from_bool(status.stderr.is_empty()).with_log(status.stderr),
        Err(failed) => failed,
    }
}

impl TestGroup for BundleGeneration {
    fn name(&self) -> &'static str {
        "bundle_generation"
    }

    fn cases(&self, _platform: Platform) -> Vec<TestCase> {
        vec![
            TestCase::new(
                "Create bundle",
                Subject::container(CONTAINER),
                Matcher::literal("Dobby Bundle Generator Tool"),
                "Generates bundle with DobbyBundleGenerator",
            ),
            TestCase::new(
                "Diff bundles",
                Subject::container(CONTAINER),
                Matcher::literal(""),
                "Compares between original bundle and newly generated one",
            ),
            TestCase::new(
                "Remove bundle",
                Subject::container(CONTAINER),
                Matcher::literal(""),
                "Removes files created by this test group",
            ),
        ]
    }

    fn execute(&self, ctx: &HarnessContext<'_>) -> Vec<TestVerdict> {
        let config = ctx.config;
        let cases = self.cases(config.platform);
        let [create, diff, remove] = cases.as_slice() else {
            return Vec::new();
        };
        let reference = match ScopedBundle::acquire(config, CONTAINER) {
            Ok(reference) => reference,
            Err(err) => return super::fail_all(ctx, &cases, &err.to_string()),
        };
        vec![
            ctx.record(create, create_bundle(config, create)),
            ctx.record(diff, diff_bundles(config, &reference)),
            ctx.record(remove, remove_bundle(config)),
        ]
    }
}
