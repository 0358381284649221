//! Integration test: JSONL run events and the artifact index
//!
//! Validates that:
//! 1. A run writes schema-valid events from run_start to run_end.
//! 2. Every verdict, skip and group boundary has an event.
//! 3. Trace ids are `<run>::<seq>` in emission order.
//! 4. The artifact index records digests of the files it lists.
//!
//! Run: cargo test -p dobby-l2-harness --test event_log_test

use std::path::Path;

use dobby_l2_harness::case::{Matcher, Subject, TestCase};
use dobby_l2_harness::runner::{HarnessContext, TestGroup, TestRunner};
use dobby_l2_harness::structured_log::{ArtifactIndex, LogEmitter, sha256_file, validate_log_file};
use dobby_l2_harness::{CaseOutcome, HarnessConfig, Platform, TestVerdict, Timings};

struct TwoCases;

impl TestGroup for TwoCases {
    fn name(&self) -> &'static str {
        "two_cases"
    }

    fn cases(&self, _platform: Platform) -> Vec<TestCase> {
        ["first", "second"]
            .into_iter()
            .map(|name| TestCase::new(name, Subject::None, Matcher::literal(""), "d"))
            .collect()
    }

    fn execute(&self, ctx: &HarnessContext<'_>) -> Vec<TestVerdict> {
        let cases = self.cases(ctx.config.platform);
        vec![
            ctx.record(&cases[0], CaseOutcome::pass()),
            ctx.record(&cases[1], CaseOutcome::fail("no match")),
        ]
    }
}

struct XiOnly;

impl TestGroup for XiOnly {
    fn name(&self) -> &'static str {
        "xi_only"
    }

    fn supported_platforms(&self) -> &'static [Platform] {
        &[Platform::Xi6]
    }

    fn cases(&self, _platform: Platform) -> Vec<TestCase> {
        Vec::new()
    }

    fn execute(&self, _ctx: &HarnessContext<'_>) -> Vec<TestVerdict> {
        unreachable!("never supported in these tests")
    }
}

fn events(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn run_with_log(path: &Path) {
    let config = HarnessConfig {
        platform: Platform::VagrantVm,
        timings: Timings::default().scaled(0.0),
        ..HarnessConfig::default()
    };
    let emitter = LogEmitter::to_file(path, "l2-test").unwrap();
    let ctx = HarnessContext::new(&config).with_event_log(emitter);
    let groups: [&dyn TestGroup; 2] = [&XiOnly, &TwoCases];
    TestRunner::new(ctx).run(&groups);
}

#[test]
fn run_events_validate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    run_with_log(&path);

    let check = validate_log_file(&path).unwrap();
    assert!(check.problems.is_empty(), "{:?}", check.problems);
    assert_eq!(check.lines, 7);
}

#[test]
fn events_cover_the_whole_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    run_with_log(&path);

    let events = events(&path);
    let names: Vec<&str> = events.iter().map(|e| e["event"].as_str().unwrap()).collect();
    assert_eq!(
        names,
        [
            "run_start",
            "group_skipped",
            "group_start",
            "case_verdict",
            "case_verdict",
            "group_end",
            "run_end",
        ]
    );
    assert_eq!(events[1]["group"], "xi_only");
    assert_eq!(events[1]["outcome"], "skip");
    assert_eq!(events[3]["case"], "first");
    assert_eq!(events[3]["outcome"], "pass");
    assert_eq!(events[4]["outcome"], "fail");
    assert_eq!(events[5]["outcome"], "fail");
    assert_eq!(events[6]["details"]["total"], 2);
    assert_eq!(events[6]["details"]["skipped_groups"], 1);
    for event in &events {
        assert_eq!(event["platform"], "vagrant_vm");
        assert_eq!(event["run_id"], "l2-test");
    }
}

#[test]
fn trace_ids_follow_emission_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    run_with_log(&path);

    let ids: Vec<String> = events(&path)
        .iter()
        .map(|e| e["trace_id"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = (1..=ids.len()).map(|i| format!("l2-test::{i:03}")).collect();
    assert_eq!(ids, expected);
}

#[test]
fn artifact_index_records_digests() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("DobbyL2TestResults.json");
    std::fs::write(&report, "abc").unwrap();

    let mut index = ArtifactIndex::new("l2-test");
    index.add_file(&report, "report").unwrap();
    let json: serde_json::Value = serde_json::from_str(&index.to_json().unwrap()).unwrap();

    let (digest, size) = sha256_file(&report).unwrap();
    assert_eq!(digest, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    assert_eq!(size, 3);
    let entry = &json["artifacts"][0];
    assert_eq!(entry["kind"], "report");
    assert_eq!(entry["sha256"], digest);
    assert_eq!(entry["size_bytes"], 3);
}
