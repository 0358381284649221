//! Result aggregation and reporting.
//!
//! [`SuiteReport`] is appended to while groups run and written once at the
//! end. Its JSON keys keep the established `DobbyL2TestResults.json` layout
//! so existing result collectors can read it.

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::Platform;
use crate::error::Result;
use crate::supervisor::ProcessAnomaly;
use crate::verify::{GroupTally, TestVerdict};

/// Verdicts and counts for one executed group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupReport {
    pub name: String,
    pub tests: usize,
    #[serde(rename = "Passed Tests")]
    pub passed: usize,
    #[serde(rename = "Failed Tests")]
    pub failed: usize,
    pub testsuite: Vec<TestVerdict>,
}

impl GroupReport {
    #[must_use]
    pub fn tally(&self) -> GroupTally {
        GroupTally {
            passed: self.passed,
            total: self.tests,
        }
    }
}

/// A process anomaly attributed to the group that observed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub group: String,
    #[serde(flatten)]
    pub anomaly: ProcessAnomaly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    #[serde(rename = "Total tests")]
    pub total: usize,
    #[serde(rename = "Passed tests")]
    pub passed: usize,
    #[serde(rename = "Failed Tests")]
    pub failed: usize,
    #[serde(rename = "Skipped testsuites")]
    pub skipped: usize,
    pub testsuites: Vec<GroupReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<AnomalyRecord>,
    pub platform: String,
    pub timestamp: String,
}

impl SuiteReport {
    #[must_use]
    pub fn new(platform: Platform) -> Self {
        Self {
            total: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            testsuites: Vec::new(),
            skipped_groups: Vec::new(),
            anomalies: Vec::new(),
            platform: platform.name().to_string(),
            timestamp: crate::structured_log::now_utc(),
        }
    }

    pub fn push_group(&mut self, name: &str, verdicts: Vec<TestVerdict>) {
        let tally = GroupTally::from_verdicts(&verdicts);
        self.total += tally.total;
        self.passed += tally.passed;
        self.failed += tally.failed();
        self.testsuites.push(GroupReport {
            name: name.to_string(),
            tests: tally.total,
            passed: tally.passed,
            failed: tally.failed(),
            testsuite: verdicts,
        });
    }

    pub fn skip_group(&mut self, name: &str) {
        self.skipped += 1;
        self.skipped_groups.push(name.to_string());
    }

    pub fn push_anomaly(&mut self, group: &str, anomaly: ProcessAnomaly) {
        self.anomalies.push(AnomalyRecord {
            group: group.to_string(),
            anomaly,
        });
    }

    #[must_use]
    pub fn totals(&self) -> GroupTally {
        GroupTally {
            passed: self.passed,
            total: self.total,
        }
    }

    /// No verdict failed. Anomalies are reported but do not change this.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    #[must_use]
    pub fn group(&self, name: &str) -> Option<&GroupReport> {
        self.testsuites.iter().find(|g| g.name == name)
    }

    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Dobby L2 Test Results\n");
        let _ = writeln!(out, "- Platform: {}", self.platform);
        let _ = writeln!(out, "- Timestamp: {}", self.timestamp);
        let _ = writeln!(out, "- Total: {}", self.total);
        let _ = writeln!(out, "- Passed: {}", self.passed);
        let _ = writeln!(out, "- Failed: {}", self.failed);
        let _ = writeln!(out, "- Skipped groups: {}\n", self.skipped);

        out.push_str("| Group | Case | Status | Message |\n");
        out.push_str("|-------|------|--------|---------|\n");
        for group in &self.testsuites {
            for verdict in &group.testsuite {
                let status = if verdict.passed { "PASS" } else { "FAIL" };
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {} |",
                    group.name,
                    verdict.name,
                    status,
                    verdict.message.replace('\n', " ")
                );
            }
        }
        for name in &self.skipped_groups {
            let _ = writeln!(out, "| {name} | - | SKIP | unsupported platform |");
        }
        if !self.anomalies.is_empty() {
            out.push_str("\n## Process anomalies\n\n");
            for record in &self.anomalies {
                let _ = writeln!(out, "- {}: {}", record.group, record.anomaly.detail);
            }
        }
        out
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Print one verdict block: debug when it passed, error when it failed.
pub fn print_verdict(verdict: &TestVerdict) {
    let block = format!(
        "\n---------------Test {}---------------\nName = {}\nPassed = {}\nDescription = {}\nMessage = {}\nLog = {}\n---------------End Report---------------\n",
        if verdict.passed { "Passed" } else { "Failed" },
        verdict.name,
        verdict.passed,
        verdict.description,
        verdict.message,
        verdict.log_snapshot,
    );
    if verdict.passed {
        tracing::debug!("{block}");
    } else {
        tracing::error!("{block}");
    }
}

pub fn print_unsupported_platform(group: &str, platform: Platform) {
    tracing::warn!(
        "Test '{group}' is not supported for platform '{}', no tests executed",
        platform.name()
    );
}

/// `All N succeed` or `X out of N succeed`.
#[must_use]
pub fn results_line(tally: GroupTally) -> String {
    if tally.all_passed() {
        format!("All {} succeed", tally.total)
    } else {
        format!("{} out of {} succeed", tally.passed, tally.total)
    }
}

pub fn print_group_totals(group: &str, tally: GroupTally) {
    tracing::info!("{}", results_line(tally));
    tracing::info!("Test Group: \"{group}\"");
    tracing::info!("Total Tests: {}", tally.total);
    tracing::info!("Total Passed Tests: {}", tally.passed);
}

pub fn print_summary(suite: &SuiteReport) {
    tracing::info!("Summary:");
    if suite.skipped > 0 {
        tracing::info!("Skipped {} test groups", suite.skipped);
    }
    tracing::info!("Tested {} test groups", suite.testsuites.len());
    for record in &suite.anomalies {
        tracing::error!(group = %record.group, "{}", record.anomaly.detail);
    }
    tracing::info!("{}", results_line(suite.totals()));
}
