//! JSONL event log for harness runs.
//!
//! One line per run event, in emission order. Every line carries a trace id
//! `<run_id>::<seq>` so events from several runs can be merged and still be
//! ordered. [`ArtifactIndex`] records the files a run wrote together with
//! their SHA-256 digests.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    RunStart,
    GroupStart,
    GroupSkipped,
    CaseVerdict,
    GroupEnd,
    DaemonAnomaly,
    RunEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
}

impl Outcome {
    #[must_use]
    pub fn from_passed(passed: bool) -> Self {
        if passed { Outcome::Pass } else { Outcome::Fail }
    }
}

/// One event line. `trace_id` and `run_id` are filled in by the emitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    #[serde(default)]
    pub trace_id: String,
    pub level: LogLevel,
    pub event: Event,
    #[serde(default)]
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    #[must_use]
    pub fn new(level: LogLevel, event: Event) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: String::new(),
            level,
            event,
            run_id: String::new(),
            platform: None,
            group: None,
            case: None,
            outcome: None,
            duration_ms: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    #[must_use]
    pub fn with_case(mut self, case: impl Into<String>) -> Self {
        self.case = Some(case.into());
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Writes [`LogEntry`] lines and numbers them.
pub struct LogEmitter {
    out: Box<dyn Write + Send>,
    run_id: String,
    seq: u32,
}

impl std::fmt::Debug for LogEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEmitter")
            .field("run_id", &self.run_id)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl LogEmitter {
    /// Truncate `path` and write events to it.
    pub fn to_file(path: &Path, run_id: &str) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::to_writer(Box::new(BufWriter::new(file)), run_id))
    }

    #[must_use]
    pub fn to_writer(out: Box<dyn Write + Send>, run_id: &str) -> Self {
        Self {
            out,
            run_id: run_id.to_string(),
            seq: 0,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Stamp `entry` with the next trace id and write it. Returns the trace id.
    pub fn emit(&mut self, mut entry: LogEntry) -> io::Result<String> {
        self.seq += 1;
        entry.trace_id = format!("{}::{:03}", self.run_id, self.seq);
        entry.run_id.clone_from(&self.run_id);
        let line = serde_json::to_string(&entry).map_err(io::Error::other)?;
        writeln!(self.out, "{line}")?;
        Ok(entry.trace_id)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// A line of an event log that does not follow the format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogProblem {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for LogProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Parse and check one line. Every problem found is returned, not just the
/// first.
pub fn validate_log_line(text: &str, line: usize) -> Result<LogEntry, Vec<LogProblem>> {
    let problem = |message: String| LogProblem { line, message };
    let entry: LogEntry = serde_json::from_str(text).map_err(|e| vec![problem(e.to_string())])?;

    let mut problems = Vec::new();
    if DateTime::parse_from_rfc3339(&entry.timestamp).is_err() {
        problems.push(problem(format!("timestamp '{}' is not RFC 3339", entry.timestamp)));
    }
    match entry.trace_id.rsplit_once("::") {
        Some((run, seq)) if run == entry.run_id && seq.parse::<u32>().is_ok() => {}
        _ => problems.push(problem(format!(
            "trace id '{}' is not <run_id>::<seq> for run '{}'",
            entry.trace_id, entry.run_id
        ))),
    }
    if entry.event == Event::CaseVerdict
        && (entry.group.is_none() || entry.case.is_none() || entry.outcome.is_none())
    {
        problems.push(problem(String::from(
            "case_verdict needs group, case and outcome",
        )));
    }
    if entry.event == Event::GroupSkipped && entry.outcome != Some(Outcome::Skip) {
        problems.push(problem(String::from("group_skipped must have outcome skip")));
    }

    if problems.is_empty() { Ok(entry) } else { Err(problems) }
}

/// Summary of a checked event log.
#[derive(Debug, Default)]
pub struct LogCheck {
    pub lines: usize,
    pub problems: Vec<LogProblem>,
}

/// Check every line of `path` and that sequence numbers only increase.
pub fn validate_log_file(path: &Path) -> io::Result<LogCheck> {
    let text = std::fs::read_to_string(path)?;
    let mut check = LogCheck::default();
    let mut last_seq = 0_u32;
    for (index, raw) in text.lines().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        check.lines += 1;
        match validate_log_line(raw, index + 1) {
            Ok(entry) => {
                let seq = entry
                    .trace_id
                    .rsplit_once("::")
                    .and_then(|(_, seq)| seq.parse::<u32>().ok())
                    .unwrap_or_default();
                if seq <= last_seq {
                    check.problems.push(LogProblem {
                        line: index + 1,
                        message: format!("sequence {seq} does not follow {last_seq}"),
                    });
                }
                last_seq = seq;
            }
            Err(problems) => check.problems.extend(problems),
        }
    }
    Ok(check)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub path: String,
    pub kind: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Files written by one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactIndex {
    pub run_id: String,
    pub generated_utc: String,
    pub artifacts: Vec<ArtifactEntry>,
}

impl ArtifactIndex {
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            generated_utc: now_utc(),
            artifacts: Vec::new(),
        }
    }

    pub fn add_file(&mut self, path: &Path, kind: impl Into<String>) -> io::Result<&mut Self> {
        let (sha256, size_bytes) = sha256_file(path)?;
        self.artifacts.push(ArtifactEntry {
            path: path.display().to_string(),
            kind: kind.into(),
            sha256,
            size_bytes,
        });
        Ok(self)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Lowercase hex SHA-256 and length of the file at `path`.
pub fn sha256_file(path: &Path) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let size = io::copy(&mut File::open(path)?, &mut hasher)?;
    let mut hex = String::with_capacity(64);
    for byte in hasher.finalize() {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok((hex, size))
}

/// RFC 3339 UTC timestamp with millisecond precision.
#[must_use]
pub fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Run identifier derived from the wall clock, e.g. `l2-20261019T101500Z`.
#[must_use]
pub fn new_run_id() -> String {
    format!("l2-{}", Utc::now().format("%Y%m%dT%H%M%SZ"))
}
