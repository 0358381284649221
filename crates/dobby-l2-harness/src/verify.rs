//! Verdicts and tallies.

use serde::{Deserialize, Serialize};

/// What a case procedure observed, before it is bound to a case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseOutcome {
    pub passed: bool,
    /// Empty means the default "Test passed"/"Test failed" message.
    pub message: String,
    /// Diagnostic log; empty means the container's own log file is used.
    pub log: String,
}

impl CaseOutcome {
    #[must_use]
    pub fn pass() -> Self {
        Self::from_bool(true)
    }

    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            log: String::new(),
        }
    }

    #[must_use]
    pub fn from_bool(passed: bool) -> Self {
        Self {
            passed,
            message: String::new(),
            log: String::new(),
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    #[must_use]
    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = log.into();
        self
    }
}

/// Outcome of one executed test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestVerdict {
    pub name: String,
    pub passed: bool,
    pub description: String,
    pub message: String,
    /// Captured diagnostic log. Printed, never persisted.
    #[serde(skip)]
    pub log_snapshot: String,
}

impl TestVerdict {
    #[must_use]
    pub fn new(name: &str, description: &str, outcome: CaseOutcome) -> Self {
        let message = if outcome.message.is_empty() {
            String::from(if outcome.passed {
                "Test passed"
            } else {
                "Test failed"
            })
        } else {
            outcome.message
        };
        Self {
            name: name.to_string(),
            passed: outcome.passed,
            description: description.to_string(),
            message,
            log_snapshot: outcome.log,
        }
    }
}

/// Passed/total counts for one group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTally {
    pub passed: usize,
    pub total: usize,
}

impl GroupTally {
    #[must_use]
    pub fn from_verdicts(verdicts: &[TestVerdict]) -> Self {
        Self {
            passed: verdicts.iter().filter(|v| v.passed).count(),
            total: verdicts.len(),
        }
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.total - self.passed
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

impl std::ops::AddAssign for GroupTally {
    fn add_assign(&mut self, other: Self) {
        self.passed += other.passed;
        self.total += other.total;
    }
}
