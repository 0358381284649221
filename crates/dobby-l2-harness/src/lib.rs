//! L2 test orchestration harness for the Dobby container daemon.
//!
//! This crate provides:
//! - Process supervision: the daemon-under-test, the memcr checkpoint helper
//!   and listener helpers, each owned by a guard that stops it on drop
//! - Scoped bundles: OCI bundle archives extracted for the duration of a case
//! - Control-tool invocation with captured output and bounded state polling
//! - The hibernate/wakeup verification protocol and its dump-directory checks
//! - Test groups, a sequential runner and the `DobbyL2TestResults.json` report

#![forbid(unsafe_code)]

pub mod bundle;
pub mod case;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod groups;
pub mod hibernation;
pub mod poller;
pub mod process;
pub mod report;
pub mod runner;
pub mod structured_log;
pub mod supervisor;
pub mod tool;
pub mod verify;

pub use case::{CaseKind, Matcher, Subject, TestCase};
pub use config::{HarnessConfig, Platform, Timings, Verbosity};
pub use error::{HarnessError, Result};
pub use report::SuiteReport;
pub use runner::{HarnessContext, TestGroup, TestRunner};
pub use supervisor::{DaemonLogging, Supervisor};
pub use tool::{ControlTool, LaunchOutcome};
pub use verify::{CaseOutcome, TestVerdict};
