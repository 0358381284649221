//! Error type shared by every harness component.
//!
//! Only environment problems surface as [`HarnessError`]: a missing archive, a
//! program that cannot be spawned, an unwritable report. Output that does not
//! match an expectation is never an error; it becomes a failed verdict.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::process::ExitClass;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` did not finish within {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },
    #[error("empty command line")]
    EmptyCommand,
    #[error("bundle archive {} not found", .0.display())]
    MissingArchive(PathBuf),
    #[error("failed to extract {}: {source}", .archive.display())]
    Extract {
        archive: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("container spec {} not found", .0.display())]
    MissingSpec(PathBuf),
    #[error("`{program}` stopped during startup: {exit}")]
    DaemonExited { program: String, exit: ExitClass },
    #[error("a daemon-under-test is already running; stop it before starting another")]
    DaemonAlreadyRunning,
    #[error("{0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, HarnessError>;
