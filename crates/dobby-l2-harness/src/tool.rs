//! Control-tool invocation.
//!
//! [`run_command`] executes a program to completion and captures both
//! streams. A non-zero exit is not an error: the control tool reports
//! failures as text, so callers inspect the captured output.

use std::fmt;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::poller::{InfoSnapshot, PollSpec, poll_until};

/// Exit code reported for a command killed on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const DAEMON_LOG_LINES: &str = "50";

#[derive(Debug, Clone, Serialize)]
pub struct CommandCapture {
    pub argv: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    #[serde(skip)]
    pub duration: Duration,
}

impl CommandCapture {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    #[must_use]
    pub fn command_line(&self) -> String {
        command_to_string(&self.argv)
    }

    /// Turn a timed-out capture into [`HarnessError::CommandTimeout`].
    pub fn ensure_completed(self, timeout: Duration) -> Result<Self> {
        if self.timed_out {
            return Err(HarnessError::CommandTimeout {
                command: self.command_line(),
                timeout,
            });
        }
        Ok(self)
    }

    /// Return code plus both streams, for failure diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        let code = self
            .exit_code
            .map_or_else(|| String::from("none"), |c| c.to_string());
        format!(
            "Return code: {code}\nSTDOUT:\n{}\nSTDERR:\n{}",
            self.stdout, self.stderr
        )
    }
}

/// Render an argument vector as a line that can be pasted into a shell.
/// Arguments containing spaces are single-quoted.
#[must_use]
pub fn command_to_string<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| {
            let arg = arg.as_ref();
            if arg.contains(' ') {
                format!("'{arg}'")
            } else {
                arg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run `argv` to completion, killing it after `timeout`.
pub fn run_command(argv: &[String], timeout: Duration) -> Result<CommandCapture> {
    let (program, args) = argv.split_first().ok_or(HarnessError::EmptyCommand)?;
    tracing::debug!(command = %command_to_string(argv), "running command");

    let started = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|source| HarnessError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = child.stdout.take().map(|s| thread::spawn(move || read_all(s)));
    let stderr = child.stderr.take().map(|s| thread::spawn(move || read_all(s)));

    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if started.elapsed() >= timeout {
            timed_out = true;
            // Grandchildren would otherwise keep the pipes open.
            let _ = signal::killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
            let _ = child.kill();
            break child.wait().ok();
        }
        thread::sleep(Duration::from_millis(10));
    };

    let capture = CommandCapture {
        argv: argv.to_vec(),
        stdout: join_output(stdout),
        stderr: join_output(stderr),
        exit_code: if timed_out {
            Some(TIMEOUT_EXIT_CODE)
        } else {
            status.and_then(|s| s.code())
        },
        timed_out,
        duration: started.elapsed(),
    };
    if !capture.stdout.is_empty() {
        tracing::debug!("STDOUT:\n{}", capture.stdout);
    }
    if !capture.stderr.is_empty() {
        tracing::debug!("STDERR:\n{}", capture.stderr);
    }
    if timed_out {
        tracing::warn!(command = %capture.command_line(), ?timeout, "command timed out");
    }
    Ok(capture)
}

fn read_all<R: Read>(mut source: R) -> String {
    let mut bytes = Vec::new();
    let _ = source.read_to_end(&mut bytes);
    String::from_utf8_lossy(&bytes).into_owned()
}

fn join_output(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Control-tool verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verb {
    Start,
    Stop,
    Pause,
    Resume,
    Info,
    Hibernate,
    Wakeup,
    Annotate,
    RemoveAnnotation,
}

impl Verb {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Start => "start",
            Verb::Stop => "stop",
            Verb::Pause => "pause",
            Verb::Resume => "resume",
            Verb::Info => "info",
            Verb::Hibernate => "hibernate",
            Verb::Wakeup => "wakeup",
            Verb::Annotate => "annotate",
            Verb::RemoveAnnotation => "remove-annotation",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of launching a container and watching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Acknowledged and gone from `info` within the window.
    Exited,
    /// Acknowledged and still reported when the window closed.
    StillRunning,
    NotLaunched { diagnostic: String },
}

impl LaunchOutcome {
    #[must_use]
    pub fn is_launched(&self) -> bool {
        !matches!(self, LaunchOutcome::NotLaunched { .. })
    }
}

/// Whether `stdout` carries the start acknowledgement for `container_id`.
#[must_use]
pub fn start_acknowledged(stdout: &str, container_id: &str) -> bool {
    stdout.contains(&format!("started '{container_id}' container"))
}

/// Typed front end for the control tool.
#[derive(Debug, Clone, Copy)]
pub struct ControlTool<'a> {
    config: &'a HarnessConfig,
}

impl<'a> ControlTool<'a> {
    #[must_use]
    pub fn new(config: &'a HarnessConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &'a HarnessConfig {
        self.config
    }

    /// `<tool> <verb> <id> [params..]`. `start` without parameters launches
    /// from the container's spec file.
    #[must_use]
    pub fn argv(&self, verb: Verb, container_id: &str, params: &[&str]) -> Vec<String> {
        let mut argv = vec![
            self.config.tool_program.clone(),
            verb.as_str().to_string(),
            container_id.to_string(),
        ];
        if verb == Verb::Start && params.is_empty() {
            argv.push(self.config.spec_path(container_id).display().to_string());
        }
        argv.extend(params.iter().map(|p| (*p).to_string()));
        argv
    }

    pub fn run(&self, argv: &[String]) -> Result<CommandCapture> {
        run_command(argv, self.config.timings.command_timeout)
    }

    pub fn command(
        &self,
        verb: Verb,
        container_id: &str,
        params: &[&str],
    ) -> Result<CommandCapture> {
        self.run(&self.argv(verb, container_id, params))
    }

    pub fn start(&self, container_id: &str, path: &Path) -> Result<CommandCapture> {
        let path = path.display().to_string();
        self.command(Verb::Start, container_id, &[&path])
    }

    pub fn stop(&self, container_id: &str) -> Result<CommandCapture> {
        self.command(Verb::Stop, container_id, &[])
    }

    pub fn info(&self, container_id: &str) -> Result<CommandCapture> {
        self.command(Verb::Info, container_id, &[])
    }

    pub fn hibernate(&self, container_id: &str) -> Result<CommandCapture> {
        self.command(Verb::Hibernate, container_id, &[])
    }

    pub fn wakeup(&self, container_id: &str) -> Result<CommandCapture> {
        self.command(Verb::Wakeup, container_id, &[])
    }

    pub fn annotate(&self, container_id: &str, key: &str, value: &str) -> Result<CommandCapture> {
        self.command(Verb::Annotate, container_id, &[key, value])
    }

    pub fn remove_annotation(&self, container_id: &str, key: &str) -> Result<CommandCapture> {
        self.command(Verb::RemoveAnnotation, container_id, &[key])
    }

    /// Start `container_id` from `path` and watch `info` until it disappears
    /// or `spec` runs out.
    pub fn launch_and_await(
        &self,
        container_id: &str,
        path: &Path,
        spec: PollSpec,
    ) -> Result<LaunchOutcome> {
        tracing::debug!(container = container_id, path = %path.display(), "launching container");
        let argv = vec![
            self.config.tool_program.clone(),
            String::from("-v"),
            Verb::Start.as_str().to_string(),
            container_id.to_string(),
            path.display().to_string(),
        ];
        let timeout = self.config.timings.command_timeout;
        let capture = self.run(&argv)?.ensure_completed(timeout)?;

        if !start_acknowledged(&capture.stdout, container_id) {
            let diagnostic = format!(
                "Container did not launch successfully\n{}\nDobbyDaemon logs:\n{}",
                capture.describe(),
                self.daemon_log_tail()
            );
            return Ok(LaunchOutcome::NotLaunched { diagnostic });
        }

        tracing::debug!(container = container_id, "container launched, waiting for exit");
        let outcome = poll_until(
            spec,
            || Ok(InfoSnapshot::parse(self.info(container_id)?.stdout)),
            |snapshot: &InfoSnapshot| !snapshot.exists(),
        )?;
        if outcome.satisfied {
            tracing::debug!(container = container_id, "container has exited");
            Ok(LaunchOutcome::Exited)
        } else {
            tracing::warn!(
                container = container_id,
                waited = ?spec.timeout,
                "container still running after launch window"
            );
            Ok(LaunchOutcome::StillRunning)
        }
    }

    /// Recent daemon journal lines. Never fails: a read error is returned
    /// as text.
    #[must_use]
    pub fn daemon_log_tail(&self) -> String {
        let argv = vec![
            String::from("journalctl"),
            String::from("-u"),
            self.config.daemon_journal_unit.clone(),
            String::from("-n"),
            String::from(DAEMON_LOG_LINES),
            String::from("--no-pager"),
        ];
        match run_command(&argv, self.config.timings.command_timeout) {
            Ok(capture) if capture.succeeded() => capture.stdout,
            Ok(capture) => format!(
                "Failed to get {} logs: {}",
                self.config.daemon_program,
                capture.describe()
            ),
            Err(err) => format!("Failed to get {} logs: {err}", self.config.daemon_program),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn command_to_string_quotes_spaced_arguments() {
        assert_eq!(
            command_to_string(&["DobbyTool", "annotate", "sleepy", "a value"]),
            "DobbyTool annotate sleepy 'a value'"
        );
        assert_eq!(command_to_string::<&str>(&[]), "");
    }

    #[test]
    fn start_without_params_appends_spec_path() {
        let config = HarnessConfig::default();
        let tool = ControlTool::new(&config);
        assert_eq!(
            tool.argv(Verb::Start, "sleepy", &[]),
            argv(&["DobbyTool", "start", "sleepy", "dobby_specs/sleepy.json"])
        );
        assert_eq!(
            tool.argv(Verb::Start, "sleepy", &["bundle/sleepy_bundle"]),
            argv(&["DobbyTool", "start", "sleepy", "bundle/sleepy_bundle"])
        );
        assert_eq!(
            tool.argv(Verb::RemoveAnnotation, "sleepy", &["Key1"]),
            argv(&["DobbyTool", "remove-annotation", "sleepy", "Key1"])
        );
    }

    #[test]
    fn start_acknowledgement_is_container_specific() {
        assert!(start_acknowledged("started 'echo' container\n", "echo"));
        assert!(!start_acknowledged("started 'other' container\n", "echo"));
    }

    #[test]
    fn run_command_captures_streams_and_nonzero_exit() {
        let capture = run_command(
            &argv(&["/bin/sh", "-c", "echo out; echo err >&2; exit 3"]),
            Duration::from_secs(10),
        )
        .expect("run sh");
        assert_eq!(capture.stdout, "out\n");
        assert_eq!(capture.stderr, "err\n");
        assert_eq!(capture.exit_code, Some(3));
        assert!(!capture.succeeded());
    }

    #[test]
    fn run_command_kills_on_timeout() {
        let capture = run_command(&argv(&["sleep", "5"]), Duration::from_millis(100))
            .expect("run sleep");
        assert!(capture.timed_out);
        assert_eq!(capture.exit_code, Some(TIMEOUT_EXIT_CODE));
        assert!(matches!(
            capture.ensure_completed(Duration::from_millis(100)),
            Err(HarnessError::CommandTimeout { .. })
        ));
    }

    #[test]
    fn run_command_reports_spawn_failure() {
        let result = run_command(&argv(&["/nonexistent/DobbyTool"]), Duration::from_secs(1));
        assert!(matches!(result, Err(HarnessError::Spawn { .. })));
    }
}
