//! Managed background processes.
//!
//! A [`ManagedProcess`] owns a spawned child running in its own process
//! group. Captured stdout/stderr are drained by reader threads into a
//! bounded [`StreamLog`] so callers can block until a token appears (the
//! daemon startup banner) without ever reading the pipes themselves.
//! Dropping the handle kills the group and reaps the child.

use std::collections::VecDeque;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

const DEFAULT_LOG_CAPACITY: usize = 2048;
const REAP_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: StreamKind,
    pub text: String,
}

#[derive(Debug)]
struct LogState {
    lines: VecDeque<LogLine>,
    capacity: usize,
    dropped: usize,
    open_streams: usize,
}

/// Bounded, thread-safe line buffer fed by stream reader threads.
#[derive(Debug)]
pub struct StreamLog {
    state: Mutex<LogState>,
    changed: Condvar,
}

impl Default for StreamLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl StreamLog {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LogState {
                lines: VecDeque::new(),
                capacity: capacity.max(1),
                dropped: 0,
                open_streams: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn open_stream(&self) {
        self.state.lock().open_streams += 1;
    }

    fn close_stream(&self) {
        let mut state = self.state.lock();
        state.open_streams = state.open_streams.saturating_sub(1);
        drop(state);
        self.changed.notify_all();
    }

    pub fn push(&self, stream: StreamKind, text: impl Into<String>) {
        let mut state = self.state.lock();
        if state.lines.len() == state.capacity {
            state.lines.pop_front();
            state.dropped += 1;
        }
        state.lines.push_back(LogLine {
            stream,
            text: text.into(),
        });
        drop(state);
        self.changed.notify_all();
    }

    /// Block until a retained line contains `token`, every stream has
    /// closed, or `timeout` elapses. Returns whether the token was seen.
    pub fn wait_for(&self, token: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.lines.iter().any(|line| line.text.contains(token)) {
                return true;
            }
            if state.open_streams == 0 {
                return false;
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.lines.iter().any(|line| line.text.contains(token));
            }
        }
    }

    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.state
            .lock()
            .lines
            .iter()
            .any(|line| line.text.contains(token))
    }

    /// Last `count` lines, oldest first.
    #[must_use]
    pub fn tail(&self, count: usize) -> Vec<LogLine> {
        let state = self.state.lock();
        let skip = state.lines.len().saturating_sub(count);
        state.lines.iter().skip(skip).cloned().collect()
    }

    /// All retained lines of one stream joined with newlines.
    #[must_use]
    pub fn text(&self, stream: StreamKind) -> String {
        self.state
            .lock()
            .lines
            .iter()
            .filter(|line| line.stream == stream)
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[must_use]
    pub fn dropped(&self) -> usize {
        self.state.lock().dropped
    }
}

/// How a finished (or unfinished) process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitClass {
    Clean,
    Code(i32),
    Signal(i32),
    /// SIGSEGV/SIGBUS, either delivered directly or reported by a wrapper
    /// shell as `128 + signo`.
    MemoryFault(i32),
    StillRunning,
}

impl ExitClass {
    #[must_use]
    pub fn is_memory_fault(self) -> bool {
        matches!(self, ExitClass::MemoryFault(_))
    }
}

impl fmt::Display for ExitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitClass::Clean => write!(f, "exited cleanly"),
            ExitClass::Code(code) => write!(f, "exited with code {code}"),
            ExitClass::Signal(signo) => write!(f, "killed by {}", signal_name(*signo)),
            ExitClass::MemoryFault(signo) => {
                write!(f, "memory fault ({})", signal_name(*signo))
            }
            ExitClass::StillRunning => write!(f, "still running"),
        }
    }
}

fn signal_name(signo: i32) -> String {
    Signal::try_from(signo)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {signo}"))
}

/// Classify a reaped exit status.
#[must_use]
pub fn classify(status: ExitStatus) -> ExitClass {
    const SEGV: i32 = Signal::SIGSEGV as i32;
    const BUS: i32 = Signal::SIGBUS as i32;
    if let Some(signo) = status.signal() {
        return match signo {
            SEGV | BUS => ExitClass::MemoryFault(signo),
            other => ExitClass::Signal(other),
        };
    }
    match status.code() {
        Some(0) => ExitClass::Clean,
        Some(code) if code == 128 + SEGV => ExitClass::MemoryFault(SEGV),
        Some(code) if code == 128 + BUS => ExitClass::MemoryFault(BUS),
        Some(code) => ExitClass::Code(code),
        None => ExitClass::Code(-1),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// Pipe stdout/stderr into the process's [`StreamLog`].
    Captured,
    /// Share the harness's own stdout/stderr.
    Inherited,
}

/// A spawned child in its own process group.
#[derive(Debug)]
pub struct ManagedProcess {
    label: String,
    command_line: String,
    child: Child,
    log: Arc<StreamLog>,
    readers: Vec<JoinHandle<()>>,
    exit: Option<ExitStatus>,
}

impl ManagedProcess {
    pub fn spawn(label: &str, argv: &[String], stdio: StdioMode) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or(HarnessError::EmptyCommand)?;
        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).process_group(0);
        match stdio {
            StdioMode::Captured => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            StdioMode::Inherited => {
                command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }
        let mut child = command.spawn().map_err(|source| HarnessError::Spawn {
            program: program.clone(),
            source,
        })?;

        let log = Arc::new(StreamLog::default());
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(drain(label, StreamKind::Stdout, stdout, &log)?);
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(drain(label, StreamKind::Stderr, stderr, &log)?);
        }
        tracing::debug!(label, pid = child.id(), "spawned managed process");

        Ok(Self {
            label: label.to_string(),
            command_line: crate::tool::command_to_string(argv),
            child,
            log,
            readers,
            exit: None,
        })
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    #[must_use]
    pub fn log(&self) -> &Arc<StreamLog> {
        &self.log
    }

    fn group(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Deliver `signal` to the whole process group.
    pub fn signal_group(&self, signal: Signal) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        signal::killpg(self.group(), signal)
            .map_err(|errno| HarnessError::Io(std::io::Error::from(errno)))
    }

    /// Non-blocking exit check.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?;
        }
        Ok(self.exit)
    }

    /// Wait up to `timeout` for the child to exit and classify it.
    pub fn finish(&mut self, timeout: Duration) -> ExitClass {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_status() {
                Ok(Some(status)) => {
                    self.join_readers();
                    return classify(status);
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(REAP_POLL),
                Ok(None) => return ExitClass::StillRunning,
                Err(err) => {
                    tracing::warn!(label = %self.label, error = %err, "failed to poll child status");
                    return ExitClass::StillRunning;
                }
            }
        }
    }

    /// SIGKILL the group and reap the child.
    pub fn kill(&mut self) -> ExitClass {
        if let Some(status) = self.exit {
            return classify(status);
        }
        let _ = self.signal_group(Signal::SIGKILL);
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => {
                self.exit = Some(status);
                self.join_readers();
                classify(status)
            }
            Err(err) => {
                tracing::warn!(label = %self.label, error = %err, "failed to reap killed child");
                ExitClass::StillRunning
            }
        }
    }

    /// [`finish`](Self::finish), falling back to [`kill`](Self::kill) when
    /// the child outlives `timeout`.
    pub fn finish_or_kill(&mut self, timeout: Duration) -> ExitClass {
        match self.finish(timeout) {
            ExitClass::StillRunning => {
                tracing::warn!(label = %self.label, "process ignored termination request, killing");
                self.kill()
            }
            class => class,
        }
    }

    fn join_readers(&mut self) {
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = self.kill();
        }
        self.join_readers();
    }
}

fn drain<R: Read + Send + 'static>(
    label: &str,
    stream: StreamKind,
    source: R,
    log: &Arc<StreamLog>,
) -> Result<JoinHandle<()>> {
    let log = Arc::clone(log);
    log.open_stream();
    let name = format!("{label}-{}", match stream {
        StreamKind::Stdout => "stdout",
        StreamKind::Stderr => "stderr",
    });
    let spawned = thread::Builder::new().name(name).spawn({
        let log = Arc::clone(&log);
        move || {
            for line in BufReader::new(source).lines() {
                match line {
                    Ok(text) => log.push(stream, text),
                    Err(_) => break,
                }
            }
            log.close_stream();
        }
    });
    spawned.map_err(|err| {
        log.close_stream();
        HarnessError::Io(err)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn classify_recognises_memory_faults() {
        assert_eq!(classify(ExitStatus::from_raw(0)), ExitClass::Clean);
        assert_eq!(classify(ExitStatus::from_raw(3 << 8)), ExitClass::Code(3));
        assert_eq!(classify(ExitStatus::from_raw(11)), ExitClass::MemoryFault(11));
        assert_eq!(classify(ExitStatus::from_raw(7)), ExitClass::MemoryFault(7));
        assert_eq!(classify(ExitStatus::from_raw(15)), ExitClass::Signal(15));
        assert_eq!(classify(ExitStatus::from_raw(139 << 8)), ExitClass::MemoryFault(11));
        assert_eq!(classify(ExitStatus::from_raw(135 << 8)), ExitClass::MemoryFault(7));
    }

    #[test]
    fn exit_class_display_names_signal() {
        assert_eq!(ExitClass::MemoryFault(11).to_string(), "memory fault (SIGSEGV)");
        assert_eq!(ExitClass::Code(2).to_string(), "exited with code 2");
    }

    #[test]
    fn stream_log_is_bounded() {
        let log = StreamLog::with_capacity(2);
        log.push(StreamKind::Stdout, "a");
        log.push(StreamKind::Stdout, "b");
        log.push(StreamKind::Stderr, "c");
        assert_eq!(log.dropped(), 1);
        assert_eq!(log.text(StreamKind::Stdout), "b");
        assert_eq!(log.tail(5).len(), 2);
    }

    #[test]
    fn wait_for_sees_banner_on_stderr() {
        let mut process = ManagedProcess::spawn(
            "banner",
            &sh("echo 'started Dobby daemon' >&2; sleep 5"),
            StdioMode::Captured,
        )
        .expect("spawn sh");
        assert!(process.log().wait_for("started Dobby daemon", Duration::from_secs(5)));
        process.signal_group(Signal::SIGTERM).expect("signal group");
        assert_eq!(process.finish(Duration::from_secs(5)), ExitClass::Signal(15));
    }

    #[test]
    fn wait_for_gives_up_when_streams_close() {
        let mut process =
            ManagedProcess::spawn("quiet", &sh("echo nothing"), StdioMode::Captured)
                .expect("spawn sh");
        let started = Instant::now();
        assert!(!process.log().wait_for("banner", Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(process.finish(Duration::from_secs(5)), ExitClass::Clean);
    }

    #[test]
    fn finish_reports_still_running_then_kill_reaps() {
        let mut process =
            ManagedProcess::spawn("sleeper", &sh("sleep 30"), StdioMode::Captured)
                .expect("spawn sh");
        assert_eq!(process.finish(Duration::from_millis(50)), ExitClass::StillRunning);
        assert_eq!(process.kill(), ExitClass::Signal(9));
    }

    #[test]
    fn spawn_rejects_empty_argv() {
        assert!(matches!(
            ManagedProcess::spawn("empty", &[], StdioMode::Captured),
            Err(HarnessError::EmptyCommand)
        ));
    }
}
