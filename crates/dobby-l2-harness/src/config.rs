//! Run configuration.
//!
//! A single [`HarnessConfig`] is built once in `main` from command-line
//! arguments and passed by reference to every component. Nothing reads
//! verbosity or platform from global state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use crate::error::{HarnessError, Result};

/// Console verbosity, selected with `-v/--verbosity 0..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    NoLog = 0,
    Error = 1,
    Warning = 2,
    Info = 3,
    Debug = 4,
    LogAll = 5,
}

impl Verbosity {
    pub const ALL: [Verbosity; 6] = [
        Verbosity::NoLog,
        Verbosity::Error,
        Verbosity::Warning,
        Verbosity::Info,
        Verbosity::Debug,
        Verbosity::LogAll,
    ];

    #[must_use]
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Verbosity::NoLog => "no_log",
            Verbosity::Error => "error",
            Verbosity::Warning => "warning",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
            Verbosity::LogAll => "log_all",
        }
    }

    #[must_use]
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Verbosity::NoLog => LevelFilter::OFF,
            Verbosity::Error => LevelFilter::ERROR,
            Verbosity::Warning => LevelFilter::WARN,
            Verbosity::Info => LevelFilter::INFO,
            Verbosity::Debug => LevelFilter::DEBUG,
            Verbosity::LogAll => LevelFilter::TRACE,
        }
    }
}

/// Target platform, selected with `-p/--platform 0..=3`.
///
/// Group applicability is a static lookup against this value; the harness
/// never inspects the host to decide what runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    NoSelection = 0,
    VagrantVm = 1,
    Xi6 = 2,
    GithubWorkflowVm = 3,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::NoSelection,
        Platform::VagrantVm,
        Platform::Xi6,
        Platform::GithubWorkflowVm,
    ];

    #[must_use]
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Platform::NoSelection => "no_selection",
            Platform::VagrantVm => "vagrant_vm",
            Platform::Xi6 => "xi_6",
            Platform::GithubWorkflowVm => "github_workflow_vm",
        }
    }

    /// Platforms where the daemon runs as a system service and must be
    /// stopped/restarted through the service manager around each test group.
    #[must_use]
    pub fn is_service_managed(self) -> bool {
        self == Platform::Xi6
    }
}

/// Render `0 = a, 1 = b, ...` for CLI help text.
#[must_use]
pub fn describe_choices<T: Copy>(items: &[T], name: fn(T) -> &'static str) -> String {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| format!("{index} = {}", name(*item)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Every settle interval, poll interval and timeout used by the harness.
#[derive(Debug, Clone, PartialEq)]
pub struct Timings {
    /// Wait after spawning the daemon before issuing commands.
    pub daemon_settle: Duration,
    /// Wait after requesting daemon termination before reaping it.
    pub daemon_stop_settle: Duration,
    /// Wait after stopping a stray daemon before spawning a new one.
    pub stop_before_start: Duration,
    /// Wait after spawning or interrupting a helper process.
    pub helper_settle: Duration,
    /// Upper bound for a terminated process to be reaped before it is killed.
    pub reap_timeout: Duration,
    /// Time allowed for one checkpoint/restore or lifecycle transition.
    pub transition_timeout: Duration,
    /// Poll interval inside a transition window.
    pub transition_poll: Duration,
    /// Time a launched workload is watched for completion.
    pub launch_timeout: Duration,
    pub launch_poll: Duration,
    /// Time allowed for a banner to appear on the daemon's stderr.
    pub banner_timeout: Duration,
    /// Pause between test groups.
    pub group_pause: Duration,
    /// Upper bound for a synchronous command.
    pub command_timeout: Duration,
    /// Wait for a container to reach a listening helper.
    pub listener_settle: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            daemon_settle: Duration::from_secs(1),
            daemon_stop_settle: Duration::from_millis(200),
            stop_before_start: Duration::from_secs(1),
            helper_settle: Duration::from_secs(1),
            reap_timeout: Duration::from_secs(5),
            transition_timeout: Duration::from_secs(1),
            transition_poll: Duration::from_millis(250),
            launch_timeout: Duration::from_secs(5),
            launch_poll: Duration::from_millis(500),
            banner_timeout: Duration::from_secs(5),
            group_pause: Duration::from_secs(1),
            command_timeout: Duration::from_secs(30),
            listener_settle: Duration::from_secs(2),
        }
    }
}

impl Timings {
    /// Multiply every duration by `factor` (e.g. `2.0` on a slow CI host).
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        let scale = |d: Duration| d.mul_f64(factor.max(0.0));
        Self {
            daemon_settle: scale(self.daemon_settle),
            daemon_stop_settle: scale(self.daemon_stop_settle),
            stop_before_start: scale(self.stop_before_start),
            helper_settle: scale(self.helper_settle),
            reap_timeout: scale(self.reap_timeout),
            transition_timeout: scale(self.transition_timeout),
            transition_poll: scale(self.transition_poll),
            launch_timeout: scale(self.launch_timeout),
            launch_poll: scale(self.launch_poll),
            banner_timeout: scale(self.banner_timeout),
            group_pause: scale(self.group_pause),
            command_timeout: scale(self.command_timeout),
            listener_settle: scale(self.listener_settle),
        }
    }
}

/// Configuration for one harness run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub verbosity: Verbosity,
    pub platform: Platform,
    /// Daemon-under-test executable.
    pub daemon_program: String,
    /// Service unit controlling the daemon on service-managed platforms.
    pub daemon_service: String,
    /// Journal unit queried for daemon diagnostics.
    pub daemon_journal_unit: String,
    /// Kill any daemon left over from an earlier run before starting one.
    pub purge_stray_daemon: bool,
    /// Control tool executable.
    pub tool_program: String,
    pub bundle_generator_program: String,
    /// Shell command that launches the checkpoint/restore helper.
    pub helper_start_command: String,
    /// Process name used to interrupt the helper.
    pub helper_process_name: String,
    /// TCP listener the network group waits on (`netcat`-compatible flags).
    pub listener_program: String,
    /// Command prefix for privileged invocations (`sudo`); `None` runs directly.
    pub privilege_wrapper: Option<String>,
    pub spec_dir: PathBuf,
    pub bundle_dir: PathBuf,
    pub container_log_dir: PathBuf,
    pub checkpoint_dump_dir: PathBuf,
    pub cgroup_pids_root: PathBuf,
    pub report_path: PathBuf,
    pub event_log: Option<PathBuf>,
    pub timings: Timings,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            verbosity: Verbosity::Info,
            platform: Platform::NoSelection,
            daemon_program: String::from("DobbyDaemon"),
            daemon_service: String::from("dobby"),
            daemon_journal_unit: String::from("DobbyDaemon"),
            purge_stray_daemon: true,
            tool_program: String::from("DobbyTool"),
            bundle_generator_program: String::from("DobbyBundleGenerator"),
            helper_start_command: String::from("~/memcr/scripts/start_memcr.sh"),
            helper_process_name: String::from("memcr"),
            listener_program: String::from("netcat"),
            privilege_wrapper: Some(String::from("sudo")),
            spec_dir: PathBuf::from("dobby_specs"),
            bundle_dir: PathBuf::from("bundle"),
            container_log_dir: PathBuf::from("/tmp"),
            checkpoint_dump_dir: PathBuf::from("/media/apps/memcr"),
            cgroup_pids_root: PathBuf::from("/sys/fs/cgroup/pids"),
            report_path: PathBuf::from("DobbyL2TestResults.json"),
            event_log: None,
            timings: Timings::default(),
        }
    }
}

impl HarnessConfig {
    /// Spec file for a container launched directly from a spec.
    #[must_use]
    pub fn spec_path(&self, container_id: &str) -> PathBuf {
        self.spec_dir.join(format!("{container_id}.json"))
    }

    /// Directory a bundle archive for `container_id` extracts to.
    #[must_use]
    pub fn bundle_path(&self, container_id: &str) -> PathBuf {
        self.bundle_dir.join(format!("{container_id}_bundle"))
    }

    #[must_use]
    pub fn container_log_path(&self, container_id: &str) -> PathBuf {
        self.container_log_dir.join(format!("{container_id}.log"))
    }

    /// Argument vector for `program args..`, prefixed with the privilege wrapper.
    #[must_use]
    pub fn privileged<S: AsRef<str>>(&self, program: &str, args: &[S]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 2);
        if let Some(wrapper) = self.privilege_wrapper.as_deref().filter(|w| !w.is_empty()) {
            argv.push(wrapper.to_string());
        }
        argv.push(program.to_string());
        argv.extend(args.iter().map(|a| a.as_ref().to_string()));
        argv
    }

    /// Name `pkill` matches the daemon by; a path given as `--daemon` is
    /// reduced to its file name.
    #[must_use]
    pub fn daemon_process_name(&self) -> &str {
        process_name(&self.daemon_program)
    }

    #[must_use]
    pub fn helper_pkill_name(&self) -> &str {
        process_name(&self.helper_process_name)
    }

    /// Check that directories the run depends on are usable.
    pub fn validate(&self) -> Result<()> {
        for (label, dir) in [("spec", &self.spec_dir), ("bundle", &self.bundle_dir)] {
            if dir.exists() && !dir.is_dir() {
                return Err(HarnessError::InvalidArgument(format!(
                    "{label} directory {} is not a directory",
                    dir.display()
                )));
            }
        }
        if self.report_path.as_os_str().is_empty() {
            return Err(HarnessError::InvalidArgument(String::from(
                "report path must not be empty",
            )));
        }
        Ok(())
    }
}

/// Install the console subscriber for `verbosity`.
///
/// `RUST_LOG` overrides the level when set. Calling this twice is harmless.
pub fn install_console_logging(verbosity: Verbosity) {
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.level_filter().into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .try_init();
}

fn process_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program)
}

/// Read a whole file, returning an empty string when it does not exist.
pub(crate) fn read_optional(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}
