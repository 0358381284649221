//! Process supervision for the daemon-under-test and its helpers.
//!
//! Every long-lived process is owned by a guard. Dropping a guard stops the
//! process the same way an explicit `stop()` does, so a panicking test body
//! never leaves a daemon or helper behind. At most one daemon guard exists
//! per [`Supervisor`]; a second `start_daemon` fails until the first guard is
//! released.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use nix::sys::signal::Signal;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{HarnessConfig, Platform};
use crate::error::{HarnessError, Result};
use crate::process::{ExitClass, ManagedProcess, StdioMode, StreamLog, StreamKind};
use crate::tool::run_command;

/// Where the daemon sends its own log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonLogging {
    /// Journal only; console output suppressed, streams captured.
    JournalOnly,
    /// Journal plus console; streams captured so banners can be watched.
    JournalAndConsole,
    /// Console output shares the harness terminal.
    Passthrough,
}

impl DaemonLogging {
    #[must_use]
    pub fn flags(self) -> &'static [&'static str] {
        match self {
            DaemonLogging::JournalOnly => &["--nofork", "--journald", "--noconsole"],
            DaemonLogging::JournalAndConsole => &["--nofork", "--journald"],
            DaemonLogging::Passthrough => &["--nofork"],
        }
    }

    fn stdio(self) -> StdioMode {
        match self {
            DaemonLogging::Passthrough => StdioMode::Inherited,
            _ => StdioMode::Captured,
        }
    }
}

/// Abnormal termination observed during teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessAnomaly {
    pub process: String,
    pub pid: u32,
    pub exit: ExitClass,
    pub detail: String,
}

#[derive(Debug)]
pub struct Supervisor<'a> {
    config: &'a HarnessConfig,
    daemon_active: AtomicBool,
    anomalies: Mutex<Vec<ProcessAnomaly>>,
}

impl<'a> Supervisor<'a> {
    #[must_use]
    pub fn new(config: &'a HarnessConfig) -> Self {
        Self {
            config,
            daemon_active: AtomicBool::new(false),
            anomalies: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &'a HarnessConfig {
        self.config
    }

    #[must_use]
    pub fn daemon_running(&self) -> bool {
        self.daemon_active.load(Ordering::SeqCst)
    }

    /// Drain anomalies recorded since the last call.
    pub fn take_anomalies(&self) -> Vec<ProcessAnomaly> {
        std::mem::take(&mut *self.anomalies.lock())
    }

    fn record_anomaly(&self, anomaly: ProcessAnomaly) {
        tracing::error!(
            process = %anomaly.process,
            pid = anomaly.pid,
            exit = %anomaly.exit,
            "{}",
            anomaly.detail
        );
        self.anomalies.lock().push(anomaly);
    }

    /// Stop any stray daemon, spawn a fresh one and let it settle.
    pub fn start_daemon(&self, logging: DaemonLogging) -> Result<DaemonGuard<'_>> {
        if self.daemon_active.swap(true, Ordering::SeqCst) {
            return Err(HarnessError::DaemonAlreadyRunning);
        }
        match self.spawn_daemon(logging) {
            Ok(process) => Ok(DaemonGuard {
                supervisor: self,
                process: Some(process),
            }),
            Err(err) => {
                self.daemon_active.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn spawn_daemon(&self, logging: DaemonLogging) -> Result<ManagedProcess> {
        let config = self.config;
        if config.purge_stray_daemon {
            self.stop_stray_daemon();
            thread::sleep(config.timings.stop_before_start);
        }

        tracing::debug!(?logging, "starting {}", config.daemon_program);
        let argv = config.privileged(&config.daemon_program, logging.flags());
        let mut process = ManagedProcess::spawn(&config.daemon_program, &argv, logging.stdio())?;
        thread::sleep(config.timings.daemon_settle);

        // No guard is built for a daemon that died here, so this is the only
        // place its exit is checked.
        if let Ok(Some(status)) = process.try_status() {
            let exit = crate::process::classify(status);
            if exit.is_memory_fault() {
                self.record_anomaly(ProcessAnomaly {
                    process: config.daemon_program.clone(),
                    pid: process.pid(),
                    exit,
                    detail: format!("Received {exit} from {} during startup", config.daemon_program),
                });
            } else {
                tracing::error!(%exit, "{} exited during startup", config.daemon_program);
            }
            return Err(HarnessError::DaemonExited {
                program: config.daemon_program.clone(),
                exit,
            });
        }
        Ok(process)
    }

    fn stop_stray_daemon(&self) {
        let config = self.config;
        let argv = if config.platform.is_service_managed() {
            vec![
                String::from("systemctl"),
                String::from("stop"),
                config.daemon_service.clone(),
            ]
        } else {
            config.privileged("pkill", &[config.daemon_process_name()])
        };
        if let Err(err) = run_command(&argv, config.timings.command_timeout) {
            tracing::warn!(error = %err, "failed to stop stray daemon");
        }
    }

    /// Launch the checkpoint/restore helper through the shell.
    pub fn start_checkpoint_helper(&self) -> Result<HelperGuard<'_>> {
        let config = self.config;
        tracing::debug!("starting {}", config.helper_process_name);
        let argv = vec![
            String::from("/bin/sh"),
            String::from("-c"),
            config.helper_start_command.clone(),
        ];
        let process = ManagedProcess::spawn(&config.helper_process_name, &argv, StdioMode::Captured)?;
        thread::sleep(config.timings.helper_settle);
        Ok(HelperGuard {
            supervisor: self,
            process: Some(process),
        })
    }

    /// Spawn a listener that runs until its peer disconnects.
    pub fn start_listener(&self, argv: &[String]) -> Result<ListenerGuard<'_>> {
        let label = argv.first().ok_or(HarnessError::EmptyCommand)?.clone();
        let process = ManagedProcess::spawn(&label, argv, StdioMode::Captured)?;
        Ok(ListenerGuard {
            supervisor: self,
            process: Some(process),
        })
    }

    fn check_exit(&self, process: &ManagedProcess, exit: ExitClass) {
        if exit.is_memory_fault() {
            self.record_anomaly(ProcessAnomaly {
                process: process.label().to_string(),
                pid: process.pid(),
                exit,
                detail: format!("Received {exit} from {}", process.label()),
            });
        } else {
            tracing::debug!(process = process.label(), %exit, "process stopped");
        }
    }
}

/// Final state of a stopped daemon.
#[derive(Debug, Clone)]
pub struct DaemonExit {
    pub pid: u32,
    pub exit: ExitClass,
    /// Everything the daemon printed, complete once the process is reaped.
    pub log: Arc<StreamLog>,
}

/// The running daemon-under-test.
#[derive(Debug)]
pub struct DaemonGuard<'a> {
    supervisor: &'a Supervisor<'a>,
    process: Option<ManagedProcess>,
}

impl DaemonGuard<'_> {
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ManagedProcess::pid)
    }

    /// Command line the daemon was spawned with.
    #[must_use]
    pub fn command_line(&self) -> String {
        self.process
            .as_ref()
            .map(|p| p.command_line().to_string())
            .unwrap_or_default()
    }

    /// Block until the daemon prints `token` or the banner timeout passes.
    #[must_use]
    pub fn wait_for_log(&self, token: &str) -> bool {
        let timeout = self.supervisor.config.timings.banner_timeout;
        self.process
            .as_ref()
            .is_some_and(|p| p.log().wait_for(token, timeout))
    }

    #[must_use]
    pub fn log_tail(&self, lines: usize) -> String {
        self.process
            .as_ref()
            .map(|p| {
                p.log()
                    .tail(lines)
                    .into_iter()
                    .map(|l| l.text)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
    }

    /// Stop the daemon and report how it ended.
    pub fn stop(mut self) -> Option<DaemonExit> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<DaemonExit> {
        let mut process = self.process.take()?;
        let supervisor = self.supervisor;
        let config = supervisor.config;
        tracing::debug!("stopping {}", config.daemon_program);

        let exit = if config.platform == Platform::Xi6 {
            let exit = process.kill();
            let argv = vec![
                String::from("systemctl"),
                String::from("start"),
                config.daemon_service.clone(),
            ];
            if let Err(err) = run_command(&argv, config.timings.command_timeout) {
                tracing::warn!(error = %err, "failed to restart {}", config.daemon_service);
            }
            exit
        } else {
            if config.privilege_wrapper.is_some() {
                let argv = config.privileged("pkill", &[config.daemon_process_name()]);
                if let Err(err) = run_command(&argv, config.timings.command_timeout) {
                    tracing::warn!(error = %err, "pkill failed, signalling process group");
                    let _ = process.signal_group(Signal::SIGTERM);
                }
            } else if let Err(err) = process.signal_group(Signal::SIGTERM) {
                tracing::warn!(error = %err, "failed to signal daemon");
            }
            thread::sleep(config.timings.daemon_stop_settle);
            process.finish_or_kill(config.timings.reap_timeout)
        };

        supervisor.check_exit(&process, exit);
        supervisor.daemon_active.store(false, Ordering::SeqCst);
        Some(DaemonExit {
            pid: process.pid(),
            exit,
            log: Arc::clone(process.log()),
        })
    }
}

impl Drop for DaemonGuard<'_> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// The checkpoint/restore helper.
///
/// Stopped with SIGINT so it can shut down the worker processes it forked;
/// SIGKILL would orphan them.
#[derive(Debug)]
pub struct HelperGuard<'a> {
    supervisor: &'a Supervisor<'a>,
    process: Option<ManagedProcess>,
}

impl HelperGuard<'_> {
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ManagedProcess::pid)
    }

    pub fn stop(mut self) -> Option<ExitClass> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<ExitClass> {
        let mut process = self.process.take()?;
        let config = self.supervisor.config;
        tracing::debug!("stopping {}", config.helper_process_name);

        if config.privilege_wrapper.is_some() {
            let argv = config.privileged("pkill", &["-2", config.helper_pkill_name()]);
            if let Err(err) = run_command(&argv, config.timings.command_timeout) {
                tracing::warn!(error = %err, "pkill failed, interrupting process group");
                let _ = process.signal_group(Signal::SIGINT);
            }
        } else if let Err(err) = process.signal_group(Signal::SIGINT) {
            tracing::warn!(error = %err, "failed to interrupt helper");
        }
        thread::sleep(config.timings.helper_settle);
        let exit = process.finish_or_kill(config.timings.reap_timeout);
        self.supervisor.check_exit(&process, exit);
        Some(exit)
    }
}

impl Drop for HelperGuard<'_> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// A listening helper whose captured stdout is the observation.
#[derive(Debug)]
pub struct ListenerGuard<'a> {
    supervisor: &'a Supervisor<'a>,
    process: Option<ManagedProcess>,
}

impl ListenerGuard<'_> {
    /// Wait for the listener to finish (killing it after the reap timeout)
    /// and return what it received.
    pub fn collect(mut self) -> String {
        self.shutdown().unwrap_or_default()
    }

    fn shutdown(&mut self) -> Option<String> {
        let mut process = self.process.take()?;
        let exit = process.finish_or_kill(self.supervisor.config.timings.reap_timeout);
        self.supervisor.check_exit(&process, exit);
        Some(process.log().text(StreamKind::Stdout))
    }
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
