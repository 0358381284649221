//! Checkpoint/restore verification protocol.
//!
//! Drives one container through
//! `NotStarted → Running → Hibernating → Hibernated → WakingUp → Running → Stopped`.
//! Each transition is confirmed through `info`; the hibernate and wakeup
//! transitions are additionally cross-checked against the dump directory.
//! The first unmet transition ends the run. Nothing is retried.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::checkpoint;
use crate::error::HarnessError;
use crate::poller::{PollSpec, StatePoller, poll_until};
use crate::tool::ControlTool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    NotStarted,
    Running,
    Hibernating,
    Hibernated,
    WakingUp,
    Stopped,
}

impl Phase {
    #[must_use]
    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::NotStarted, Phase::Running)
                | (Phase::Running, Phase::Hibernating)
                | (Phase::Running, Phase::Stopped)
                | (Phase::Hibernating, Phase::Hibernated)
                | (Phase::Hibernated, Phase::WakingUp)
                | (Phase::WakingUp, Phase::Running)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::NotStarted => "not started",
            Phase::Running => "running",
            Phase::Hibernating => "hibernating",
            Phase::Hibernated => "hibernated",
            Phase::WakingUp => "waking up",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// The first transition that did not happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionFailure {
    /// Phase the container was last confirmed in.
    pub phase: Phase,
    pub reason: String,
}

impl fmt::Display for TransitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (last confirmed phase: {})", self.reason, self.phase)
    }
}

/// Phases visited plus the pid evidence gathered on the way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolTrace {
    pub phases: Vec<Phase>,
    pub pids_at_start: Vec<i32>,
    pub pids_after_wakeup: Vec<i32>,
}

impl ProtocolTrace {
    fn new() -> Self {
        Self {
            phases: vec![Phase::NotStarted],
            pids_at_start: Vec::new(),
            pids_after_wakeup: Vec::new(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::NotStarted)
    }

    fn advance(&mut self, next: Phase) -> Result<(), TransitionFailure> {
        let current = self.phase();
        if !current.can_advance_to(next) {
            return Err(TransitionFailure {
                phase: current,
                reason: format!("illegal transition from {current} to {next}"),
            });
        }
        self.phases.push(next);
        Ok(())
    }

    fn fail(&self, reason: impl Into<String>) -> TransitionFailure {
        TransitionFailure {
            phase: self.phase(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HibernationProtocol<'a> {
    tool: ControlTool<'a>,
    poller: StatePoller<'a>,
    dump_dir: PathBuf,
    step: PollSpec,
}

impl<'a> HibernationProtocol<'a> {
    #[must_use]
    pub fn new(tool: ControlTool<'a>) -> Self {
        let config = tool.config();
        Self {
            tool,
            poller: StatePoller::new(tool),
            dump_dir: config.checkpoint_dump_dir.clone(),
            step: PollSpec::new(
                config.timings.transition_timeout,
                config.timings.transition_poll,
            ),
        }
    }

    /// Start `container_id` from `path`, hibernate it, wake it and stop it.
    pub fn run(&self, container_id: &str, path: &Path) -> Result<ProtocolTrace, TransitionFailure> {
        let mut trace = ProtocolTrace::new();
        let env_failure = |trace: &ProtocolTrace, err: HarnessError| trace.fail(err.to_string());

        self.tool.start(container_id, path).map_err(|e| env_failure(&trace, e))?;
        let started = self
            .poller
            .wait_for(container_id, "running", self.step)
            .map_err(|e| env_failure(&trace, e))?;
        if !started.satisfied {
            return Err(trace.fail("Unable to start container"));
        }
        trace.advance(Phase::Running)?;
        trace.pids_at_start = started.last.map(|s| s.pids().to_vec()).unwrap_or_default();
        tracing::debug!(container = container_id, pids = ?trace.pids_at_start, "container pids");
        if trace.pids_at_start.is_empty() {
            tracing::warn!(container = container_id, "container reported no pids");
        }

        self.tool.hibernate(container_id).map_err(|e| env_failure(&trace, e))?;
        trace.advance(Phase::Hibernating)?;
        let hibernated = self
            .poller
            .wait_for(container_id, "hibernated", self.step)
            .map_err(|e| env_failure(&trace, e))?;
        if !hibernated.satisfied {
            return Err(trace.fail("Failed to hibernate container"));
        }
        trace.advance(Phase::Hibernated)?;
        if !self.await_dump(&trace, &trace.pids_at_start, checkpoint::all_checkpointed)? {
            return Err(trace.fail("Not all pids checkpointed"));
        }

        self.tool.wakeup(container_id).map_err(|e| env_failure(&trace, e))?;
        trace.advance(Phase::WakingUp)?;
        let woken = self
            .poller
            .wait_for(container_id, "running", self.step)
            .map_err(|e| env_failure(&trace, e))?;
        if !woken.satisfied {
            return Err(trace.fail("Failed to wakeup container"));
        }
        trace.advance(Phase::Running)?;
        if !self.await_dump(&trace, &trace.pids_at_start, checkpoint::all_restored)? {
            return Err(trace.fail("Not all pids restored"));
        }
        trace.pids_after_wakeup = woken.last.map(|s| s.pids().to_vec()).unwrap_or_default();
        let before: BTreeSet<_> = trace.pids_at_start.iter().collect();
        let after: BTreeSet<_> = trace.pids_after_wakeup.iter().collect();
        if before != after {
            return Err(trace.fail(format!(
                "Restored pids {:?} differ from pids before hibernation {:?}",
                trace.pids_after_wakeup, trace.pids_at_start
            )));
        }

        self.tool.stop(container_id).map_err(|e| env_failure(&trace, e))?;
        let gone = self
            .poller
            .wait_until_gone(container_id, self.step)
            .map_err(|e| env_failure(&trace, e))?;
        if !gone.satisfied {
            return Err(trace.fail("Container still present after stop"));
        }
        trace.advance(Phase::Stopped)?;
        Ok(trace)
    }

    fn await_dump(
        &self,
        trace: &ProtocolTrace,
        pids: &[i32],
        check: fn(&Path, &[i32]) -> std::io::Result<bool>,
    ) -> Result<bool, TransitionFailure> {
        poll_until(
            self.step,
            || Ok(check(&self.dump_dir, pids)?),
            |done: &bool| *done,
        )
        .map(|outcome| outcome.satisfied)
        .map_err(|err| trace.fail(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_follow_protocol_order() {
        let order = [
            Phase::NotStarted,
            Phase::Running,
            Phase::Hibernating,
            Phase::Hibernated,
            Phase::WakingUp,
            Phase::Running,
            Phase::Stopped,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn skipping_a_phase_is_illegal() {
        assert!(!Phase::Running.can_advance_to(Phase::Hibernated));
        assert!(!Phase::NotStarted.can_advance_to(Phase::Stopped));
        assert!(!Phase::Stopped.can_advance_to(Phase::Running));
    }

    #[test]
    fn trace_rejects_illegal_advance() {
        let mut trace = ProtocolTrace::new();
        let err = trace.advance(Phase::Hibernated).unwrap_err();
        assert_eq!(err.phase, Phase::NotStarted);
        assert!(err.reason.contains("illegal transition"));
        trace.advance(Phase::Running).unwrap();
        assert_eq!(trace.phase(), Phase::Running);
    }
}
