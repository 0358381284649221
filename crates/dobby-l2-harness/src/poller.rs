//! Bounded polling against the control tool's `info` output.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tool::ControlTool;

/// Poll window: at most `max_attempts()` checks, one every `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollSpec {
    #[must_use]
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// `ceil(timeout / interval)`, never less than one.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        let interval = self.interval.as_nanos().max(1);
        let attempts = self.timeout.as_nanos().div_ceil(interval);
        u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome<T> {
    pub satisfied: bool,
    pub attempts: u32,
    /// Value observed on the final attempt.
    pub last: Option<T>,
}

/// Sleep one interval, observe, and repeat until `accept` holds or the attempt
/// budget is spent. An observation error ends the poll immediately.
pub fn poll_until<T>(
    spec: PollSpec,
    mut observe: impl FnMut() -> Result<T>,
    accept: impl Fn(&T) -> bool,
) -> Result<PollOutcome<T>> {
    let max_attempts = spec.max_attempts();
    let mut last = None;
    for attempt in 1..=max_attempts {
        thread::sleep(spec.interval);
        let value = observe()?;
        if accept(&value) {
            return Ok(PollOutcome {
                satisfied: true,
                attempts: attempt,
                last: Some(value),
            });
        }
        last = Some(value);
    }
    Ok(PollOutcome {
        satisfied: false,
        attempts: max_attempts,
        last,
    })
}

/// Fields of an `info` reply the harness inspects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub pids: Vec<i32>,
}

/// One `info` reply. Anything that is not a JSON object means the daemon
/// does not know the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoSnapshot {
    pub raw: String,
    pub container: Option<ContainerInfo>,
}

impl InfoSnapshot {
    #[must_use]
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let container = if raw.trim_start().starts_with('{') {
            serde_json::from_str::<ContainerInfo>(raw.trim()).ok()
        } else {
            None
        };
        Self { raw, container }
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.container.is_some()
    }

    #[must_use]
    pub fn state(&self) -> Option<&str> {
        self.container.as_ref().and_then(|c| c.state.as_deref())
    }

    #[must_use]
    pub fn pids(&self) -> &[i32] {
        self.container
            .as_ref()
            .map(|c| c.pids.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatePoller<'a> {
    tool: ControlTool<'a>,
}

impl<'a> StatePoller<'a> {
    #[must_use]
    pub fn new(tool: ControlTool<'a>) -> Self {
        Self { tool }
    }

    pub fn snapshot(&self, container_id: &str) -> Result<InfoSnapshot> {
        let capture = self.tool.info(container_id)?;
        Ok(InfoSnapshot::parse(capture.stdout))
    }

    /// Poll `info` until `predicate` accepts the reported state. The
    /// predicate sees `None` when the container is unknown.
    pub fn wait_for_state(
        &self,
        container_id: &str,
        predicate: impl Fn(Option<&str>) -> bool,
        spec: PollSpec,
    ) -> Result<PollOutcome<InfoSnapshot>> {
        let outcome = poll_until(
            spec,
            || self.snapshot(container_id),
            |snapshot: &InfoSnapshot| predicate(snapshot.state()),
        )?;
        tracing::debug!(
            container = container_id,
            satisfied = outcome.satisfied,
            attempts = outcome.attempts,
            state = ?outcome.last.as_ref().and_then(InfoSnapshot::state),
            "state poll finished"
        );
        Ok(outcome)
    }

    pub fn wait_for(
        &self,
        container_id: &str,
        expected: &str,
        spec: PollSpec,
    ) -> Result<PollOutcome<InfoSnapshot>> {
        self.wait_for_state(container_id, |state| state == Some(expected), spec)
    }

    pub fn wait_until_gone(
        &self,
        container_id: &str,
        spec: PollSpec,
    ) -> Result<PollOutcome<InfoSnapshot>> {
        poll_until(spec, || self.snapshot(container_id), |s: &InfoSnapshot| !s.exists())
    }
}
