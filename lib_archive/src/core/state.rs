//! # Engine State
//!
//! The engine's lifecycle state and the single cell that owns it.
//!
//! Every state change goes through [`StateCell::transition`], a compare-and-set
//! over a `tokio::sync::watch` channel: the allowed source states are checked
//! and the target written under the channel's lock, so two concurrent requests
//! can never both succeed from the same source state. Observers (the host's
//! supervisor, the HTTP control surface) hold a `watch::Receiver` and wake on
//! every accepted change.

use serde::Serialize;
use std::fmt;
use tokio::sync::watch;

use crate::core::error::EngineError;

/// Lifecycle states of the archive engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    /// Configured or not, but not archiving. Configuration may change.
    Idle,
    /// Channels connected and the write scheduler running.
    Running,
    /// A stop has been requested; the host is expected to call `stop()`.
    ShutdownRequested,
    /// A restart has been requested; the host is expected to stop, reconfigure and start.
    RestartRequested,
    /// `stop()` is in progress.
    Stopping,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "IDLE",
            EngineState::Running => "RUNNING",
            EngineState::ShutdownRequested => "SHUTDOWN_REQUESTED",
            EngineState::RestartRequested => "RESTART_REQUESTED",
            EngineState::Stopping => "STOPPING",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The accepted state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    RequestStop,
    RequestRestart,
    BeginStop,
    FinishStop,
}

impl Transition {
    pub fn name(self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::RequestStop => "request_stop",
            Transition::RequestRestart => "request_restart",
            Transition::BeginStop => "stop",
            Transition::FinishStop => "finish_stop",
        }
    }

    fn allowed_from(self) -> &'static [EngineState] {
        use EngineState::*;
        match self {
            Transition::Start => &[Idle],
            // A pending restart may be upgraded to a shutdown, never the reverse.
            Transition::RequestStop => &[Running, RestartRequested],
            Transition::RequestRestart => &[Running],
            Transition::BeginStop => &[Running, ShutdownRequested, RestartRequested],
            Transition::FinishStop => &[Stopping],
        }
    }

    fn target(self) -> EngineState {
        match self {
            Transition::Start => EngineState::Running,
            Transition::RequestStop => EngineState::ShutdownRequested,
            Transition::RequestRestart => EngineState::RestartRequested,
            Transition::BeginStop => EngineState::Stopping,
            Transition::FinishStop => EngineState::Idle,
        }
    }
}

pub struct StateCell {
    tx: watch::Sender<EngineState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(EngineState::Idle);
        Self { tx }
    }

    pub fn get(&self) -> EngineState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.tx.subscribe()
    }

    /// Applies `transition` atomically. Returns the state it replaced.
    pub fn transition(&self, transition: Transition) -> Result<EngineState, EngineError> {
        let mut previous = EngineState::Idle;
        let applied = self.tx.send_if_modified(|state| {
            previous = *state;
            if transition.allowed_from().contains(state) {
                *state = transition.target();
                true
            } else {
                false
            }
        });

        if applied {
            tracing::debug!(from = %previous, to = %transition.target(), "Engine state changed");
            Ok(previous)
        } else {
            Err(EngineError::InvalidState {
                operation: transition.name(),
                state: previous,
            })
        }
    }

    /// Fails with `InvalidState` unless the current state is `expected`.
    pub fn require(&self, operation: &'static str, expected: EngineState) -> Result<(), EngineError> {
        let state = self.get();
        if state == expected {
            Ok(())
        } else {
            Err(EngineError::InvalidState { operation, state })
        }
    }
}
