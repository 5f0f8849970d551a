//! # Shutdown Sequencer
//!
//! Two-phase teardown: half-close the socket in both directions, then close
//! the descriptor. Each phase runs as its own reactor event queued behind any
//! I/O completions already waiting, so in-flight operations finish issuing
//! before the socket goes away.
//!
//! ```text
//! Open --Requested--> ShutdownRequested --HalfCloseDone--> HalfClosed --CloseDone--> Closed
//!   \--WriteQueueDrained (delayed only)--^
//! ```
//!
//! A second `Requested` is an internal invariant violation, never retried.

use std::fmt;

use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Open,
    ShutdownRequested,
    HalfClosed,
    Closed,
}

impl ShutdownState {
    fn name(self) -> &'static str {
        match self {
            ShutdownState::Open => "open",
            ShutdownState::ShutdownRequested => "shutdown-requested",
            ShutdownState::HalfClosed => "half-closed",
            ShutdownState::Closed => "closed",
        }
    }
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownEvent {
    /// Teardown requested by a drop, a write failure or an idle writer
    Requested,
    /// The outbound queue has finished draining
    WriteQueueDrained,
    /// Phase 1 ran
    HalfCloseDone,
    /// Phase 2 ran
    CloseDone,
}

impl ShutdownEvent {
    fn name(self) -> &'static str {
        match self {
            ShutdownEvent::Requested => "requested",
            ShutdownEvent::WriteQueueDrained => "write-queue-drained",
            ShutdownEvent::HalfCloseDone => "half-close-done",
            ShutdownEvent::CloseDone => "close-done",
        }
    }
}

/// What the reactor must do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownAction {
    /// Nothing to do
    None,
    /// Post phase 1 (half-close) behind queued events
    HalfClose,
    /// Post phase 2 (close) behind queued events
    Close,
    /// The socket is closed; reap the connection once its I/O has returned
    Reap,
}

#[derive(Debug)]
pub struct ShutdownSequencer {
    state: ShutdownState,
    delayed: bool,
}

impl Default for ShutdownSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSequencer {
    pub fn new() -> Self {
        Self {
            state: ShutdownState::Open,
            delayed: false,
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.state
    }

    /// Teardown already dispatched
    pub fn is_scheduled(&self) -> bool {
        self.state != ShutdownState::Open
    }

    /// Teardown deferred until the outbound queue drains
    pub fn is_delayed(&self) -> bool {
        self.delayed
    }

    /// Defer teardown to the writer's idle transition
    pub fn defer(&mut self) {
        self.delayed = true;
    }

    pub fn apply(&mut self, event: ShutdownEvent) -> Result<ShutdownAction> {
        use ShutdownEvent as E;
        use ShutdownState as S;

        let (next, action) = match (self.state, event) {
            (S::Open, E::Requested) => (S::ShutdownRequested, ShutdownAction::HalfClose),
            (S::Open, E::WriteQueueDrained) if self.delayed => {
                (S::ShutdownRequested, ShutdownAction::HalfClose)
            }
            (state, E::WriteQueueDrained) => (state, ShutdownAction::None),
            (S::ShutdownRequested, E::HalfCloseDone) => (S::HalfClosed, ShutdownAction::Close),
            (S::HalfClosed, E::CloseDone) => (S::Closed, ShutdownAction::Reap),
            (state, event) => {
                return Err(ProtocolError::InvalidShutdownTransition {
                    state: state.name(),
                    event: event.name(),
                })
            }
        };
        self.state = next;
        Ok(action)
    }
}
