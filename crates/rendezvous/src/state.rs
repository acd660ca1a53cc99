//! A small explicit finite-state machine.
//!
//! [`StateMachine`] holds one value of an enumerated state set and only moves
//! between states through guarded transitions. The same type drives both the
//! session server lifecycle and the per-client connection state.

use std::fmt::Debug;

use crate::error::{ProtocolError, Result};

/// Maintains a state value and guards transitions between states.
#[derive(Debug, Clone)]
pub struct StateMachine<S> {
    state: S,
    name: &'static str,
}

impl<S> StateMachine<S>
where
    S: Copy + Eq + Debug,
{
    /// Creates a machine in `initial` state. `name` is used for logging.
    pub fn new(initial: S, name: &'static str) -> Self {
        Self {
            state: initial,
            name,
        }
    }

    /// Returns the current state.
    pub fn current(&self) -> S {
        self.state
    }

    /// Returns true when the current state equals `state`.
    pub fn check(&self, state: S) -> bool {
        self.state == state
    }

    /// Moves to `to` if the machine is currently in `from`.
    ///
    /// Returns whether the transition happened.
    pub fn change(&mut self, from: S, to: S) -> bool {
        if self.state != from {
            return false;
        }

        tracing::debug!(machine = self.name, from = ?from, to = ?to, "State transition");
        self.state = to;
        true
    }

    /// Moves to `to`, failing when the machine is not in `from`.
    pub fn require(&mut self, from: S, to: S) -> Result<()> {
        if self.change(from, to) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidTransition {
                machine: self.name,
                from: format!("{:?}", from),
                to: format!("{:?}", to),
                actual: format!("{:?}", self.state),
            })
        }
    }
}
