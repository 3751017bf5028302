//! Connection state machine.
//!
//! ```text
//!   ┌──────────────┐  connect   ┌────────────┐  opened   ┌───────────────┐
//!   │ Disconnected │──────────▶│ Connecting │─────────▶│ Synchronizing │
//!   └──────────────┘           └────────────┘           └───────────────┘
//!          ▲                         │ failed                  │ synced
//!          │                         ▼                         ▼
//!          └───────────────── (any state) ◀── lost ──── ┌───────┐
//!                                                       │ Ready │
//!                                                       └───────┘
//! ```
//!
//! The Commander owns one [`ConnectionFsm`] behind its lock.  The epoch is
//! bumped on the `Connecting → Synchronizing` edge, which is taken once per
//! physical connection.

use log::info;
use serde::Serialize;

/// Monotonic counter distinguishing successive physical connections.
pub type Epoch = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Synchronizing = 2,
    Ready = 3,
}

impl ConnectionState {
    /// Whether the edge `self -> next` exists in the state table.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Connecting, Disconnected, Ready, Synchronizing};
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Synchronizing)
                | (Synchronizing, Ready)
                | (Connecting | Synchronizing | Ready, Disconnected)
        )
    }
}

/// Rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug)]
pub struct ConnectionFsm {
    state: ConnectionState,
    epoch: Epoch,
    transitions: u64,
}

impl Default for ConnectionFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionFsm {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            epoch: 0,
            transitions: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Take the edge to `next`.  Entering `Synchronizing` starts a new epoch.
    pub fn transition(&mut self, next: ConnectionState) -> Result<Epoch, InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        if next == ConnectionState::Synchronizing {
            self.epoch += 1;
        }
        info!(
            "Connection transition: {:?} -> {:?} (epoch {})",
            self.state, next, self.epoch
        );
        self.state = next;
        self.transitions += 1;
        Ok(self.epoch)
    }
}
