//! Clock adapters.
//!
//! [`SystemClock`] reads the host wall clock; [`FixedClock`] returns a
//! constant for deterministic tests and simulation runs.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::app::ports::ClockPort;

/// Host wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockPort for SystemClock {
    fn now_secs(&self) -> u64 {
        // A clock set before 1970 reads as the epoch itself.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub u64);

impl ClockPort for FixedClock {
    fn now_secs(&self) -> u64 {
        self.0
    }
}
