//! Runtime diagnostics.
//!
//! Lock-free counters bumped by the read and write paths of the Commander.
//! Corrupt frames and unmatched responses never reach a caller, so these
//! counters are the only place they show up.

use core::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Diagnostics {
    frames_received: AtomicU64,
    frames_corrupt: AtomicU64,
    responses_malformed: AtomicU64,
    responses_unexpected: AtomicU64,
    responses_stale: AtomicU64,
    commands_sent: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    connections: AtomicU64,
}

/// Point-in-time copy of [`Diagnostics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub frames_received: u64,
    pub frames_corrupt: u64,
    pub responses_malformed: u64,
    pub responses_unexpected: u64,
    pub responses_stale: u64,
    pub commands_sent: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub connections: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_received(&self) {
        bump(&self.frames_received);
    }

    pub fn frame_corrupt(&self) {
        bump(&self.frames_corrupt);
    }

    pub fn response_malformed(&self) {
        bump(&self.responses_malformed);
    }

    pub fn response_unexpected(&self) {
        bump(&self.responses_unexpected);
    }

    pub fn response_stale(&self) {
        bump(&self.responses_stale);
    }

    pub fn command_sent(&self) {
        bump(&self.commands_sent);
    }

    pub fn retry(&self) {
        bump(&self.retries);
    }

    pub fn timeout(&self) {
        bump(&self.timeouts);
    }

    pub fn connection(&self) {
        bump(&self.connections);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DiagnosticsSnapshot {
            frames_received: load(&self.frames_received),
            frames_corrupt: load(&self.frames_corrupt),
            responses_malformed: load(&self.responses_malformed),
            responses_unexpected: load(&self.responses_unexpected),
            responses_stale: load(&self.responses_stale),
            commands_sent: load(&self.commands_sent),
            retries: load(&self.retries),
            timeouts: load(&self.timeouts),
            connections: load(&self.connections),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let d = Diagnostics::new();
        d.frame_corrupt();
        d.frame_corrupt();
        d.retry();
        let snap = d.snapshot();
        assert_eq!(snap.frames_corrupt, 2);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.timeouts, 0);
    }
}
