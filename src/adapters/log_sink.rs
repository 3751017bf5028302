//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing engine events to the `log` facade.
//! A message-broker adapter would implement the same trait.

use log::{info, warn};

use crate::app::events::EngineEvent;
use crate::app::ports::EventSink;

/// Adapter that logs every [`EngineEvent`].
#[derive(Debug, Default)]
pub struct LogEventSink {
    snapshots: u64,
}

impl LogEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> u64 {
        self.snapshots
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::StateChanged { from, to, epoch } => {
                info!("STATE | {:?} -> {:?} | epoch={}", from, to, epoch);
            }
            EngineEvent::Synchronized {
                epoch,
                device_id,
                allocated,
            } => {
                info!(
                    "SYNC | epoch={} | device={} | allocated={}",
                    epoch,
                    device_id,
                    allocated.len()
                );
            }
            EngineEvent::ConnectionLost { epoch, reason } => {
                warn!("LOST | epoch={} | {}", epoch, reason);
            }
            EngineEvent::Snapshot(snapshot) => {
                self.snapshots += 1;
                info!(
                    "SNAPSHOT | epoch={} | blocks={} | named={}",
                    snapshot.epoch,
                    snapshot.blocks.len(),
                    snapshot.history().len()
                );
            }
        }
    }
}
