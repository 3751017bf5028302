//! Outbound engine events and the block view they carry.
//!
//! The supervisor and broadcaster emit these through the
//! [`EventSink`](super::ports::EventSink) port.  Adapters on the other side
//! decide what to do with them: log them, publish them to a broker, record
//! them in a test.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::codec::Fields;
use crate::datastore::GENERATED_ID_PREFIX;
use crate::fsm::{ConnectionState, Epoch};

/// A block as presented outside the engine.
///
/// Assembled on demand from a response plus a datastore lookup; never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    pub id: String,
    pub nid: u16,
    #[serde(rename = "type")]
    pub type_name: String,
    pub data: Fields,
}

/// Resolved block collection published on every broadcast tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub epoch: Epoch,
    pub blocks: BTreeMap<String, Block>,
}

impl Snapshot {
    /// Blocks with a user-assigned id, for the history service.
    pub fn history(&self) -> BTreeMap<&str, &Fields> {
        self.blocks
            .iter()
            .filter(|(id, _)| !id.starts_with(GENERATED_ID_PREFIX))
            .map(|(id, block)| (id.as_str(), &block.data))
            .collect()
    }
}

/// Structured events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The connection state machine took an edge.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
        epoch: Epoch,
    },
    /// Synchronization finished; the connection is ready.
    Synchronized {
        epoch: Epoch,
        device_id: String,
        allocated: Vec<String>,
    },
    /// The physical connection dropped.
    ConnectionLost { epoch: Epoch, reason: String },
    /// Periodic resolved block collection.
    Snapshot(Snapshot),
}
