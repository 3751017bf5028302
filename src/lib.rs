//! Sparkhost: host-side protocol engine for block-based brewing controllers.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  FileStorage      LogEventSink     SystemClock    Transports   │
//! │  (Config+Storage) (EventSink)      (ClockPort)    TCP/serial   │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │  Supervisor ─▶ Synchronizer ─▶ Commander ─▶ Framer     │    │
//! │  │  Broadcaster · BlockApi · Datastore · ObjectCodec      │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! └────────────────────────────────────────────────────────────────┘
//! ```

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod datastore;
pub mod diagnostics;
pub mod error;
pub mod fsm;
pub mod rpc;
pub mod supervisor;
pub mod sync;

pub use app::blocks::BlockApi;
pub use app::events::{Block, EngineEvent, Snapshot};
pub use config::{ConnectionTarget, EngineConfig};
pub use datastore::Datastore;
pub use error::{Error, ErrorKind, Result};
pub use fsm::{ConnectionState, Epoch};
pub use rpc::commander::Commander;
pub use supervisor::Engine;
