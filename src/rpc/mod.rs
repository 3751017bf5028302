//! Controller RPC subsystem.
//!
//! Text-framed request/response protocol with no correlation id, so at most
//! one command is ever in flight.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      RPC Stack                             │
//! │                                                            │
//! │  ┌───────────┐   ┌──────────┐   ┌───────────────────────┐  │
//! │  │ Transport │──▶│  Framer  │──▶│  Commander            │  │
//! │  │ (trait)   │   │ (codec)  │   │  queue, epoch, retry  │  │
//! │  └───────────┘   └──────────┘   └───────────────────────┘  │
//! │       ▲                                    │               │
//! │       └──────────── command frames ◀───────┘               │
//! │                                                            │
//! │  TCP · serial · in-process simulator                       │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod command;
pub mod commander;
pub mod handshake;
pub mod sim;
pub mod transport;
