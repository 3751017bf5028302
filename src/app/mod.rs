//! Application layer: what the engine exposes to the outside world.
//!
//! Everything outside the engine speaks in stable ids and decoded fields;
//! everything inside speaks numeric ids and raw payloads.  This module sits
//! at that seam and talks to adapters through the **port traits** in
//! [`ports`].

pub mod blocks;
pub mod events;
pub mod ports;
