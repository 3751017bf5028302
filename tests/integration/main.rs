//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises one subsystem against the
//! in-process simulated controller.  Nothing here needs a real controller.

mod blocks_api_tests;
mod broadcast_tests;
mod commander_tests;
mod harness;
mod sync_tests;
