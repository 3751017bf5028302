//! Adapters: concrete implementations of the port traits.
//!
//! | Adapter    | Implements              | Connects to               |
//! |------------|-------------------------|---------------------------|
//! | `log_sink` | EventSink               | `log` facade              |
//! | `storage`  | StoragePort, ConfigPort | data directory / memory   |
//! | `time`     | ClockPort               | host wall clock           |

pub mod log_sink;
pub mod storage;
pub mod time;
