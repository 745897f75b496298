//! Run orchestration for Loom.
//!
//! Drives provider runs to completion: adaptive polling, tool call bridging,
//! progress events with monitor fan-out, and the packaged single-turn
//! conversation runner.

pub mod config;
pub mod errors;
pub mod events;
pub mod poller;
pub mod runner;
pub mod tools;

pub use config::*;
pub use errors::*;
pub use events::*;
pub use poller::*;
pub use runner::*;
pub use tools::*;
