//! Provider layer for Loom.
//!
//! Normalizes thread, message and run primitives across a threaded hosted API,
//! a vendor variant of it with pre-provisioned agents, and a stateless local
//! chat endpoint. Owns the agent identity cache, the in-process conversation
//! store and token accounting.

pub mod agents;
pub mod errors;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod store;
pub mod types;
pub mod usage;

pub use agents::*;
pub use errors::*;
pub use provider::*;
pub use providers::*;
pub use retry::*;
pub use store::*;
pub use types::*;
pub use usage::*;
