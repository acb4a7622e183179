//! Networking module
//!
//! Provides the TCP node runtime and replication counters

pub mod node;
pub mod stats;

pub use node::{EngineEvent, EngineHandle, EngineSnapshot, Node, NodeHandle};
pub use stats::ReplicationStats;
