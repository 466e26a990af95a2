//! Consensus integration: type config, durable log, state machine,
//! in-process transport, and the per-node adapter.

pub mod log_store;
pub mod network;
pub mod node;
pub mod state_machine;
pub mod types;
