#![forbid(unsafe_code)]

//! Durable flow state machines for a permissioned ledger node.
//!
//! Flows are explicit state-machine structs driven by a per-flow actor,
//! checkpointed to `SQLite` before every externally visible effect, and
//! recovered from their last checkpoint when a node restarts.

pub mod config;
pub mod demo;
pub mod errors;
pub mod flow;
pub mod models;
pub mod node;
pub mod persistence;
pub mod serialization;
pub mod statemachine;
pub mod transport;

pub use config::NodeConfig;
pub use errors::{AppError, FlowException, Result};
pub use node::FlowNode;
pub use statemachine::StateMachineManager;
