//! Flow scheduler: per-flow actors, the session protocol, and start-up
//! recovery.

mod actor;
pub mod manager;
pub mod protocol;
pub mod recovery;
mod recent;

pub use manager::StateMachineManager;
pub use recovery::{recover, RecoveryReport};
