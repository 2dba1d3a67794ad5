//! Domain model module declarations.

pub mod checkpoint;
pub mod flow;
pub mod io_request;
pub mod message;
pub mod session;
pub mod session_table;

pub use checkpoint::{FlowCheckpoint, ParkedInitiation};
pub use flow::{FlowDescriptor, FlowId, FlowOutcome, FlowStatus, InvocationContext};
pub use io_request::{FlowIORequest, Resume};
pub use message::{OutboundMessage, Payload, SessionMessage, SessionPayload};
pub use session::{FlowSession, InboundItem, Party, SessionId, SessionRole, SessionState};
pub use session_table::SessionTable;
