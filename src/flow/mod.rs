//! Flow programming model.
//!
//! A flow is a serializable struct that advances one step at a time. Each
//! call to [`Flow::resume`] receives the value the previous suspension
//! produced and either yields the next [`FlowIORequest`] or completes. The
//! struct itself is the continuation: it is encoded into every checkpoint
//! and decoded again after a restart, so a flow must keep all of its
//! progress in its own fields.
//!
//! Sub-flows are ordinary flow structs embedded in the parent and driven
//! through [`Flow::resume`] with the parent's [`FlowContext`], which makes
//! them share the parent's id, continuation and session table.

pub mod executor;
pub mod registry;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::FlowException;
use crate::models::flow::{FlowDescriptor, FlowId};
use crate::models::io_request::{FlowIORequest, Resume};
use crate::models::message::Payload;
use crate::models::session::{Party, SessionId};
use crate::models::session_table::SessionTable;
use crate::serialization;
use crate::Result;

pub use registry::FlowRegistry;

/// What a flow step produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Park until the request is satisfied.
    Suspend(FlowIORequest),
    /// Finish with a result.
    Complete(Payload),
}

impl Step {
    /// Send `payload` and resume once it is handed to the transport.
    #[must_use]
    pub fn send(session_id: SessionId, payload: Payload) -> Self {
        Self::Suspend(FlowIORequest::Send {
            session_id,
            payload,
        })
    }

    /// Wait for the next payload of `expected_type`.
    pub fn receive(session_id: SessionId, expected_type: impl Into<String>) -> Self {
        Self::Suspend(FlowIORequest::Receive {
            session_id,
            expected_type: expected_type.into(),
        })
    }

    /// Send `payload`, then wait for a reply of `expected_type`.
    pub fn send_and_receive(
        session_id: SessionId,
        payload: Payload,
        expected_type: impl Into<String>,
    ) -> Self {
        Self::Suspend(FlowIORequest::SendAndReceive {
            session_id,
            payload,
            expected_type: expected_type.into(),
        })
    }

    /// Close a session.
    #[must_use]
    pub fn close(session_id: SessionId) -> Self {
        Self::Suspend(FlowIORequest::CloseSession { session_id })
    }

    /// Wait for an external signal delivered under `event_key`.
    pub fn wait_for_event(event_key: impl Into<String>, deadline: Option<DateTime<Utc>>) -> Self {
        Self::Suspend(FlowIORequest::WaitForExternalEvent {
            event_key: event_key.into(),
            deadline,
        })
    }

    /// Sleep until `until`.
    #[must_use]
    pub fn sleep_until(until: DateTime<Utc>) -> Self {
        Self::Suspend(FlowIORequest::Sleep { until })
    }
}

/// Everything flow logic may touch while it runs one step.
///
/// The context performs no I/O; opening a session only records it in the
/// session table. The initiation goes out with the session's first send.
pub struct FlowContext<'a> {
    flow_id: FlowId,
    our_identity: &'a Party,
    flow_type: &'a FlowDescriptor,
    sessions: &'a mut SessionTable,
}

impl<'a> FlowContext<'a> {
    /// Context over `sessions` for one step of flow `flow_id`.
    #[must_use]
    pub fn new(
        flow_id: FlowId,
        our_identity: &'a Party,
        flow_type: &'a FlowDescriptor,
        sessions: &'a mut SessionTable,
    ) -> Self {
        Self {
            flow_id,
            our_identity,
            flow_type,
            sessions,
        }
    }

    /// Identifier of the running flow.
    #[must_use]
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// The node this flow runs on.
    #[must_use]
    pub fn our_identity(&self) -> &Party {
        self.our_identity
    }

    /// Open a session to `counterparty` for this flow's own protocol.
    pub fn initiate_flow(&mut self, counterparty: Party) -> SessionId {
        self.sessions
            .open_initiating(self.flow_id, counterparty, self.flow_type.clone())
    }

    /// Open a session naming a different initiating protocol, for
    /// sub-flows that are registered as initiators in their own right.
    pub fn initiate_flow_as(&mut self, counterparty: Party, protocol: FlowDescriptor) -> SessionId {
        self.sessions
            .open_initiating(self.flow_id, counterparty, protocol)
    }

    /// Counterparty of an owned session.
    #[must_use]
    pub fn counterparty(&self, session_id: SessionId) -> Option<&Party> {
        self.sessions
            .get(session_id)
            .map(|session| &session.counterparty)
    }

    /// Current wall-clock time, for computing deadlines.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// User-defined flow logic.
pub trait Flow: Serialize + DeserializeOwned + Send + 'static {
    /// Stable name used in descriptors.
    const NAME: &'static str;
    /// Protocol version.
    const VERSION: u32 = 1;

    /// Descriptor under which the flow is registered and initiated.
    #[must_use]
    fn descriptor() -> FlowDescriptor {
        FlowDescriptor::new(Self::NAME, Self::VERSION)
    }

    /// Advance the flow with the value its last suspension produced.
    ///
    /// # Errors
    ///
    /// Returning an error fails the flow and propagates a session error to
    /// every open counterparty.
    fn resume(&mut self, ctx: &mut FlowContext<'_>, input: Resume) -> std::result::Result<Step, FlowException>;
}

/// A flow started by an inbound session initiation.
pub trait InitiatedFlow: Flow {
    /// Build the responder for a freshly accepted session.
    fn initiated(session: SessionId, counterparty: Party) -> Self;
}

/// Object-safe view of a [`Flow`] used by the scheduler.
pub trait FlowLogic: Send {
    /// Registered descriptor.
    fn descriptor(&self) -> FlowDescriptor;

    /// See [`Flow::resume`].
    ///
    /// # Errors
    ///
    /// Propagates the flow's own error.
    fn resume(&mut self, ctx: &mut FlowContext<'_>, input: Resume) -> std::result::Result<Step, FlowException>;

    /// Encode the continuation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serialization` if the flow cannot be encoded.
    fn encode(&self) -> Result<Vec<u8>>;
}

struct Typed<F>(F);

impl<F: Flow> FlowLogic for Typed<F> {
    fn descriptor(&self) -> FlowDescriptor {
        F::descriptor()
    }

    fn resume(&mut self, ctx: &mut FlowContext<'_>, input: Resume) -> std::result::Result<Step, FlowException> {
        self.0.resume(ctx, input)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        serialization::encode(&self.0)
    }
}

/// Box a typed flow for the scheduler.
pub fn boxed<F: Flow>(flow: F) -> Box<dyn FlowLogic> {
    Box::new(Typed(flow))
}

/// Rebuild a typed flow from its encoded continuation.
///
/// # Errors
///
/// Returns `AppError::Serialization` if the bytes do not decode as `F`.
pub fn restore<F: Flow>(bytes: &[u8]) -> Result<Box<dyn FlowLogic>> {
    let flow: F = serialization::decode(bytes)?;
    Ok(boxed(flow))
}
