//! Flow session model: one conversation with one counterparty flow.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::flow::{FlowDescriptor, FlowId};
use super::message::{Payload, SessionMessage, SessionPayload};

/// Identity of a node on the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Party(String);

impl Party {
    /// Construct a party from its legal name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Legal name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Display for Party {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session identifier, unique within the owning flow and across the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Derive the `index`-th session id of a flow.
    ///
    /// Derivation is deterministic so re-running a step from the same
    /// checkpoint reproduces the same ids on the wire.
    #[must_use]
    pub fn derive(flow_id: FlowId, index: u64) -> Self {
        Self(Uuid::new_v5(flow_id.as_uuid(), &index.to_be_bytes()))
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Handshake and lifecycle state of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created locally; the counterparty has not confirmed yet.
    Initiating,
    /// Both sides know each other's session id.
    Confirmed,
    /// The counterparty refused the initiation.
    Rejected,
    /// Closed locally or ended by the counterparty.
    Closed,
}

/// Which side of the handshake this session is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    /// Created by `initiate_flow` on this node.
    Initiator,
    /// Created by an inbound initiation.
    Initiated,
}

/// An accepted inbound item not yet consumed by the flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundItem {
    /// Application payload.
    Data {
        /// Payload as received.
        payload: Payload,
    },
    /// Counterparty flow failed.
    Error {
        /// Remote error description.
        message: String,
    },
    /// Counterparty ended the session.
    End,
}

/// One point-to-point conversation owned by exactly one flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSession {
    /// Local session identifier.
    pub session_id: SessionId,
    /// Node hosting the counterparty flow.
    pub counterparty: Party,
    /// Initiating flow type; tells the counterparty which logic to run.
    pub flow_type: FlowDescriptor,
    /// Side of the handshake.
    pub role: SessionRole,
    /// Current handshake state.
    pub state: SessionState,
    /// Counterparty's session id once known.
    pub peer_session_id: Option<SessionId>,
    /// Highest sequence number stamped on an outbound message.
    pub last_sent_seq: u64,
    /// Highest sequence number accepted from the counterparty.
    pub last_received_seq: u64,
    /// Accepted inbound items awaiting a receive.
    pub inbound: VecDeque<InboundItem>,
    /// Outbound payloads issued before the handshake confirmed.
    pub backlog: Vec<SessionPayload>,
    /// Stamped initiation, kept until confirmed so recovery can re-send it.
    pub initiation: Option<SessionMessage>,
    /// Reason given by the counterparty when it rejected the session.
    pub rejection: Option<String>,
}

impl FlowSession {
    /// New locally initiated session.
    #[must_use]
    pub fn initiating(session_id: SessionId, counterparty: Party, flow_type: FlowDescriptor) -> Self {
        Self {
            session_id,
            counterparty,
            flow_type,
            role: SessionRole::Initiator,
            state: SessionState::Initiating,
            peer_session_id: None,
            last_sent_seq: 0,
            last_received_seq: 0,
            inbound: VecDeque::new(),
            backlog: Vec::new(),
            initiation: None,
            rejection: None,
        }
    }

    /// New session accepted from an inbound initiation.
    #[must_use]
    pub fn initiated(
        session_id: SessionId,
        counterparty: Party,
        flow_type: FlowDescriptor,
        peer_session_id: SessionId,
    ) -> Self {
        Self {
            session_id,
            counterparty,
            flow_type,
            role: SessionRole::Initiated,
            state: SessionState::Confirmed,
            peer_session_id: Some(peer_session_id),
            last_sent_seq: 0,
            last_received_seq: 0,
            inbound: VecDeque::new(),
            backlog: Vec::new(),
            initiation: None,
            rejection: None,
        }
    }

    /// Whether the session can still carry traffic in either direction.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Initiating | SessionState::Confirmed)
    }

    /// Whether the initiation has already been stamped.
    #[must_use]
    pub fn initiation_sent(&self) -> bool {
        self.role == SessionRole::Initiated || self.last_sent_seq > 0
    }

    /// Reserve the next outbound sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        self.last_sent_seq += 1;
        self.last_sent_seq
    }
}
