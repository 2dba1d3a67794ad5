//! Durable snapshot of a suspended or terminal flow.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::flow::{FlowDescriptor, FlowId, FlowOutcome, FlowStatus, InvocationContext};
use super::io_request::FlowIORequest;
use super::message::{OutboundMessage, Payload, SessionMessage};
use super::session::Party;
use super::session_table::SessionTable;

/// Everything needed to resume a flow from its last suspend point.
///
/// `continuation` is opaque to the scheduler and stored separately from
/// the structured fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowCheckpoint {
    /// Owning flow.
    pub flow_id: FlowId,
    /// Type used to rebuild the continuation.
    pub flow_type: FlowDescriptor,
    /// Who started the flow.
    pub context: InvocationContext,
    /// Status at write time.
    pub status: FlowStatus,
    /// Strictly increasing per flow, starting at 1.
    pub sequence: u64,
    /// Encoded continuation state.
    #[serde(skip)]
    pub continuation: Vec<u8>,
    /// Session table as of suspension.
    pub sessions: SessionTable,
    /// Outstanding request, absent for terminal checkpoints.
    pub pending_request: Option<FlowIORequest>,
    /// Messages produced at this suspension, dispatched after the write.
    pub outbox: Vec<OutboundMessage>,
    /// External events received but not yet consumed, by key.
    pub external_events: BTreeMap<String, VecDeque<Payload>>,
    /// Set for terminal and hospitalized checkpoints.
    pub outcome: Option<FlowOutcome>,
    /// Outcome reached while session initiations were still unanswered.
    /// The flow terminates with it once every initiation is confirmed or
    /// rejected and the trailing end or error has been sent.
    #[serde(default)]
    pub closing: Option<FlowOutcome>,
    /// When the flow was created.
    pub created_at: DateTime<Utc>,
    /// When this checkpoint was written.
    pub updated_at: DateTime<Utc>,
}

impl FlowCheckpoint {
    /// State of a flow that has been created but never suspended.
    #[must_use]
    pub fn new(flow_id: FlowId, flow_type: FlowDescriptor, context: InvocationContext) -> Self {
        let now = Utc::now();
        Self {
            flow_id,
            flow_type,
            context,
            status: FlowStatus::Created,
            sequence: 0,
            continuation: Vec::new(),
            sessions: SessionTable::new(),
            pending_request: None,
            outbox: Vec::new(),
            external_events: BTreeMap::new(),
            outcome: None,
            closing: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Hospitalization reason, if the flow is hospitalized.
    #[must_use]
    pub fn hospital_reason(&self) -> Option<&str> {
        match &self.outcome {
            Some(FlowOutcome::Hospitalized { reason }) => Some(reason),
            _ => None,
        }
    }
}

/// An inbound initiation whose flow type could not be resolved, kept for
/// re-evaluation on the next start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedInitiation {
    /// Unique record identifier.
    pub id: String,
    /// Initiating node.
    pub sender: Party,
    /// The initiation as received.
    pub message: SessionMessage,
    /// Why it could not be resolved.
    pub reason: String,
    /// When it was parked.
    pub parked_at: DateTime<Utc>,
}

impl ParkedInitiation {
    /// Park an initiation with a generated identifier.
    #[must_use]
    pub fn new(message: SessionMessage, reason: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: message.sender.clone(),
            message,
            reason,
            parked_at: Utc::now(),
        }
    }
}
