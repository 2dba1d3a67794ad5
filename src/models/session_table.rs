//! Per-flow session table.
//!
//! Mutated only by the owning flow's actor. Serialized whole into every
//! checkpoint.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::flow::{FlowDescriptor, FlowId};
use super::session::{FlowSession, Party, SessionId, SessionRole};

/// Mapping of session ids to sessions for one flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTable {
    sessions: BTreeMap<SessionId, FlowSession>,
    next_index: u64,
}

impl SessionTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a session id for `flow_id` without inserting a session.
    pub fn allocate_id(&mut self, flow_id: FlowId) -> SessionId {
        let id = SessionId::derive(flow_id, self.next_index);
        self.next_index += 1;
        id
    }

    /// Create a locally initiated session and return its id.
    pub fn open_initiating(
        &mut self,
        flow_id: FlowId,
        counterparty: Party,
        flow_type: FlowDescriptor,
    ) -> SessionId {
        let id = self.allocate_id(flow_id);
        self.sessions
            .insert(id, FlowSession::initiating(id, counterparty, flow_type));
        id
    }

    /// Insert a fully built session (used for inbound initiations).
    pub fn insert(&mut self, session: FlowSession) {
        self.sessions.insert(session.session_id, session);
    }

    /// Look up a session.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<&FlowSession> {
        self.sessions.get(&id)
    }

    /// Look up a session mutably.
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut FlowSession> {
        self.sessions.get_mut(&id)
    }

    /// Whether the table owns `id`.
    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// All sessions in id order.
    pub fn iter(&self) -> impl Iterator<Item = &FlowSession> {
        self.sessions.values()
    }

    /// All sessions in id order, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FlowSession> {
        self.sessions.values_mut()
    }

    /// All session ids.
    #[must_use]
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Sessions created by an inbound initiation, keyed by the peer's id.
    pub fn initiated(&self) -> impl Iterator<Item = &FlowSession> {
        self.sessions
            .values()
            .filter(|session| session.role == SessionRole::Initiated)
    }

    /// Whether any initiation is still waiting for a confirm or reject.
    #[must_use]
    pub fn awaiting_answer(&self) -> bool {
        self.sessions
            .values()
            .any(|session| session.initiation.is_some())
    }

    /// Number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
