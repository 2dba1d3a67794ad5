//! Session protocol: stamping outbound messages and accepting inbound ones.
//!
//! Everything here is synchronous and operates on one flow's
//! [`SessionTable`]; the actor that owns the table decides when the
//! produced messages are persisted and dispatched.

use tracing::debug;

use crate::models::flow::FlowDescriptor;
use crate::models::message::{OutboundMessage, Payload, SessionMessage, SessionPayload};
use crate::models::session::{FlowSession, InboundItem, Party, SessionId, SessionRole, SessionState};
use crate::models::session_table::SessionTable;

/// Reason carried by a reject for an unresolvable flow type.
pub const UNKNOWN_FLOW_REASON: &str = "unknown flow type";
/// Reason carried by a reject for a party outside the allow-list.
pub const NOT_PERMITTED_REASON: &str = "counterparty not permitted";

/// What happened to an inbound message offered to a session table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// The message changed session state.
    Applied {
        /// An item was buffered for the flow to consume.
        buffered: bool,
        /// Messages released by the change (backlog flushed on confirm).
        produced: Vec<OutboundMessage>,
    },
    /// Sequence number already consumed.
    Duplicate,
    /// Sequence number would open a gap.
    OutOfOrder,
    /// No session with that id.
    UnknownSession,
}

fn stamp(us: &Party, session: &mut FlowSession, payload: SessionPayload) -> OutboundMessage {
    let sequence = session.next_sequence();
    OutboundMessage {
        destination: session.counterparty.clone(),
        message: SessionMessage {
            sender: us.clone(),
            sender_session_id: Some(session.session_id),
            recipient_session_id: session.peer_session_id,
            sequence,
            payload,
        },
    }
}

/// Stamp the initiation of a locally created session unless it already
/// went out. `first_payload` travels with it.
pub fn initiate(us: &Party, session: &mut FlowSession, first_payload: Option<Payload>, out: &mut Vec<OutboundMessage>) {
    if session.initiation_sent() {
        return;
    }
    let initiate = SessionPayload::Initiate {
        flow_type: session.flow_type.clone(),
        first_payload,
    };
    let outbound = stamp(us, session, initiate);
    session.initiation = Some(outbound.message.clone());
    out.push(outbound);
}

/// Queue `payload` on a session, opening it first when this is its first
/// send. Payloads issued before the counterparty confirms wait in the
/// backlog.
pub fn send_payload(us: &Party, session: &mut FlowSession, payload: Payload, out: &mut Vec<OutboundMessage>) {
    if !session.initiation_sent() {
        initiate(us, session, Some(payload), out);
    } else if session.peer_session_id.is_none() {
        session.backlog.push(SessionPayload::Data { payload });
    } else {
        out.push(stamp(us, session, SessionPayload::Data { payload }));
    }
}

/// Close a session from the local side.
pub fn close_session(us: &Party, session: &mut FlowSession, out: &mut Vec<OutboundMessage>) {
    if !session.is_open() {
        return;
    }
    if session.peer_session_id.is_some() {
        out.push(stamp(us, session, SessionPayload::End));
    } else if session.initiation_sent() {
        session.backlog.push(SessionPayload::End);
    }
    session.state = SessionState::Closed;
}

/// Send `last` on every open session and close it. Sessions still waiting
/// for a confirm keep `last` in their backlog; it goes out after the
/// confirm arrives. Sessions never initiated are closed silently.
fn close_all(us: &Party, sessions: &mut SessionTable, last: &SessionPayload, out: &mut Vec<OutboundMessage>) {
    for session in sessions.iter_mut() {
        if !session.is_open() {
            continue;
        }
        if session.peer_session_id.is_some() {
            out.push(stamp(us, session, last.clone()));
        } else if session.initiation.is_some() {
            session.backlog.push(last.clone());
        }
        session.state = SessionState::Closed;
    }
}

/// Tell every open session that the flow finished.
pub fn end_sessions(us: &Party, sessions: &mut SessionTable, out: &mut Vec<OutboundMessage>) {
    close_all(us, sessions, &SessionPayload::End, out);
}

/// Propagate a flow failure to every open session.
pub fn error_sessions(us: &Party, sessions: &mut SessionTable, message: &str, out: &mut Vec<OutboundMessage>) {
    let error = SessionPayload::Error {
        message: message.to_owned(),
    };
    close_all(us, sessions, &error, out);
}

/// Apply an inbound message to the owning flow's session table.
pub fn accept_inbound(us: &Party, sessions: &mut SessionTable, message: SessionMessage) -> Accepted {
    let session = match message.recipient_session_id {
        Some(session_id) => sessions.get_mut(session_id),
        None => None,
    };
    let Some(session) = session else {
        return Accepted::UnknownSession;
    };

    if message.sequence <= session.last_received_seq {
        return Accepted::Duplicate;
    }
    if message.sequence > session.last_received_seq + 1 {
        return Accepted::OutOfOrder;
    }
    session.last_received_seq = message.sequence;

    let mut produced = Vec::new();
    let buffered = match message.payload {
        SessionPayload::Confirm => {
            confirm(us, session, message.sender_session_id, &mut produced);
            false
        }
        SessionPayload::Reject { reason, .. } => {
            session.state = SessionState::Rejected;
            session.rejection = Some(reason);
            session.initiation = None;
            session.backlog.clear();
            true
        }
        SessionPayload::Data { payload } => {
            session.inbound.push_back(InboundItem::Data { payload });
            true
        }
        SessionPayload::Error { message } => {
            session.inbound.push_back(InboundItem::Error { message });
            session.state = SessionState::Closed;
            true
        }
        SessionPayload::End => {
            session.inbound.push_back(InboundItem::End);
            session.state = SessionState::Closed;
            true
        }
        SessionPayload::Initiate { .. } => {
            debug!(session_id = %session.session_id, "initiate addressed to an existing session ignored");
            false
        }
    };

    Accepted::Applied { buffered, produced }
}

fn confirm(us: &Party, session: &mut FlowSession, peer: Option<SessionId>, out: &mut Vec<OutboundMessage>) {
    if session.role != SessionRole::Initiator || session.peer_session_id.is_some() {
        return;
    }
    session.peer_session_id = peer;
    session.initiation = None;
    if session.state == SessionState::Initiating {
        session.state = SessionState::Confirmed;
    }
    for payload in std::mem::take(&mut session.backlog) {
        out.push(stamp(us, session, payload));
    }
}

/// Build the responder side of an accepted initiation: the session, the
/// first payload buffered for the responder, and the confirm to send back.
pub fn accept_initiation(
    us: &Party,
    local_session_id: SessionId,
    initiation: &SessionMessage,
    peer_session_id: SessionId,
    flow_type: FlowDescriptor,
    first_payload: Option<Payload>,
) -> (FlowSession, OutboundMessage) {
    let mut session = FlowSession::initiated(
        local_session_id,
        initiation.sender.clone(),
        flow_type,
        peer_session_id,
    );
    session.last_received_seq = initiation.sequence;
    if let Some(payload) = first_payload {
        session.inbound.push_back(InboundItem::Data { payload });
    }
    let confirm = stamp(us, &mut session, SessionPayload::Confirm);
    (session, confirm)
}

/// Confirm as originally sent for an already accepted initiation.
#[must_use]
pub fn confirm_message(us: &Party, local_session_id: SessionId, initiation: &SessionMessage) -> SessionMessage {
    SessionMessage {
        sender: us.clone(),
        sender_session_id: Some(local_session_id),
        recipient_session_id: initiation.sender_session_id,
        sequence: 1,
        payload: SessionPayload::Confirm,
    }
}

/// Reject for an initiation that cannot be served.
#[must_use]
pub fn reject_message(us: &Party, initiation: &SessionMessage, flow_type: FlowDescriptor, reason: &str) -> SessionMessage {
    SessionMessage {
        sender: us.clone(),
        sender_session_id: None,
        recipient_session_id: initiation.sender_session_id,
        sequence: 1,
        payload: SessionPayload::Reject {
            flow_type,
            reason: reason.to_owned(),
        },
    }
}
