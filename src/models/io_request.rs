//! The yield/resume contract between flow logic and the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::Payload;
use super::session::SessionId;
use crate::errors::FlowException;

/// What a suspended flow is waiting for.
///
/// The executor yields exactly one request per suspension and is resumed
/// with exactly one matching [`Resume`] value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum FlowIORequest {
    /// Hand a payload to the counterparty; resumes with [`Resume::Sent`].
    Send {
        /// Target session.
        session_id: SessionId,
        /// Payload to deliver.
        payload: Payload,
    },
    /// Wait for the next payload; resumes with [`Resume::Received`].
    Receive {
        /// Source session.
        session_id: SessionId,
        /// Expected payload type tag.
        expected_type: String,
    },
    /// Send then wait for the reply; resumes with [`Resume::Received`].
    SendAndReceive {
        /// Target session.
        session_id: SessionId,
        /// Payload to deliver.
        payload: Payload,
        /// Expected reply type tag.
        expected_type: String,
    },
    /// Close a session; resumes with [`Resume::Closed`].
    CloseSession {
        /// Session to close.
        session_id: SessionId,
    },
    /// Wait for a keyed external signal; resumes with [`Resume::Event`].
    WaitForExternalEvent {
        /// Key the signal is delivered under.
        event_key: String,
        /// Optional deadline after which the flow resumes with a timeout.
        deadline: Option<DateTime<Utc>>,
    },
    /// Wait until a point in time; resumes with [`Resume::Woke`].
    Sleep {
        /// Wake-up time.
        until: DateTime<Utc>,
    },
}

impl FlowIORequest {
    /// Short label used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Receive { .. } => "receive",
            Self::SendAndReceive { .. } => "send_and_receive",
            Self::CloseSession { .. } => "close_session",
            Self::WaitForExternalEvent { .. } => "wait_for_external_event",
            Self::Sleep { .. } => "sleep",
        }
    }

    /// Session the request operates on, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::Send { session_id, .. }
            | Self::Receive { session_id, .. }
            | Self::SendAndReceive { session_id, .. }
            | Self::CloseSession { session_id } => Some(*session_id),
            Self::WaitForExternalEvent { .. } | Self::Sleep { .. } => None,
        }
    }

    /// Timer deadline the scheduler must arm while this request is pending.
    #[must_use]
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Sleep { until } => Some(*until),
            Self::WaitForExternalEvent { deadline, .. } => *deadline,
            _ => None,
        }
    }
}

/// Value a flow is resumed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// First execution of a new flow.
    Start,
    /// A `Send` was handed to the transport.
    Sent,
    /// A payload arrived for a `Receive` or `SendAndReceive`.
    Received(Payload),
    /// The session was closed.
    Closed,
    /// An external event arrived.
    Event(Payload),
    /// A `Sleep` elapsed.
    Woke,
    /// The pending operation failed.
    Failed(FlowException),
}
