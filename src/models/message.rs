//! Wire-level session messages and typed payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::flow::FlowDescriptor;
use super::session::{Party, SessionId};
use crate::errors::FlowException;
use crate::Result;

/// Type name used for plain text payloads.
pub const TEXT_TYPE: &str = "string";

/// Typed application payload carried by session messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Application-level type tag checked against a receive's expectation.
    pub type_name: String,
    /// Encoded value.
    pub body: serde_json::Value,
}

impl Payload {
    /// Encode `value` under the given type tag.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serialization` if `value` cannot be encoded.
    pub fn new<T: Serialize>(type_name: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self {
            type_name: type_name.into(),
            body: serde_json::to_value(value)?,
        })
    }

    /// A plain text payload.
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            type_name: TEXT_TYPE.to_owned(),
            body: serde_json::Value::String(value.into()),
        }
    }

    /// Borrow the body as text when this is a text payload.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if self.type_name == TEXT_TYPE {
            self.body.as_str()
        } else {
            None
        }
    }

    /// Decode the body into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowException::UnexpectedPayload`] if the body does not
    /// match `T`'s shape.
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, FlowException> {
        serde_json::from_value(self.body.clone()).map_err(|err| FlowException::UnexpectedPayload {
            expected: std::any::type_name::<T>().to_owned(),
            actual: format!("{} ({err})", self.type_name),
        })
    }
}

/// Body of a [`SessionMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionPayload {
    /// Opens a session and names the flow the recipient should run.
    Initiate {
        /// Descriptor of the initiating flow type.
        flow_type: FlowDescriptor,
        /// First application payload, sent with the handshake.
        first_payload: Option<Payload>,
    },
    /// Accepts an initiation; the sender session id is the responder's.
    Confirm,
    /// Refuses an initiation.
    Reject {
        /// Descriptor that could not be resolved or was refused.
        flow_type: FlowDescriptor,
        /// Human-readable reason.
        reason: String,
    },
    /// Normal application message.
    Data {
        /// Application payload.
        payload: Payload,
    },
    /// The sending flow failed with an uncaught error.
    Error {
        /// Description of the remote error.
        message: String,
    },
    /// The sending side closed the session or finished.
    End,
}

impl SessionPayload {
    /// Short label used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initiate { .. } => "initiate",
            Self::Confirm => "confirm",
            Self::Reject { .. } => "reject",
            Self::Data { .. } => "data",
            Self::Error { .. } => "error",
            Self::End => "end",
        }
    }
}

/// Wire-level unit exchanged between nodes.
///
/// `sequence` is gapless per direction per session, starting at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    /// Sending node.
    pub sender: Party,
    /// Session id on the sending side; absent only for rejects, which are
    /// produced before any responder session exists.
    pub sender_session_id: Option<SessionId>,
    /// Session id on the receiving side; absent only for initiations.
    pub recipient_session_id: Option<SessionId>,
    /// Per-direction sequence number.
    pub sequence: u64,
    /// Message body.
    pub payload: SessionPayload,
}

/// A message waiting to be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Node the message is addressed to.
    pub destination: Party,
    /// Message to deliver.
    pub message: SessionMessage,
}
