//! Error types shared across the engine.
//!
//! [`AppError`] is the infrastructure-facing error returned by the
//! scheduler, store, transport and configuration layers. [`FlowException`]
//! is what flow logic observes when a suspended operation fails; it is
//! serializable so it can travel inside checkpoints and session-error
//! messages.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Shared engine result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Engine error enumeration covering all infrastructure failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Encoding or decoding of continuation state or payloads failed.
    Serialization(String),
    /// Frame codec failure on a stream transport.
    Codec(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// A flow could not be started: bad input or capacity exceeded.
    FlowStart(String),
    /// The counterparty cannot run the requested protocol.
    UnknownCounterpartyFlow(String),
    /// Remote flow logic raised an error.
    CounterpartyFlow(String),
    /// A flow terminated with an error of its own.
    Flow(String),
    /// Transient message transport failure.
    Transport(String),
    /// Another resumption committed a checkpoint first.
    ConcurrentCheckpoint(String),
    /// Flow frozen for operator triage.
    Hospitalization(String),
    /// The engine is shutting down.
    Shutdown(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Serialization(msg) => write!(f, "serialization: {msg}"),
            Self::Codec(msg) => write!(f, "codec: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::FlowStart(msg) => write!(f, "flow start: {msg}"),
            Self::UnknownCounterpartyFlow(msg) => write!(f, "unknown counterparty flow: {msg}"),
            Self::CounterpartyFlow(msg) => write!(f, "counterparty flow: {msg}"),
            Self::Flow(msg) => write!(f, "flow: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::ConcurrentCheckpoint(msg) => write!(f, "concurrent checkpoint: {msg}"),
            Self::Hospitalization(msg) => write!(f, "hospitalized: {msg}"),
            Self::Shutdown(msg) => write!(f, "shutdown: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<FlowException> for AppError {
    fn from(err: FlowException) -> Self {
        match err {
            FlowException::UnknownCounterpartyFlow { .. } => Self::UnknownCounterpartyFlow(err.to_string()),
            FlowException::CounterpartyFlow { message } => Self::CounterpartyFlow(message),
            other => Self::Flow(other.to_string()),
        }
    }
}

/// Failure delivered to flow logic in place of an expected resume value.
///
/// Flow code may handle any of these (retry, compensate) or return it,
/// which fails the flow and propagates a session-error to counterparties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowException {
    /// The counterparty does not know, or refuses, the initiating flow type.
    UnknownCounterpartyFlow {
        /// Descriptor the counterparty failed to resolve.
        flow_type: String,
        /// Reason reported by the counterparty.
        reason: String,
    },
    /// The counterparty flow failed and propagated its error.
    CounterpartyFlow {
        /// Description of the remote error.
        message: String,
    },
    /// A received payload did not have the expected type.
    UnexpectedPayload {
        /// Type the flow asked for.
        expected: String,
        /// Type that actually arrived.
        actual: String,
    },
    /// The counterparty ended the session while a receive was pending.
    SessionEnded {
        /// Local session identifier.
        session_id: String,
    },
    /// An operation referenced a session that is closed or not owned by the flow.
    InvalidSession {
        /// Local session identifier.
        session_id: String,
    },
    /// A deadline expired before the awaited event arrived.
    Timeout,
    /// The flow was cancelled by an operator.
    Cancelled,
    /// Flow logic raised an error of its own.
    Logic {
        /// Description of the error.
        message: String,
    },
}

impl FlowException {
    /// Build a [`FlowException::Logic`] from any displayable message.
    pub fn logic(message: impl Into<String>) -> Self {
        Self::Logic {
            message: message.into(),
        }
    }
}

impl Display for FlowException {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownCounterpartyFlow { flow_type, reason } => {
                write!(f, "counterparty cannot run {flow_type}: {reason}")
            }
            Self::CounterpartyFlow { message } => write!(f, "counterparty flow failed: {message}"),
            Self::UnexpectedPayload { expected, actual } => {
                write!(f, "expected payload of type {expected}, received {actual}")
            }
            Self::SessionEnded { session_id } => {
                write!(f, "session {session_id} ended by counterparty")
            }
            Self::InvalidSession { session_id } => write!(f, "session {session_id} is not usable"),
            Self::Timeout => write!(f, "deadline expired"),
            Self::Cancelled => write!(f, "flow cancelled"),
            Self::Logic { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for FlowException {}
