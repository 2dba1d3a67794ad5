//! Flow identity, lifecycle status, descriptors and outcomes.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::Payload;
use crate::errors::FlowException;
use crate::{AppError, Result};

/// Globally unique, immutable identifier of a flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(Uuid);

impl FlowId {
    /// Allocate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID value.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for FlowId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|err| AppError::Serialization(format!("invalid flow id {s}: {err}")))
    }
}

/// Lifecycle status of a flow instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Allocated but not yet run.
    Created,
    /// Executing flow logic between suspend points.
    Running,
    /// Parked at a suspend point waiting for an event.
    Suspended,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Frozen pending operator triage; retryable.
    Hospitalized,
}

impl FlowStatus {
    /// `Completed` and `Failed` are never resumed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created | Self::Suspended, Self::Running)
                | (
                    Self::Running,
                    Self::Suspended | Self::Completed | Self::Failed | Self::Hospitalized
                )
                | (
                    Self::Created | Self::Suspended,
                    Self::Hospitalized | Self::Failed
                )
                | (Self::Hospitalized, Self::Suspended | Self::Failed)
                | (Self::Suspended, Self::Completed)
        )
    }

    /// Stable text form used in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Hospitalized => "hospitalized",
        }
    }
}

impl Display for FlowStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "hospitalized" => Ok(Self::Hospitalized),
            other => Err(AppError::Db(format!("invalid flow status: {other}"))),
        }
    }
}

/// Stable `name@version` key identifying a flow type across nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowDescriptor {
    /// Fully qualified flow name.
    pub name: String,
    /// Protocol version.
    pub version: u32,
}

impl FlowDescriptor {
    /// Construct a descriptor.
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// A descriptor is usable when its name is non-blank and has no `@`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let name = self.name.trim();
        !name.is_empty() && name.len() == self.name.len() && !name.contains('@')
    }
}

impl Display for FlowDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl FromStr for FlowDescriptor {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, version) = s
            .rsplit_once('@')
            .ok_or_else(|| AppError::Serialization(format!("invalid flow descriptor: {s}")))?;
        let version = version
            .parse()
            .map_err(|err| AppError::Serialization(format!("invalid flow version in {s}: {err}")))?;
        Ok(Self::new(name, version))
    }
}

/// Who or what started a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum InvocationContext {
    /// Started by a local client (RPC user, shell, scheduler).
    Client {
        /// Client identity.
        actor: String,
    },
    /// Started by an inbound session initiation from a peer.
    Peer {
        /// Initiating party.
        party: String,
    },
}

impl InvocationContext {
    /// Context for a locally started flow.
    pub fn client(actor: impl Into<String>) -> Self {
        Self::Client {
            actor: actor.into(),
        }
    }
}

/// Final result of a flow, recorded in its terminal checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlowOutcome {
    /// The flow returned a value.
    Completed {
        /// Returned value.
        result: Payload,
    },
    /// The flow raised an uncaught error.
    Failed {
        /// Error that terminated the flow.
        error: FlowException,
    },
    /// The flow is parked for operator triage.
    Hospitalized {
        /// Reason given at hospitalization.
        reason: String,
    },
}

impl FlowOutcome {
    /// Matching status for this outcome.
    #[must_use]
    pub fn status(&self) -> FlowStatus {
        match self {
            Self::Completed { .. } => FlowStatus::Completed,
            Self::Failed { .. } => FlowStatus::Failed,
            Self::Hospitalized { .. } => FlowStatus::Hospitalized,
        }
    }
}
