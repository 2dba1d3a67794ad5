//! Node configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::session::Party;
use crate::{AppError, Result};

/// Scheduler sizing and checkpoint retention behaviour.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Maximum live flows before `start_flow` applies backpressure.
    #[serde(default = "default_max_in_flight_flows")]
    pub max_in_flight_flows: usize,
    /// Number of flows allowed to execute logic at the same time.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Seconds a suspended flow stays resident before its actor is dropped;
    /// 0 keeps every flow resident.
    #[serde(default)]
    pub idle_eviction_seconds: u64,
    /// Keep terminal checkpoints for audit instead of deleting them.
    #[serde(default = "default_true")]
    pub retain_terminal_checkpoints: bool,
    /// Outcomes of finished flows kept in memory after they leave the
    /// live set.
    #[serde(default = "default_finished_flow_cache")]
    pub finished_flow_cache: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_in_flight_flows: default_max_in_flight_flows(),
            worker_pool_size: default_worker_pool_size(),
            idle_eviction_seconds: 0,
            retain_terminal_checkpoints: true,
            finished_flow_cache: default_finished_flow_cache(),
        }
    }
}

impl SchedulerConfig {
    /// Idle eviction threshold, if enabled.
    #[must_use]
    pub fn idle_eviction(&self) -> Option<Duration> {
        (self.idle_eviction_seconds > 0).then(|| Duration::from_secs(self.idle_eviction_seconds))
    }
}

/// Bounded retry policy for transport failures and checkpoint races.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Attempts before the flow is hospitalized.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for the exponential delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling and capped.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// What to do with an inbound initiation for an unknown flow type.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownFlowPolicy {
    /// Answer with a reject; the initiator fails.
    #[default]
    Reject,
    /// Persist the initiation unanswered and re-evaluate it on restart.
    Park,
}

/// Session protocol policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Handling of initiations naming an unregistered flow type.
    #[serde(default)]
    pub unknown_flow_policy: UnknownFlowPolicy,
    /// Parties allowed to initiate flows here; empty allows everyone.
    #[serde(default)]
    pub allowed_counterparties: Vec<String>,
    /// Answered initiations remembered for re-answering duplicates, per
    /// kind (rejected, and accepted by a finished responder).
    #[serde(default = "default_initiation_cache")]
    pub initiation_cache: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            unknown_flow_policy: UnknownFlowPolicy::default(),
            allowed_counterparties: Vec::new(),
            initiation_cache: default_initiation_cache(),
        }
    }
}

impl SessionConfig {
    /// Whether `party` may initiate flows on this node.
    #[must_use]
    pub fn permits(&self, party: &Party) -> bool {
        self.allowed_counterparties.is_empty()
            || self
                .allowed_counterparties
                .iter()
                .any(|name| name == party.name())
    }
}

fn default_true() -> bool {
    true
}

fn default_max_in_flight_flows() -> usize {
    1000
}

fn default_worker_pool_size() -> usize {
    8
}

fn default_finished_flow_cache() -> usize {
    1024
}

fn default_initiation_cache() -> usize {
    10_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_retention_days() -> u32 {
    30
}

fn default_db_path() -> PathBuf {
    PathBuf::from("flowstate.db")
}

/// Node configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct NodeConfig {
    /// Legal name of this node on the network.
    pub node_name: String,
    /// Path of the `SQLite` checkpoint database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Days after termination before archived checkpoints are purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Scheduler sizing.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Session protocol policy.
    #[serde(default)]
    pub sessions: SessionConfig,
}

impl NodeConfig {
    /// Configuration with defaults for everything but the node name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the name is blank.
    pub fn for_node(node_name: impl Into<String>) -> Result<Self> {
        let config = Self {
            node_name: node_name.into(),
            db_path: default_db_path(),
            retention_days: default_retention_days(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            sessions: SessionConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// This node's identity.
    #[must_use]
    pub fn party(&self) -> Party {
        Party::new(self.node_name.clone())
    }

    fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(AppError::Config("node_name must not be empty".into()));
        }

        if self.scheduler.max_in_flight_flows == 0 {
            return Err(AppError::Config(
                "scheduler.max_in_flight_flows must be greater than zero".into(),
            ));
        }

        if self.scheduler.worker_pool_size == 0 {
            return Err(AppError::Config(
                "scheduler.worker_pool_size must be greater than zero".into(),
            ));
        }

        if self.scheduler.finished_flow_cache == 0 {
            return Err(AppError::Config(
                "scheduler.finished_flow_cache must be greater than zero".into(),
            ));
        }

        if self.sessions.initiation_cache == 0 {
            return Err(AppError::Config(
                "sessions.initiation_cache must be greater than zero".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(AppError::Config(
                "retry.max_attempts must be greater than zero".into(),
            ));
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(AppError::Config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }

        Ok(())
    }
}
