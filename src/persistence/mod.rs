//! Persistence layer: the checkpoint store contract and its `SQLite`
//! implementation.
//!
//! The [`CheckpointStore`] trait is the only surface the scheduler and
//! recovery manager depend on. Writes are compare-and-swap on the flow's
//! previous checkpoint sequence so two resumptions of the same flow can
//! never both commit.

pub mod checkpoint_repo;
pub mod db;
pub mod retention;
pub mod schema;

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

use crate::models::checkpoint::{FlowCheckpoint, ParkedInitiation};
use crate::models::flow::FlowId;
use crate::Result;

pub use checkpoint_repo::SqliteCheckpointStore;
/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Durable key-value storage of flow checkpoints, keyed by [`FlowId`].
pub trait CheckpointStore: Send + Sync {
    /// Write `checkpoint`, succeeding only if the stored sequence equals
    /// `expected_prior` (`None` means no checkpoint may exist yet).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConcurrentCheckpoint`](crate::AppError::ConcurrentCheckpoint)
    /// on a sequence mismatch and `AppError::Db` on storage failure.
    fn put<'a>(
        &'a self,
        checkpoint: &'a FlowCheckpoint,
        expected_prior: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Load the latest checkpoint of a flow.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the read or decode fails.
    fn get(
        &self,
        flow_id: FlowId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<FlowCheckpoint>>> + Send + '_>>;

    /// All checkpoints whose status is neither completed nor failed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    fn list_non_terminal(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FlowCheckpoint>>> + Send + '_>>;

    /// Every stored checkpoint, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    fn list_all(&self) -> Pin<Box<dyn Future<Output = Result<Vec<FlowCheckpoint>>> + Send + '_>>;

    /// Remove a flow's checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    fn delete(&self, flow_id: FlowId) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Delete terminal checkpoints last written before `cutoff`, returning
    /// how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    fn purge_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;

    /// Persist an unresolved inbound initiation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    fn park_initiation<'a>(
        &'a self,
        parked: &'a ParkedInitiation,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Parked initiations, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    fn list_parked(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ParkedInitiation>>> + Send + '_>>;

    /// Drop a parked initiation once it has been resolved.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    fn remove_parked<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}
