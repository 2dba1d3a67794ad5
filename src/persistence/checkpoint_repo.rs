//! Checkpoint repository for `SQLite` persistence.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::checkpoint::{FlowCheckpoint, ParkedInitiation};
use crate::models::flow::FlowId;
use crate::models::message::SessionMessage;
use crate::models::session::Party;
use crate::{AppError, Result};

use super::db::Database;
use super::CheckpointStore;

/// `SQLite`-backed [`CheckpointStore`].
///
/// Structured fields are kept as JSON in `body`; the continuation bytes
/// live in their own BLOB column so they stay opaque to the store.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct CheckpointRow {
    flow_id: String,
    status: String,
    sequence: i64,
    continuation: Vec<u8>,
    body: String,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<FlowCheckpoint> {
        let mut checkpoint: FlowCheckpoint = serde_json::from_str(&self.body)
            .map_err(|err| AppError::Db(format!("corrupt checkpoint {}: {err}", self.flow_id)))?;
        let sequence = u64::try_from(self.sequence)
            .map_err(|err| AppError::Db(format!("invalid sequence: {err}")))?;
        if checkpoint.sequence != sequence || checkpoint.status.as_str() != self.status {
            return Err(AppError::Db(format!(
                "checkpoint {} columns disagree with body",
                self.flow_id
            )));
        }
        checkpoint.continuation = self.continuation;
        Ok(checkpoint)
    }
}

/// Internal row struct for parked initiations.
#[derive(sqlx::FromRow)]
struct ParkedRow {
    id: String,
    sender: String,
    message: String,
    reason: String,
    parked_at: String,
}

impl ParkedRow {
    fn into_parked(self) -> Result<ParkedInitiation> {
        let message: SessionMessage = serde_json::from_str(&self.message)
            .map_err(|err| AppError::Db(format!("corrupt parked initiation {}: {err}", self.id)))?;
        let parked_at = DateTime::parse_from_rfc3339(&self.parked_at)
            .map_err(|err| AppError::Db(format!("invalid parked_at: {err}")))?
            .with_timezone(&Utc);

        Ok(ParkedInitiation {
            id: self.id,
            sender: Party::new(self.sender),
            message,
            reason: self.reason,
            parked_at,
        })
    }
}

fn sequence_column(sequence: u64) -> Result<i64> {
    i64::try_from(sequence).map_err(|err| AppError::Db(format!("sequence out of range: {err}")))
}

impl SqliteCheckpointStore {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn put_inner(&self, checkpoint: &FlowCheckpoint, expected_prior: Option<u64>) -> Result<()> {
        let body = serde_json::to_string(checkpoint)?;
        let sequence = sequence_column(checkpoint.sequence)?;
        let flow_id = checkpoint.flow_id.to_string();

        let result = match expected_prior {
            None => {
                sqlx::query(
                    "INSERT INTO flow_checkpoint
                     (flow_id, flow_type, status, sequence, continuation, body, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(flow_id) DO NOTHING",
                )
                .bind(&flow_id)
                .bind(checkpoint.flow_type.to_string())
                .bind(checkpoint.status.as_str())
                .bind(sequence)
                .bind(&checkpoint.continuation)
                .bind(&body)
                .bind(checkpoint.created_at.to_rfc3339())
                .bind(checkpoint.updated_at.to_rfc3339())
                .execute(self.db.as_ref())
                .await?
            }
            Some(prior) => {
                if checkpoint.sequence <= prior {
                    return Err(AppError::Db(format!(
                        "checkpoint sequence {} does not advance past {prior}",
                        checkpoint.sequence
                    )));
                }
                sqlx::query(
                    "UPDATE flow_checkpoint
                     SET status = ?1, sequence = ?2, continuation = ?3, body = ?4, updated_at = ?5
                     WHERE flow_id = ?6 AND sequence = ?7",
                )
                .bind(checkpoint.status.as_str())
                .bind(sequence)
                .bind(&checkpoint.continuation)
                .bind(&body)
                .bind(checkpoint.updated_at.to_rfc3339())
                .bind(&flow_id)
                .bind(sequence_column(prior)?)
                .execute(self.db.as_ref())
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(AppError::ConcurrentCheckpoint(format!(
                "flow {flow_id} expected prior sequence {expected_prior:?}"
            )));
        }
        Ok(())
    }

    async fn get_inner(&self, flow_id: FlowId) -> Result<Option<FlowCheckpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            "SELECT flow_id, status, sequence, continuation, body
             FROM flow_checkpoint WHERE flow_id = ?1",
        )
        .bind(flow_id.to_string())
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    async fn list_where(&self, sql: &str) -> Result<Vec<FlowCheckpoint>> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(sql).fetch_all(self.db.as_ref()).await?;
        rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
    }

    async fn delete_inner(&self, flow_id: FlowId) -> Result<()> {
        sqlx::query("DELETE FROM flow_checkpoint WHERE flow_id = ?1")
            .bind(flow_id.to_string())
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn purge_inner(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM flow_checkpoint
             WHERE status IN ('completed', 'failed') AND updated_at < ?1",
        )
        .bind(cutoff.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }

    async fn park_inner(&self, parked: &ParkedInitiation) -> Result<()> {
        sqlx::query(
            "INSERT INTO parked_initiation (id, sender, message, reason, parked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&parked.id)
        .bind(parked.sender.name())
        .bind(serde_json::to_string(&parked.message)?)
        .bind(&parked.reason)
        .bind(parked.parked_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    async fn list_parked_inner(&self) -> Result<Vec<ParkedInitiation>> {
        let rows: Vec<ParkedRow> = sqlx::query_as(
            "SELECT id, sender, message, reason, parked_at
             FROM parked_initiation ORDER BY parked_at ASC",
        )
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(ParkedRow::into_parked).collect()
    }

    async fn remove_parked_inner(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM parked_initiation WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn put<'a>(
        &'a self,
        checkpoint: &'a FlowCheckpoint,
        expected_prior: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.put_inner(checkpoint, expected_prior))
    }

    fn get(
        &self,
        flow_id: FlowId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<FlowCheckpoint>>> + Send + '_>> {
        Box::pin(self.get_inner(flow_id))
    }

    fn list_non_terminal(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FlowCheckpoint>>> + Send + '_>> {
        Box::pin(self.list_where(
            "SELECT flow_id, status, sequence, continuation, body
             FROM flow_checkpoint
             WHERE status NOT IN ('completed', 'failed')
             ORDER BY created_at ASC",
        ))
    }

    fn list_all(&self) -> Pin<Box<dyn Future<Output = Result<Vec<FlowCheckpoint>>> + Send + '_>> {
        Box::pin(self.list_where(
            "SELECT flow_id, status, sequence, continuation, body
             FROM flow_checkpoint ORDER BY updated_at DESC",
        ))
    }

    fn delete(&self, flow_id: FlowId) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.delete_inner(flow_id))
    }

    fn purge_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        Box::pin(self.purge_inner(cutoff))
    }

    fn park_initiation<'a>(
        &'a self,
        parked: &'a ParkedInitiation,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.park_inner(parked))
    }

    fn list_parked(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ParkedInitiation>>> + Send + '_>> {
        Box::pin(self.list_parked_inner())
    }

    fn remove_parked<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.remove_parked_inner(id))
    }
}
