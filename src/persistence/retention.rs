//! Retention service for archived terminal checkpoints.
//!
//! Runs as a background task deleting completed and failed checkpoints
//! whose last write is older than `retention_days`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::CheckpointStore;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
///
/// The task runs hourly, starting immediately.
#[must_use]
pub fn spawn_retention_task(
    store: Arc<dyn CheckpointStore>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(store.as_ref(), retention_days).await {
                        error!(%err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Delete terminal checkpoints older than `retention_days`.
///
/// # Errors
///
/// Returns `AppError::Db` if the delete fails.
pub async fn purge(store: &dyn CheckpointStore, retention_days: u32) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let purged = store.purge_terminal_before(cutoff).await?;
    info!(retention_days, purged, "retention purge completed");
    Ok(purged)
}
