//! Start-up recovery: rebuild the in-memory scheduler from the checkpoint
//! store before the node accepts traffic.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};

use super::actor::{hospitalize_checkpoint, ActorInit, FlowEvent};
use super::manager::{Shared, StateMachineManager};
use crate::models::flow::FlowStatus;
use crate::models::message::SessionPayload;
use crate::Result;

/// What recovery did with the stored state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Flows scheduled again from their last checkpoint.
    pub resumed: usize,
    /// Flows newly hospitalized because they could not be restored.
    pub hospitalized: usize,
    /// Flows that were already hospitalized and stay there.
    pub retained_in_hospital: usize,
    /// Parked initiations that now resolve and were started.
    pub initiations_replayed: usize,
    /// Parked initiations that still do not resolve.
    pub initiations_parked: usize,
}

/// Restore every non-terminal flow and re-evaluate parked initiations.
///
/// Restored flows re-send their checkpoint outbox and any unconfirmed
/// session initiations; the counterparty discards what it already saw.
///
/// # Errors
///
/// Returns `AppError::Db` if the store cannot be listed. Individual flows
/// that fail to restore are hospitalized instead.
pub async fn recover(manager: &StateMachineManager) -> Result<RecoveryReport> {
    let span = info_span!("recovery", node = %manager.identity());
    restore(Arc::clone(&manager.shared)).instrument(span).await
}

async fn restore(shared: Arc<Shared>) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let checkpoints = shared.store.list_non_terminal().await?;
    info!(count = checkpoints.len(), "restoring flows from checkpoints");

    for checkpoint in checkpoints {
        let flow_id = checkpoint.flow_id;
        shared.add_routes(flow_id, checkpoint.sessions.ids()).await;
        {
            let mut initiations = shared.initiations.lock().await;
            for session in checkpoint.sessions.initiated() {
                if let Some(peer) = session.peer_session_id {
                    initiations.accept((session.counterparty.clone(), peer), flow_id, session.session_id);
                }
            }
        }

        if checkpoint.status == FlowStatus::Hospitalized {
            let reason = checkpoint
                .hospital_reason()
                .unwrap_or("hospitalized before restart")
                .to_owned();
            info!(%flow_id, %reason, "flow stays in hospital");
            shared.mark_hospitalized(flow_id, &reason).await;
            report.retained_in_hospital += 1;
            continue;
        }

        let restored = shared
            .registry
            .restore(&checkpoint.flow_type, &checkpoint.continuation)
            .await;
        let logic = match restored {
            Ok(logic) => logic,
            Err(err) => {
                let reason = format!("cannot restore flow type {}: {err}", checkpoint.flow_type);
                hospitalize_checkpoint(&shared, checkpoint, &reason, None).await;
                report.hospitalized += 1;
                continue;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(FlowEvent::Recover { resend: true });
        shared.register(flow_id, FlowStatus::Suspended, Some(tx)).await;
        let persisted = Some(checkpoint.sequence);
        shared.spawn_actor(
            flow_id,
            ActorInit::Ready {
                logic,
                checkpoint: Box::new(checkpoint),
                persisted,
            },
            rx,
        );
        report.resumed += 1;
    }

    for parked in shared.store.list_parked().await? {
        let message = &parked.message;
        let (SessionPayload::Initiate { flow_type, first_payload }, Some(peer_session_id)) =
            (&message.payload, message.sender_session_id)
        else {
            warn!(parked_id = %parked.id, "parked record is not an initiation, discarding");
            shared.store.remove_parked(&parked.id).await?;
            continue;
        };
        let key = (parked.sender.clone(), peer_session_id);

        match shared.registry.resolve(flow_type).await {
            Ok(responder) => {
                let (flow_id, session_id) = shared
                    .start_responder(message, peer_session_id, flow_type.clone(), first_payload.clone(), responder)
                    .await;
                shared.store.remove_parked(&parked.id).await?;
                shared.initiations.lock().await.accept(key, flow_id, session_id);
                info!(parked_id = %parked.id, %flow_id, %flow_type, "parked initiation replayed");
                report.initiations_replayed += 1;
            }
            Err(_) => {
                shared.initiations.lock().await.parked.insert(key);
                report.initiations_parked += 1;
            }
        }
    }

    info!(
        resumed = report.resumed,
        hospitalized = report.hospitalized,
        retained_in_hospital = report.retained_in_hospital,
        initiations_replayed = report.initiations_replayed,
        initiations_parked = report.initiations_parked,
        "recovery complete"
    );
    Ok(report)
}
