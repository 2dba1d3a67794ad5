//! A running node: scheduler, recovery, inbound receive loop and the
//! retention task wired together.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, Instrument};

use crate::config::NodeConfig;
use crate::flow::FlowRegistry;
use crate::models::message::SessionMessage;
use crate::persistence::retention;
use crate::persistence::CheckpointStore;
use crate::statemachine::{recover, RecoveryReport, StateMachineManager};
use crate::transport::Transport;
use crate::Result;

/// Handle on a started node.
pub struct FlowNode {
    manager: StateMachineManager,
    report: RecoveryReport,
    cancel: CancellationToken,
    tracker: TaskTracker,
    receiver: JoinHandle<()>,
    retention: JoinHandle<()>,
}

impl FlowNode {
    /// Start a node: recover stored flows, then begin consuming `inbound`.
    ///
    /// Inbound messages that arrive while recovery runs stay queued in the
    /// channel until it finishes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if recovery cannot read the store.
    pub async fn start(
        config: NodeConfig,
        store: Arc<dyn CheckpointStore>,
        transport: Arc<dyn Transport>,
        inbound: UnboundedReceiver<SessionMessage>,
        registry: Arc<FlowRegistry>,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let retention_days = config.retention_days;
        let node_name = config.node_name.clone();

        let manager = StateMachineManager::new(
            config,
            Arc::clone(&store),
            transport,
            registry,
            cancel.clone(),
            tracker.clone(),
        );

        let report = recover(&manager).await?;

        let receiver = tokio::spawn(
            receive_loop(manager.clone(), inbound, cancel.clone())
                .instrument(info_span!("receiver", node = %node_name)),
        );
        let retention = retention::spawn_retention_task(store, retention_days, cancel.clone());

        info!(node = %node_name, "flow node started");
        Ok(Self {
            manager,
            report,
            cancel,
            tracker,
            receiver,
            retention,
        })
    }

    /// The node's scheduler.
    #[must_use]
    pub fn manager(&self) -> &StateMachineManager {
        &self.manager
    }

    /// What start-up recovery did.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    /// Stop every task. No state is rewritten, so the store looks exactly
    /// as it would after a crash and a new node over it recovers.
    pub async fn shutdown(self) {
        info!(node = %self.manager.identity(), "flow node stopping");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        let _ = tokio::join!(self.receiver, self.retention);
        info!(node = %self.manager.identity(), "flow node stopped");
    }
}

async fn receive_loop(
    manager: StateMachineManager,
    mut inbound: UnboundedReceiver<SessionMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("receive loop: cancellation received, stopping");
                break;
            }

            message = inbound.recv() => match message {
                Some(message) => manager.handle_inbound(message).await,
                None => {
                    debug!("receive loop: inbound channel closed, stopping");
                    break;
                }
            },
        }
    }
}
