//! State machine manager: the registry of live flows and the router that
//! delivers events to them.
//!
//! Each live flow is owned by one actor task (see [`super::actor`]). The
//! manager never touches a flow's state directly; it only creates actors,
//! sends them events, and answers inbound session initiations.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use super::actor::{self, ActorInit, FlowEvent};
use super::protocol::{self, Accepted};
use super::recent::RecentMap;
use crate::config::{NodeConfig, UnknownFlowPolicy};
use crate::errors::FlowException;
use crate::flow::registry::ResponderFactory;
use crate::flow::{boxed, Flow, FlowRegistry, InitiatedFlow};
use crate::models::checkpoint::{FlowCheckpoint, ParkedInitiation};
use crate::models::flow::{FlowDescriptor, FlowId, FlowOutcome, FlowStatus, InvocationContext};
use crate::models::message::{OutboundMessage, Payload, SessionMessage, SessionPayload};
use crate::models::session::{Party, SessionId};
use crate::persistence::CheckpointStore;
use crate::transport::Transport;
use crate::{AppError, Result};

/// In-memory handle on a flow that has not terminated.
pub(crate) struct LiveFlow {
    /// Mailbox of the resident actor; `None` when evicted or hospitalized.
    pub(crate) tx: Option<UnboundedSender<FlowEvent>>,
    pub(crate) status: FlowStatus,
}

type InitiationKey = (Party, SessionId);

/// Bookkeeping for inbound initiations, used to answer duplicates.
pub(crate) struct Initiations {
    /// Initiations served by a responder that has not terminated.
    accepted: HashMap<InitiationKey, (FlowId, SessionId)>,
    by_flow: HashMap<FlowId, Vec<InitiationKey>>,
    /// Initiations whose responder has terminated, most recent only.
    finished: RecentMap<InitiationKey, SessionId>,
    /// Rejections sent during this process lifetime, most recent only.
    rejected: RecentMap<InitiationKey, SessionMessage>,
    pub(crate) parked: HashSet<InitiationKey>,
}

impl Initiations {
    fn new(capacity: usize) -> Self {
        Self {
            accepted: HashMap::new(),
            by_flow: HashMap::new(),
            finished: RecentMap::new(capacity),
            rejected: RecentMap::new(capacity),
            parked: HashSet::new(),
        }
    }

    /// Record the responder session serving an initiation.
    pub(crate) fn accept(&mut self, key: InitiationKey, flow_id: FlowId, session_id: SessionId) {
        self.accepted.insert(key.clone(), (flow_id, session_id));
        self.by_flow.entry(flow_id).or_default().push(key);
    }

    /// Local session that answered `key`, whether its flow is live or not.
    fn answered(&self, key: &InitiationKey) -> Option<SessionId> {
        self.accepted
            .get(key)
            .map(|(_, session_id)| *session_id)
            .or_else(|| self.finished.get(key).copied())
    }

    /// Move a terminated responder's initiations to the bounded cache.
    fn retire(&mut self, flow_id: FlowId) {
        for key in self.by_flow.remove(&flow_id).unwrap_or_default() {
            if let Some((_, session_id)) = self.accepted.remove(&key) {
                self.finished.insert(key, session_id);
            }
        }
    }
}

/// State shared between the manager, the actors and recovery.
pub(crate) struct Shared {
    pub(crate) identity: Party,
    pub(crate) config: NodeConfig,
    pub(crate) store: Arc<dyn CheckpointStore>,
    transport: Arc<dyn Transport>,
    pub(crate) registry: Arc<FlowRegistry>,
    pub(crate) live: Mutex<HashMap<FlowId, LiveFlow>>,
    routes: Mutex<HashMap<SessionId, FlowId>>,
    outcomes: Mutex<HashMap<FlowId, watch::Sender<Option<FlowOutcome>>>>,
    /// Outcomes of recently terminated flows.
    finished: Mutex<RecentMap<FlowId, FlowOutcome>>,
    pub(crate) initiations: Mutex<Initiations>,
    /// Held while a flow enters or leaves the hospital, and while inbound
    /// messages are routed. Taken before `live`.
    hospital: Mutex<()>,
    pub(crate) workers: Semaphore,
    pub(crate) shutdown: CancellationToken,
    tracker: TaskTracker,
    duplicates_dropped: AtomicU64,
}

impl Shared {
    /// Track a flow and give it an outcome channel.
    pub(crate) async fn register(&self, flow_id: FlowId, status: FlowStatus, tx: Option<UnboundedSender<FlowEvent>>) {
        self.live.lock().await.insert(flow_id, LiveFlow { tx, status });
        self.track_outcome(flow_id).await;
    }

    /// Create, or reset, the outcome channel of a flow.
    async fn track_outcome(&self, flow_id: FlowId) {
        self.outcomes
            .lock()
            .await
            .entry(flow_id)
            .and_modify(|sender| {
                sender.send_replace(None);
            })
            .or_insert_with(|| watch::channel(None).0);
    }

    pub(crate) async fn set_status(&self, flow_id: FlowId, status: FlowStatus) {
        if let Some(entry) = self.live.lock().await.get_mut(&flow_id) {
            entry.status = status;
        }
    }

    pub(crate) async fn add_routes(&self, flow_id: FlowId, session_ids: impl IntoIterator<Item = SessionId>) {
        let mut routes = self.routes.lock().await;
        for session_id in session_ids {
            routes.insert(session_id, flow_id);
        }
    }

    async fn remove_routes(&self, session_ids: impl IntoIterator<Item = SessionId>) {
        let mut routes = self.routes.lock().await;
        for session_id in session_ids {
            routes.remove(&session_id);
        }
    }

    async fn publish(&self, flow_id: FlowId, outcome: Option<FlowOutcome>) {
        let mut outcomes = self.outcomes.lock().await;
        let sender = outcomes
            .entry(flow_id)
            .or_insert_with(|| watch::channel(None).0);
        sender.send_replace(outcome);
    }

    /// Forget a terminated flow and publish its outcome.
    pub(crate) async fn finish(&self, flow_id: FlowId, outcome: FlowOutcome, session_ids: Vec<SessionId>) {
        self.live.lock().await.remove(&flow_id);
        self.remove_routes(session_ids).await;
        self.initiations.lock().await.retire(flow_id);
        self.finished.lock().await.insert(flow_id, outcome.clone());
        if let Some(sender) = self.outcomes.lock().await.remove(&flow_id) {
            sender.send_replace(Some(outcome));
        }
    }

    async fn finished_outcome(&self, flow_id: FlowId) -> Option<FlowOutcome> {
        self.finished.lock().await.get(&flow_id).cloned()
    }

    /// Park a flow in the hospital: registered, not resident.
    pub(crate) async fn mark_hospitalized(&self, flow_id: FlowId, reason: &str) {
        {
            let mut live = self.live.lock().await;
            let entry = live.entry(flow_id).or_insert(LiveFlow {
                tx: None,
                status: FlowStatus::Hospitalized,
            });
            entry.tx = None;
            entry.status = FlowStatus::Hospitalized;
        }
        let outcome = FlowOutcome::Hospitalized {
            reason: reason.to_owned(),
        };
        self.publish(flow_id, Some(outcome)).await;
    }

    /// Hospitalize a flow whose actor is stopping. Session messages still
    /// queued for the actor are kept in the stored checkpoint; other events
    /// are dropped.
    pub(crate) async fn admit_to_hospital(
        &self,
        flow_id: FlowId,
        reason: &str,
        mut queued: VecDeque<FlowEvent>,
        mailbox: Option<&mut UnboundedReceiver<FlowEvent>>,
    ) {
        let _ward = self.hospital.lock().await;
        self.mark_hospitalized(flow_id, reason).await;
        if let Some(mailbox) = mailbox {
            while let Ok(event) = mailbox.try_recv() {
                queued.push_back(event);
            }
        }
        for event in queued {
            match event {
                FlowEvent::Inbound(message) => self.hold_inbound(flow_id, message).await,
                other => debug!(%flow_id, event = ?other, "event for hospitalized flow dropped"),
            }
        }
    }

    /// Apply a session message to a hospitalized flow's stored checkpoint
    /// so that it is there when the flow is retried.
    async fn hold_inbound(&self, flow_id: FlowId, message: SessionMessage) {
        let sequence = message.sequence;
        if let Err(err) = self.store_inbound(flow_id, message).await {
            warn!(%flow_id, sequence, %err, "message for hospitalized flow not kept");
        }
    }

    async fn store_inbound(&self, flow_id: FlowId, message: SessionMessage) -> Result<()> {
        let mut checkpoint = self
            .store
            .get(flow_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("flow {flow_id} has no checkpoint")))?;
        let session_id = message.recipient_session_id;
        let sequence = message.sequence;

        match protocol::accept_inbound(&self.identity, &mut checkpoint.sessions, message) {
            Accepted::Applied { produced, .. } => checkpoint.outbox.extend(produced),
            Accepted::Duplicate => {
                self.note_duplicate();
                return Ok(());
            }
            Accepted::OutOfOrder | Accepted::UnknownSession => {
                debug!(%flow_id, ?session_id, sequence, "message for hospitalized flow dropped");
                return Ok(());
            }
        }

        let prior = checkpoint.sequence;
        checkpoint.sequence = prior + 1;
        checkpoint.updated_at = Utc::now();
        self.store.put(&checkpoint, Some(prior)).await?;
        debug!(%flow_id, ?session_id, sequence, "message kept for hospitalized flow");
        Ok(())
    }

    /// Hand a session message to its flow, or keep it in the checkpoint if
    /// the flow is hospitalized.
    async fn route_inbound(self: &Arc<Self>, flow_id: FlowId, message: SessionMessage) -> Result<()> {
        let _ward = self.hospital.lock().await;
        let hospitalized = self
            .live
            .lock()
            .await
            .get(&flow_id)
            .is_some_and(|entry| entry.status == FlowStatus::Hospitalized);
        if hospitalized {
            self.hold_inbound(flow_id, message).await;
            return Ok(());
        }
        self.deliver(flow_id, FlowEvent::Inbound(message)).await
    }

    pub(crate) fn note_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Hand messages to the transport in order, retrying each with bounded
    /// backoff.
    ///
    /// # Errors
    ///
    /// Returns the last `AppError::Transport` once retries are exhausted,
    /// or `AppError::Shutdown` if the node stops while backing off.
    pub(crate) async fn dispatch(&self, messages: &[OutboundMessage]) -> Result<()> {
        for outbound in messages {
            self.send_with_retry(outbound).await?;
        }
        Ok(())
    }

    async fn send_with_retry(&self, outbound: &OutboundMessage) -> Result<()> {
        let retry = &self.config.retry;
        let message = &outbound.message;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .transport
                .send(&outbound.destination, message.clone())
                .await
            {
                Ok(()) => {
                    debug!(
                        party = %outbound.destination,
                        session_id = ?message.sender_session_id,
                        sequence = message.sequence,
                        kind = message.payload.kind(),
                        "message dispatched"
                    );
                    return Ok(());
                }
                Err(err) if attempt >= retry.max_attempts => return Err(err),
                Err(err) => {
                    warn!(party = %outbound.destination, %err, attempt, "dispatch failed, backing off");
                    tokio::select! {
                        () = self.shutdown.cancelled() => {
                            return Err(AppError::Shutdown("node stopping".into()));
                        }
                        () = tokio::time::sleep(retry.backoff(attempt)) => {}
                    }
                }
            }
        }
    }

    /// Start an actor task for `flow_id`.
    pub(crate) fn spawn_actor(self: &Arc<Self>, flow_id: FlowId, init: ActorInit, mailbox: UnboundedReceiver<FlowEvent>) {
        let shared = Arc::clone(self);
        self.tracker.spawn(
            actor::run(shared, flow_id, init, mailbox).instrument(info_span!("flow", %flow_id)),
        );
    }

    /// Deliver an event to a flow, reloading it from its checkpoint when
    /// it is not resident.
    pub(crate) async fn deliver(self: &Arc<Self>, flow_id: FlowId, event: FlowEvent) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(AppError::Shutdown("node stopping".into()));
        }

        let mut live = self.live.lock().await;
        let entry = live
            .get_mut(&flow_id)
            .ok_or_else(|| AppError::NotFound(format!("flow {flow_id} is not live")))?;
        if entry.status == FlowStatus::Hospitalized {
            return Err(AppError::Hospitalization(format!(
                "flow {flow_id} is hospitalized"
            )));
        }

        let event = match &entry.tx {
            Some(tx) => match tx.send(event) {
                Ok(()) => return Ok(()),
                Err(returned) => returned.0,
            },
            None => event,
        };

        debug!(%flow_id, "flow not resident, reloading from checkpoint");
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(FlowEvent::Recover { resend: false });
        let _ = tx.send(event);
        entry.tx = Some(tx);
        drop(live);

        self.spawn_actor(flow_id, ActorInit::Load, rx);
        Ok(())
    }

    async fn send_direct(&self, destination: &Party, message: SessionMessage) {
        let outbound = OutboundMessage {
            destination: destination.clone(),
            message,
        };
        if let Err(err) = self.dispatch(std::slice::from_ref(&outbound)).await {
            warn!(party = %destination, %err, "protocol reply not delivered");
        }
    }

    /// Answer an inbound session initiation.
    async fn on_initiate(
        self: &Arc<Self>,
        message: SessionMessage,
        flow_type: FlowDescriptor,
        first_payload: Option<Payload>,
    ) {
        let Some(peer_session_id) = message.sender_session_id else {
            warn!(party = %message.sender, "initiation without sender session id dropped");
            return;
        };
        let key = (message.sender.clone(), peer_session_id);
        let mut initiations = self.initiations.lock().await;

        if let Some(local_session_id) = initiations.answered(&key) {
            self.note_duplicate();
            debug!(session_id = %local_session_id, party = %message.sender, "duplicate initiation, confirming again");
            let confirm = protocol::confirm_message(&self.identity, local_session_id, &message);
            drop(initiations);
            self.send_direct(&message.sender, confirm).await;
            return;
        }

        if let Some(reject) = initiations.rejected.get(&key).cloned() {
            self.note_duplicate();
            debug!(party = %message.sender, %flow_type, "duplicate initiation, rejecting again");
            drop(initiations);
            self.send_direct(&message.sender, reject).await;
            return;
        }

        if initiations.parked.contains(&key) {
            self.note_duplicate();
            debug!(party = %message.sender, %flow_type, "duplicate of parked initiation ignored");
            return;
        }

        if !self.config.sessions.permits(&message.sender) {
            warn!(party = %message.sender, %flow_type, "initiation from unpermitted counterparty rejected");
            let reject = protocol::reject_message(&self.identity, &message, flow_type, protocol::NOT_PERMITTED_REASON);
            initiations.rejected.insert(key, reject.clone());
            drop(initiations);
            self.send_direct(&message.sender, reject).await;
            return;
        }

        match self.registry.resolve(&flow_type).await {
            Ok(responder) => {
                let (flow_id, session_id) = self
                    .start_responder(&message, peer_session_id, flow_type, first_payload, responder)
                    .await;
                initiations.accept(key, flow_id, session_id);
            }
            Err(err) => match self.config.sessions.unknown_flow_policy {
                UnknownFlowPolicy::Reject => {
                    warn!(party = %message.sender, %flow_type, %err, "initiation for unknown flow rejected");
                    let reject = protocol::reject_message(&self.identity, &message, flow_type, protocol::UNKNOWN_FLOW_REASON);
                    initiations.rejected.insert(key, reject.clone());
                    drop(initiations);
                    self.send_direct(&message.sender, reject).await;
                }
                UnknownFlowPolicy::Park => {
                    let parked = ParkedInitiation::new(message, err.to_string());
                    match self.store.park_initiation(&parked).await {
                        Ok(()) => {
                            info!(party = %parked.sender, %flow_type, parked_id = %parked.id, "initiation for unknown flow parked");
                            initiations.parked.insert(key);
                        }
                        Err(store_err) => {
                            warn!(party = %parked.sender, %flow_type, %store_err, "failed to park initiation");
                        }
                    }
                }
            },
        }
    }

    /// Create and schedule the responder for an accepted initiation.
    pub(crate) async fn start_responder(
        self: &Arc<Self>,
        initiation: &SessionMessage,
        peer_session_id: SessionId,
        initiating: FlowDescriptor,
        first_payload: Option<Payload>,
        (responder_type, factory): (FlowDescriptor, ResponderFactory),
    ) -> (FlowId, SessionId) {
        let flow_id = FlowId::new();
        let context = InvocationContext::Peer {
            party: initiation.sender.name().to_owned(),
        };
        let mut checkpoint = FlowCheckpoint::new(flow_id, responder_type, context);
        let local_session_id = checkpoint.sessions.allocate_id(flow_id);
        let (session, confirm) = protocol::accept_initiation(
            &self.identity,
            local_session_id,
            initiation,
            peer_session_id,
            initiating,
            first_payload,
        );
        checkpoint.sessions.insert(session);
        checkpoint.outbox.push(confirm);

        let logic = factory(local_session_id, initiation.sender.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(FlowEvent::Start);
        self.register(flow_id, FlowStatus::Created, Some(tx)).await;
        self.add_routes(flow_id, [local_session_id]).await;

        info!(%flow_id, flow_type = %checkpoint.flow_type, party = %initiation.sender, session_id = %local_session_id, "responder flow started");
        self.spawn_actor(
            flow_id,
            ActorInit::Ready {
                logic,
                checkpoint: Box::new(checkpoint),
                persisted: None,
            },
            rx,
        );
        (flow_id, local_session_id)
    }
}

/// Public face of the scheduler.
///
/// Cheap to clone; all clones drive the same set of flows.
#[derive(Clone)]
pub struct StateMachineManager {
    pub(crate) shared: Arc<Shared>,
}

impl StateMachineManager {
    pub(crate) fn new(
        config: NodeConfig,
        store: Arc<dyn CheckpointStore>,
        transport: Arc<dyn Transport>,
        registry: Arc<FlowRegistry>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        let workers = Semaphore::new(config.scheduler.worker_pool_size);
        let finished = RecentMap::new(config.scheduler.finished_flow_cache);
        let initiations = Initiations::new(config.sessions.initiation_cache);
        Self {
            shared: Arc::new(Shared {
                identity: config.party(),
                config,
                store,
                transport,
                registry,
                live: Mutex::new(HashMap::new()),
                routes: Mutex::new(HashMap::new()),
                outcomes: Mutex::new(HashMap::new()),
                finished: Mutex::new(finished),
                initiations: Mutex::new(initiations),
                hospital: Mutex::new(()),
                workers,
                shutdown,
                tracker,
                duplicates_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// This node's identity.
    #[must_use]
    pub fn identity(&self) -> &Party {
        &self.shared.identity
    }

    /// The flow type registry backing this manager.
    #[must_use]
    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.shared.registry
    }

    /// Start a new flow and schedule its first step.
    ///
    /// # Errors
    ///
    /// Returns `AppError::FlowStart` if the flow type is invalid or not
    /// registered, or if the in-flight limit is reached.
    pub async fn start_flow<F: Flow>(&self, flow: F, context: InvocationContext) -> Result<FlowId> {
        let descriptor = F::descriptor();
        if !descriptor.is_valid() {
            return Err(AppError::FlowStart(format!("invalid flow type {descriptor:?}")));
        }
        if !self.shared.registry.is_registered(&descriptor).await {
            return Err(AppError::FlowStart(format!(
                "flow type {descriptor} is not registered and could not be restored"
            )));
        }
        if self.shared.shutdown.is_cancelled() {
            return Err(AppError::Shutdown("node stopping".into()));
        }

        let flow_id = FlowId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(FlowEvent::Start);
        {
            let max = self.shared.config.scheduler.max_in_flight_flows;
            let mut live = self.shared.live.lock().await;
            if live.len() >= max {
                warn!(flow_type = %descriptor, max, "flow start refused, in-flight limit reached");
                return Err(AppError::FlowStart(format!(
                    "in-flight limit of {max} flows reached"
                )));
            }
            live.insert(
                flow_id,
                LiveFlow {
                    tx: Some(tx),
                    status: FlowStatus::Created,
                },
            );
        }
        self.shared.track_outcome(flow_id).await;

        info!(%flow_id, flow_type = %descriptor, "flow started");
        let checkpoint = FlowCheckpoint::new(flow_id, descriptor, context);
        self.shared.spawn_actor(
            flow_id,
            ActorInit::Ready {
                logic: boxed(flow),
                checkpoint: Box::new(checkpoint),
                persisted: None,
            },
            rx,
        );
        Ok(flow_id)
    }

    /// Install a responder for sessions initiated by `initiating`.
    pub async fn register_initiated_flow_handler<R: InitiatedFlow>(&self, initiating: FlowDescriptor) {
        self.shared
            .registry
            .register_initiated_flow_handler::<R>(initiating)
            .await;
    }

    /// All registered flow descriptors.
    pub async fn registered_flows(&self) -> Vec<FlowDescriptor> {
        self.shared.registry.registered_flows().await
    }

    /// Current status of a flow.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the flow is unknown to this node.
    pub async fn get_flow_status(&self, flow_id: FlowId) -> Result<FlowStatus> {
        if let Some(entry) = self.shared.live.lock().await.get(&flow_id) {
            return Ok(entry.status);
        }
        if let Some(outcome) = self.shared.finished_outcome(flow_id).await {
            return Ok(outcome.status());
        }
        let published = self
            .shared
            .outcomes
            .lock()
            .await
            .get(&flow_id)
            .and_then(|sender| sender.borrow().as_ref().map(FlowOutcome::status));
        if let Some(status) = published {
            return Ok(status);
        }
        self.shared
            .store
            .get(flow_id)
            .await?
            .map(|checkpoint| checkpoint.status)
            .ok_or_else(|| AppError::NotFound(format!("flow {flow_id} not found")))
    }

    /// Wait until the flow completes, fails or is hospitalized.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the flow is unknown and
    /// `AppError::Shutdown` if the node stops first.
    pub async fn wait_for_outcome(&self, flow_id: FlowId) -> Result<FlowOutcome> {
        let receiver = self
            .shared
            .outcomes
            .lock()
            .await
            .get(&flow_id)
            .map(watch::Sender::subscribe);

        if let Some(mut receiver) = receiver {
            let outcome = receiver
                .wait_for(Option::is_some)
                .await
                .map_err(|_| AppError::Shutdown("outcome channel closed".into()))?;
            return outcome
                .clone()
                .ok_or_else(|| AppError::NotFound(format!("flow {flow_id} has no outcome")));
        }
        if let Some(outcome) = self.shared.finished_outcome(flow_id).await {
            return Ok(outcome);
        }

        self.shared
            .store
            .get(flow_id)
            .await?
            .and_then(|checkpoint| checkpoint.outcome)
            .ok_or_else(|| AppError::NotFound(format!("flow {flow_id} not found")))
    }

    /// Cancel a flow at its next suspend point. A hospitalized flow is
    /// failed immediately.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the flow is not live.
    pub async fn kill_flow(&self, flow_id: FlowId) -> Result<()> {
        let ward = self.shared.hospital.lock().await;
        let hospitalized = {
            let mut live = self.shared.live.lock().await;
            let entry = live
                .get(&flow_id)
                .ok_or_else(|| AppError::NotFound(format!("flow {flow_id} is not live")))?;
            if entry.status == FlowStatus::Hospitalized {
                live.remove(&flow_id);
                true
            } else {
                false
            }
        };

        if !hospitalized {
            drop(ward);
            info!(%flow_id, "kill requested");
            return self.shared.deliver(flow_id, FlowEvent::Cancel).await;
        }

        let error = FlowException::Cancelled;
        let mut session_ids = Vec::new();
        if let Some(mut checkpoint) = self.shared.store.get(flow_id).await? {
            let prior = checkpoint.sequence;
            let mut outbox = Vec::new();
            protocol::error_sessions(&self.shared.identity, &mut checkpoint.sessions, &error.to_string(), &mut outbox);
            checkpoint.status = FlowStatus::Failed;
            checkpoint.outcome = Some(FlowOutcome::Failed {
                error: error.clone(),
            });
            checkpoint.pending_request = None;
            checkpoint.outbox.clone_from(&outbox);
            checkpoint.sequence = prior + 1;
            checkpoint.updated_at = Utc::now();
            self.shared.store.put(&checkpoint, Some(prior)).await?;

            if let Err(err) = self.shared.dispatch(&outbox).await {
                warn!(%flow_id, %err, "session errors for killed flow not delivered");
            }
            if !self.shared.config.scheduler.retain_terminal_checkpoints {
                self.shared.store.delete(flow_id).await?;
            }
            session_ids = checkpoint.sessions.ids();
        }

        info!(%flow_id, "hospitalized flow killed");
        self.shared
            .finish(flow_id, FlowOutcome::Failed { error }, session_ids)
            .await;
        drop(ward);
        Ok(())
    }

    /// Deliver an external signal to a flow.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the flow is not live and
    /// `AppError::Hospitalization` if it is hospitalized.
    pub async fn signal_external_event(
        &self,
        flow_id: FlowId,
        event_key: impl Into<String>,
        payload: Payload,
    ) -> Result<()> {
        let key = event_key.into();
        debug!(%flow_id, event_key = %key, "external event signalled");
        self.shared
            .deliver(flow_id, FlowEvent::ExternalEvent { key, payload })
            .await
    }

    /// Reload a flow from its last checkpoint and resume it as though the
    /// node had restarted, re-issuing its pending outbound messages.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the flow is not live.
    pub async fn retry_from_last_checkpoint(&self, flow_id: FlowId) -> Result<()> {
        let mut live = self.shared.live.lock().await;
        let entry = live
            .get_mut(&flow_id)
            .ok_or_else(|| AppError::NotFound(format!("flow {flow_id} is not live")))?;
        if entry.status == FlowStatus::Hospitalized {
            drop(live);
            return self.retry_flow(flow_id).await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(FlowEvent::Recover { resend: true });
        entry.tx = Some(tx);
        drop(live);

        info!(%flow_id, "flow reloading from last checkpoint");
        self.shared.spawn_actor(flow_id, ActorInit::Load, rx);
        Ok(())
    }

    /// Discharge a hospitalized flow and resume it from its checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no hospitalized flow has this id or
    /// its checkpoint is missing, and `AppError::Db` if the store fails.
    pub async fn retry_flow(&self, flow_id: FlowId) -> Result<()> {
        let _ward = self.shared.hospital.lock().await;
        let hospitalized = self
            .shared
            .live
            .lock()
            .await
            .get(&flow_id)
            .is_some_and(|entry| entry.status == FlowStatus::Hospitalized);
        if !hospitalized {
            return Err(AppError::NotFound(format!("no hospitalized flow {flow_id}")));
        }

        let mut checkpoint = self
            .shared
            .store
            .get(flow_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("flow {flow_id} has no checkpoint")))?;
        if checkpoint.status == FlowStatus::Hospitalized {
            let prior = checkpoint.sequence;
            checkpoint.status = FlowStatus::Suspended;
            checkpoint.outcome = None;
            checkpoint.sequence = prior + 1;
            checkpoint.updated_at = Utc::now();
            self.shared.store.put(&checkpoint, Some(prior)).await?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(FlowEvent::Recover { resend: true });
        self.shared
            .register(flow_id, FlowStatus::Suspended, Some(tx))
            .await;

        info!(%flow_id, "hospitalized flow discharged for retry");
        self.shared.spawn_actor(flow_id, ActorInit::Load, rx);
        Ok(())
    }

    /// Route one inbound message from the transport.
    pub async fn handle_inbound(&self, message: SessionMessage) {
        let span = info_span!("inbound", party = %message.sender, sequence = message.sequence, kind = message.payload.kind());
        async {
            if let SessionPayload::Initiate {
                flow_type,
                first_payload,
            } = &message.payload
            {
                let (flow_type, first_payload) = (flow_type.clone(), first_payload.clone());
                self.shared.on_initiate(message, flow_type, first_payload).await;
                return;
            }

            let Some(recipient) = message.recipient_session_id else {
                warn!("message without recipient session dropped");
                return;
            };
            let flow_id = self.shared.routes.lock().await.get(&recipient).copied();
            let Some(flow_id) = flow_id else {
                debug!(session_id = %recipient, "message for unknown session dropped");
                return;
            };
            if let Err(err) = self.shared.route_inbound(flow_id, message).await {
                debug!(%flow_id, %err, "inbound message not delivered");
            }
        }
        .instrument(span)
        .await;
    }

    /// Number of flows that have not terminated, hospitalized included.
    pub async fn live_flow_count(&self) -> usize {
        self.shared.live.lock().await.len()
    }

    /// Number of live flows that currently have an actor task.
    pub async fn resident_flow_count(&self) -> usize {
        self.shared
            .live
            .lock()
            .await
            .values()
            .filter(|entry| entry.tx.is_some())
            .count()
    }

    /// Inbound messages and initiations discarded as duplicates.
    #[must_use]
    pub fn duplicates_dropped(&self) -> u64 {
        self.shared.duplicates_dropped.load(Ordering::Relaxed)
    }
}
