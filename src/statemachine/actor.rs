//! Per-flow actor.
//!
//! Every live flow is driven by exactly one tokio task that owns its
//! continuation, session table and checkpoint state. All events for the
//! flow arrive through the actor's mailbox, so checkpoint writes for one
//! flow are strictly serialized and the session table is only ever
//! mutated here.
//!
//! The suspension protocol is: run a step, record the yielded request and
//! the messages it produces, write checkpoint `n + 1` with a
//! compare-and-swap on `n`, and only then hand the messages to the
//! transport.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use super::manager::Shared;
use super::protocol::{self, Accepted};
use crate::errors::FlowException;
use crate::flow::executor::{self, StepOutcome};
use crate::flow::{FlowContext, FlowLogic};
use crate::models::checkpoint::FlowCheckpoint;
use crate::models::flow::{FlowId, FlowOutcome, FlowStatus};
use crate::models::io_request::{FlowIORequest, Resume};
use crate::models::message::{OutboundMessage, Payload, SessionMessage};
use crate::models::session::{FlowSession, InboundItem, SessionId, SessionState};
use crate::{AppError, Result};

/// Events a flow actor reacts to.
#[derive(Debug, Clone)]
pub(crate) enum FlowEvent {
    /// First execution of a new flow.
    Start,
    /// Re-enter a flow loaded from its checkpoint; `resend` re-dispatches
    /// the checkpoint outbox and unconfirmed initiations.
    Recover { resend: bool },
    /// A session message routed to this flow.
    Inbound(SessionMessage),
    /// An external signal.
    ExternalEvent { key: String, payload: Payload },
    /// The pending request's deadline passed.
    TimerFired,
    /// The flow stayed suspended for the idle eviction period.
    IdleTimeout,
    /// Operator cancellation.
    Cancel,
}

/// How an actor comes into existence.
pub(crate) enum ActorInit {
    /// State already in memory: a new flow, or one decoded by recovery.
    Ready {
        logic: Box<dyn FlowLogic>,
        checkpoint: Box<FlowCheckpoint>,
        persisted: Option<u64>,
    },
    /// Load the latest checkpoint from the store first.
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Continue,
    Stop,
    Conflict,
}

struct FlowActor {
    shared: Arc<Shared>,
    flow_id: FlowId,
    logic: Box<dyn FlowLogic>,
    checkpoint: FlowCheckpoint,
    /// Sequence of the last checkpoint known to be stored.
    persisted: Option<u64>,
    /// In-memory state has changed since the last write.
    dirty: bool,
    conflicts: u32,
    mailbox: UnboundedReceiver<FlowEvent>,
    requeued: VecDeque<FlowEvent>,
}

/// Actor task body.
pub(crate) async fn run(shared: Arc<Shared>, flow_id: FlowId, init: ActorInit, mailbox: UnboundedReceiver<FlowEvent>) {
    let actor = match init {
        ActorInit::Ready {
            logic,
            checkpoint,
            persisted,
        } => FlowActor {
            shared,
            flow_id,
            logic,
            checkpoint: *checkpoint,
            persisted,
            dirty: false,
            conflicts: 0,
            mailbox,
            requeued: VecDeque::new(),
        },
        ActorInit::Load => match FlowActor::load(shared, flow_id, mailbox).await {
            Some(actor) => actor,
            None => return,
        },
    };
    actor.event_loop().await;
}

/// Write a hospitalized checkpoint for a flow that has no running actor and
/// mark it hospitalized in memory. Session messages waiting in `mailbox`
/// are kept in the checkpoint.
pub(crate) async fn hospitalize_checkpoint(
    shared: &Shared,
    mut checkpoint: FlowCheckpoint,
    reason: &str,
    mailbox: Option<&mut UnboundedReceiver<FlowEvent>>,
) {
    let flow_id = checkpoint.flow_id;
    error!(%flow_id, reason, "flow hospitalized");
    if checkpoint.status != FlowStatus::Hospitalized {
        let prior = checkpoint.sequence;
        checkpoint.status = FlowStatus::Hospitalized;
        checkpoint.outcome = Some(FlowOutcome::Hospitalized {
            reason: reason.to_owned(),
        });
        checkpoint.sequence = prior + 1;
        checkpoint.updated_at = Utc::now();
        if let Err(err) = shared.store.put(&checkpoint, Some(prior)).await {
            error!(%flow_id, %err, "hospitalization checkpoint not written");
        }
    }
    shared
        .admit_to_hospital(flow_id, reason, VecDeque::new(), mailbox)
        .await;
}

/// Pass through a stored checkpoint that can be resumed. A terminal one
/// finishes the flow with its stored outcome and a hospitalized one parks
/// it, consuming `queued` and `mailbox`.
async fn resumable(
    shared: &Shared,
    checkpoint: FlowCheckpoint,
    queued: VecDeque<FlowEvent>,
    mailbox: &mut UnboundedReceiver<FlowEvent>,
) -> Option<FlowCheckpoint> {
    let flow_id = checkpoint.flow_id;
    if checkpoint.status.is_terminal() {
        warn!(%flow_id, status = %checkpoint.status, "stored flow already terminated, not resuming");
        let outcome = checkpoint.outcome.unwrap_or_else(|| FlowOutcome::Failed {
            error: FlowException::logic(format!("flow terminated as {} without an outcome", checkpoint.status)),
        });
        shared.finish(flow_id, outcome, checkpoint.sessions.ids()).await;
        return None;
    }
    if checkpoint.status == FlowStatus::Hospitalized {
        let reason = checkpoint
            .hospital_reason()
            .unwrap_or("hospitalized elsewhere")
            .to_owned();
        warn!(%flow_id, %reason, "stored flow is hospitalized, not resuming");
        shared
            .admit_to_hospital(flow_id, &reason, queued, Some(mailbox))
            .await;
        return None;
    }
    Some(checkpoint)
}

impl FlowActor {
    async fn load(shared: Arc<Shared>, flow_id: FlowId, mut mailbox: UnboundedReceiver<FlowEvent>) -> Option<Self> {
        let checkpoint = match shared.store.get(flow_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => {
                error!(%flow_id, "checkpoint missing, flow cannot be reloaded");
                shared
                    .admit_to_hospital(flow_id, "checkpoint missing", VecDeque::new(), Some(&mut mailbox))
                    .await;
                return None;
            }
            Err(err) => {
                error!(%flow_id, %err, "checkpoint load failed");
                let reason = format!("checkpoint load failed: {err}");
                shared
                    .admit_to_hospital(flow_id, &reason, VecDeque::new(), Some(&mut mailbox))
                    .await;
                return None;
            }
        };

        let checkpoint = resumable(&shared, checkpoint, VecDeque::new(), &mut mailbox).await?;

        match shared
            .registry
            .restore(&checkpoint.flow_type, &checkpoint.continuation)
            .await
        {
            Ok(logic) => Some(Self {
                persisted: Some(checkpoint.sequence),
                shared,
                flow_id,
                logic,
                checkpoint,
                dirty: false,
                conflicts: 0,
                mailbox,
                requeued: VecDeque::new(),
            }),
            Err(err) => {
                let reason = format!("cannot restore flow: {err}");
                hospitalize_checkpoint(&shared, checkpoint, &reason, Some(&mut mailbox)).await;
                None
            }
        }
    }

    async fn event_loop(mut self) {
        let shutdown = self.shared.shutdown.clone();
        loop {
            let event = if let Some(event) = self.requeued.pop_front() {
                event
            } else {
                let timer = self.timer();
                let idle = if timer.is_none() && self.checkpoint.status == FlowStatus::Suspended {
                    self.shared.config.scheduler.idle_eviction()
                } else {
                    None
                };

                tokio::select! {
                    biased;

                    () = shutdown.cancelled() => {
                        debug!("actor stopping for shutdown");
                        return;
                    }

                    event = self.mailbox.recv() => match event {
                        Some(event) => event,
                        None => {
                            debug!("mailbox closed, actor stopping");
                            return;
                        }
                    },

                    () = time::sleep_until(timer.unwrap_or_else(Instant::now)), if timer.is_some() => {
                        FlowEvent::TimerFired
                    }

                    () = time::sleep(idle.unwrap_or_default()), if idle.is_some() => {
                        FlowEvent::IdleTimeout
                    }
                }
            };

            if self.handle(event).await == Control::Stop {
                return;
            }
        }
    }

    async fn handle(&mut self, event: FlowEvent) -> Control {
        let control = match event.clone() {
            FlowEvent::Start => self.resume(Resume::Start).await,
            FlowEvent::Recover { resend } => self.recover(resend).await,
            FlowEvent::Inbound(message) => self.on_inbound(message).await,
            FlowEvent::ExternalEvent { key, payload } => self.on_external_event(key, payload).await,
            FlowEvent::TimerFired => self.on_timer().await,
            FlowEvent::IdleTimeout => self.on_idle().await,
            FlowEvent::Cancel => self.on_cancel().await,
        };

        match control {
            Control::Conflict => self.on_conflict(event).await,
            Control::Continue => {
                self.conflicts = 0;
                Control::Continue
            }
            Control::Stop => Control::Stop,
        }
    }

    async fn recover(&mut self, resend: bool) -> Control {
        let mut messages = std::mem::take(&mut self.checkpoint.outbox);
        self.shared
            .add_routes(self.flow_id, self.checkpoint.sessions.ids())
            .await;
        self.shared
            .set_status(self.flow_id, self.checkpoint.status)
            .await;

        if resend {
            for session in self.checkpoint.sessions.iter() {
                if let Some(initiation) = &session.initiation {
                    if !messages.iter().any(|outbound| &outbound.message == initiation) {
                        messages.push(OutboundMessage {
                            destination: session.counterparty.clone(),
                            message: initiation.clone(),
                        });
                    }
                }
            }
            info!(
                sequence = self.checkpoint.sequence,
                resent = messages.len(),
                "flow recovered from checkpoint"
            );
            if let Err(err) = self.shared.dispatch(&messages).await {
                return self.dispatch_failed(messages, err).await;
            }
        } else {
            debug!(sequence = self.checkpoint.sequence, "flow reloaded from checkpoint");
        }

        if let Some(control) = self.settle().await {
            return control;
        }
        match self.try_satisfy() {
            Some(input) => self.resume(input).await,
            None => Control::Continue,
        }
    }

    async fn on_inbound(&mut self, message: SessionMessage) -> Control {
        let session_id = message.recipient_session_id;
        let sequence = message.sequence;
        let kind = message.payload.kind();

        match protocol::accept_inbound(&self.shared.identity, &mut self.checkpoint.sessions, message) {
            Accepted::Duplicate => {
                self.shared.note_duplicate();
                debug!(?session_id, sequence, kind, "duplicate message dropped");
                Control::Continue
            }
            Accepted::OutOfOrder => {
                warn!(?session_id, sequence, kind, "out-of-order message dropped");
                Control::Continue
            }
            Accepted::UnknownSession => {
                debug!(?session_id, sequence, kind, "message for closed session dropped");
                Control::Continue
            }
            Accepted::Applied { buffered, produced } => {
                debug!(?session_id, sequence, kind, "message accepted");
                self.checkpoint.outbox.extend(produced);
                self.dirty = true;
                if let Some(control) = self.settle().await {
                    return control;
                }
                if let Some(input) = self.try_satisfy() {
                    return self.resume(input).await;
                }
                if buffered || !self.checkpoint.outbox.is_empty() {
                    return self.commit().await;
                }
                Control::Continue
            }
        }
    }

    async fn on_external_event(&mut self, key: String, payload: Payload) -> Control {
        debug!(event_key = %key, "external event received");
        self.checkpoint
            .external_events
            .entry(key)
            .or_default()
            .push_back(payload);
        self.dirty = true;
        match self.try_satisfy() {
            Some(input) => self.resume(input).await,
            None => self.commit().await,
        }
    }

    async fn on_timer(&mut self) -> Control {
        match self.try_satisfy() {
            Some(input) => {
                debug!("deadline reached");
                self.resume(input).await
            }
            None => Control::Continue,
        }
    }

    async fn on_cancel(&mut self) -> Control {
        if self.checkpoint.pending_request.is_none() {
            return Control::Continue;
        }
        info!("flow cancelled at suspend point");
        self.resume(Resume::Failed(FlowException::Cancelled)).await
    }

    async fn on_idle(&mut self) -> Control {
        if self.checkpoint.status != FlowStatus::Suspended {
            return Control::Continue;
        }
        if self.dirty {
            let control = self.commit().await;
            if control != Control::Continue {
                return control;
            }
        }

        let mut live = self.shared.live.lock().await;
        let Some(entry) = live.get_mut(&self.flow_id) else {
            return Control::Stop;
        };
        let Some(tx) = entry.tx.take() else {
            return Control::Stop;
        };
        while let Ok(event) = self.mailbox.try_recv() {
            self.requeued.push_back(event);
        }
        if !self.requeued.is_empty() {
            entry.tx = Some(tx);
            return Control::Continue;
        }
        drop(live);

        info!(sequence = self.checkpoint.sequence, "idle flow evicted");
        Control::Stop
    }

    async fn on_conflict(&mut self, event: FlowEvent) -> Control {
        self.conflicts += 1;
        let max_attempts = self.shared.config.retry.max_attempts;

        match self.reload().await {
            Ok(true) if self.conflicts < max_attempts => {
                if !matches!(event, FlowEvent::Start | FlowEvent::Recover { .. }) {
                    self.requeued.push_front(event);
                }
                self.requeued.push_front(FlowEvent::Recover { resend: false });
                warn!(attempt = self.conflicts, "checkpoint conflict, retrying from stored state");
                Control::Continue
            }
            Ok(true) => {
                self.hospitalize("checkpoint conflicts exhausted retries").await;
                Control::Stop
            }
            Ok(false) => {
                warn!("flow finished elsewhere, actor stopping");
                if let Ok(Some(stored)) = self.shared.store.get(self.flow_id).await {
                    let queued = std::mem::take(&mut self.requeued);
                    let shared = Arc::clone(&self.shared);
                    if resumable(&shared, stored, queued, &mut self.mailbox).await.is_some() {
                        debug!("stored flow became resumable again");
                    }
                }
                Control::Stop
            }
            Err(err) => {
                self.hospitalize(&format!("reload after conflict failed: {err}"))
                    .await;
                Control::Stop
            }
        }
    }

    /// Replace in-memory state with the stored checkpoint. Returns `false`
    /// when the stored flow can no longer be resumed.
    async fn reload(&mut self) -> Result<bool> {
        let Some(checkpoint) = self.shared.store.get(self.flow_id).await? else {
            return Ok(false);
        };
        if checkpoint.status.is_terminal() || checkpoint.status == FlowStatus::Hospitalized {
            return Ok(false);
        }
        self.logic = self
            .shared
            .registry
            .restore(&checkpoint.flow_type, &checkpoint.continuation)
            .await?;
        self.persisted = Some(checkpoint.sequence);
        self.checkpoint = checkpoint;
        self.checkpoint.outbox.clear();
        self.dirty = false;
        Ok(true)
    }

    /// Drive the flow from `input` until it parks or terminates.
    async fn resume(&mut self, mut input: Resume) -> Control {
        loop {
            match self.step(input).await {
                StepOutcome::Suspended(request) => {
                    self.issue(request).await;
                    let control = self.commit().await;
                    if control != Control::Continue {
                        return control;
                    }
                    match self.try_satisfy() {
                        Some(next) => input = next,
                        None => return Control::Continue,
                    }
                }
                StepOutcome::Completed(result) => {
                    return self.finish(FlowOutcome::Completed { result }).await;
                }
                StepOutcome::Failed(error) => {
                    return self.finish(FlowOutcome::Failed { error }).await;
                }
            }
        }
    }

    async fn step(&mut self, input: Resume) -> StepOutcome {
        let shared = Arc::clone(&self.shared);
        let _permit = shared.workers.acquire().await.ok();
        self.transition(FlowStatus::Running).await;
        self.checkpoint.pending_request = None;
        self.dirty = true;

        let outcome = {
            let mut ctx = FlowContext::new(
                self.flow_id,
                &self.shared.identity,
                &self.checkpoint.flow_type,
                &mut self.checkpoint.sessions,
            );
            executor::run_step(self.logic.as_mut(), &mut ctx, input)
        };

        self.shared
            .add_routes(self.flow_id, self.checkpoint.sessions.ids())
            .await;
        outcome
    }

    /// Record a yielded request and stage the messages it produces.
    async fn issue(&mut self, request: FlowIORequest) {
        let us = &self.shared.identity;
        let outbox = &mut self.checkpoint.outbox;
        match &request {
            FlowIORequest::Send {
                session_id,
                payload,
            }
            | FlowIORequest::SendAndReceive {
                session_id,
                payload,
                ..
            } => {
                if let Some(session) = self.checkpoint.sessions.get_mut(*session_id) {
                    if session.is_open() {
                        protocol::send_payload(us, session, payload.clone(), outbox);
                    }
                }
            }
            FlowIORequest::Receive { session_id, .. } => {
                if let Some(session) = self.checkpoint.sessions.get_mut(*session_id) {
                    if session.is_open() {
                        protocol::initiate(us, session, None, outbox);
                    }
                }
            }
            FlowIORequest::CloseSession { session_id } => {
                if let Some(session) = self.checkpoint.sessions.get_mut(*session_id) {
                    protocol::close_session(us, session, outbox);
                }
            }
            FlowIORequest::WaitForExternalEvent { .. } | FlowIORequest::Sleep { .. } => {}
        }

        debug!(request = request.kind(), session_id = ?request.session_id(), "flow suspended");
        self.checkpoint.pending_request = Some(request);
        self.transition(FlowStatus::Suspended).await;
    }

    /// Persist the current state, then dispatch the staged messages.
    async fn commit(&mut self) -> Control {
        match self.persist().await {
            Ok(()) => {}
            Err(AppError::ConcurrentCheckpoint(detail)) => {
                warn!(%detail, "checkpoint write lost a race");
                return Control::Conflict;
            }
            Err(AppError::Shutdown(_)) => return Control::Stop,
            Err(err) => {
                self.hospitalize(&format!("checkpoint write failed: {err}"))
                    .await;
                return Control::Stop;
            }
        }

        let outbox = std::mem::take(&mut self.checkpoint.outbox);
        match self.shared.dispatch(&outbox).await {
            Ok(()) => Control::Continue,
            Err(err) => self.dispatch_failed(outbox, err).await,
        }
    }

    async fn dispatch_failed(&mut self, outbox: Vec<OutboundMessage>, err: AppError) -> Control {
        if matches!(err, AppError::Shutdown(_)) {
            return Control::Stop;
        }
        self.checkpoint.outbox = outbox;
        self.hospitalize(&format!("dispatch failed: {err}")).await;
        Control::Stop
    }

    async fn persist(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let retry = &shared.config.retry;
        let prior = self.persisted;

        self.checkpoint.sequence = prior.map_or(1, |sequence| sequence + 1);
        self.checkpoint.continuation = self.logic.encode()?;
        self.checkpoint.updated_at = Utc::now();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match shared.store.put(&self.checkpoint, prior).await {
                Ok(()) => break,
                Err(err @ AppError::Db(_)) if attempt < retry.max_attempts => {
                    warn!(%err, attempt, "checkpoint write failed, backing off");
                    tokio::select! {
                        () = shared.shutdown.cancelled() => {
                            return Err(AppError::Shutdown("node stopping".into()));
                        }
                        () = time::sleep(retry.backoff(attempt)) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }

        self.persisted = Some(self.checkpoint.sequence);
        self.dirty = false;
        info!(
            sequence = self.checkpoint.sequence,
            status = %self.checkpoint.status,
            pending = self.checkpoint.pending_request.as_ref().map_or("none", FlowIORequest::kind),
            outbox = self.checkpoint.outbox.len(),
            "checkpoint written"
        );
        Ok(())
    }

    /// Close the flow's sessions with its outcome. Terminates now, or once
    /// every session initiation still in flight has been answered.
    async fn finish(&mut self, outcome: FlowOutcome) -> Control {
        let us = self.shared.identity.clone();
        match &outcome {
            FlowOutcome::Completed { .. } => {
                protocol::end_sessions(&us, &mut self.checkpoint.sessions, &mut self.checkpoint.outbox);
            }
            FlowOutcome::Failed { error } => {
                protocol::error_sessions(
                    &us,
                    &mut self.checkpoint.sessions,
                    &error.to_string(),
                    &mut self.checkpoint.outbox,
                );
            }
            FlowOutcome::Hospitalized { .. } => {}
        }
        self.checkpoint.pending_request = None;

        if self.checkpoint.sessions.awaiting_answer() {
            info!(status = %outcome.status(), "flow done, waiting for session confirms before terminating");
            self.checkpoint.closing = Some(outcome);
            self.transition(FlowStatus::Suspended).await;
            return self.commit().await;
        }
        self.terminate(outcome).await
    }

    /// Terminate a closing flow once nothing awaits a confirm or reject.
    async fn settle(&mut self) -> Option<Control> {
        let outcome = self.checkpoint.closing.clone()?;
        if self.checkpoint.sessions.awaiting_answer() {
            return Some(if self.dirty {
                self.commit().await
            } else {
                Control::Continue
            });
        }
        Some(self.terminate(outcome).await)
    }

    /// Write the terminal checkpoint, send the final session messages and
    /// publish the outcome.
    async fn terminate(&mut self, outcome: FlowOutcome) -> Control {
        if let FlowOutcome::Failed { error } = &outcome {
            warn!(%error, "flow failed");
        }
        let status = outcome.status();
        self.transition(status).await;
        self.checkpoint.pending_request = None;
        self.checkpoint.closing = None;
        self.checkpoint.outcome = Some(outcome.clone());

        match self.persist().await {
            Ok(()) => {}
            Err(AppError::ConcurrentCheckpoint(detail)) => {
                warn!(%detail, "terminal checkpoint write lost a race");
                return Control::Conflict;
            }
            Err(AppError::Shutdown(_)) => return Control::Stop,
            Err(err) => {
                self.hospitalize(&format!("terminal checkpoint write failed: {err}"))
                    .await;
                return Control::Stop;
            }
        }

        let outbox = std::mem::take(&mut self.checkpoint.outbox);
        if let Err(err) = self.shared.dispatch(&outbox).await {
            warn!(%err, "final session messages not delivered");
        }
        if !self.shared.config.scheduler.retain_terminal_checkpoints {
            if let Err(err) = self.shared.store.delete(self.flow_id).await {
                warn!(%err, "terminal checkpoint not deleted");
            }
        }

        info!(%status, sequence = self.checkpoint.sequence, "flow finished");
        self.shared
            .finish(self.flow_id, outcome, self.checkpoint.sessions.ids())
            .await;
        Control::Stop
    }

    async fn hospitalize(&mut self, reason: &str) {
        error!(reason, "flow hospitalized");
        self.checkpoint.status = FlowStatus::Hospitalized;
        self.checkpoint.outcome = Some(FlowOutcome::Hospitalized {
            reason: reason.to_owned(),
        });
        if let Err(err) = self.persist().await {
            error!(%err, "hospitalization checkpoint not written");
        }
        let queued = std::mem::take(&mut self.requeued);
        self.shared
            .admit_to_hospital(self.flow_id, reason, queued, Some(&mut self.mailbox))
            .await;
    }

    async fn transition(&mut self, next: FlowStatus) {
        let current = self.checkpoint.status;
        if current != next && !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "unexpected status transition");
        }
        self.checkpoint.status = next;
        self.shared.set_status(self.flow_id, next).await;
    }

    /// Deadline of the pending request as a tokio instant.
    fn timer(&self) -> Option<Instant> {
        let deadline = self.checkpoint.pending_request.as_ref()?.deadline()?;
        let delay = (deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        Some(Instant::now() + delay)
    }

    /// Resume value for the pending request, if it can be satisfied now.
    fn try_satisfy(&mut self) -> Option<Resume> {
        let request = self.checkpoint.pending_request.clone()?;
        let now = Utc::now();
        match request {
            FlowIORequest::Send { session_id, .. } => Some(self.send_result(session_id)),
            FlowIORequest::Receive {
                session_id,
                expected_type,
            }
            | FlowIORequest::SendAndReceive {
                session_id,
                expected_type,
                ..
            } => self.take_inbound(session_id, &expected_type),
            FlowIORequest::CloseSession { .. } => Some(Resume::Closed),
            FlowIORequest::WaitForExternalEvent { event_key, deadline } => {
                if let Some(payload) = self.take_event(&event_key) {
                    Some(Resume::Event(payload))
                } else if deadline.is_some_and(|deadline| deadline <= now) {
                    Some(Resume::Failed(FlowException::Timeout))
                } else {
                    None
                }
            }
            FlowIORequest::Sleep { until } => (until <= now).then_some(Resume::Woke),
        }
    }

    fn send_result(&self, session_id: SessionId) -> Resume {
        match self.checkpoint.sessions.get(session_id) {
            None => Resume::Failed(invalid_session(session_id)),
            Some(session) => match session.state {
                SessionState::Initiating | SessionState::Confirmed => Resume::Sent,
                SessionState::Rejected => Resume::Failed(rejection(session)),
                SessionState::Closed => Resume::Failed(invalid_session(session_id)),
            },
        }
    }

    fn take_inbound(&mut self, session_id: SessionId, expected_type: &str) -> Option<Resume> {
        let Some(session) = self.checkpoint.sessions.get_mut(session_id) else {
            return Some(Resume::Failed(invalid_session(session_id)));
        };

        if let Some(item) = session.inbound.pop_front() {
            self.dirty = true;
            return Some(match item {
                InboundItem::Data { payload } if payload.type_name == expected_type => Resume::Received(payload),
                InboundItem::Data { payload } => Resume::Failed(FlowException::UnexpectedPayload {
                    expected: expected_type.to_owned(),
                    actual: payload.type_name,
                }),
                InboundItem::Error { message } => Resume::Failed(FlowException::CounterpartyFlow { message }),
                InboundItem::End => Resume::Failed(FlowException::SessionEnded {
                    session_id: session_id.to_string(),
                }),
            });
        }

        match session.state {
            SessionState::Rejected => Some(Resume::Failed(rejection(session))),
            SessionState::Closed => Some(Resume::Failed(FlowException::SessionEnded {
                session_id: session_id.to_string(),
            })),
            SessionState::Initiating | SessionState::Confirmed => None,
        }
    }

    fn take_event(&mut self, event_key: &str) -> Option<Payload> {
        let queue = self.checkpoint.external_events.get_mut(event_key)?;
        let payload = queue.pop_front();
        if queue.is_empty() {
            self.checkpoint.external_events.remove(event_key);
        }
        if payload.is_some() {
            self.dirty = true;
        }
        payload
    }
}

fn invalid_session(session_id: SessionId) -> FlowException {
    FlowException::InvalidSession {
        session_id: session_id.to_string(),
    }
}

fn rejection(session: &FlowSession) -> FlowException {
    FlowException::UnknownCounterpartyFlow {
        flow_type: session.flow_type.to_string(),
        reason: session
            .rejection
            .clone()
            .unwrap_or_else(|| protocol::UNKNOWN_FLOW_REASON.to_owned()),
    }
}
