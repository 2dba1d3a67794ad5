//! In-process network connecting several nodes.
//!
//! Behaves like a persistent message broker: a party that is attached but
//! currently has no live receiver (detached, or its node stopped) has its
//! messages queued and handed over when it attaches again. Sending to a
//! party that never attached, or one marked unreachable, fails.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::Transport;
use crate::models::message::SessionMessage;
use crate::models::session::Party;
use crate::{AppError, Result};

/// One message handed to the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Sending party.
    pub from: Party,
    /// Destination party.
    pub to: Party,
    /// Message as sent.
    pub message: SessionMessage,
}

#[derive(Default)]
struct Endpoint {
    sender: Option<UnboundedSender<SessionMessage>>,
    queued: VecDeque<SessionMessage>,
    unreachable: bool,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<Party, Endpoint>,
    log: Vec<Delivery>,
    duplicate_delivery: bool,
}

/// Shared in-memory network. Cloning yields another handle to the same
/// network.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl InMemoryNetwork {
    /// Empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `party`, returning its outbound transport and inbound
    /// receiver. Messages queued while the party was away are delivered
    /// first.
    pub async fn attach(&self, party: Party) -> (Arc<dyn Transport>, UnboundedReceiver<SessionMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        let endpoint = state.endpoints.entry(party.clone()).or_default();
        for message in endpoint.queued.drain(..) {
            // The receiver is still in scope, so this cannot fail.
            let _ = tx.send(message);
        }
        endpoint.sender = Some(tx);
        debug!(%party, "party attached to network");

        let transport = Arc::new(NetworkEndpoint {
            party,
            network: self.clone(),
        });
        (transport, rx)
    }

    /// Disconnect `party`; later messages are queued for it.
    pub async fn detach(&self, party: &Party) {
        if let Some(endpoint) = self.state.lock().await.endpoints.get_mut(party) {
            endpoint.sender = None;
            debug!(%party, "party detached from network");
        }
    }

    /// Make sends to `party` fail (or succeed again).
    pub async fn set_unreachable(&self, party: &Party, unreachable: bool) {
        let mut state = self.state.lock().await;
        state.endpoints.entry(party.clone()).or_default().unreachable = unreachable;
    }

    /// Deliver every message twice, simulating at-least-once redelivery.
    pub async fn set_duplicate_delivery(&self, enabled: bool) {
        self.state.lock().await.duplicate_delivery = enabled;
    }

    /// Every message accepted by the network so far, in send order.
    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().await.log.clone()
    }

    /// Number of messages waiting for a detached party.
    pub async fn queued_for(&self, party: &Party) -> usize {
        self.state
            .lock()
            .await
            .endpoints
            .get(party)
            .map_or(0, |endpoint| endpoint.queued.len())
    }

    async fn route(&self, from: &Party, to: &Party, message: SessionMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        let copies = if state.duplicate_delivery { 2 } else { 1 };

        let endpoint = state
            .endpoints
            .get_mut(to)
            .ok_or_else(|| AppError::Transport(format!("unknown party {to}")))?;
        if endpoint.unreachable {
            return Err(AppError::Transport(format!("party {to} is unreachable")));
        }

        for _ in 0..copies {
            let undelivered = match &endpoint.sender {
                Some(sender) => sender.send(message.clone()).err().map(|err| err.0),
                None => Some(message.clone()),
            };
            if let Some(undelivered) = undelivered {
                if endpoint.sender.take().is_some() {
                    warn!(party = %to, "receiver gone, queueing messages for party");
                }
                endpoint.queued.push_back(undelivered);
            }
        }

        state.log.push(Delivery {
            from: from.clone(),
            to: to.clone(),
            message,
        });
        Ok(())
    }
}

/// A party's handle on the [`InMemoryNetwork`].
struct NetworkEndpoint {
    party: Party,
    network: InMemoryNetwork,
}

impl Transport for NetworkEndpoint {
    fn send<'a>(
        &'a self,
        destination: &'a Party,
        message: SessionMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.network.route(&self.party, destination, message))
    }
}
