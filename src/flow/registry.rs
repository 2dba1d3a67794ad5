//! Flow type registry.
//!
//! Maps descriptors to the code that can rebuild a flow from its
//! continuation, and initiating descriptors to the responder that answers
//! them. Populated at node start and extendable at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use super::{boxed, restore, Flow, FlowLogic, InitiatedFlow};
use crate::models::flow::FlowDescriptor;
use crate::models::session::{Party, SessionId};
use crate::{AppError, Result};

type Restorer = fn(&[u8]) -> Result<Box<dyn FlowLogic>>;

/// Builds a responder flow for an accepted session.
pub type ResponderFactory = Arc<dyn Fn(SessionId, Party) -> Box<dyn FlowLogic> + Send + Sync>;

#[derive(Clone)]
struct Responder {
    flow_type: FlowDescriptor,
    factory: ResponderFactory,
}

/// Registry of startable flows and initiated-flow handlers.
#[derive(Default)]
pub struct FlowRegistry {
    flows: RwLock<HashMap<FlowDescriptor, Restorer>>,
    responders: RwLock<HashMap<FlowDescriptor, Responder>>,
}

impl FlowRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow type so it can be started and restored.
    pub async fn register<F: Flow>(&self) {
        let descriptor = F::descriptor();
        info!(flow_type = %descriptor, "flow registered");
        self.flows.write().await.insert(descriptor, restore::<F>);
    }

    /// Install `R` as the responder for sessions initiated by `initiating`.
    ///
    /// A later registration for the same initiating descriptor replaces
    /// the earlier one.
    pub async fn register_initiated_flow_handler<R: InitiatedFlow>(&self, initiating: FlowDescriptor) {
        self.register::<R>().await;
        let factory: ResponderFactory =
            Arc::new(|session, counterparty| boxed(R::initiated(session, counterparty)));
        info!(initiating = %initiating, responder = %R::descriptor(), "initiated flow handler registered");
        self.responders.write().await.insert(
            initiating,
            Responder {
                flow_type: R::descriptor(),
                factory,
            },
        );
    }

    /// Whether `descriptor` can be restored from a checkpoint.
    pub async fn is_registered(&self, descriptor: &FlowDescriptor) -> bool {
        self.flows.read().await.contains_key(descriptor)
    }

    /// Rebuild a flow of type `descriptor` from continuation bytes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the type is not registered and
    /// `AppError::Serialization` if the bytes cannot be decoded.
    pub async fn restore(&self, descriptor: &FlowDescriptor, bytes: &[u8]) -> Result<Box<dyn FlowLogic>> {
        let restorer = self
            .flows
            .read()
            .await
            .get(descriptor)
            .copied()
            .ok_or_else(|| AppError::NotFound(format!("flow type {descriptor} is not registered")))?;
        restorer(bytes)
    }

    /// Resolve the responder for an initiating descriptor, returning the
    /// responder's own descriptor and its factory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no handler is installed.
    pub async fn resolve(&self, initiating: &FlowDescriptor) -> Result<(FlowDescriptor, ResponderFactory)> {
        self.responders
            .read()
            .await
            .get(initiating)
            .map(|responder| (responder.flow_type.clone(), Arc::clone(&responder.factory)))
            .ok_or_else(|| AppError::NotFound(format!("unknown flow type {initiating}")))
    }

    /// All registered flow descriptors, sorted.
    pub async fn registered_flows(&self) -> Vec<FlowDescriptor> {
        let mut flows: Vec<FlowDescriptor> = self.flows.read().await.keys().cloned().collect();
        flows.sort();
        flows
    }
}
