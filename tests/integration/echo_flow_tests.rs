//! End-to-end echo exchanges between nodes.
//!
//! Validates:
//! - A two-node echo completes and the initiator writes exactly two checkpoints
//! - Every outbound message is preceded by the checkpoint that produced it
//! - Duplicate delivery by the network changes nothing but the drop counters
//! - Sub-flows share the parent's session table
//! - The byte-stream transport carries a full exchange
//! - Payloads sent before the confirm, and the session end, reach the
//!   responder even when the initiator finishes first
//! - An initiator may open a session by receiving

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use flowstate::demo::{EchoInitiator, EchoResponder};
use flowstate::flow::Flow;
use flowstate::models::flow::{FlowStatus, InvocationContext};
use flowstate::models::message::SessionMessage;
use flowstate::models::session::Party;
use flowstate::persistence::CheckpointStore;
use flowstate::transport::stream::run_reader;
use flowstate::transport::{InMemoryNetwork, StreamTransport, Transport};
use flowstate::{FlowNode, Result};

use super::test_flows::{Burst, Collector, EchoTwice, Greeter, Listener};
use super::test_helpers::{
    completed_text, demo_node, demo_registry, first_terminal_outcome, memory_store, party,
    start_node, test_config, wait_outcome,
};

#[tokio::test]
async fn echo_completes_with_doubled_text() {
    let network = InMemoryNetwork::new();
    let alice = demo_node(&network, "alice").await;
    let bob = demo_node(&network, "bob").await;

    let flow_id = alice
        .manager()
        .start_flow(EchoInitiator::new(party("bob"), "hello"), InvocationContext::client("ops"))
        .await
        .expect("start echo");

    let outcome = wait_outcome(alice.manager(), flow_id).await;
    assert_eq!(completed_text(&outcome), "hellohello");
    assert_eq!(
        alice.manager().get_flow_status(flow_id).await.expect("status"),
        FlowStatus::Completed
    );
    assert_eq!(alice.manager().live_flow_count().await, 0);

    alice.shutdown().await;
    bob.shutdown().await;
}

/// Transport that records, for every message a flow sends, the sequence
/// of that flow's stored checkpoint at the moment of sending.
struct RecordingTransport {
    inner: Arc<dyn Transport>,
    store: Arc<dyn CheckpointStore>,
    observed: Mutex<Vec<u64>>,
}

impl RecordingTransport {
    async fn record_and_send(&self, destination: &Party, message: SessionMessage) -> Result<()> {
        let stored = self
            .store
            .list_all()
            .await?
            .into_iter()
            .find(|checkpoint| {
                message
                    .sender_session_id
                    .is_some_and(|id| checkpoint.sessions.contains(id))
            })
            .map_or(0, |checkpoint| checkpoint.sequence);
        self.observed.lock().await.push(stored);
        self.inner.send(destination, message).await
    }
}

impl Transport for RecordingTransport {
    fn send<'a>(
        &'a self,
        destination: &'a Party,
        message: SessionMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.record_and_send(destination, message))
    }
}

#[tokio::test]
async fn checkpoint_precedes_every_send() {
    let network = InMemoryNetwork::new();
    let bob = demo_node(&network, "bob").await;

    let store = memory_store().await;
    let config = test_config("alice", "");
    let (inner, inbound) = network.attach(config.party()).await;
    let recording = Arc::new(RecordingTransport {
        inner,
        store: Arc::clone(&store),
        observed: Mutex::new(Vec::new()),
    });
    let transport: Arc<dyn Transport> = recording.clone();
    let alice = FlowNode::start(config, Arc::clone(&store), transport, inbound, demo_registry().await)
        .await
        .expect("alice starts");

    let flow_id = alice
        .manager()
        .start_flow(EchoInitiator::new(party("bob"), "hello"), InvocationContext::client("ops"))
        .await
        .expect("start echo");
    let outcome = wait_outcome(alice.manager(), flow_id).await;
    assert_eq!(completed_text(&outcome), "hellohello");

    // Initiate after checkpoint 1, session end after terminal checkpoint 2.
    assert_eq!(*recording.observed.lock().await, vec![1, 2]);
    let stored = store.get(flow_id).await.expect("read").expect("retained");
    assert_eq!(stored.sequence, 2);
    assert_eq!(stored.status, FlowStatus::Completed);
    assert!(stored.outcome.is_some());

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn duplicate_delivery_is_absorbed() {
    let network = InMemoryNetwork::new();
    network.set_duplicate_delivery(true).await;
    let alice = demo_node(&network, "alice").await;
    let bob = demo_node(&network, "bob").await;

    let flow_id = alice
        .manager()
        .start_flow(EchoInitiator::new(party("bob"), "hello"), InvocationContext::client("ops"))
        .await
        .expect("start echo");

    let outcome = wait_outcome(alice.manager(), flow_id).await;
    assert_eq!(completed_text(&outcome), "hellohello");
    assert!(alice.manager().duplicates_dropped() >= 1);
    assert!(bob.manager().duplicates_dropped() >= 1);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn sub_flows_share_the_parent_session_table() {
    let network = InMemoryNetwork::new();
    let alice = demo_node(&network, "alice").await;
    let bob = demo_node(&network, "bob").await;
    let carol = demo_node(&network, "carol").await;
    alice.manager().registry().register::<EchoTwice>().await;
    for responder in [&bob, &carol] {
        responder
            .manager()
            .register_initiated_flow_handler::<EchoResponder>(EchoTwice::descriptor())
            .await;
    }

    let flow_id = alice
        .manager()
        .start_flow(
            EchoTwice::new((party("bob"), "hi"), (party("carol"), "yo")),
            InvocationContext::client("ops"),
        )
        .await
        .expect("start parent flow");

    let outcome = wait_outcome(alice.manager(), flow_id).await;
    assert_eq!(completed_text(&outcome), "hihi|yoyo");

    alice.shutdown().await;
    bob.shutdown().await;
    carol.shutdown().await;
}

#[tokio::test]
async fn sub_flow_sessions_are_checkpointed_under_the_parent() {
    let network = InMemoryNetwork::new();
    let store = memory_store().await;
    let alice = start_node(
        &network,
        test_config("alice", ""),
        Arc::clone(&store),
        demo_registry().await,
    )
    .await;
    let bob = demo_node(&network, "bob").await;
    alice.manager().registry().register::<EchoTwice>().await;
    bob.manager()
        .register_initiated_flow_handler::<EchoResponder>(EchoTwice::descriptor())
        .await;

    let flow_id = alice
        .manager()
        .start_flow(
            EchoTwice::new((party("bob"), "a"), (party("bob"), "b")),
            InvocationContext::client("ops"),
        )
        .await
        .expect("start parent flow");
    let outcome = wait_outcome(alice.manager(), flow_id).await;
    assert_eq!(completed_text(&outcome), "aa|bb");

    let stored = store.get(flow_id).await.expect("read").expect("retained");
    assert_eq!(stored.sessions.len(), 2);
    assert!(stored.sessions.iter().all(|s| s.flow_type == EchoTwice::descriptor()));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn echo_over_byte_streams() {
    let (alice_end, bob_end) = tokio::io::duplex(64 * 1024);
    let (alice_read, alice_write) = tokio::io::split(alice_end);
    let (bob_read, bob_write) = tokio::io::split(bob_end);
    let cancel = CancellationToken::new();

    let alice_transport = Arc::new(StreamTransport::new());
    let bob_transport = Arc::new(StreamTransport::new());
    let alice_writer = alice_transport
        .add_peer(party("bob"), alice_write, cancel.clone())
        .await;
    let bob_writer = bob_transport
        .add_peer(party("alice"), bob_write, cancel.clone())
        .await;

    let (alice_tx, alice_rx) = mpsc::unbounded_channel();
    let (bob_tx, bob_rx) = mpsc::unbounded_channel();
    let alice_reader = tokio::spawn(run_reader(party("bob"), alice_read, alice_tx, cancel.clone()));
    let bob_reader = tokio::spawn(run_reader(party("alice"), bob_read, bob_tx, cancel.clone()));

    let alice = FlowNode::start(
        test_config("alice", ""),
        memory_store().await,
        alice_transport,
        alice_rx,
        demo_registry().await,
    )
    .await
    .expect("alice starts");
    let bob = FlowNode::start(
        test_config("bob", ""),
        memory_store().await,
        bob_transport,
        bob_rx,
        demo_registry().await,
    )
    .await
    .expect("bob starts");

    let flow_id = alice
        .manager()
        .start_flow(EchoInitiator::new(party("bob"), "over the wire"), InvocationContext::client("ops"))
        .await
        .expect("start echo");
    let outcome = wait_outcome(alice.manager(), flow_id).await;
    assert_eq!(completed_text(&outcome), "over the wireover the wire");

    alice.shutdown().await;
    bob.shutdown().await;
    cancel.cancel();
    for writer in [alice_writer, bob_writer] {
        writer.await.expect("join writer").expect("writer result");
    }
    for reader in [alice_reader, bob_reader] {
        reader.await.expect("join reader").expect("reader result");
    }
}

#[tokio::test]
async fn sends_before_confirm_reach_responder_after_initiator_completes() {
    let network = InMemoryNetwork::new();
    let alice = demo_node(&network, "alice").await;
    alice.manager().registry().register::<Burst>().await;
    let bob_store = memory_store().await;
    let bob = start_node(&network, test_config("bob", ""), Arc::clone(&bob_store), demo_registry().await).await;
    bob.manager()
        .register_initiated_flow_handler::<Collector>(Burst::descriptor())
        .await;

    let flow_id = alice
        .manager()
        .start_flow(Burst::new(party("bob")), InvocationContext::client("ops"))
        .await
        .expect("start burst");

    let outcome = wait_outcome(alice.manager(), flow_id).await;
    assert_eq!(completed_text(&outcome), "sent");
    let collected = first_terminal_outcome(&bob_store).await;
    assert_eq!(completed_text(&collected), "a,b");
    assert_eq!(alice.manager().live_flow_count().await, 0);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn initiator_can_open_a_session_by_receiving() {
    let network = InMemoryNetwork::new();
    let alice = demo_node(&network, "alice").await;
    alice.manager().registry().register::<Listener>().await;
    let bob = demo_node(&network, "bob").await;
    bob.manager()
        .register_initiated_flow_handler::<Greeter>(Listener::descriptor())
        .await;

    let flow_id = alice
        .manager()
        .start_flow(Listener::new(party("bob")), InvocationContext::client("ops"))
        .await
        .expect("start listener");

    let outcome = wait_outcome(alice.manager(), flow_id).await;
    assert_eq!(completed_text(&outcome), "hi");

    alice.shutdown().await;
    bob.shutdown().await;
}
