//! Integration tests for the flow lifecycle on a single scheduler.
//!
//! Validates:
//! - Sleep and event deadlines resume the flow on time
//! - Killing a suspended flow fails it with `Cancelled`
//! - A counterparty failure surfaces as `CounterpartyFlow`
//! - Idle flows are evicted and transparently reloaded by the next event
//! - Undeliverable flows are hospitalized, refuse events, and recover on retry
//! - Session messages for a hospitalized flow are kept for the retry
//! - A failure before the counterparty confirmed still reaches it
//! - Outcomes of finished flows stay queryable up to the cache size
//! - Reloading a flow whose stored checkpoint is terminal finishes it
//! - The in-flight limit refuses new flows

use std::sync::Arc;

use flowstate::demo::{EchoInitiator, EchoResponder};
use flowstate::errors::FlowException;
use flowstate::flow::{Flow, FlowRegistry};
use flowstate::models::flow::{FlowId, FlowOutcome, FlowStatus, InvocationContext};
use flowstate::models::session::InboundItem;
use flowstate::persistence::CheckpointStore;
use flowstate::transport::InMemoryNetwork;
use flowstate::AppError;

use super::test_flows::{Collector, Courier, FailingResponder, Napper, Quitter, Waiter};
use super::test_helpers::{
    completed_text, demo_node, demo_registry, eventually, first_terminal_outcome, memory_store,
    party, start_node, test_config, text, wait_outcome,
};

async fn registry_with<F: Flow>() -> Arc<FlowRegistry> {
    let registry = FlowRegistry::new();
    flowstate::demo::register(&registry).await;
    registry.register::<F>().await;
    Arc::new(registry)
}

#[tokio::test]
async fn sleep_and_event_deadline_resume_the_flow() {
    let network = InMemoryNetwork::new();
    let node = start_node(&network, test_config("alice", ""), memory_store().await, registry_with::<Napper>().await).await;

    let flow_id = node
        .manager()
        .start_flow(Napper::default(), InvocationContext::client("ops"))
        .await
        .expect("start napper");

    let outcome = wait_outcome(node.manager(), flow_id).await;
    assert_eq!(completed_text(&outcome), "timed out");
    node.shutdown().await;
}

#[tokio::test]
async fn external_event_completes_waiting_flow() {
    let network = InMemoryNetwork::new();
    let node = start_node(&network, test_config("alice", ""), memory_store().await, registry_with::<Waiter>().await).await;

    let flow_id = node
        .manager()
        .start_flow(Waiter, InvocationContext::client("ops"))
        .await
        .expect("start waiter");
    node.manager()
        .signal_external_event(flow_id, "go", text("approved"))
        .await
        .expect("signal");

    let outcome = wait_outcome(node.manager(), flow_id).await;
    assert_eq!(completed_text(&outcome), "approved");
    node.shutdown().await;
}

#[tokio::test]
async fn killed_flow_fails_with_cancelled() {
    let network = InMemoryNetwork::new();
    let node = start_node(&network, test_config("alice", ""), memory_store().await, registry_with::<Waiter>().await).await;

    let flow_id = node
        .manager()
        .start_flow(Waiter, InvocationContext::client("ops"))
        .await
        .expect("start waiter");
    let manager = node.manager().clone();
    eventually(|| {
        let manager = manager.clone();
        async move { manager.get_flow_status(flow_id).await.ok() == Some(FlowStatus::Suspended) }
    })
    .await;

    node.manager().kill_flow(flow_id).await.expect("kill");
    let outcome = wait_outcome(node.manager(), flow_id).await;
    assert_eq!(
        outcome,
        FlowOutcome::Failed {
            error: FlowException::Cancelled
        }
    );

    let err = node
        .manager()
        .kill_flow(flow_id)
        .await
        .expect_err("already finished");
    assert!(matches!(err, AppError::NotFound(_)));
    node.shutdown().await;
}

#[tokio::test]
async fn counterparty_failure_is_propagated() {
    let network = InMemoryNetwork::new();
    let alice = demo_node(&network, "alice").await;
    let bob_registry = FlowRegistry::new();
    bob_registry
        .register_initiated_flow_handler::<FailingResponder>(EchoInitiator::descriptor())
        .await;
    let bob = start_node(&network, test_config("bob", ""), memory_store().await, Arc::new(bob_registry)).await;

    let flow_id = alice
        .manager()
        .start_flow(EchoInitiator::new(party("bob"), "hello"), InvocationContext::client("ops"))
        .await
        .expect("start echo");

    let outcome = wait_outcome(alice.manager(), flow_id).await;
    assert_eq!(
        outcome,
        FlowOutcome::Failed {
            error: FlowException::CounterpartyFlow {
                message: "insufficient funds".into()
            }
        }
    );

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn idle_flow_is_evicted_and_reloaded_on_demand() {
    let network = InMemoryNetwork::new();
    let config = test_config("alice", "[scheduler]\nidle_eviction_seconds = 1");
    let node = start_node(&network, config, memory_store().await, registry_with::<Waiter>().await).await;

    let flow_id = node
        .manager()
        .start_flow(Waiter, InvocationContext::client("ops"))
        .await
        .expect("start waiter");

    let manager = node.manager().clone();
    eventually(|| {
        let manager = manager.clone();
        async move { manager.resident_flow_count().await == 0 }
    })
    .await;
    assert_eq!(node.manager().live_flow_count().await, 1);
    assert_eq!(
        node.manager().get_flow_status(flow_id).await.expect("status"),
        FlowStatus::Suspended
    );

    node.manager()
        .signal_external_event(flow_id, "go", text("back"))
        .await
        .expect("signal evicted flow");
    let outcome = wait_outcome(node.manager(), flow_id).await;
    assert_eq!(completed_text(&outcome), "back");
    node.shutdown().await;
}

#[tokio::test]
async fn undeliverable_flow_is_hospitalized_then_retried() {
    let network = InMemoryNetwork::new();
    let alice = demo_node(&network, "alice").await;
    let bob = demo_node(&network, "bob").await;
    network.set_unreachable(&party("bob"), true).await;

    let flow_id = alice
        .manager()
        .start_flow(EchoInitiator::new(party("bob"), "hello"), InvocationContext::client("ops"))
        .await
        .expect("start echo");

    let outcome = wait_outcome(alice.manager(), flow_id).await;
    assert!(matches!(&outcome, FlowOutcome::Hospitalized { reason } if reason.contains("dispatch failed")));
    assert_eq!(
        alice.manager().get_flow_status(flow_id).await.expect("status"),
        FlowStatus::Hospitalized
    );

    let err = alice
        .manager()
        .signal_external_event(flow_id, "go", text("ignored"))
        .await
        .expect_err("hospitalized flows refuse events");
    assert!(matches!(err, AppError::Hospitalization(_)));

    network.set_unreachable(&party("bob"), false).await;
    alice.manager().retry_flow(flow_id).await.expect("retry");

    let outcome = wait_outcome(alice.manager(), flow_id).await;
    assert_eq!(completed_text(&outcome), "hellohello");

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn retry_flow_requires_a_hospitalized_flow() {
    let network = InMemoryNetwork::new();
    let node = demo_node(&network, "alice").await;

    let err = node
        .manager()
        .retry_flow(FlowId::new())
        .await
        .expect_err("unknown flow");
    assert!(matches!(err, AppError::NotFound(_)));
    node.shutdown().await;
}

#[tokio::test]
async fn in_flight_limit_refuses_new_flows() {
    let network = InMemoryNetwork::new();
    let config = test_config("alice", "[scheduler]\nmax_in_flight_flows = 1");
    let node = start_node(&network, config, memory_store().await, registry_with::<Waiter>().await).await;

    node.manager()
        .start_flow(Waiter, InvocationContext::client("ops"))
        .await
        .expect("first flow fits");
    let err = node
        .manager()
        .start_flow(Waiter, InvocationContext::client("ops"))
        .await
        .expect_err("second flow refused");
    assert!(matches!(err, AppError::FlowStart(msg) if msg.contains("in-flight limit")));
    node.shutdown().await;
}

#[tokio::test]
async fn unregistered_flow_cannot_start() {
    let network = InMemoryNetwork::new();
    let node = demo_node(&network, "alice").await;

    let err = node
        .manager()
        .start_flow(Waiter, InvocationContext::client("ops"))
        .await
        .expect_err("not registered");
    assert!(matches!(err, AppError::FlowStart(_)));
    assert!(matches!(
        node.manager().get_flow_status(FlowId::new()).await,
        Err(AppError::NotFound(_))
    ));
    node.shutdown().await;
}

#[tokio::test]
async fn retry_from_last_checkpoint_replaces_the_resident_actor() {
    let network = InMemoryNetwork::new();
    let node = start_node(&network, test_config("alice", ""), memory_store().await, registry_with::<Waiter>().await).await;

    let flow_id = node
        .manager()
        .start_flow(Waiter, InvocationContext::client("ops"))
        .await
        .expect("start waiter");
    let manager = node.manager().clone();
    eventually(|| {
        let manager = manager.clone();
        async move { manager.get_flow_status(flow_id).await.ok() == Some(FlowStatus::Suspended) }
    })
    .await;

    node.manager()
        .retry_from_last_checkpoint(flow_id)
        .await
        .expect("reload from checkpoint");
    node.manager()
        .signal_external_event(flow_id, "go", text("reloaded"))
        .await
        .expect("signal reloaded flow");

    let outcome = wait_outcome(node.manager(), flow_id).await;
    assert_eq!(completed_text(&outcome), "reloaded");
    assert_eq!(node.manager().resident_flow_count().await, 0);
    node.shutdown().await;
}

#[tokio::test]
async fn failure_before_confirm_reaches_the_counterparty() {
    let network = InMemoryNetwork::new();
    let alice = start_node(&network, test_config("alice", ""), memory_store().await, registry_with::<Quitter>().await).await;
    let bob_store = memory_store().await;
    let bob = start_node(&network, test_config("bob", ""), Arc::clone(&bob_store), demo_registry().await).await;
    bob.manager()
        .register_initiated_flow_handler::<Collector>(Quitter::descriptor())
        .await;

    let flow_id = alice
        .manager()
        .start_flow(Quitter::new(party("bob")), InvocationContext::client("ops"))
        .await
        .expect("start quitter");

    let outcome = wait_outcome(alice.manager(), flow_id).await;
    assert_eq!(
        outcome,
        FlowOutcome::Failed {
            error: FlowException::logic("boom")
        }
    );
    let responder = first_terminal_outcome(&bob_store).await;
    assert_eq!(
        responder,
        FlowOutcome::Failed {
            error: FlowException::CounterpartyFlow {
                message: "boom".into()
            }
        }
    );

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn hospitalized_flow_keeps_inbound_messages_for_retry() {
    let network = InMemoryNetwork::new();
    let alice_store = memory_store().await;
    let alice = start_node(&network, test_config("alice", ""), Arc::clone(&alice_store), registry_with::<Courier>().await).await;
    let bob = demo_node(&network, "bob").await;
    let carol = demo_node(&network, "carol").await;
    for responder in [&bob, &carol] {
        responder
            .manager()
            .register_initiated_flow_handler::<EchoResponder>(Courier::descriptor())
            .await;
    }
    network.set_unreachable(&party("carol"), true).await;

    let flow_id = alice
        .manager()
        .start_flow(Courier::new(party("bob"), party("carol")), InvocationContext::client("ops"))
        .await
        .expect("start courier");

    let outcome = wait_outcome(alice.manager(), flow_id).await;
    assert!(matches!(&outcome, FlowOutcome::Hospitalized { reason } if reason.contains("dispatch failed")));

    let store = Arc::clone(&alice_store);
    eventually(|| {
        let store = Arc::clone(&store);
        async move {
            store
                .get(flow_id)
                .await
                .ok()
                .flatten()
                .is_some_and(|checkpoint| {
                    checkpoint.sessions.iter().any(|session| {
                        session.counterparty == party("bob")
                            && session
                                .inbound
                                .iter()
                                .any(|item| matches!(item, InboundItem::Data { .. }))
                    })
                })
        }
    })
    .await;
    let stored = alice_store.get(flow_id).await.expect("read").expect("stored");
    assert_eq!(stored.status, FlowStatus::Hospitalized);

    network.set_unreachable(&party("carol"), false).await;
    alice.manager().retry_flow(flow_id).await.expect("retry");

    let outcome = wait_outcome(alice.manager(), flow_id).await;
    assert_eq!(completed_text(&outcome), "xx");

    alice.shutdown().await;
    bob.shutdown().await;
    carol.shutdown().await;
}

#[tokio::test]
async fn finished_outcomes_are_cached_up_to_the_limit() {
    let network = InMemoryNetwork::new();
    let config = test_config(
        "alice",
        "[scheduler]\nretain_terminal_checkpoints = false\nfinished_flow_cache = 1",
    );
    let alice = start_node(&network, config, memory_store().await, demo_registry().await).await;
    let bob = demo_node(&network, "bob").await;

    let first = alice
        .manager()
        .start_flow(EchoInitiator::new(party("bob"), "one"), InvocationContext::client("ops"))
        .await
        .expect("start first echo");
    assert_eq!(completed_text(&wait_outcome(alice.manager(), first).await), "oneone");
    assert_eq!(completed_text(&wait_outcome(alice.manager(), first).await), "oneone");
    assert_eq!(
        alice.manager().get_flow_status(first).await.expect("cached status"),
        FlowStatus::Completed
    );

    let second = alice
        .manager()
        .start_flow(EchoInitiator::new(party("bob"), "two"), InvocationContext::client("ops"))
        .await
        .expect("start second echo");
    assert_eq!(completed_text(&wait_outcome(alice.manager(), second).await), "twotwo");

    assert!(matches!(
        alice.manager().get_flow_status(first).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        alice.manager().wait_for_outcome(first).await,
        Err(AppError::NotFound(_))
    ));
    assert_eq!(
        alice.manager().get_flow_status(second).await.expect("cached status"),
        FlowStatus::Completed
    );

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn reloading_a_terminated_checkpoint_finishes_the_flow() {
    let network = InMemoryNetwork::new();
    let store = memory_store().await;
    let node = start_node(&network, test_config("alice", ""), Arc::clone(&store), registry_with::<Waiter>().await).await;

    let flow_id = node
        .manager()
        .start_flow(Waiter, InvocationContext::client("ops"))
        .await
        .expect("start waiter");
    let watched = Arc::clone(&store);
    eventually(|| {
        let store = Arc::clone(&watched);
        async move {
            store
                .get(flow_id)
                .await
                .ok()
                .flatten()
                .is_some_and(|checkpoint| checkpoint.status == FlowStatus::Suspended)
        }
    })
    .await;

    let mut stored = store.get(flow_id).await.expect("read").expect("stored");
    let prior = stored.sequence;
    stored.sequence = prior + 1;
    stored.status = FlowStatus::Completed;
    stored.pending_request = None;
    stored.outcome = Some(FlowOutcome::Completed {
        result: text("settled elsewhere"),
    });
    store.put(&stored, Some(prior)).await.expect("write terminal checkpoint");

    node.manager()
        .retry_from_last_checkpoint(flow_id)
        .await
        .expect("reload");
    let outcome = wait_outcome(node.manager(), flow_id).await;
    assert_eq!(completed_text(&outcome), "settled elsewhere");
    let manager = node.manager().clone();
    eventually(|| {
        let manager = manager.clone();
        async move { manager.live_flow_count().await == 0 }
    })
    .await;
    assert_eq!(
        node.manager().get_flow_status(flow_id).await.expect("status"),
        FlowStatus::Completed
    );
    node.shutdown().await;
}
