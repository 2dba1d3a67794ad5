use std::sync::Arc;

use chrono::{Duration, Utc};

use flowstate::models::checkpoint::{FlowCheckpoint, ParkedInitiation};
use flowstate::models::flow::{FlowDescriptor, FlowId, FlowOutcome, FlowStatus, InvocationContext};
use flowstate::models::io_request::FlowIORequest;
use flowstate::models::message::{Payload, SessionMessage, SessionPayload};
use flowstate::models::session::Party;
use flowstate::persistence::{db, retention, CheckpointStore, SqliteCheckpointStore};
use flowstate::AppError;

async fn store() -> SqliteCheckpointStore {
    let pool = db::connect_memory().await.expect("db connect");
    SqliteCheckpointStore::new(Arc::new(pool))
}

fn suspended(sequence: u64) -> FlowCheckpoint {
    let mut checkpoint = FlowCheckpoint::new(
        FlowId::new(),
        FlowDescriptor::new("demo.echo", 1),
        InvocationContext::client("ops"),
    );
    checkpoint.status = FlowStatus::Suspended;
    checkpoint.sequence = sequence;
    checkpoint.continuation = b"{\"stage\":\"waiting\"}".to_vec();
    checkpoint.pending_request = Some(FlowIORequest::WaitForExternalEvent {
        event_key: "approval".into(),
        deadline: None,
    });
    checkpoint
}

fn advance(checkpoint: &mut FlowCheckpoint, status: FlowStatus) {
    checkpoint.sequence += 1;
    checkpoint.status = status;
    checkpoint.updated_at = Utc::now();
}

/// In-memory `connect_memory()` creates both tables.
#[tokio::test]
async fn in_memory_connect_creates_tables() {
    let pool = db::connect_memory().await.expect("in-memory connect should succeed");

    for table in ["flow_checkpoint", "parked_initiation"] {
        let query = format!("SELECT COUNT(*) AS cnt FROM {table}");
        let row: (i64,) = sqlx::query_as(&query)
            .fetch_one(&pool)
            .await
            .unwrap_or_else(|e| panic!("table '{table}' should be queryable: {e}"));
        assert_eq!(row.0, 0, "table '{table}' should start empty");
    }
}

#[tokio::test]
async fn put_then_get_returns_identical_checkpoint() {
    let store = store().await;
    let checkpoint = suspended(1);

    store.put(&checkpoint, None).await.expect("first write");
    let loaded = store
        .get(checkpoint.flow_id)
        .await
        .expect("read")
        .expect("checkpoint exists");

    assert_eq!(loaded, checkpoint);
    assert_eq!(loaded.continuation, checkpoint.continuation);
}

#[tokio::test]
async fn get_missing_flow_is_none() {
    let store = store().await;
    assert!(store.get(FlowId::new()).await.expect("read").is_none());
}

#[tokio::test]
async fn second_insert_without_prior_conflicts() {
    let store = store().await;
    let checkpoint = suspended(1);
    store.put(&checkpoint, None).await.expect("first write");

    let err = store.put(&checkpoint, None).await.expect_err("duplicate insert");
    assert!(matches!(err, AppError::ConcurrentCheckpoint(_)));
}

#[tokio::test]
async fn stale_prior_sequence_conflicts_and_keeps_stored_state() {
    let store = store().await;
    let mut checkpoint = suspended(1);
    store.put(&checkpoint, None).await.expect("first write");

    advance(&mut checkpoint, FlowStatus::Suspended);
    store.put(&checkpoint, Some(1)).await.expect("second write");

    let mut stale = checkpoint.clone();
    advance(&mut stale, FlowStatus::Completed);
    let err = store.put(&stale, Some(1)).await.expect_err("stale prior");
    assert!(matches!(err, AppError::ConcurrentCheckpoint(_)));

    let loaded = store.get(checkpoint.flow_id).await.expect("read").expect("exists");
    assert_eq!(loaded.sequence, 2);
    assert_eq!(loaded.status, FlowStatus::Suspended);
}

#[tokio::test]
async fn non_advancing_sequence_is_refused() {
    let store = store().await;
    let checkpoint = suspended(3);
    store.put(&checkpoint, None).await.expect("first write");

    let err = store.put(&checkpoint, Some(3)).await.expect_err("same sequence");
    assert!(matches!(err, AppError::Db(msg) if msg.contains("does not advance")));
}

#[tokio::test]
async fn listing_separates_terminal_checkpoints() {
    let store = store().await;

    let live = suspended(1);
    store.put(&live, None).await.expect("write live");

    let mut done = suspended(1);
    store.put(&done, None).await.expect("write done");
    advance(&mut done, FlowStatus::Completed);
    done.pending_request = None;
    done.outcome = Some(FlowOutcome::Completed {
        result: Payload::text("ok"),
    });
    store.put(&done, Some(1)).await.expect("write terminal");

    let mut sick = suspended(1);
    sick.status = FlowStatus::Hospitalized;
    store.put(&sick, None).await.expect("write hospitalized");

    let non_terminal = store.list_non_terminal().await.expect("list non-terminal");
    let ids: Vec<FlowId> = non_terminal.iter().map(|c| c.flow_id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&live.flow_id));
    assert!(ids.contains(&sick.flow_id));

    let all = store.list_all().await.expect("list all");
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn delete_removes_checkpoint() {
    let store = store().await;
    let checkpoint = suspended(1);
    store.put(&checkpoint, None).await.expect("write");

    store.delete(checkpoint.flow_id).await.expect("delete");
    assert!(store.get(checkpoint.flow_id).await.expect("read").is_none());

    // A fresh insert is allowed once the row is gone.
    store.put(&checkpoint, None).await.expect("rewrite");
}

#[tokio::test]
async fn purge_removes_only_old_terminal_checkpoints() {
    let store = store().await;

    let mut old_done = suspended(1);
    old_done.status = FlowStatus::Failed;
    old_done.updated_at = Utc::now() - Duration::days(40);
    store.put(&old_done, None).await.expect("write old terminal");

    let mut recent_done = suspended(1);
    recent_done.status = FlowStatus::Completed;
    store.put(&recent_done, None).await.expect("write recent terminal");

    let mut old_live = suspended(1);
    old_live.updated_at = Utc::now() - Duration::days(40);
    store.put(&old_live, None).await.expect("write old live");

    let purged = retention::purge(&store, 30).await.expect("purge");
    assert_eq!(purged, 1);

    assert!(store.get(old_done.flow_id).await.expect("read").is_none());
    assert!(store.get(recent_done.flow_id).await.expect("read").is_some());
    assert!(store.get(old_live.flow_id).await.expect("read").is_some());
}

#[tokio::test]
async fn parked_initiations_round_trip_in_arrival_order() {
    let store = store().await;
    let initiate = |sender: &str| SessionMessage {
        sender: Party::new(sender),
        sender_session_id: None,
        recipient_session_id: None,
        sequence: 1,
        payload: SessionPayload::Initiate {
            flow_type: FlowDescriptor::new("settlement.confirm", 2),
            first_payload: Some(Payload::text("trade-7")),
        },
    };

    let mut first = ParkedInitiation::new(initiate("bob"), "unknown flow type".into());
    first.parked_at = Utc::now() - Duration::seconds(5);
    let second = ParkedInitiation::new(initiate("carol"), "unknown flow type".into());

    store.park_initiation(&second).await.expect("park second");
    store.park_initiation(&first).await.expect("park first");

    let parked = store.list_parked().await.expect("list parked");
    assert_eq!(parked.len(), 2);
    assert_eq!(parked[0].id, first.id);
    assert_eq!(parked[0].sender, Party::new("bob"));
    assert_eq!(parked[0].message, first.message);
    assert_eq!(parked[1].id, second.id);

    store.remove_parked(&first.id).await.expect("remove");
    let parked = store.list_parked().await.expect("list parked");
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].id, second.id);
}

#[tokio::test]
async fn file_database_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("flows.db");
    let checkpoint = suspended(1);

    {
        let pool = db::connect(&path).await.expect("file db");
        let store = SqliteCheckpointStore::new(Arc::new(pool.clone()));
        store.put(&checkpoint, None).await.expect("write");
        pool.close().await;
    }

    let pool = db::connect(&path).await.expect("reopen file db");
    let store = SqliteCheckpointStore::new(Arc::new(pool));
    let loaded = store.get(checkpoint.flow_id).await.expect("read").expect("persisted");
    assert_eq!(loaded, checkpoint);
}
