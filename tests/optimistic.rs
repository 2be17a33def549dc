mod common;

use biztrack::error::{DataError, MutationKind};
use biztrack::identity::Identity;
use biztrack::live::Phase;
use biztrack::mutator::EntityLabels;
use biztrack::notify::NotificationKind;
use biztrack::remote::{Record, RemoteError};
use serde_json::json;
use uuid::Uuid;

use common::{CLIENTS, Harness, active_clients, client, wait_for};

fn labels() -> EntityLabels {
    EntityLabels::new("Client", "Clients")
}

#[tokio::test]
async fn rejected_update_restores_exact_previous_entry() {
    let harness = Harness::new();
    harness
        .remote
        .seed(CLIENTS, [client("a", "Ann"), client("b", "Ben")]);
    let query = harness.layer.open(active_clients(2));
    wait_for(&query, |s| s.phase == Phase::Streaming).await;

    let key = query.descriptor().expect("descriptor").cache_key();
    let before = harness.cache.get(&key).await.expect("first page cached");
    let mutator = harness.layer.mutator(query.handle(), labels());

    harness
        .remote
        .fail_next_mutation(RemoteError::PermissionDenied("rules".to_string()));
    let renamed = Record::from_json("a", json!({"clientName": "Ann Renamed", "status": "Active"}));
    let err = mutator.update(renamed).await.expect_err("update rejected");

    assert_eq!(
        err,
        DataError::mutation(
            MutationKind::Update,
            "a",
            RemoteError::PermissionDenied("rules".to_string())
        )
    );
    assert_eq!(harness.cache.get(&key).await, Some(before));
    assert_eq!(
        harness
            .remote
            .document(CLIENTS, "a")
            .and_then(|r| r.field("clientName").cloned()),
        Some(json!("Ann"))
    );

    let toasts = harness.toasts.pending();
    let last = toasts.last().expect("failure toast");
    assert_eq!(last.kind, NotificationKind::Error);
    assert_eq!(last.title, "Failed to update client");
}

#[tokio::test]
async fn accepted_update_is_staged_then_confirmed() {
    let harness = Harness::new();
    harness
        .remote
        .seed(CLIENTS, [client("a", "Ann"), client("b", "Ben")]);
    let query = harness.layer.open(active_clients(2));
    wait_for(&query, |s| s.phase == Phase::Streaming).await;
    let key = query.descriptor().expect("descriptor").cache_key();
    let mutator = harness.layer.mutator(query.handle(), labels());

    let renamed = Record::from_json("a", json!({"clientName": "Ann Renamed", "status": "Active"}));
    mutator.update(renamed.clone()).await.expect("update");

    let staged = harness.cache.get(&key).await.expect("staged entry");
    assert_eq!(staged.data.first(), Some(&renamed));

    let state = wait_for(&query, |s| {
        s.phase == Phase::Streaming
            && s.items
                .first()
                .and_then(|r| r.field("clientName"))
                .is_some_and(|name| name == "Ann Renamed")
    })
    .await;
    assert_eq!(state.ids(), ["a", "b"]);

    let toasts = harness.toasts.pending();
    assert_eq!(
        toasts.last().map(|t| t.title.as_str()),
        Some("Client updated")
    );
}

#[tokio::test]
async fn delete_removes_record_from_view_and_store() {
    let harness = Harness::new();
    harness.remote.seed(
        CLIENTS,
        [client("a", "Ann"), client("b", "Ben"), client("c", "Cy")],
    );
    let query = harness.layer.open(active_clients(2));
    wait_for(&query, |s| s.phase == Phase::Streaming).await;
    let mutator = harness.layer.mutator(query.handle(), labels());

    mutator.delete("a").await.expect("delete");

    assert!(harness.remote.document(CLIENTS, "a").is_none());
    let state = wait_for(&query, |s| {
        s.phase == Phase::Streaming && s.items.first().is_some_and(|r| r.id == "b")
    })
    .await;
    assert_eq!(state.ids(), ["b", "c"]);
}

#[tokio::test]
async fn add_generates_ids_and_refreshes_view() {
    let harness = Harness::new();
    let query = harness.layer.open(active_clients(5));
    wait_for(&query, |s| s.phase == Phase::Streaming).await;
    let mutator = harness.layer.mutator(query.handle(), labels());

    let id = mutator.add(client("", "Ann")).await.expect("add");
    assert!(Uuid::parse_str(&id).is_ok());
    assert!(harness.remote.document(CLIENTS, &id).is_some());

    let kept = mutator.add(client("chosen", "Ben")).await.expect("add");
    assert_eq!(kept, "chosen");

    let state = wait_for(&query, |s| s.items.len() == 2).await;
    assert_eq!(state.ids(), [id.as_str(), "chosen"]);
}

#[tokio::test]
async fn bulk_add_is_split_into_store_sized_batches() {
    let harness = Harness::new();
    let query = harness.layer.open(active_clients(10));
    wait_for(&query, |s| s.phase == Phase::Streaming).await;
    let mutator = harness.layer.mutator(query.handle(), labels());

    let records: Vec<Record> = (0..501)
        .map(|n| client("", &format!("Client {n:03}")))
        .collect();
    assert_eq!(mutator.bulk_add(records).await, Ok(501));

    assert_eq!(harness.remote.batch_commits(), 2);
    let stored = harness.remote.documents(CLIENTS);
    assert_eq!(stored.len(), 501);
    assert!(stored.iter().all(|r| Uuid::parse_str(&r.id).is_ok()));
    assert_eq!(
        harness.toasts.pending().last().map(|t| t.title.as_str()),
        Some("Clients imported")
    );
}

#[tokio::test]
async fn bulk_update_and_delete_touch_only_listed_ids() {
    let harness = Harness::new();
    harness.remote.seed(
        CLIENTS,
        [client("a", "Ann"), client("b", "Ben"), client("c", "Cy")],
    );
    let query = harness.layer.open(active_clients(10));
    wait_for(&query, |s| s.phase == Phase::Streaming).await;
    let mutator = harness.layer.mutator(query.handle(), labels());

    let patch = json!({"status": "Archived"})
        .as_object()
        .cloned()
        .expect("object patch");
    let ids = vec!["a".to_string(), "b".to_string()];
    assert_eq!(mutator.bulk_update(&ids, patch).await, Ok(2));
    assert_eq!(
        harness
            .remote
            .document(CLIENTS, "b")
            .and_then(|r| r.field("status").cloned()),
        Some(json!("Archived"))
    );
    let state = wait_for(&query, |s| s.items.len() == 1).await;
    assert_eq!(state.ids(), ["c"]);

    harness
        .remote
        .fail_next_mutation(RemoteError::Unavailable("offline".to_string()));
    let err = mutator
        .bulk_delete(&["c".to_string()])
        .await
        .expect_err("bulk delete rejected");
    assert!(matches!(
        err,
        DataError::Mutation {
            operation: MutationKind::BulkDelete,
            ..
        }
    ));
    assert!(harness.remote.document(CLIENTS, "c").is_some());
    assert_eq!(
        harness.toasts.pending().last().map(|t| t.title.as_str()),
        Some("Failed to bulk delete")
    );
}

#[tokio::test]
async fn writes_need_an_owner_and_a_live_view() {
    let harness = Harness::new();
    harness.identity.set(Identity::signed_out());
    let query = harness.layer.open(active_clients(2));
    let mutator = harness.layer.mutator(query.handle(), labels());

    assert_eq!(
        mutator.delete("a").await,
        Err(DataError::no_owner("delete"))
    );

    query.dispose();
    assert_eq!(
        mutator.update(client("a", "Ann")).await,
        Err(DataError::misuse("update"))
    );
}
