mod common;

use common::{show, Harness};
use serde_json::json;
use show_sync::storage::{StagingStore, WorkQueue};

#[tokio::test]
async fn full_sync_rejects_bad_pages() {
    let h = Harness::new().await;
    let runtime = h.runtime();
    let handlers = runtime.handlers();

    for bad in ["-1", "abc", "1.5"] {
        let response = handlers.start_full_sync(Some(bad)).await;
        assert_eq!(response.status, 400, "page {bad}");
        assert!(!response.is_success());
    }
    assert_eq!(h.storage.depth(&h.cfg.storage.queues.shows).await.unwrap(), 0);

    let response = handlers.start_full_sync(Some(" 4 ")).await;
    assert_eq!(response.status, 202);
    let queued = h.take_messages(&h.cfg.storage.queues.shows).await;
    assert_eq!(queued, vec![json!({"page": 4})]);
}

#[tokio::test]
async fn full_sync_defaults_to_page_zero() {
    let h = Harness::new().await;
    let response = h.runtime().handlers().start_full_sync(None).await;
    assert_eq!(response.status, 202);
    assert_eq!(response.to_string(), "202 full sync started at page 0");
    let queued = h.take_messages(&h.cfg.storage.queues.shows).await;
    assert_eq!(queued, vec![json!({"page": 0})]);
}

#[tokio::test]
async fn change_sweep_statuses() {
    let h = Harness::new().await;
    let runtime = h.runtime();
    let handlers = runtime.handlers();

    assert_eq!(handlers.sweep_changes(Some("year")).await.status, 400);

    h.catalog.set_changes(&[(8, 1_700_000_000)]).await;
    assert_eq!(handlers.sweep_changes(Some("month")).await.status, 202);
    assert_eq!(
        h.storage.list(&h.cfg.storage.containers.updates).await.unwrap(),
        vec!["updates_month.json"]
    );

    h.catalog.fail_changes().await;
    assert_eq!(handlers.sweep_changes(None).await.status, 500);
    assert!(h.catalog.calls().await.contains(&"changes:day".to_string()));
}

#[tokio::test]
async fn malformed_or_misrouted_queue_messages_are_dropped() {
    let h = Harness::new().await;
    let runtime = h.runtime();
    let handlers = runtime.handlers();
    let queues = &h.cfg.storage.queues;

    handlers
        .handle_queue_message(&queues.shows, b"not json")
        .await
        .unwrap();
    handlers
        .handle_queue_message(&queues.shows, br#"{"show_id": 3}"#)
        .await
        .unwrap();
    handlers
        .handle_queue_message(&queues.seasons_episodes, br#"{"page": 3}"#)
        .await
        .unwrap();
    handlers
        .handle_queue_message("somewhere-else", br#"{"page": 0}"#)
        .await
        .unwrap();
    handlers
        .handle_queue_message(&queues.shows, br#"{"page": -1}"#)
        .await
        .unwrap();

    assert!(h.catalog.calls().await.is_empty());
}

#[tokio::test]
async fn upstream_failure_on_a_queue_message_is_retryable() {
    let h = Harness::new().await;
    h.catalog.fail_page(2).await;
    let runtime = h.runtime();

    let err = runtime
        .handlers()
        .handle_queue_message(&h.cfg.storage.queues.shows, br#"{"page": 2}"#)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn notifications_route_by_container() {
    let h = Harness::new().await;
    let runtime = h.runtime();
    let handlers = runtime.handlers();
    let containers = &h.cfg.storage.containers;

    handlers.handle_notification(b"{}").await.unwrap();
    handlers.handle_notification(b"garbage").await.unwrap();
    handlers
        .handle_staged_object("unknown-container", "x.json")
        .await
        .unwrap();
    // Object vanished between notification and handling.
    handlers
        .handle_staged_object(&containers.show_upsert, "tv_show_1.json")
        .await
        .unwrap();

    let payload = serde_json::to_vec(&show(5)).unwrap();
    h.storage
        .write(&containers.show_upsert, "tv_show_5.json", payload, true)
        .await
        .unwrap();
    let event = json!({ "container": containers.show_upsert, "name": "tv_show_5.json" });
    handlers
        .handle_notification(&serde_json::to_vec(&event).unwrap())
        .await
        .unwrap();
    assert_eq!(h.scalar("SELECT COUNT(*) FROM shows WHERE id = 5").await, 1);
}

#[tokio::test]
async fn invalid_staged_objects_are_dropped_not_retried() {
    let h = Harness::new().await;
    let runtime = h.runtime();
    let handlers = runtime.handlers();
    let containers = &h.cfg.storage.containers;

    for (container, body) in [
        (&containers.show_stage, &b"{\"not\": \"a list\"}"[..]),
        (&containers.show_upsert, &b"[]"[..]),
        (&containers.seasons, &b"not json"[..]),
        (&containers.updates, &b"[1, 2]"[..]),
    ] {
        h.storage
            .write(container, "bad.json", body.to_vec(), true)
            .await
            .unwrap();
        handlers
            .handle_staged_object(container, "bad.json")
            .await
            .unwrap();
    }
    assert_eq!(h.scalar("SELECT COUNT(*) FROM shows").await, 0);
}

#[tokio::test]
async fn queue_handled_by_runtime_is_emptied() {
    let h = Harness::new().await;
    let runtime = h.runtime();
    let queue = &h.cfg.storage.queues.shows_update;
    h.storage.send(queue, &json!({"show_id": 77})).await.unwrap();

    runtime.run_until_idle().await.unwrap();

    assert_eq!(h.storage.depth(queue).await.unwrap(), 0);
    assert!(h
        .catalog
        .calls()
        .await
        .contains(&"show_details:77:0".to_string()));
}
