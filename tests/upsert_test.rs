mod common;

use common::setup_pool;
use serde_json::json;
use show_sync::pipeline::{ApplyOutcome, UpsertApplier};
use sqlx::Row;

fn bytes(value: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&value).unwrap()
}

#[tokio::test]
async fn applying_the_same_show_repeatedly_keeps_one_row() {
    let pool = setup_pool().await;
    let applier = UpsertApplier::new(pool.clone());
    let payload = bytes(json!({
        "id": 1,
        "name": "Under the Dome",
        "genres": ["Drama", "Science-Fiction"],
        "schedule": { "time": "22:00", "days": ["Thursday"] },
        "weight": 97
    }));

    for _ in 0..3 {
        assert_eq!(applier.apply_staged_show(&payload).await, ApplyOutcome::Applied);
    }

    let rows = sqlx::query("SELECT id, name, genres, schedule, weight FROM shows")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.get::<String, _>("name"), "Under the Dome");
    assert_eq!(row.get::<String, _>("genres"), r#"["Drama","Science-Fiction"]"#);
    let schedule: serde_json::Value =
        serde_json::from_str(&row.get::<String, _>("schedule")).unwrap();
    assert_eq!(schedule["days"][0], "Thursday");
    assert_eq!(row.get::<i64, _>("weight"), 97);
}

#[tokio::test]
async fn last_applied_version_wins() {
    let pool = setup_pool().await;
    let applier = UpsertApplier::new(pool.clone());
    let _ = applier
        .apply_staged_show(&bytes(json!({"id": 3, "name": "Old", "status": "Running"})))
        .await;
    let _ = applier
        .apply_staged_show(&bytes(json!({"id": 3, "name": "New", "status": "Ended"})))
        .await;
    let row = sqlx::query("SELECT name, status FROM shows WHERE id = 3")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("name"), "New");
    assert_eq!(row.get::<String, _>("status"), "Ended");
}

#[tokio::test]
async fn envelope_show_id_overrides_embedded_value() {
    let pool = setup_pool().await;
    let applier = UpsertApplier::new(pool.clone());
    let season = bytes(json!({
        "show_id": 7,
        "season": { "id": 20, "show_id": 99, "number": 1 }
    }));
    let episode = bytes(json!({
        "show_id": 7,
        "episode": { "id": 30, "show_id": 99, "season": 1, "number": 1 }
    }));
    assert_eq!(applier.apply_staged_season(&season).await, ApplyOutcome::Applied);
    assert_eq!(applier.apply_staged_episode(&episode).await, ApplyOutcome::Applied);

    let season_show: i64 = sqlx::query_scalar("SELECT show_id FROM seasons WHERE id = 20")
        .fetch_one(&pool)
        .await
        .unwrap();
    let episode_show: i64 = sqlx::query_scalar("SELECT show_id FROM episodes WHERE id = 30")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!((season_show, episode_show), (7, 7));
}

#[tokio::test]
async fn unknown_fields_are_ignored() {
    let pool = setup_pool().await;
    let applier = UpsertApplier::new(pool.clone());
    let payload = bytes(json!({
        "id": 5,
        "name": "Lost",
        "brandNewField": { "nested": true },
        "anotherOne": 12
    }));
    assert_eq!(applier.apply_staged_show(&payload).await, ApplyOutcome::Applied);

    let columns: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info('shows')")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert!(!columns.iter().any(|c| c == "brandNewField" || c == "anotherOne"));
    let name: String = sqlx::query_scalar("SELECT name FROM shows WHERE id = 5")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(name, "Lost");
}

#[tokio::test]
async fn invalid_envelopes_write_nothing() {
    let pool = setup_pool().await;
    let applier = UpsertApplier::new(pool.clone());

    let missing_show_id = bytes(json!({ "season": { "id": 20, "number": 1 } }));
    let missing_id = bytes(json!({ "show_id": 1, "episode": { "name": "Pilot" } }));
    let show_without_id = bytes(json!({ "name": "Nameless" }));

    assert_eq!(applier.apply_staged_season(&missing_show_id).await, ApplyOutcome::Rejected);
    assert_eq!(applier.apply_staged_episode(&missing_id).await, ApplyOutcome::Rejected);
    assert_eq!(applier.apply_staged_show(&show_without_id).await, ApplyOutcome::Rejected);
    assert_eq!(applier.apply_staged_show(b"{not json").await, ApplyOutcome::Rejected);

    let total: i64 = sqlx::query_scalar(
        "SELECT (SELECT COUNT(*) FROM shows) + (SELECT COUNT(*) FROM seasons) + (SELECT COUNT(*) FROM episodes)",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn drifted_field_types_still_land_in_the_row() {
    let pool = setup_pool().await;
    let applier = UpsertApplier::new(pool.clone());
    let episode = bytes(json!({
        "show_id": 7,
        "episode": { "id": 3, "name": "Pilot", "season": 1, "number": 1, "runtime": 42.5 }
    }));
    let show = bytes(json!({ "id": 1, "name": "X", "weight": "90" }));
    assert_eq!(applier.apply_staged_episode(&episode).await, ApplyOutcome::Applied);
    assert_eq!(applier.apply_staged_show(&show).await, ApplyOutcome::Applied);

    let runtime: f64 = sqlx::query_scalar("SELECT CAST(runtime AS REAL) FROM episodes WHERE id = 3")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(runtime, 42.5);
    // Numeric text is coerced by the column's integer affinity.
    let weight: i64 = sqlx::query_scalar("SELECT weight FROM shows WHERE id = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(weight, 90);
}

#[tokio::test]
async fn relational_failures_are_absorbed() {
    let pool = setup_pool().await;
    let applier = UpsertApplier::new(pool.clone());
    sqlx::query("DROP TABLE episodes").execute(&pool).await.unwrap();

    let episode = bytes(json!({ "show_id": 1, "episode": { "id": 1, "number": 1 } }));
    assert_eq!(applier.apply_staged_episode(&episode).await, ApplyOutcome::Failed);

    // Unrelated entities keep working.
    let show = bytes(json!({ "id": 1, "name": "Still fine" }));
    assert_eq!(applier.apply_staged_show(&show).await, ApplyOutcome::Applied);

    pool.close().await;
    assert_eq!(applier.apply_staged_show(&show).await, ApplyOutcome::Failed);
}

#[tokio::test]
async fn concurrent_applies_of_one_entity_converge() {
    let pool = setup_pool().await;
    let applier = UpsertApplier::new(pool.clone());
    let payload = bytes(json!({ "show_id": 42, "season": { "id": 420, "number": 1 } }));

    let (a, b) = tokio::join!(
        applier.apply_staged_season(&payload),
        applier.apply_staged_season(&payload)
    );
    assert_eq!((a, b), (ApplyOutcome::Applied, ApplyOutcome::Applied));
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM seasons WHERE show_id = 42")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}
