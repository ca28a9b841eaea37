//! SQLite-backed staging store, work queues and key-value tables.
//!
//! Queue messages follow lease semantics: `receive` hides a message for the
//! visibility timeout and bumps its dequeue count; `complete` deletes it;
//! `abandon` makes it visible again after a backoff; `poison` moves it to
//! `<queue>-poison`.
use super::{PendingTable, StagingStore, TableEntity, WorkQueue, MAX_TABLE_BATCH, STAGED_OBJECTS_QUEUE};
use crate::db::{self, Pool};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};
use sqlx::{Row, SqliteConnection};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// A leased queue message. Hold on to it to complete, abandon or poison it.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub queue: String,
    pub payload: String,
    pub dequeue_count: i64,
    pub pop_receipt: String,
    pub inserted_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SqliteStorage {
    pool: Pool,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_backoff`.
pub fn backoff_delay(attempt: i64, max_backoff: Duration) -> Duration {
    let exp = attempt.clamp(0, 16) as u32;
    let secs = 5_u64.saturating_mul(1_u64 << exp);
    Duration::from_secs(secs).min(max_backoff)
}

async fn insert_message(conn: &mut SqliteConnection, queue: &str, payload: &str) -> Result<String> {
    let message_id = Uuid::new_v4().to_string();
    let now = now_ms();
    sqlx::query(
        "INSERT INTO queue_messages (message_id, queue_name, payload, dequeue_count, visible_at, inserted_at) \
         VALUES (?, ?, ?, 0, ?, ?)",
    )
    .bind(&message_id)
    .bind(queue)
    .bind(payload)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(message_id)
}

impl SqliteStorage {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the storage database and apply its schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = db::init_pool(url).await?;
        db::run_storage_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Lease up to `max` visible messages from `queue`, oldest first.
    #[instrument(skip_all, fields(queue = queue))]
    pub async fn receive(
        &self,
        queue: &str,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let now = now_ms();
        let hidden_until = now + visibility_timeout.as_millis() as i64;
        let receipt = Uuid::new_v4().to_string();
        let rows = sqlx::query(
            "UPDATE queue_messages \
             SET dequeue_count = dequeue_count + 1, visible_at = ?, pop_receipt = ? \
             WHERE seq IN ( \
                 SELECT seq FROM queue_messages \
                 WHERE queue_name = ? AND visible_at <= ? \
                 ORDER BY visible_at ASC, seq ASC LIMIT ? \
             ) \
             RETURNING seq, message_id, payload, dequeue_count, inserted_at",
        )
        .bind(hidden_until)
        .bind(&receipt)
        .bind(queue)
        .bind(now)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut leased: Vec<(i64, ReceivedMessage)> = rows
            .into_iter()
            .map(|row| {
                let inserted_ms: i64 = row.get("inserted_at");
                let message = ReceivedMessage {
                    message_id: row.get("message_id"),
                    queue: queue.to_string(),
                    payload: row.get("payload"),
                    dequeue_count: row.get("dequeue_count"),
                    pop_receipt: receipt.clone(),
                    inserted_at: Utc
                        .timestamp_millis_opt(inserted_ms)
                        .single()
                        .unwrap_or_else(Utc::now),
                };
                (row.get::<i64, _>("seq"), message)
            })
            .collect();
        leased.sort_by_key(|(seq, _)| *seq);
        if !leased.is_empty() {
            debug!(count = leased.len(), "leased messages");
        }
        Ok(leased.into_iter().map(|(_, m)| m).collect())
    }

    /// Delete a leased message. Returns false when the lease was lost to
    /// another consumer.
    #[instrument(skip_all, fields(queue = %msg.queue, message_id = %msg.message_id))]
    pub async fn complete(&self, msg: &ReceivedMessage) -> Result<bool> {
        let done = sqlx::query("DELETE FROM queue_messages WHERE message_id = ? AND pop_receipt = ?")
            .bind(&msg.message_id)
            .bind(&msg.pop_receipt)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            warn!("lease expired before completion; message will be redelivered");
        }
        Ok(done.rows_affected() > 0)
    }

    /// Release a leased message so it becomes visible again after `delay`.
    #[instrument(skip_all, fields(queue = %msg.queue, message_id = %msg.message_id))]
    pub async fn abandon(&self, msg: &ReceivedMessage, delay: Duration) -> Result<bool> {
        let visible_at = now_ms() + delay.as_millis() as i64;
        let done = sqlx::query(
            "UPDATE queue_messages SET visible_at = ?, pop_receipt = NULL \
             WHERE message_id = ? AND pop_receipt = ?",
        )
        .bind(visible_at)
        .bind(&msg.message_id)
        .bind(&msg.pop_receipt)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Move a leased message to the queue's poison queue.
    #[instrument(skip_all, fields(queue = %msg.queue, message_id = %msg.message_id))]
    pub async fn poison(&self, msg: &ReceivedMessage) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE queue_messages SET queue_name = ?, visible_at = ?, pop_receipt = NULL \
             WHERE message_id = ? AND pop_receipt = ?",
        )
        .bind(poison_queue(&msg.queue))
        .bind(now_ms())
        .bind(&msg.message_id)
        .bind(&msg.pop_receipt)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Messages in `queue`, visible or leased.
    pub async fn depth(&self, queue: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Messages in `queue` a consumer could lease right now.
    pub async fn visible_depth(&self, queue: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_messages WHERE queue_name = ? AND visible_at <= ?",
        )
        .bind(queue)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Per-queue message counts, including poison queues.
    pub async fn queue_depths(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT queue_name, COUNT(*) AS depth FROM queue_messages GROUP BY queue_name ORDER BY queue_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("queue_name"), row.get("depth")))
            .collect())
    }

    /// Per-container object counts.
    pub async fn container_sizes(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT container, COUNT(*) AS objects FROM staged_objects GROUP BY container ORDER BY container",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("container"), row.get("objects")))
            .collect())
    }
}

pub fn poison_queue(queue: &str) -> String {
    format!("{queue}-poison")
}

#[async_trait]
impl StagingStore for SqliteStorage {
    #[instrument(skip_all, fields(container = container, name = name))]
    async fn write(
        &self,
        container: &str,
        name: &str,
        payload: Vec<u8>,
        overwrite: bool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let sql = if overwrite {
            "INSERT INTO staged_objects (container, name, payload, written_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(container, name) DO UPDATE SET payload = excluded.payload, written_at = excluded.written_at"
        } else {
            "INSERT INTO staged_objects (container, name, payload, written_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(container, name) DO NOTHING"
        };
        let written = sqlx::query(sql)
            .bind(container)
            .bind(name)
            .bind(&payload)
            .bind(now_ms())
            .execute(&mut *tx)
            .await?;
        if written.rows_affected() == 0 {
            bail!("object {container}/{name} already exists");
        }

        let notification = json!({ "container": container, "name": name }).to_string();
        insert_message(&mut *tx, STAGED_OBJECTS_QUEUE, &notification).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read(&self, container: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let payload: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT payload FROM staged_objects WHERE container = ? AND name = ?")
                .bind(container)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(payload)
    }

    async fn list(&self, container: &str) -> Result<Vec<String>> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM staged_objects WHERE container = ? ORDER BY name")
                .bind(container)
                .fetch_all(&self.pool)
                .await?;
        Ok(names)
    }
}

#[async_trait]
impl WorkQueue for SqliteStorage {
    #[instrument(skip_all, fields(queue = queue))]
    async fn send(&self, queue: &str, payload: &Value) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_message(&mut *conn, queue, &payload.to_string()).await?;
        Ok(())
    }
}

#[async_trait]
impl PendingTable for SqliteStorage {
    #[instrument(skip_all, fields(table = table, row_key = %entity.row_key))]
    async fn upsert(&self, table: &str, entity: &TableEntity) -> Result<()> {
        let properties = serde_json::to_string(&entity.properties)?;
        sqlx::query(
            "INSERT INTO table_entities (table_name, partition_key, row_key, properties, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(table_name, partition_key, row_key) \
             DO UPDATE SET properties = excluded.properties, updated_at = excluded.updated_at",
        )
        .bind(table)
        .bind(&entity.partition_key)
        .bind(&entity.row_key)
        .bind(properties)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_all(&self, table: &str) -> Result<Vec<TableEntity>> {
        let rows = sqlx::query(
            "SELECT partition_key, row_key, properties FROM table_entities \
             WHERE table_name = ? ORDER BY partition_key, row_key",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let row_key: String = row.get("row_key");
                let raw: String = row.get("properties");
                let properties: Map<String, Value> = serde_json::from_str(&raw)
                    .with_context(|| format!("entity {table}/{row_key} has corrupt properties"))?;
                Ok(TableEntity {
                    partition_key: row.get("partition_key"),
                    row_key,
                    properties,
                })
            })
            .collect()
    }

    #[instrument(skip_all, fields(table = table, count = entities.len()))]
    async fn delete_batch(&self, table: &str, entities: &[TableEntity]) -> Result<()> {
        if entities.len() > MAX_TABLE_BATCH {
            bail!(
                "batch of {} entities exceeds the limit of {MAX_TABLE_BATCH}",
                entities.len()
            );
        }
        let Some(first) = entities.first() else {
            return Ok(());
        };
        if entities.iter().any(|e| e.partition_key != first.partition_key) {
            return Err(anyhow!("batch spans more than one partition"));
        }

        let mut tx = self.pool.begin().await?;
        for entity in entities {
            sqlx::query(
                "DELETE FROM table_entities WHERE table_name = ? AND partition_key = ? AND row_key = ?",
            )
            .bind(table)
            .bind(&entity.partition_key)
            .bind(&entity.row_key)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
