//! Storage primitives the pipeline runs on: a staging store for transit
//! objects, work queues, and a key-value table for the refresh backlog.
//!
//! The pipeline only sees the traits below. `sqlite` provides the backend the
//! binaries and tests use.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

pub mod sqlite;

pub use sqlite::{ReceivedMessage, SqliteStorage};

/// Queue the staging store notifies with `{container, name}` on every write.
pub const STAGED_OBJECTS_QUEUE: &str = "staged-objects";
/// Largest number of entities a single `delete_batch` call accepts.
pub const MAX_TABLE_BATCH: usize = 100;

/// Named-object store. Objects are overwritten in place and never deleted by
/// the pipeline.
#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn write(
        &self,
        container: &str,
        name: &str,
        payload: Vec<u8>,
        overwrite: bool,
    ) -> Result<()>;

    async fn read(&self, container: &str, name: &str) -> Result<Option<Vec<u8>>>;

    async fn list(&self, container: &str) -> Result<Vec<String>>;
}

/// At-least-once message queue. Redelivery is the queue's business.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn send(&self, queue: &str, payload: &Value) -> Result<()>;
}

/// One row of a key-value table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableEntity {
    pub partition_key: String,
    pub row_key: String,
    pub properties: Map<String, Value>,
}

#[async_trait]
pub trait PendingTable: Send + Sync {
    /// Insert or replace the entity with the same partition and row key.
    async fn upsert(&self, table: &str, entity: &TableEntity) -> Result<()>;

    /// Every entity in the table. A table that was never written is empty.
    async fn list_all(&self, table: &str) -> Result<Vec<TableEntity>>;

    /// Delete up to [`MAX_TABLE_BATCH`] entities of one partition atomically.
    async fn delete_batch(&self, table: &str, entities: &[TableEntity]) -> Result<()>;
}

/// Serialize `value` and stage it with overwrite enabled.
pub async fn write_json<T>(store: &dyn StagingStore, container: &str, name: &str, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(value)?;
    store.write(container, name, payload, true).await
}
