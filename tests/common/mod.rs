#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use show_sync::config::{self, Config};
use show_sync::db::{self, Pool};
use show_sync::model::{Period, RawRecord};
use show_sync::pipeline::{Collaborators, Pipeline};
use show_sync::runtime::Runtime;
use show_sync::storage::{PendingTable, SqliteStorage, TableEntity, WorkQueue};
use show_sync::tvmaze::{CatalogClient, Embed};

pub fn test_config() -> Config {
    serde_yaml::from_str(config::example()).unwrap()
}

pub async fn setup_pool() -> Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub async fn setup_storage() -> SqliteStorage {
    SqliteStorage::connect("sqlite::memory:").await.unwrap()
}

pub fn record(value: Value) -> RawRecord {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

pub fn show(id: i64) -> RawRecord {
    record(json!({
        "id": id,
        "url": format!("https://www.tvmaze.com/shows/{id}"),
        "name": format!("Show {id}"),
        "language": "English",
        "genres": ["Drama"],
        "runtime": 60,
        "rating": { "average": 7.5 },
        "updated": 1_700_000_000,
        "someFutureField": { "x": 1 }
    }))
}

pub fn season(id: i64, number: i64) -> Value {
    json!({ "id": id, "number": number, "name": "", "episodeOrder": 10 })
}

pub fn episode(id: i64, season: i64, number: i64) -> Value {
    json!({
        "id": id,
        "name": format!("Episode {number}"),
        "season": season,
        "number": number,
        "airdate": "2013-06-24",
        "rating": { "average": null }
    })
}

pub fn show_with_embeds(id: i64, seasons: Vec<Value>, episodes: Vec<Value>) -> RawRecord {
    let mut s = show(id);
    s.insert(
        "_embedded".into(),
        json!({ "seasons": seasons, "episodes": episodes }),
    );
    s
}

/// Catalog fake with scripted pages, shows and change feed, recording calls.
#[derive(Clone, Default)]
pub struct FakeCatalog {
    pages: Arc<Mutex<HashMap<i64, Vec<RawRecord>>>>,
    shows: Arc<Mutex<HashMap<i64, RawRecord>>>,
    changes: Arc<Mutex<BTreeMap<i64, i64>>>,
    failing_pages: Arc<Mutex<HashSet<i64>>>,
    fail_changes: Arc<Mutex<bool>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeCatalog {
    pub async fn set_page(&self, page: i64, shows: Vec<RawRecord>) {
        self.pages.lock().await.insert(page, shows);
    }

    pub async fn set_show(&self, show: RawRecord) {
        let id = show["id"].as_i64().unwrap();
        self.shows.lock().await.insert(id, show);
    }

    pub async fn set_changes(&self, changes: &[(i64, i64)]) {
        *self.changes.lock().await = changes.iter().copied().collect();
    }

    pub async fn fail_page(&self, page: i64) {
        self.failing_pages.lock().await.insert(page);
    }

    pub async fn fail_changes(&self) {
        *self.fail_changes.lock().await = true;
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl CatalogClient for FakeCatalog {
    async fn list_page(&self, page: i64) -> Result<Vec<RawRecord>> {
        self.calls.lock().await.push(format!("list_page:{page}"));
        if self.failing_pages.lock().await.contains(&page) {
            return Err(anyhow!("503 from upstream"));
        }
        Ok(self.pages.lock().await.get(&page).cloned().unwrap_or_default())
    }

    async fn show_details(&self, show_id: i64, embed: &[Embed]) -> Result<Option<RawRecord>> {
        self.calls
            .lock()
            .await
            .push(format!("show_details:{show_id}:{}", embed.len()));
        let show = self.shows.lock().await.get(&show_id).cloned();
        Ok(show.map(|mut s| {
            if embed.is_empty() {
                s.remove("_embedded");
            }
            s
        }))
    }

    async fn changes(&self, period: Period) -> Result<BTreeMap<i64, i64>> {
        self.calls.lock().await.push(format!("changes:{period}"));
        if *self.fail_changes.lock().await {
            return Err(anyhow!("timeout"));
        }
        Ok(self.changes.lock().await.clone())
    }
}

/// Pending table whose `delete_batch` fails on the given call (0-based).
pub struct FlakyTable {
    pub inner: SqliteStorage,
    pub fail_delete_call: usize,
    delete_calls: AtomicUsize,
}

impl FlakyTable {
    pub fn new(inner: SqliteStorage, fail_delete_call: usize) -> Self {
        Self {
            inner,
            fail_delete_call,
            delete_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PendingTable for FlakyTable {
    async fn upsert(&self, table: &str, entity: &TableEntity) -> Result<()> {
        self.inner.upsert(table, entity).await
    }

    async fn list_all(&self, table: &str) -> Result<Vec<TableEntity>> {
        self.inner.list_all(table).await
    }

    async fn delete_batch(&self, table: &str, entities: &[TableEntity]) -> Result<()> {
        let call = self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if call == self.fail_delete_call {
            return Err(anyhow!("table service unavailable"));
        }
        self.inner.delete_batch(table, entities).await
    }
}

/// Work queue that refuses messages for the given show ids.
pub struct FlakyQueue {
    pub inner: SqliteStorage,
    pub refused: HashSet<i64>,
}

#[async_trait]
impl WorkQueue for FlakyQueue {
    async fn send(&self, queue: &str, payload: &Value) -> Result<()> {
        if let Some(id) = payload.get("show_id").and_then(Value::as_i64) {
            if self.refused.contains(&id) {
                return Err(anyhow!("queue unavailable"));
            }
        }
        self.inner.send(queue, payload).await
    }
}

pub struct Harness {
    pub cfg: Config,
    pub pool: Pool,
    pub storage: SqliteStorage,
    pub catalog: FakeCatalog,
}

impl Harness {
    pub async fn new() -> Self {
        Self {
            cfg: test_config(),
            pool: setup_pool().await,
            storage: setup_storage().await,
            catalog: FakeCatalog::default(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        let shared = Arc::new(self.storage.clone());
        Collaborators {
            pool: self.pool.clone(),
            catalog: Arc::new(self.catalog.clone()),
            store: shared.clone(),
            queue: shared.clone(),
            table: shared,
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(&self.cfg, self.collaborators())
    }

    pub fn runtime(&self) -> Runtime {
        Runtime::new(
            self.cfg.clone(),
            self.pool.clone(),
            self.storage.clone(),
            Arc::new(self.catalog.clone()),
        )
    }

    /// Lease and return every visible payload on `queue` without handling it.
    pub async fn take_messages(&self, queue: &str) -> Vec<Value> {
        let leased = self
            .storage
            .receive(queue, 10_000, std::time::Duration::from_secs(600))
            .await
            .unwrap();
        leased
            .iter()
            .map(|m| serde_json::from_str(&m.payload).unwrap())
            .collect()
    }

    pub async fn scalar(&self, sql: &str) -> i64 {
        sqlx::query_scalar(sql).fetch_one(&self.pool).await.unwrap()
    }
}
