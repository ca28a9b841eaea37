//! Seasons/episodes fan-out.
//!
//! Crawl start stages every known show id; the ids object fans out into one
//! queue message per show; each message fetches the show with its seasons and
//! episodes embedded and stages it whole; the whole-show object is split into
//! per-entity objects by the season and episode stagers.
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::{Collaborators, EntityStager};
use crate::config::{Containers, Queues};
use crate::db::{self, Pool};
use crate::error::{SyncError, SyncResult};
use crate::model::{names, parse_id, EntityKind, WorkItem, SHOW_IDS_OBJECT};
use crate::storage::{write_json, StagingStore, WorkQueue};
use crate::tvmaze::{CatalogClient, Embed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlStart {
    /// This many show ids were staged.
    Staged(usize),
    /// The catalog holds no shows yet.
    NoWork,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub enqueued: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitReport {
    pub seasons: usize,
    pub episodes: usize,
}

#[derive(Clone)]
pub struct FanOut {
    pool: Pool,
    catalog: Arc<dyn CatalogClient>,
    store: Arc<dyn StagingStore>,
    queue: Arc<dyn WorkQueue>,
    stager: EntityStager,
    ids_container: String,
    shows_container: String,
    seasons_episodes_queue: String,
}

impl FanOut {
    pub fn new(
        deps: &Collaborators,
        stager: EntityStager,
        containers: &Containers,
        queues: &Queues,
    ) -> Self {
        Self {
            pool: deps.pool.clone(),
            catalog: deps.catalog.clone(),
            store: deps.store.clone(),
            queue: deps.queue.clone(),
            stager,
            ids_container: containers.show_ids.clone(),
            shows_container: containers.seasons_episodes.clone(),
            seasons_episodes_queue: queues.seasons_episodes.clone(),
        }
    }

    /// Stage the id of every show in the catalog as one list.
    #[instrument(skip(self))]
    pub async fn begin_full_crawl(&self) -> SyncResult<CrawlStart> {
        let ids = db::all_show_ids(&self.pool).await?;
        if ids.is_empty() {
            info!("no shows in the catalog; nothing to crawl");
            return Ok(CrawlStart::NoWork);
        }
        write_json(self.store.as_ref(), &self.ids_container, SHOW_IDS_OBJECT, &ids)
            .await
            .map_err(SyncError::Storage)?;
        info!(shows = ids.len(), "staged show ids for seasons/episodes crawl");
        Ok(CrawlStart::Staged(ids.len()))
    }

    /// Enqueue one `{show_id}` message per id in a staged id list. Each send
    /// is independent: a failure is logged and the rest proceed.
    #[instrument(skip_all)]
    pub async fn enqueue_per_show_work(&self, payload: &[u8]) -> SyncResult<FanOutReport> {
        let ids: Vec<Value> = serde_json::from_slice(payload)?;
        let mut report = FanOutReport::default();
        for raw in &ids {
            let Some(show_id) = parse_id(Some(raw)) else {
                warn!(value = %raw, "skipping invalid show id");
                report.skipped += 1;
                continue;
            };
            let item = WorkItem::Show { show_id }.to_json();
            match self.queue.send(&self.seasons_episodes_queue, &item).await {
                Ok(()) => report.enqueued += 1,
                Err(err) => {
                    error!(show_id, ?err, "failed to enqueue seasons/episodes work");
                    report.failed += 1;
                }
            }
        }
        info!(
            enqueued = report.enqueued,
            failed = report.failed,
            skipped = report.skipped,
            "fanned out per-show work"
        );
        Ok(report)
    }

    /// Fetch a show with seasons and episodes embedded and stage it whole.
    /// Returns false when upstream has no such show.
    #[instrument(skip(self))]
    pub async fn fetch_show_with_embeds(&self, show_id: i64) -> SyncResult<bool> {
        let show = self
            .catalog
            .show_details(show_id, &[Embed::Seasons, Embed::Episodes])
            .await
            .map_err(SyncError::Upstream)?;
        let Some(show) = show else {
            warn!(show_id, "show not found upstream");
            return Ok(false);
        };
        write_json(
            self.store.as_ref(),
            &self.shows_container,
            &names::show(show_id),
            &show,
        )
        .await
        .map_err(SyncError::Storage)?;
        info!(show_id, "staged show with seasons and episodes");
        Ok(true)
    }

    /// Route the embedded seasons and episodes of a staged whole show to
    /// their stagers.
    #[instrument(skip_all)]
    pub async fn split_and_stage(&self, payload: &[u8]) -> SyncResult<SplitReport> {
        let show: Value = serde_json::from_slice(payload)?;
        Ok(SplitReport {
            seasons: self.stage_seasons_from_show_data(&show).await?,
            episodes: self.stage_episodes_from_show_data(&show).await?,
        })
    }

    pub async fn stage_seasons_from_show_data(&self, show_data: &Value) -> SyncResult<usize> {
        self.stage_children(show_data, EntityKind::Season).await
    }

    pub async fn stage_episodes_from_show_data(&self, show_data: &Value) -> SyncResult<usize> {
        self.stage_children(show_data, EntityKind::Episode).await
    }

    /// Accepts either a whole show (`{id, _embedded: {<plural>: [...]}}`) or a
    /// standalone list (`{show_id, <plural>: [...]}`).
    async fn stage_children(&self, show_data: &Value, kind: EntityKind) -> SyncResult<usize> {
        let Some(data) = show_data.as_object() else {
            return Err(SyncError::validation(format!(
                "{} payload must be a JSON object",
                kind.plural()
            )));
        };

        if let Some(list) = data.get(kind.plural()).and_then(Value::as_array) {
            let show_id = parse_id(data.get("show_id"));
            return self.stager.stage_all(show_id, kind, list).await;
        }

        let show_id = parse_id(data.get("id")).ok_or_else(|| {
            SyncError::validation(format!("show payload for {} has no id", kind.plural()))
        })?;
        match embedded(data, kind) {
            Some(list) if !list.is_empty() => self.stager.stage_all(Some(show_id), kind, list).await,
            _ => {
                debug!(show_id, "no embedded {}", kind.plural());
                Ok(0)
            }
        }
    }
}

fn embedded<'a>(show: &'a Map<String, Value>, kind: EntityKind) -> Option<&'a Vec<Value>> {
    show.get("_embedded")?.get(kind.plural())?.as_array()
}
