//! Update tracker: turns the upstream change feed into show refreshes now and
//! a durable backlog of season/episode refreshes for later.
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::Collaborators;
use crate::config::{Containers, Queues, Tables};
use crate::error::{SyncError, SyncResult};
use crate::model::{names, parse_id, PendingUpdateEntry, Period, WorkItem, PENDING_PARTITION};
use crate::storage::{write_json, PendingTable, StagingStore, TableEntity, WorkQueue, MAX_TABLE_BATCH};
use crate::tvmaze::CatalogClient;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordReport {
    pub enqueued: usize,
    pub recorded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub entries: usize,
    pub enqueued: usize,
    pub enqueue_failed: usize,
    pub deleted: usize,
}

#[derive(Clone)]
pub struct UpdateTracker {
    catalog: Arc<dyn CatalogClient>,
    store: Arc<dyn StagingStore>,
    queue: Arc<dyn WorkQueue>,
    table: Arc<dyn PendingTable>,
    updates_container: String,
    show_upsert_container: String,
    shows_update_queue: String,
    seasons_episodes_queue: String,
    pending_table: String,
}

impl UpdateTracker {
    pub fn new(
        deps: &Collaborators,
        containers: &Containers,
        queues: &Queues,
        tables: &Tables,
    ) -> Self {
        Self {
            catalog: deps.catalog.clone(),
            store: deps.store.clone(),
            queue: deps.queue.clone(),
            table: deps.table.clone(),
            updates_container: containers.updates.clone(),
            show_upsert_container: containers.show_upsert.clone(),
            shows_update_queue: queues.shows_update.clone(),
            seasons_episodes_queue: queues.seasons_episodes.clone(),
            pending_table: tables.seasons_episodes_update.clone(),
        }
    }

    /// Stage the change feed for `period` whole. Returns how many shows changed.
    #[instrument(skip(self))]
    pub async fn sweep_changes(&self, period: Period) -> SyncResult<usize> {
        let changes = self
            .catalog
            .changes(period)
            .await
            .map_err(SyncError::Upstream)?;
        if changes.is_empty() {
            info!(%period, "no upstream changes");
            return Ok(0);
        }
        let name = names::updates(period);
        write_json(self.store.as_ref(), &self.updates_container, &name, &changes)
            .await
            .map_err(SyncError::Storage)?;
        info!(%period, shows = changes.len(), name = %name, "staged change feed");
        Ok(changes.len())
    }

    /// For every `{show_id: changed_at}` pair: enqueue a show refresh and
    /// record a pending season/episode refresh. The two effects are
    /// independent, and a failure for one show does not stop the others.
    #[instrument(skip_all)]
    pub async fn record_pending_updates(&self, payload: &[u8]) -> SyncResult<RecordReport> {
        let changes: Map<String, Value> = serde_json::from_slice(payload)?;
        let mut report = RecordReport::default();
        for (key, changed_at) in &changes {
            let show_id = parse_id(Some(&Value::String(key.clone())));
            let (Some(show_id), Some(last_updated)) = (show_id, changed_at.as_i64()) else {
                warn!(key = %key, value = %changed_at, "skipping malformed change entry");
                report.skipped += 1;
                continue;
            };

            let item = WorkItem::Show { show_id }.to_json();
            match self.queue.send(&self.shows_update_queue, &item).await {
                Ok(()) => report.enqueued += 1,
                Err(err) => {
                    error!(show_id, ?err, "failed to enqueue show refresh");
                    report.failed += 1;
                }
            }

            let entry = PendingUpdateEntry {
                show_id,
                last_updated,
            };
            match self.table.upsert(&self.pending_table, &entry.to_entity()).await {
                Ok(()) => report.recorded += 1,
                Err(err) => {
                    error!(show_id, ?err, "failed to record pending update");
                    report.failed += 1;
                }
            }
        }
        info!(
            enqueued = report.enqueued,
            recorded = report.recorded,
            failed = report.failed,
            "recorded pending updates"
        );
        Ok(report)
    }

    /// Fetch a show's current details and stage them for the show applier.
    /// Seasons and episodes are left to the backlog drain.
    #[instrument(skip(self))]
    pub async fn refresh_show_details(&self, show_id: i64) -> SyncResult<bool> {
        let show = self
            .catalog
            .show_details(show_id, &[])
            .await
            .map_err(SyncError::Upstream)?;
        let Some(show) = show else {
            warn!(show_id, "show not found upstream");
            return Ok(false);
        };
        write_json(
            self.store.as_ref(),
            &self.show_upsert_container,
            &names::show(show_id),
            &show,
        )
        .await
        .map_err(SyncError::Storage)?;
        info!(show_id, "staged refreshed show");
        Ok(true)
    }

    /// Turn every pending entry into a seasons/episodes refresh message, then
    /// delete the entries whose message was sent, [`MAX_TABLE_BATCH`] at a time.
    ///
    /// An entry whose send failed stays for the next drain. A failed delete
    /// stops the drain and propagates; the entries of that batch and later
    /// batches are drained again next time, which only repeats idempotent work.
    #[instrument(skip(self))]
    pub async fn drain_season_episode_backlog(&self) -> SyncResult<DrainReport> {
        let entities = self
            .table
            .list_all(&self.pending_table)
            .await
            .map_err(SyncError::Storage)?;
        let mut report = DrainReport {
            entries: entities.len(),
            ..Default::default()
        };
        if entities.is_empty() {
            info!("no shows pending season/episode refresh");
            return Ok(report);
        }

        let mut drained: Vec<TableEntity> = Vec::with_capacity(entities.len());
        for entity in entities {
            if entity.partition_key != PENDING_PARTITION {
                continue;
            }
            let Some(entry) = PendingUpdateEntry::from_entity(&entity) else {
                warn!(row_key = %entity.row_key, "discarding malformed pending entry");
                drained.push(entity);
                continue;
            };
            let item = WorkItem::Show {
                show_id: entry.show_id,
            }
            .to_json();
            match self.queue.send(&self.seasons_episodes_queue, &item).await {
                Ok(()) => {
                    report.enqueued += 1;
                    drained.push(entity);
                }
                Err(err) => {
                    error!(show_id = entry.show_id, ?err, "failed to enqueue backlog refresh");
                    report.enqueue_failed += 1;
                }
            }
        }

        for batch in drained.chunks(MAX_TABLE_BATCH) {
            self.table
                .delete_batch(&self.pending_table, batch)
                .await
                .map_err(SyncError::Storage)?;
            report.deleted += batch.len();
        }
        info!(
            entries = report.entries,
            enqueued = report.enqueued,
            deleted = report.deleted,
            "drained season/episode backlog"
        );
        Ok(report)
    }
}
