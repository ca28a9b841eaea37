//! Trigger entry points: inbound requests, queue messages, staged objects and
//! timers, routed to the pipeline by configured container and queue name.
//!
//! Queue and object handlers return `Err` only for errors worth redelivering.
//! Everything else (malformed payloads, validation failures, unknown
//! sources) is logged and treated as handled.
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::config::{Config, Containers, Queues};
use crate::error::{SyncError, SyncResult};
use crate::model::{Period, WorkItem};
use crate::pipeline::{ApplyOutcome, CrawlStart, Pipeline};
use crate::storage::StagingStore;

/// Status and message returned to a request trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerResponse {
    pub status: u16,
    pub message: String,
}

impl TriggerResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self::with_status(200, message)
    }

    pub fn accepted(message: impl Into<String>) -> Self {
        Self::with_status(202, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::with_status(400, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::with_status(500, message)
    }

    fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl fmt::Display for TriggerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    SweepChanges,
    DrainBacklog,
}

/// Notification the staging store emits for every write.
#[derive(Debug, Deserialize)]
struct StagedObjectEvent {
    container: String,
    name: String,
}

pub struct Handlers {
    pipeline: Arc<Pipeline>,
    store: Arc<dyn StagingStore>,
    containers: Containers,
    queues: Queues,
    sweep_period: Period,
}

/// Log and swallow what redelivery cannot fix; pass the rest on.
fn settle<T>(source: &str, result: SyncResult<T>) -> SyncResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if !err.is_retryable() => {
            warn!(source, %err, "dropping input");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

impl Handlers {
    pub fn new(cfg: &Config, pipeline: Arc<Pipeline>, store: Arc<dyn StagingStore>) -> Self {
        Self {
            pipeline,
            store,
            containers: cfg.storage.containers.clone(),
            queues: cfg.storage.queues.clone(),
            sweep_period: cfg.sweep_period(),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    // ---- request triggers ----

    /// Start a full crawl at `page` (default 0).
    pub async fn start_full_sync(&self, page: Option<&str>) -> TriggerResponse {
        let page = match page.map(str::trim) {
            None | Some("") => 0,
            Some(raw) => match raw.parse::<i64>() {
                Ok(page) if page >= 0 => page,
                _ => {
                    return TriggerResponse::bad_request(format!(
                        "page must be a non-negative integer, got '{raw}'"
                    ))
                }
            },
        };
        match self.pipeline.walker.start_full_sync(page).await {
            Ok(()) => TriggerResponse::accepted(format!("full sync started at page {page}")),
            Err(err @ SyncError::Validation(_)) => TriggerResponse::bad_request(err.to_string()),
            Err(err) => {
                error!(?err, "failed to start full sync");
                TriggerResponse::failed(format!("failed to start full sync: {err}"))
            }
        }
    }

    pub async fn start_seasons_episodes_crawl(&self) -> TriggerResponse {
        match self.pipeline.fanout.begin_full_crawl().await {
            Ok(CrawlStart::Staged(shows)) => TriggerResponse::accepted(format!(
                "seasons/episodes crawl started for {shows} shows"
            )),
            Ok(CrawlStart::NoWork) => TriggerResponse::ok("no shows in the catalog"),
            Err(err) => {
                error!(?err, "failed to start seasons/episodes crawl");
                TriggerResponse::failed(format!("failed to start seasons/episodes crawl: {err}"))
            }
        }
    }

    /// Sweep the change feed for `since` (default `day`).
    pub async fn sweep_changes(&self, since: Option<&str>) -> TriggerResponse {
        let period = match since.map(str::trim) {
            None | Some("") => Period::Day,
            Some(raw) => match raw.parse::<Period>() {
                Ok(period) => period,
                Err(err) => return TriggerResponse::bad_request(err.to_string()),
            },
        };
        match self.pipeline.tracker.sweep_changes(period).await {
            Ok(shows) => TriggerResponse::accepted(format!(
                "change sweep for {period} staged {shows} shows"
            )),
            Err(err) => {
                error!(?err, %period, "change sweep failed");
                TriggerResponse::failed(format!("change sweep failed: {err}"))
            }
        }
    }

    // ---- timer triggers ----

    #[instrument(skip(self))]
    pub async fn on_timer(&self, timer: Timer) -> SyncResult<()> {
        match timer {
            Timer::SweepChanges => {
                self.pipeline.tracker.sweep_changes(self.sweep_period).await?;
            }
            Timer::DrainBacklog => {
                self.pipeline.tracker.drain_season_episode_backlog().await?;
            }
        }
        Ok(())
    }

    // ---- queue triggers ----

    /// Route a work queue message by queue name.
    #[instrument(skip(self, payload))]
    pub async fn handle_queue_message(&self, queue: &str, payload: &[u8]) -> SyncResult<()> {
        let item = match WorkItem::from_slice(payload) {
            Ok(item) => item,
            Err(err) => {
                warn!(%err, "dropping malformed queue message");
                return Ok(());
            }
        };

        let pipeline = &self.pipeline;
        match item {
            WorkItem::Page { page } if queue == self.queues.shows => {
                settle(queue, pipeline.walker.process_page(page).await)
            }
            WorkItem::Show { show_id } if queue == self.queues.seasons_episodes => {
                settle(queue, pipeline.fanout.fetch_show_with_embeds(show_id).await)
            }
            WorkItem::Show { show_id } if queue == self.queues.shows_update => {
                settle(queue, pipeline.tracker.refresh_show_details(show_id).await)
            }
            other => {
                warn!(?other, "message does not belong on this queue; dropping");
                Ok(())
            }
        }
    }

    // ---- staged-object triggers ----

    /// Handle a `{container, name}` notification from the staging store.
    pub async fn handle_notification(&self, payload: &[u8]) -> SyncResult<()> {
        let event: StagedObjectEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(%err, "dropping malformed staged-object notification");
                return Ok(());
            }
        };
        self.handle_staged_object(&event.container, &event.name).await
    }

    /// Read a staged object and route it by container.
    #[instrument(skip(self))]
    pub async fn handle_staged_object(&self, container: &str, name: &str) -> SyncResult<()> {
        let payload = self
            .store
            .read(container, name)
            .await
            .map_err(SyncError::Storage)?;
        let Some(payload) = payload else {
            warn!("staged object disappeared before it was handled");
            return Ok(());
        };
        self.route_staged_object(container, &payload).await
    }

    async fn route_staged_object(&self, container: &str, payload: &[u8]) -> SyncResult<()> {
        let c = &self.containers;
        let pipeline = &self.pipeline;
        if container == c.show_stage {
            settle(container, pipeline.stager.stage_shows_from_page(payload).await)
        } else if container == c.show_upsert {
            absorb(container, pipeline.applier.apply_staged_show(payload).await)
        } else if container == c.season_upsert {
            absorb(container, pipeline.applier.apply_staged_season(payload).await)
        } else if container == c.episode_upsert {
            absorb(container, pipeline.applier.apply_staged_episode(payload).await)
        } else if container == c.show_ids {
            settle(container, pipeline.fanout.enqueue_per_show_work(payload).await)
        } else if container == c.seasons_episodes {
            settle(container, pipeline.fanout.split_and_stage(payload).await)
        } else if container == c.seasons || container == c.episodes {
            let data = match serde_json::from_slice(payload) {
                Ok(data) => data,
                Err(err) => return settle(container, Err::<(), _>(SyncError::from(err))),
            };
            let staged = if container == c.seasons {
                pipeline.fanout.stage_seasons_from_show_data(&data).await
            } else {
                pipeline.fanout.stage_episodes_from_show_data(&data).await
            };
            settle(container, staged)
        } else if container == c.updates {
            settle(container, pipeline.tracker.record_pending_updates(payload).await)
        } else {
            info!(container, "no handler for container");
            Ok(())
        }
    }
}

fn absorb(container: &str, outcome: ApplyOutcome) -> SyncResult<()> {
    if outcome != ApplyOutcome::Applied {
        warn!(container, ?outcome, "staged entity not applied");
    }
    Ok(())
}
