//! Entity stagers: split raw records into one staged object per entity.
//!
//! Names are deterministic, so re-staging the same entity overwrites the
//! previous object instead of adding a new one.
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::Containers;
use crate::error::{SyncError, SyncResult};
use crate::model::{envelope, names, parse_id, EntityKind, RawRecord};
use crate::storage::{write_json, StagingStore};

#[derive(Clone)]
pub struct EntityStager {
    store: Arc<dyn StagingStore>,
    show_upsert: String,
    season_upsert: String,
    episode_upsert: String,
}

impl EntityStager {
    pub fn new(store: Arc<dyn StagingStore>, containers: &Containers) -> Self {
        Self {
            store,
            show_upsert: containers.show_upsert.clone(),
            season_upsert: containers.season_upsert.clone(),
            episode_upsert: containers.episode_upsert.clone(),
        }
    }

    fn upsert_container(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Show => &self.show_upsert,
            EntityKind::Season => &self.season_upsert,
            EntityKind::Episode => &self.episode_upsert,
        }
    }

    /// Stage every record of `entities` as `{show_id, <kind>: record}`.
    ///
    /// A missing `show_id` or an empty list rejects the whole call. Records
    /// without a usable id are skipped. Returns how many objects were written.
    #[instrument(skip(self, entities), fields(count = entities.len()))]
    pub async fn stage_all(
        &self,
        show_id: Option<i64>,
        kind: EntityKind,
        entities: &[Value],
    ) -> SyncResult<usize> {
        let Some(show_id) = show_id else {
            return Err(SyncError::validation(format!(
                "cannot stage {} without a show_id",
                kind.plural()
            )));
        };
        if entities.is_empty() {
            return Err(SyncError::validation(format!(
                "no {} to stage for show {show_id}",
                kind.plural()
            )));
        }
        if kind == EntityKind::Show {
            return self.stage_shows(entities).await;
        }

        let container = self.upsert_container(kind);
        let mut staged = 0;
        for entity in entities {
            let Some(record) = entity.as_object() else {
                warn!(show_id, %kind, "skipping non-object record");
                continue;
            };
            let Some(entity_id) = parse_id(record.get("id")) else {
                warn!(show_id, %kind, "skipping record without an id");
                continue;
            };
            let name = names::entity(show_id, kind, entity_id);
            write_json(
                self.store.as_ref(),
                container,
                &name,
                &envelope(show_id, kind, record),
            )
            .await
            .map_err(SyncError::Storage)?;
            debug!(show_id, %kind, entity_id, "staged");
            staged += 1;
        }
        info!(show_id, %kind, staged, "staged {}", kind.plural());
        Ok(staged)
    }

    /// Stage one show as its bare attribute set. Returns the show id.
    pub async fn stage_show(&self, show: &RawRecord) -> SyncResult<i64> {
        let show_id = parse_id(show.get("id"))
            .ok_or_else(|| SyncError::validation("show record has no id"))?;
        write_json(
            self.store.as_ref(),
            &self.show_upsert,
            &names::show(show_id),
            show,
        )
        .await
        .map_err(SyncError::Storage)?;
        debug!(show_id, "staged show");
        Ok(show_id)
    }

    async fn stage_shows(&self, shows: &[Value]) -> SyncResult<usize> {
        let mut staged = 0;
        for show in shows {
            let Some(record) = show.as_object() else {
                warn!("skipping non-object show");
                continue;
            };
            match self.stage_show(record).await {
                Ok(_) => staged += 1,
                Err(err) if !err.is_retryable() => warn!(%err, "skipping show"),
                Err(err) => return Err(err),
            }
        }
        Ok(staged)
    }

    /// Stage every show of a staged page (a JSON array of shows).
    #[instrument(skip_all)]
    pub async fn stage_shows_from_page(&self, payload: &[u8]) -> SyncResult<usize> {
        let page: Value = serde_json::from_slice(payload)?;
        let Value::Array(shows) = page else {
            return Err(SyncError::validation("show page must be a JSON array"));
        };
        let staged = self.stage_shows(&shows).await?;
        info!(staged, "staged shows from page");
        Ok(staged)
    }
}
