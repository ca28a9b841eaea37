//! Upsert appliers: persist one staged entity.
//!
//! Appliers never fail their caller. Envelopes without their ids are rejected
//! and dropped; relational failures are logged and absorbed so one bad entity
//! cannot stall unrelated work or cause a redelivery loop.
use serde_json::Value;
use sqlx::SqliteConnection;
use tracing::{debug, error, warn};

use crate::db::{self, schema, Pool};
use crate::error::{SyncError, SyncResult};
use crate::model::{CatalogEntity, EpisodeRecord, SeasonRecord, ShowRecord};

#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Validation failed; nothing was written.
    Rejected,
    /// The write failed and was absorbed.
    Failed,
}

/// Upsert `record` on `conn`: project it, then insert or update by id.
pub async fn apply<E: CatalogEntity>(record: &E, conn: &mut SqliteConnection) -> ApplyOutcome {
    let row = schema::project(record);
    match db::upsert_row(conn, &row).await {
        Ok(_) => {
            debug!(kind = %E::KIND, id = record.id(), "upserted");
            ApplyOutcome::Applied
        }
        Err(err) => {
            error!(kind = %E::KIND, id = record.id(), ?err, "upsert failed");
            ApplyOutcome::Failed
        }
    }
}

#[derive(Clone)]
pub struct UpsertApplier {
    pool: Pool,
}

impl UpsertApplier {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn apply_staged_show(&self, payload: &[u8]) -> ApplyOutcome {
        self.apply_parsed("show", payload, ShowRecord::from_staged).await
    }

    pub async fn apply_staged_season(&self, payload: &[u8]) -> ApplyOutcome {
        self.apply_parsed("season", payload, SeasonRecord::from_envelope)
            .await
    }

    pub async fn apply_staged_episode(&self, payload: &[u8]) -> ApplyOutcome {
        self.apply_parsed("episode", payload, EpisodeRecord::from_envelope)
            .await
    }

    async fn apply_parsed<E, P>(&self, kind: &str, payload: &[u8], parse: P) -> ApplyOutcome
    where
        E: CatalogEntity + 'static,
        P: FnOnce(Value) -> SyncResult<E>,
    {
        let record = serde_json::from_slice::<Value>(payload)
            .map_err(SyncError::from)
            .and_then(parse);
        match record {
            Ok(record) => self.apply_record(record).await,
            Err(err) => {
                warn!(kind, %err, "dropping staged {kind}");
                ApplyOutcome::Rejected
            }
        }
    }

    /// Apply one record in its own transaction.
    pub async fn apply_record<E: CatalogEntity + 'static>(&self, record: E) -> ApplyOutcome {
        let id = record.id();
        let session = db::in_session(&self.pool, move |conn| {
            Box::pin(async move { Ok(apply(&record, conn).await) })
        })
        .await;
        match session {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(kind = %E::KIND, id, ?err, "upsert session failed");
                ApplyOutcome::Failed
            }
        }
    }
}
