use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{SyncError, SyncResult};
use crate::storage::TableEntity;

/// Upstream attribute set of one record, exactly as the catalog returned it.
pub type RawRecord = Map<String, Value>;

/// Partition holding every pending-update entry.
pub const PENDING_PARTITION: &str = "show";
/// Property carrying the upstream change timestamp on a pending-update entry.
pub const LAST_UPDATED: &str = "LastUpdated";
/// Name of the staged list of every known show id.
pub const SHOW_IDS_OBJECT: &str = "all_show_ids.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Show,
    Season,
    Episode,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Show => "show",
            EntityKind::Season => "season",
            EntityKind::Episode => "episode",
        }
    }

    /// Key of the embedded list on a whole-show payload and of the list in a
    /// standalone `{show_id, <plural>: [...]}` payload.
    pub fn plural(&self) -> &'static str {
        match self {
            EntityKind::Show => "shows",
            EntityKind::Season => "seasons",
            EntityKind::Episode => "episodes",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Window of the upstream change feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Day,
    Week,
    Month,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Day => "day",
            Period::Week => "week",
            Period::Month => "month",
        }
    }
}

impl FromStr for Period {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(Period::Day),
            "week" => Ok(Period::Week),
            "month" => Ok(Period::Month),
            other => Err(SyncError::validation(format!(
                "period must be 'day', 'week', or 'month', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message placed on a work queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum WorkItem {
    Page { page: i64 },
    Show { show_id: i64 },
}

impl WorkItem {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_slice(payload: &[u8]) -> SyncResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Staged object names. Deterministic so that re-staging overwrites.
pub mod names {
    use super::{EntityKind, Period};

    pub fn page(page: i64) -> String {
        format!("shows_page_{page}.json")
    }

    pub fn show(show_id: i64) -> String {
        format!("tv_show_{show_id}.json")
    }

    pub fn entity(show_id: i64, kind: EntityKind, entity_id: i64) -> String {
        format!("tv_show_{show_id}_{kind}_{entity_id}.json")
    }

    pub fn updates(period: Period) -> String {
        format!("updates_{period}.json")
    }
}

/// Interpret `value` as a catalog id. Ids are strictly positive integers;
/// numeric strings are accepted because change-feed and table keys are strings.
pub fn parse_id(value: Option<&Value>) -> Option<i64> {
    let id = match value? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    (id > 0).then_some(id)
}

/// Wrap one record with its owning show: `{show_id, <kind>: record}`.
pub fn envelope(show_id: i64, kind: EntityKind, record: &RawRecord) -> Value {
    let mut map = Map::new();
    map.insert("show_id".into(), json!(show_id));
    map.insert(kind.as_str().into(), Value::Object(record.clone()));
    Value::Object(map)
}

/// A record the upsert appliers know how to persist.
pub trait CatalogEntity: Send + Sync {
    const KIND: EntityKind;

    fn id(&self) -> i64;

    /// Owning show, authoritative over anything inside `attributes`.
    fn show_id(&self) -> Option<i64> {
        None
    }

    fn attributes(&self) -> &RawRecord;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShowRecord {
    pub id: i64,
    pub attributes: RawRecord,
}

impl ShowRecord {
    /// A show is staged as its bare attribute set.
    pub fn from_staged(value: Value) -> SyncResult<Self> {
        let Value::Object(attributes) = value else {
            return Err(SyncError::validation("staged show must be a JSON object"));
        };
        let id = parse_id(attributes.get("id"))
            .ok_or_else(|| SyncError::validation("show must have an id"))?;
        Ok(Self { id, attributes })
    }
}

impl CatalogEntity for ShowRecord {
    const KIND: EntityKind = EntityKind::Show;

    fn id(&self) -> i64 {
        self.id
    }

    fn attributes(&self) -> &RawRecord {
        &self.attributes
    }
}

/// Parse a staged `{show_id, <kind>: {...}}` envelope into (id, show_id, attributes).
fn parse_child_envelope(kind: EntityKind, value: Value) -> SyncResult<(i64, i64, RawRecord)> {
    let Value::Object(mut map) = value else {
        return Err(SyncError::validation(format!(
            "staged {kind} must be a JSON object"
        )));
    };
    let show_id = parse_id(map.get("show_id"))
        .ok_or_else(|| SyncError::validation(format!("{kind} envelope must have a show_id")))?;
    let Some(Value::Object(attributes)) = map.remove(kind.as_str()) else {
        return Err(SyncError::validation(format!(
            "{kind} envelope for show {show_id} has no {kind} record"
        )));
    };
    let id = parse_id(attributes.get("id")).ok_or_else(|| {
        SyncError::validation(format!("{kind} for show {show_id} must have an id"))
    })?;
    Ok((id, show_id, attributes))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeasonRecord {
    pub id: i64,
    pub show_id: i64,
    pub attributes: RawRecord,
}

impl SeasonRecord {
    pub fn from_envelope(value: Value) -> SyncResult<Self> {
        let (id, show_id, attributes) = parse_child_envelope(EntityKind::Season, value)?;
        Ok(Self {
            id,
            show_id,
            attributes,
        })
    }
}

impl CatalogEntity for SeasonRecord {
    const KIND: EntityKind = EntityKind::Season;

    fn id(&self) -> i64 {
        self.id
    }

    fn show_id(&self) -> Option<i64> {
        Some(self.show_id)
    }

    fn attributes(&self) -> &RawRecord {
        &self.attributes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeRecord {
    pub id: i64,
    pub show_id: i64,
    pub attributes: RawRecord,
}

impl EpisodeRecord {
    pub fn from_envelope(value: Value) -> SyncResult<Self> {
        let (id, show_id, attributes) = parse_child_envelope(EntityKind::Episode, value)?;
        Ok(Self {
            id,
            show_id,
            attributes,
        })
    }
}

impl CatalogEntity for EpisodeRecord {
    const KIND: EntityKind = EntityKind::Episode;

    fn id(&self) -> i64 {
        self.id
    }

    fn show_id(&self) -> Option<i64> {
        Some(self.show_id)
    }

    fn attributes(&self) -> &RawRecord {
        &self.attributes
    }
}

/// "Show X changed upstream at T and its seasons/episodes are not refreshed yet."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingUpdateEntry {
    pub show_id: i64,
    /// Upstream change time, epoch seconds.
    pub last_updated: i64,
}

impl PendingUpdateEntry {
    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.last_updated, 0).single()
    }

    pub fn to_entity(&self) -> TableEntity {
        let mut properties = Map::new();
        properties.insert(LAST_UPDATED.into(), json!(self.last_updated));
        TableEntity {
            partition_key: PENDING_PARTITION.into(),
            row_key: self.show_id.to_string(),
            properties,
        }
    }

    pub fn from_entity(entity: &TableEntity) -> Option<Self> {
        if entity.partition_key != PENDING_PARTITION {
            return None;
        }
        let show_id = parse_id(Some(&Value::String(entity.row_key.clone())))?;
        let last_updated = entity
            .properties
            .get(LAST_UPDATED)
            .and_then(Value::as_i64)
            .unwrap_or_default();
        Some(Self {
            show_id,
            last_updated,
        })
    }
}
