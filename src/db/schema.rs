//! Column layout of the catalog tables and projection of raw records onto it.
//!
//! Column names follow the catalog's own field names. Nested objects and
//! arrays land in `Json` columns as JSON text. `id` (and `show_id` for seasons
//! and episodes) are not listed: they are always written from the typed record.
use crate::model::{CatalogEntity, EntityKind};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Text,
    Json,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn col(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty }
}

#[derive(Debug)]
pub struct TableSchema {
    pub table: &'static str,
    pub columns: &'static [Column],
}

use ColumnType::{Integer, Json, Text};

pub static SHOWS: TableSchema = TableSchema {
    table: "shows",
    columns: &[
        col("url", Text),
        col("name", Text),
        col("type", Text),
        col("language", Text),
        col("genres", Json),
        col("status", Text),
        col("runtime", Integer),
        col("averageRuntime", Integer),
        col("premiered", Text),
        col("ended", Text),
        col("officialSite", Text),
        col("schedule", Json),
        col("rating", Json),
        col("weight", Integer),
        col("network", Json),
        col("webChannel", Json),
        col("dvdCountry", Json),
        col("externals", Json),
        col("image", Json),
        col("summary", Text),
        col("updated", Integer),
        col("_links", Json),
    ],
};

pub static SEASONS: TableSchema = TableSchema {
    table: "seasons",
    columns: &[
        col("url", Text),
        col("number", Integer),
        col("name", Text),
        col("episodeOrder", Integer),
        col("premiereDate", Text),
        col("endDate", Text),
        col("network", Json),
        col("webChannel", Json),
        col("image", Json),
        col("summary", Text),
        col("_links", Json),
    ],
};

pub static EPISODES: TableSchema = TableSchema {
    table: "episodes",
    columns: &[
        col("url", Text),
        col("name", Text),
        col("season", Integer),
        col("number", Integer),
        col("type", Text),
        col("airdate", Text),
        col("airtime", Text),
        col("airstamp", Text),
        col("runtime", Integer),
        col("rating", Json),
        col("image", Json),
        col("summary", Text),
        col("_links", Json),
    ],
};

pub fn for_kind(kind: EntityKind) -> &'static TableSchema {
    match kind {
        EntityKind::Show => &SHOWS,
        EntityKind::Season => &SEASONS,
        EntityKind::Episode => &EPISODES,
    }
}

/// A value ready to bind.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

/// One catalog row restricted to the columns the record actually carried.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedRow {
    pub table: &'static str,
    pub values: Vec<(&'static str, SqlValue)>,
}

impl ProjectedRow {
    /// `INSERT .. ON CONFLICT(id) DO UPDATE` over the projected columns.
    /// A row with nothing besides its keys leaves an existing row alone.
    pub fn upsert_sql(&self) -> String {
        let names: Vec<String> = self.values.iter().map(|(n, _)| format!("\"{n}\"")).collect();
        let placeholders = vec!["?"; names.len()].join(", ");
        let updates: Vec<String> = self
            .values
            .iter()
            .filter(|(n, _)| *n != "id")
            .map(|(n, _)| format!("\"{n}\" = excluded.\"{n}\""))
            .collect();
        let on_conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        format!(
            "INSERT INTO \"{}\" ({}) VALUES ({}) ON CONFLICT(\"id\") {}",
            self.table,
            names.join(", "),
            placeholders,
            on_conflict
        )
    }
}

/// Bind-ready form of `value`. `Json` columns take JSON text. Other columns
/// take the value as it came: SQLite's column affinity coerces numeric text,
/// and a float in an integer column is kept as a real.
fn convert(table: &str, column: &Column, value: &Value) -> SqlValue {
    let converted = match (column.ty, value) {
        (_, Value::Null) => SqlValue::Null,
        (Json, other) => SqlValue::Text(other.to_string()),
        (_, Value::Number(n)) => match n.as_i64() {
            Some(v) => SqlValue::Integer(v),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        (_, Value::String(s)) => SqlValue::Text(s.clone()),
        (_, Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        (_, other) => SqlValue::Text(other.to_string()),
    };
    let expected = match column.ty {
        Integer => matches!(converted, SqlValue::Integer(_)),
        Text => matches!(converted, SqlValue::Text(_)),
        Json => true,
    };
    if !expected && !value.is_null() {
        debug!(table, column = column.name, %value, "storing value of unexpected type");
    }
    converted
}

/// Project a typed record onto its table. Fields without a column are
/// ignored.
pub fn project<E: CatalogEntity>(record: &E) -> ProjectedRow {
    let schema = for_kind(E::KIND);
    let mut values = vec![("id", SqlValue::Integer(record.id()))];
    if let Some(show_id) = record.show_id() {
        values.push(("show_id", SqlValue::Integer(show_id)));
    }
    let attributes = record.attributes();
    for column in schema.columns {
        if let Some(value) = attributes.get(column.name) {
            values.push((column.name, convert(schema.table, column, value)));
        }
    }
    ProjectedRow {
        table: schema.table,
        values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EpisodeRecord, ShowRecord};
    use serde_json::json;

    #[test]
    fn projects_present_columns_only() {
        let show = ShowRecord::from_staged(json!({
            "id": 1,
            "name": "Under the Dome",
            "genres": ["Drama", "Thriller"],
            "runtime": null,
            "unknownField": "ignored"
        }))
        .unwrap();
        let row = project(&show);
        assert_eq!(row.table, "shows");
        assert_eq!(
            row.values,
            vec![
                ("id", SqlValue::Integer(1)),
                ("name", SqlValue::Text("Under the Dome".into())),
                ("genres", SqlValue::Text(r#"["Drama","Thriller"]"#.into())),
                ("runtime", SqlValue::Null),
            ]
        );
    }

    #[test]
    fn child_rows_carry_show_id() {
        let ep = EpisodeRecord::from_envelope(json!({
            "show_id": 7,
            "episode": { "id": 3, "show_id": 99, "season": 1, "number": 2 }
        }))
        .unwrap();
        let row = project(&ep);
        assert_eq!(row.values[0], ("id", SqlValue::Integer(3)));
        assert_eq!(row.values[1], ("show_id", SqlValue::Integer(7)));
        assert_eq!(row.values.len(), 4);
    }

    #[test]
    fn drifted_value_types_are_kept_not_rejected() {
        let show = ShowRecord::from_staged(json!({
            "id": 1,
            "runtime": 42.5,
            "weight": "90",
            "name": 12,
            "summary": true
        }))
        .unwrap();
        let row = project(&show);
        assert_eq!(
            row.values,
            vec![
                ("id", SqlValue::Integer(1)),
                ("name", SqlValue::Integer(12)),
                ("runtime", SqlValue::Real(42.5)),
                ("weight", SqlValue::Text("90".into())),
                ("summary", SqlValue::Integer(1)),
            ]
        );
    }

    #[test]
    fn upsert_sql_shapes() {
        let row = ProjectedRow {
            table: "shows",
            values: vec![
                ("id", SqlValue::Integer(1)),
                ("name", SqlValue::Text("x".into())),
            ],
        };
        assert_eq!(
            row.upsert_sql(),
            "INSERT INTO \"shows\" (\"id\", \"name\") VALUES (?, ?) ON CONFLICT(\"id\") DO UPDATE SET \"name\" = excluded.\"name\""
        );

        let bare = ProjectedRow {
            table: "shows",
            values: vec![("id", SqlValue::Integer(1))],
        };
        assert!(bare.upsert_sql().ends_with("DO NOTHING"));
    }
}
