use super::schema::{ProjectedRow, SqlValue};
use crate::error::SyncResult;
use crate::model::EntityKind;
use anyhow::Result;
use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{SqliteConnection, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    // WAL and stricter durability on every connection.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));
    let pool_options = if in_memory {
        // The database lives only as long as its single connection.
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(8)
    };
    let pool = pool_options.connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

/// Catalog schema: shows, seasons, episodes.
pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Staging objects, queue messages and key-value tables.
pub async fn run_storage_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./storage_migrations").run(pool).await?;
    Ok(())
}

/// Run `work` inside a transaction: commit when it returns `Ok`, roll back
/// when it returns `Err`.
pub async fn in_session<T, F>(pool: &Pool, work: F) -> SyncResult<T>
where
    T: Send,
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, SyncResult<T>> + Send,
{
    let mut tx = pool.begin().await?;
    match work(&mut *tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

/// Insert or update one projected row. Returns rows affected.
#[instrument(skip_all, fields(table = row.table))]
pub async fn upsert_row(conn: &mut SqliteConnection, row: &ProjectedRow) -> SyncResult<u64> {
    let sql = row.upsert_sql();
    let mut query = sqlx::query(&sql);
    for (_, value) in &row.values {
        query = match value {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.as_str()),
        };
    }
    let done = query.execute(&mut *conn).await?;
    Ok(done.rows_affected())
}

/// Every show id in the catalog, ascending.
#[instrument(skip_all)]
pub async fn all_show_ids(pool: &Pool) -> SyncResult<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM shows ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

pub async fn count_rows(pool: &Pool, kind: EntityKind) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM \"{}\"", kind.plural());
    let count: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
    Ok(count)
}

/// Show ids referenced by seasons or episodes that have no show row.
pub async fn orphaned_show_ids(pool: &Pool) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT show_id FROM seasons WHERE show_id NOT IN (SELECT id FROM shows) \
         UNION SELECT show_id FROM episodes WHERE show_id NOT IN (SELECT id FROM shows) \
         ORDER BY show_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}
