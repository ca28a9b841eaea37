use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use show_sync::config;
use show_sync::db;
use show_sync::model::{EntityKind, PendingUpdateEntry};
use show_sync::storage::{PendingTable, SqliteStorage};

#[derive(Parser, Debug)]
#[command(about = "Print queue depths, staged objects and catalog row counts")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let storage = SqliteStorage::connect(&cfg.storage_url()).await?;
    println!("Queues (total / visible now):");
    for (queue, depth) in storage.queue_depths().await? {
        let visible = storage.visible_depth(&queue).await?;
        println!("  {queue}: {depth} / {visible}");
    }
    println!("Containers:");
    for (container, objects) in storage.container_sizes().await? {
        println!("  {container}: {objects}");
    }
    let table = &cfg.storage.tables.seasons_episodes_update;
    let pending: Vec<PendingUpdateEntry> = storage
        .list_all(table)
        .await?
        .iter()
        .filter_map(PendingUpdateEntry::from_entity)
        .collect();
    println!("Pending updates ({table}): {}", pending.len());
    let oldest = pending
        .iter()
        .min_by_key(|e| e.last_updated)
        .and_then(|e| e.last_updated_at().map(|at| (e.show_id, at)));
    if let Some((show_id, at)) = oldest {
        println!("  oldest: show {show_id} changed at {}", at.to_rfc3339());
    }

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    println!("Catalog:");
    for kind in [EntityKind::Show, EntityKind::Season, EntityKind::Episode] {
        println!("  {}: {}", kind.plural(), db::count_rows(&pool, kind).await?);
    }
    let orphans = db::orphaned_show_ids(&pool).await?;
    if !orphans.is_empty() {
        println!("  shows referenced but missing: {orphans:?}");
    }
    Ok(())
}
