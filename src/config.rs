//! Configuration loader and validator for the catalog sync pipeline.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::Period;
use crate::storage::STAGED_OBJECTS_QUEUE;

static CONTAINER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9](?:[a-z0-9]|-[a-z0-9]){2,62}$").expect("valid regex"));
static TABLE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]{2,62}$").expect("valid regex"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub database: Database,
    pub storage: Storage,
    pub tvmaze: TvMaze,
    pub schedule: Schedule,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub concurrency: usize,
    pub max_backoff_seconds: u64,
}

/// Relational store holding shows, seasons and episodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Database {
    #[serde(default)]
    pub url: Option<String>,
}

/// Staging store, work queues and pending-update table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Storage {
    #[serde(default)]
    pub url: Option<String>,
    pub visibility_timeout_seconds: u64,
    pub max_dequeue_count: i64,
    #[serde(default)]
    pub containers: Containers,
    #[serde(default)]
    pub queues: Queues,
    #[serde(default)]
    pub tables: Tables,
}

/// Staging store containers, one per pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Containers {
    pub show_stage: String,
    pub show_upsert: String,
    pub show_ids: String,
    pub seasons_episodes: String,
    pub seasons: String,
    pub episodes: String,
    pub season_upsert: String,
    pub episode_upsert: String,
    pub updates: String,
}

impl Default for Containers {
    fn default() -> Self {
        Self {
            show_stage: "showstagecontainer".into(),
            show_upsert: "showupsertcontainer".into(),
            show_ids: "tvshowidscontainer".into(),
            seasons_episodes: "tvseasonsepisodescontainer".into(),
            seasons: "tvseasonscontainer".into(),
            episodes: "tvepisodescontainer".into(),
            season_upsert: "seasonupsertcontainer".into(),
            episode_upsert: "episodeupsertcontainer".into(),
            updates: "tvupdates".into(),
        }
    }
}

impl Containers {
    fn named(&self) -> [(&'static str, &str); 9] {
        [
            ("show_stage", &self.show_stage),
            ("show_upsert", &self.show_upsert),
            ("show_ids", &self.show_ids),
            ("seasons_episodes", &self.seasons_episodes),
            ("seasons", &self.seasons),
            ("episodes", &self.episodes),
            ("season_upsert", &self.season_upsert),
            ("episode_upsert", &self.episode_upsert),
            ("updates", &self.updates),
        ]
    }

    pub fn all(&self) -> Vec<&str> {
        self.named().iter().map(|(_, name)| *name).collect()
    }
}

/// Work queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Queues {
    pub shows: String,
    pub seasons_episodes: String,
    pub shows_update: String,
}

impl Default for Queues {
    fn default() -> Self {
        Self {
            shows: "tvshowsqueue".into(),
            seasons_episodes: "tvseasonsepisodesqueue".into(),
            shows_update: "tvshowsupdatequeue".into(),
        }
    }
}

impl Queues {
    fn named(&self) -> [(&'static str, &str); 3] {
        [
            ("shows", &self.shows),
            ("seasons_episodes", &self.seasons_episodes),
            ("shows_update", &self.shows_update),
        ]
    }

    pub fn all(&self) -> Vec<&str> {
        self.named().iter().map(|(_, name)| *name).collect()
    }
}

/// Key-value tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Tables {
    pub seasons_episodes_update: String,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            seasons_episodes_update: "tvseasonsepisodesupdatetable".into(),
        }
    }
}

/// Upstream TVMaze API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TvMaze {
    pub base_url: String,
    pub timeout_seconds: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_user_agent() -> String {
    format!("show-sync/{}", env!("CARGO_PKG_VERSION"))
}

/// Timer-triggered work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedule {
    pub sweep_changes_seconds: u64,
    pub sweep_period: String,
    pub drain_backlog_seconds: u64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Relational store URL: `DATABASE_URL`, then the file, then `<data_dir>/shows.db`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.database.url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/shows.db", self.app.data_dir))
    }

    /// Storage URL: `STORAGE_URL`, then the file, then `<data_dir>/storage.db`.
    pub fn storage_url(&self) -> String {
        std::env::var("STORAGE_URL")
            .ok()
            .or_else(|| self.storage.url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/storage.db", self.app.data_dir))
    }

    pub fn sweep_period(&self) -> Period {
        self.schedule.sweep_period.parse().unwrap_or(Period::Day)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.app.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.storage.visibility_timeout_seconds)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.concurrency == 0 {
        return Err(invalid("app.concurrency must be > 0"));
    }

    if cfg.storage.visibility_timeout_seconds == 0 {
        return Err(invalid("storage.visibility_timeout_seconds must be > 0"));
    }
    if cfg.storage.max_dequeue_count <= 0 {
        return Err(invalid("storage.max_dequeue_count must be > 0"));
    }

    let mut seen = HashSet::new();
    for (field, name) in cfg.storage.containers.named() {
        if !CONTAINER_NAME.is_match(name) {
            return Err(invalid(format!(
                "storage.containers.{field} '{name}' is not a valid container name"
            )));
        }
        if !seen.insert(name) {
            return Err(invalid(format!(
                "storage.containers.{field} '{name}' is used by another container"
            )));
        }
    }

    let mut seen = HashSet::new();
    for (field, name) in cfg.storage.queues.named() {
        if !CONTAINER_NAME.is_match(name) || name.ends_with("-poison") {
            return Err(invalid(format!(
                "storage.queues.{field} '{name}' is not a valid queue name"
            )));
        }
        if name == STAGED_OBJECTS_QUEUE || !seen.insert(name) {
            return Err(invalid(format!(
                "storage.queues.{field} '{name}' is used by another queue"
            )));
        }
    }

    let table = &cfg.storage.tables.seasons_episodes_update;
    if !TABLE_NAME.is_match(table) {
        return Err(invalid(format!(
            "storage.tables.seasons_episodes_update '{table}' is not a valid table name"
        )));
    }

    if reqwest::Url::parse(&cfg.tvmaze.base_url).is_err() {
        return Err(invalid("tvmaze.base_url must be an absolute URL"));
    }
    if cfg.tvmaze.timeout_seconds == 0 {
        return Err(invalid("tvmaze.timeout_seconds must be > 0"));
    }

    if cfg.schedule.sweep_changes_seconds == 0 {
        return Err(invalid("schedule.sweep_changes_seconds must be > 0"));
    }
    if cfg.schedule.drain_backlog_seconds == 0 {
        return Err(invalid("schedule.drain_backlog_seconds must be > 0"));
    }
    if cfg.schedule.sweep_period.parse::<Period>().is_err() {
        return Err(invalid("schedule.sweep_period must be day, week or month"));
    }

    Ok(())
}

/// Returns the example YAML content shipped as `config.example.yaml`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  concurrency: 8
  max_backoff_seconds: 300

database:
  url: "sqlite://./data/shows.db"

storage:
  url: "sqlite://./data/storage.db"
  visibility_timeout_seconds: 30
  max_dequeue_count: 5
  containers:
    show_stage: "showstagecontainer"
    show_upsert: "showupsertcontainer"
    show_ids: "tvshowidscontainer"
    seasons_episodes: "tvseasonsepisodescontainer"
    seasons: "tvseasonscontainer"
    episodes: "tvepisodescontainer"
    season_upsert: "seasonupsertcontainer"
    episode_upsert: "episodeupsertcontainer"
    updates: "tvupdates"
  queues:
    shows: "tvshowsqueue"
    seasons_episodes: "tvseasonsepisodesqueue"
    shows_update: "tvshowsupdatequeue"
  tables:
    seasons_episodes_update: "tvseasonsepisodesupdatetable"

tvmaze:
  base_url: "https://api.tvmaze.com/"
  timeout_seconds: 30

schedule:
  sweep_changes_seconds: 3600
  sweep_period: "day"
  drain_backlog_seconds: 86400
"#
}
