//! Local workflow runtime: polls the queues, dispatches to the handlers with
//! bounded concurrency, and fires the sweep and drain timers.
use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{self, Pool};
use crate::error::SyncResult;
use crate::handlers::{Handlers, Timer};
use crate::pipeline::{Collaborators, Pipeline};
use crate::storage::sqlite::backoff_delay;
use crate::storage::{ReceivedMessage, SqliteStorage, STAGED_OBJECTS_QUEUE};
use crate::tvmaze::{CatalogClient, TvMazeClient};

pub struct Runtime {
    cfg: Arc<Config>,
    storage: SqliteStorage,
    handlers: Arc<Handlers>,
}

impl Runtime {
    /// Open both databases, apply migrations and wire the pipeline to the
    /// TVMaze client.
    pub async fn from_config(cfg: Config) -> Result<Self> {
        cfg.ensure_dirs()?;
        let pool = db::init_pool(&cfg.database_url()).await?;
        db::run_migrations(&pool).await?;
        let storage = SqliteStorage::connect(&cfg.storage_url()).await?;
        let catalog = Arc::new(TvMazeClient::from_config(&cfg.tvmaze)?);
        Ok(Self::new(cfg, pool, storage, catalog))
    }

    pub fn new(
        cfg: Config,
        pool: Pool,
        storage: SqliteStorage,
        catalog: Arc<dyn CatalogClient>,
    ) -> Self {
        let shared = Arc::new(storage.clone());
        let deps = Collaborators {
            pool,
            catalog,
            store: shared.clone(),
            queue: shared.clone(),
            table: shared.clone(),
        };
        let pipeline = Arc::new(Pipeline::new(&cfg, deps));
        let handlers = Arc::new(Handlers::new(&cfg, pipeline, shared));
        Self {
            cfg: Arc::new(cfg),
            storage,
            handlers,
        }
    }

    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    fn polled_queues(&self) -> [&str; 4] {
        let q = &self.cfg.storage.queues;
        [
            STAGED_OBJECTS_QUEUE,
            q.shows.as_str(),
            q.seasons_episodes.as_str(),
            q.shows_update.as_str(),
        ]
    }

    /// Lease a round of messages from every queue and dispatch them.
    /// Returns how many messages were handled.
    pub async fn poll_once(&self) -> Result<usize> {
        let concurrency = self.cfg.app.concurrency;
        let visibility = self.cfg.visibility_timeout();
        let mut leased = Vec::new();
        for queue in self.polled_queues() {
            leased.extend(self.storage.receive(queue, concurrency, visibility).await?);
        }
        let count = leased.len();
        if count > 0 {
            debug!(count, "dispatching leased messages");
        }
        stream::iter(leased)
            .map(|msg| self.process(msg))
            .buffer_unordered(concurrency)
            .collect::<Vec<()>>()
            .await;
        Ok(count)
    }

    async fn dispatch(&self, msg: &ReceivedMessage) -> SyncResult<()> {
        let payload = msg.payload.as_bytes();
        if msg.queue == STAGED_OBJECTS_QUEUE {
            self.handlers.handle_notification(payload).await
        } else {
            self.handlers.handle_queue_message(&msg.queue, payload).await
        }
    }

    async fn process(&self, msg: ReceivedMessage) {
        let settled = match self.dispatch(&msg).await {
            Ok(()) => self.storage.complete(&msg).await,
            Err(err) if msg.dequeue_count >= self.cfg.storage.max_dequeue_count => {
                error!(
                    queue = %msg.queue,
                    message_id = %msg.message_id,
                    dequeue_count = msg.dequeue_count,
                    ?err,
                    "giving up on message; moving to poison queue"
                );
                self.storage.poison(&msg).await
            }
            Err(err) => {
                let max_backoff = Duration::from_secs(self.cfg.app.max_backoff_seconds);
                let delay = backoff_delay(msg.dequeue_count - 1, max_backoff);
                warn!(
                    queue = %msg.queue,
                    message_id = %msg.message_id,
                    dequeue_count = msg.dequeue_count,
                    ?err,
                    ?delay,
                    "message failed; will retry"
                );
                self.storage.abandon(&msg, delay).await
            }
        };
        if let Err(err) = settled {
            error!(queue = %msg.queue, message_id = %msg.message_id, ?err, "failed to settle message");
        }
    }

    /// Process until no message is visible on any polled queue. Messages in
    /// backoff are left for later. Returns how many messages were handled.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let n = self.poll_once().await?;
            if n == 0 {
                return Ok(handled);
            }
            handled += n;
        }
    }

    pub async fn fire(&self, timer: Timer) {
        if let Err(err) = self.handlers.on_timer(timer).await {
            error!(?timer, ?err, "timer run failed");
        }
    }

    /// Poll and run timers until Ctrl-C. Timers first fire one period after
    /// start-up.
    pub async fn run(&self) -> Result<()> {
        let sweep_every = Duration::from_secs(self.cfg.schedule.sweep_changes_seconds);
        let drain_every = Duration::from_secs(self.cfg.schedule.drain_backlog_seconds);
        let mut sweep = interval_at(Instant::now() + sweep_every, sweep_every);
        let mut drain = interval_at(Instant::now() + drain_every, drain_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle_sleep = self.cfg.poll_interval();

        info!(
            concurrency = self.cfg.app.concurrency,
            sweep_secs = sweep_every.as_secs(),
            drain_secs = drain_every.as_secs(),
            "runtime started"
        );
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            // Timers and shutdown are checked between poll rounds so a round
            // is never cut off with messages leased.
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    return Ok(());
                }
                _ = sweep.tick() => self.fire(Timer::SweepChanges).await,
                _ = drain.tick() => self.fire(Timer::DrainBacklog).await,
                _ = std::future::ready(()) => {}
            }
            match self.poll_once().await {
                Ok(0) => tokio::time::sleep(idle_sleep).await,
                Ok(_) => {}
                Err(err) => {
                    error!(?err, "poll failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
