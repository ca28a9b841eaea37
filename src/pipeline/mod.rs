//! The synchronization pipeline.
//!
//! Each component owns the collaborators it needs and is invoked once per
//! trigger (queue message, staged object, timer, request). Components never
//! call each other across a trigger boundary: they hand work on through the
//! staging store and the work queues.
use std::sync::Arc;

use crate::config::Config;
use crate::db::Pool;
use crate::storage::{PendingTable, StagingStore, WorkQueue};
use crate::tvmaze::CatalogClient;

pub mod apply;
pub mod fanout;
pub mod stager;
pub mod tracker;
pub mod walker;

pub use apply::{ApplyOutcome, UpsertApplier};
pub use fanout::{CrawlStart, FanOut, FanOutReport, SplitReport};
pub use stager::EntityStager;
pub use tracker::{DrainReport, RecordReport, UpdateTracker};
pub use walker::{PageOutcome, PaginationWalker};

/// External collaborators shared by every component.
#[derive(Clone)]
pub struct Collaborators {
    pub pool: Pool,
    pub catalog: Arc<dyn CatalogClient>,
    pub store: Arc<dyn StagingStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub table: Arc<dyn PendingTable>,
}

pub struct Pipeline {
    pub walker: PaginationWalker,
    pub stager: EntityStager,
    pub applier: UpsertApplier,
    pub fanout: FanOut,
    pub tracker: UpdateTracker,
}

impl Pipeline {
    pub fn new(cfg: &Config, deps: Collaborators) -> Self {
        let names = &cfg.storage;
        let stager = EntityStager::new(deps.store.clone(), &names.containers);
        Self {
            walker: PaginationWalker::new(&deps, &names.containers, &names.queues),
            applier: UpsertApplier::new(deps.pool.clone()),
            fanout: FanOut::new(&deps, stager.clone(), &names.containers, &names.queues),
            tracker: UpdateTracker::new(&deps, &names.containers, &names.queues, &names.tables),
            stager,
        }
    }
}
