//! Pagination walker: one upstream page per invocation, then hand the next
//! page to the queue.
use std::sync::Arc;
use tracing::{info, instrument};

use super::Collaborators;
use crate::config::{Containers, Queues};
use crate::error::{SyncError, SyncResult};
use crate::model::{names, WorkItem};
use crate::storage::{write_json, StagingStore, WorkQueue};
use crate::tvmaze::CatalogClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// The page was staged and `next_page` was enqueued.
    Staged { shows: usize, next_page: i64 },
    /// The page was empty: the crawl is over.
    EndOfCatalog,
}

fn check_page(page: i64) -> SyncResult<()> {
    if page < 0 {
        return Err(SyncError::validation(format!("page must be >= 0, got {page}")));
    }
    Ok(())
}

#[derive(Clone)]
pub struct PaginationWalker {
    catalog: Arc<dyn CatalogClient>,
    store: Arc<dyn StagingStore>,
    queue: Arc<dyn WorkQueue>,
    page_container: String,
    shows_queue: String,
}

impl PaginationWalker {
    pub fn new(deps: &Collaborators, containers: &Containers, queues: &Queues) -> Self {
        Self {
            catalog: deps.catalog.clone(),
            store: deps.store.clone(),
            queue: deps.queue.clone(),
            page_container: containers.show_stage.clone(),
            shows_queue: queues.shows.clone(),
        }
    }

    /// Enqueue the first page of a full crawl.
    #[instrument(skip(self))]
    pub async fn start_full_sync(&self, page: i64) -> SyncResult<()> {
        check_page(page)?;
        self.queue
            .send(&self.shows_queue, &WorkItem::Page { page }.to_json())
            .await
            .map_err(SyncError::Storage)?;
        info!(page, "full sync started");
        Ok(())
    }

    /// Fetch one page, stage it whole and enqueue its successor. Nothing is
    /// enqueued unless the page was staged.
    #[instrument(skip(self))]
    pub async fn process_page(&self, page: i64) -> SyncResult<PageOutcome> {
        check_page(page)?;
        let shows = self
            .catalog
            .list_page(page)
            .await
            .map_err(SyncError::Upstream)?;
        if shows.is_empty() {
            info!(page, "empty page; end of catalog");
            return Ok(PageOutcome::EndOfCatalog);
        }

        let name = names::page(page);
        write_json(self.store.as_ref(), &self.page_container, &name, &shows)
            .await
            .map_err(SyncError::Storage)?;
        info!(page, shows = shows.len(), name = %name, "staged show page");

        let next_page = page + 1;
        self.queue
            .send(&self.shows_queue, &WorkItem::Page { page: next_page }.to_json())
            .await
            .map_err(SyncError::Storage)?;
        Ok(PageOutcome::Staged {
            shows: shows.len(),
            next_page,
        })
    }
}
