//! Page collection: parallel fixed-count fan-out/fan-in, or sequential cursor walk.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rvh_adapters::{CursorSource, PagedSource, FIRST_PAGE_CURSOR};
use rvh_core::RawRecord;
use tracing::{info, warn};
use uuid::Uuid;

use crate::countdown::Countdown;
use crate::error::{CollectError, PageFailure};
use crate::events::EventSink;
use crate::pool::WorkerPool;

#[derive(Debug, Clone, Copy)]
pub struct CollectSettings {
    pub pages: usize,
    pub per_page: usize,
    pub fan_in_timeout: Duration,
}

impl Default for CollectSettings {
    fn default() -> Self {
        Self {
            pages: 3,
            per_page: 5,
            fan_in_timeout: Duration::from_secs(10),
        }
    }
}

/// Upper bound on records reserved up front.
const MAX_PREALLOCATED_RECORDS: usize = 4096;

fn preallocation(pages: usize, per_page: usize) -> usize {
    pages.saturating_mul(per_page).min(MAX_PREALLOCATED_RECORDS)
}

pub struct PageCollector {
    page_pool: Arc<WorkerPool>,
    settings: CollectSettings,
    events: Arc<dyn EventSink>,
}

/// Counts the page down however the task ends, recording a failure on panic.
struct PageTicket {
    page: usize,
    countdown: Arc<Countdown>,
    failures: Arc<Mutex<Vec<PageFailure>>>,
}

impl Drop for PageTicket {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(PageFailure::Panicked { page: self.page });
        }
        self.countdown.count_down();
    }
}

impl PageCollector {
    pub fn new(
        page_pool: Arc<WorkerPool>,
        settings: CollectSettings,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            page_pool,
            settings,
            events,
        }
    }

    pub fn settings(&self) -> CollectSettings {
        self.settings
    }

    /// Fetches pages `0..pages` in parallel and waits up to the fan-in timeout.
    /// Tasks still running at the deadline are abandoned; their output is dropped.
    pub async fn collect_paged(
        &self,
        job_id: Uuid,
        source: Arc<dyn PagedSource>,
        source_key: &str,
    ) -> Result<Vec<RawRecord>, CollectError> {
        let CollectSettings {
            pages,
            per_page,
            fan_in_timeout,
        } = self.settings;

        self.events
            .record(format!(
                "parallel collection started: pages={pages}, per_page={per_page}, job={job_id}"
            ))
            .await;

        let countdown = Arc::new(Countdown::new(pages));
        let records = Arc::new(Mutex::new(Vec::with_capacity(preallocation(pages, per_page))));
        let failures = Arc::new(Mutex::new(Vec::new()));

        for page in 0..pages {
            let ticket = PageTicket {
                page,
                countdown: countdown.clone(),
                failures: failures.clone(),
            };
            let source = source.clone();
            let records = records.clone();
            let events = self.events.clone();
            let source_key = source_key.to_string();

            self.page_pool
                .submit(async move {
                    let ticket = ticket;
                    events
                        .record(format!("page {page}: fetch started, job={job_id}"))
                        .await;
                    match source.fetch_page(&source_key, per_page, page).await {
                        Ok(batch) => {
                            events
                                .record(format!(
                                    "page {page}: received={}, job={job_id}",
                                    batch.len()
                                ))
                                .await;
                            records
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .extend(batch);
                        }
                        Err(err) => {
                            events
                                .record(format!("page {page}: error={err}, job={job_id}"))
                                .await;
                            ticket
                                .failures
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push(PageFailure::Adapter { page, source: err });
                        }
                    }
                })
                .await?;
        }

        if !countdown.wait(fan_in_timeout).await {
            warn!(%job_id, pending = countdown.remaining(), "fan-in timed out");
            return Err(CollectError::Timeout {
                timeout: fan_in_timeout,
                job_id,
            });
        }

        let mut failures =
            std::mem::take(&mut *failures.lock().unwrap_or_else(PoisonError::into_inner));
        if !failures.is_empty() {
            if failures.len() > 1 {
                warn!(%job_id, additional = failures.len() - 1, "further page failures suppressed");
            }
            return Err(CollectError::Aggregation {
                first: failures.remove(0),
            });
        }

        let collected =
            std::mem::take(&mut *records.lock().unwrap_or_else(PoisonError::into_inner));
        if collected.is_empty() {
            return Err(CollectError::EmptySource);
        }

        info!(%job_id, total = collected.len(), "all pages collected");
        self.events
            .record(format!(
                "all pages collected: total_raw={}, job={job_id}",
                collected.len()
            ))
            .await;
        Ok(collected)
    }

    /// Walks the cursor from the first page; an empty page or a missing cursor stops the walk.
    pub async fn collect_cursor(
        &self,
        job_id: Uuid,
        source: &dyn CursorSource,
        app_id: &str,
    ) -> Result<Vec<RawRecord>, CollectError> {
        let CollectSettings {
            pages, per_page, ..
        } = self.settings;

        let mut cursor = FIRST_PAGE_CURSOR.to_string();
        let mut collected = Vec::with_capacity(preallocation(pages, per_page));

        for page in 0..pages {
            self.events
                .record(format!("cursor page {page}: request, job={job_id}"))
                .await;
            let batch = source.fetch_page(app_id, &cursor, per_page).await?;
            self.events
                .record(format!(
                    "cursor page {page}: received={}, job={job_id}",
                    batch.records.len()
                ))
                .await;

            if batch.records.is_empty() {
                self.events
                    .record(format!("cursor page {page}: empty, stopping, job={job_id}"))
                    .await;
                break;
            }
            collected.extend(batch.records);

            match batch.next_cursor {
                Some(next) if !next.trim().is_empty() => cursor = next,
                _ => break,
            }
        }

        if collected.is_empty() {
            return Err(CollectError::EmptySource);
        }

        self.events
            .record(format!(
                "cursor collection finished: total_raw={}, job={job_id}",
                collected.len()
            ))
            .await;
        Ok(collected)
    }
}
