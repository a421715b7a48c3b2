//! Job lifecycle: create, dispatch, guard, collect, dedup, finalize.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rvh_adapters::{SourceAdapters, SourceTarget};
use rvh_core::{JobStateError, ParseJob};
use rvh_storage::{JobRegistry, ReviewStore, StoreError};
use tokio::task::JoinError;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::collector::{CollectSettings, PageCollector};
use crate::config::RvhConfig;
use crate::dedup::{DedupOutcome, Deduplicator};
use crate::error::{JobError, OrchestratorError};
use crate::events::EventSink;
use crate::guard::SourceGuard;
use crate::pool::{Admission, WorkerPool, WorkerPoolConfig};

pub const GUARD_SKIP_MESSAGE: &str = "source is already being processed (guard)";

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub dispatch: WorkerPoolConfig,
    pub page: WorkerPoolConfig,
    pub collect: CollectSettings,
}

impl From<&RvhConfig> for OrchestratorSettings {
    fn from(config: &RvhConfig) -> Self {
        Self {
            dispatch: config.dispatch_pool(),
            page: config.page_pool(),
            collect: CollectSettings {
                pages: config.pages,
                per_page: config.per_page,
                fan_in_timeout: config.fan_in_timeout,
            },
        }
    }
}

/// Cheap to clone; all clones share the pools, the guard and the stores.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    jobs: Arc<dyn JobRegistry>,
    guard: Arc<SourceGuard>,
    dispatch: WorkerPool,
    page_pool: Arc<WorkerPool>,
    collector: PageCollector,
    dedup: Deduplicator,
    adapters: SourceAdapters,
    events: Arc<dyn EventSink>,
}

impl JobOrchestrator {
    /// Spawns both worker pools; call from within a tokio runtime.
    pub fn new(
        settings: OrchestratorSettings,
        jobs: Arc<dyn JobRegistry>,
        reviews: Arc<dyn ReviewStore>,
        adapters: SourceAdapters,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let page_pool = Arc::new(WorkerPool::new(settings.page));
        let collector = PageCollector::new(page_pool.clone(), settings.collect, events.clone());
        Self {
            inner: Arc::new(Inner {
                jobs,
                guard: Arc::new(SourceGuard::new()),
                dispatch: WorkerPool::new(settings.dispatch),
                page_pool,
                collector,
                dedup: Deduplicator::new(reviews),
                adapters,
                events,
            }),
        }
    }

    pub fn guard(&self) -> &SourceGuard {
        &self.inner.guard
    }

    pub fn jobs(&self) -> Arc<dyn JobRegistry> {
        self.inner.jobs.clone()
    }

    /// Validates the key, persists a QUEUED job and hands execution to the dispatch pool.
    /// The id is returned even when dispatch is refused; that job is already FAILED.
    pub async fn start(&self, source_key: &str) -> Result<Uuid, OrchestratorError> {
        let target = SourceTarget::classify(source_key)
            .map_err(|err| OrchestratorError::Validation(err.to_string()))?;

        let job = ParseJob::queued(source_key.trim(), Utc::now());
        let job_id = job.id;
        self.inner.jobs.create(&job).await?;
        self.inner
            .events
            .record(format!("job created: id={job_id} source={} status=QUEUED", job.source_key))
            .await;

        let inner = self.inner.clone();
        let execution = async move { inner.execute(job_id, target).await }
            .instrument(info_span!("parse_job", %job_id));

        match self.inner.dispatch.submit(execution).await {
            Ok(Admission::Queued) => debug!(%job_id, "job queued for dispatch"),
            Ok(Admission::RanInline) => info!(%job_id, "dispatch queue full, job ran inline"),
            Err(err) => {
                warn!(%job_id, error = %err, "job dispatch refused");
                let message = format!("dispatch refused: {err}");
                self.inner
                    .finish(job_id, |job, now| job.mark_failed(now, message))
                    .await;
            }
        }
        Ok(job_id)
    }

    pub async fn job(&self, id: Uuid) -> Result<ParseJob, StoreError> {
        self.inner.jobs.find_by_id(id).await
    }

    /// Polls until the job is terminal or `timeout` passes; returns the last state seen.
    pub async fn wait_for_terminal(
        &self,
        id: Uuid,
        timeout: Duration,
    ) -> Result<ParseJob, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.job(id).await?;
            if job.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(job);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Drains queued work, then forgets every held guard key.
    pub async fn shutdown(&self) {
        self.inner.dispatch.shutdown().await;
        self.inner.page_pool.shutdown().await;
        self.inner.guard.clear();
        info!("orchestrator stopped");
    }
}

impl Inner {
    async fn execute(self: Arc<Self>, job_id: Uuid, target: SourceTarget) {
        let guard_key = target.guard_key();
        let Some(lease) = self.guard.lease(&guard_key) else {
            self.events
                .record(format!("duplicate run prevented: key={guard_key} job={job_id}"))
                .await;
            self.finish(job_id, |job, now| job.mark_skipped(now, GUARD_SKIP_MESSAGE))
                .await;
            return;
        };

        // the body runs on its own task so a panic lands here as a JoinError
        let body = {
            let inner = self.clone();
            tokio::spawn(
                async move { inner.run(job_id, &target).await }.in_current_span(),
            )
        };
        let result = body_outcome(job_id, body.await);

        match result {
            Ok(outcome) => {
                let created = u32::try_from(outcome.persisted).unwrap_or(u32::MAX);
                self.finish(job_id, |job, now| job.mark_succeeded(now, created))
                    .await;
                self.events
                    .record(format!(
                        "job finished: id={job_id} new={} skipped_duplicates={}",
                        outcome.persisted,
                        outcome.skipped()
                    ))
                    .await;
            }
            Err(err) => {
                let message = err.to_string();
                error!(%job_id, error = %message, "job failed");
                self.events
                    .record(format!("job failed: id={job_id} reason={message}"))
                    .await;
                self.finish(job_id, |job, now| job.mark_failed(now, message))
                    .await;
            }
        }

        drop(lease);
        self.events
            .record(format!("guard released: key={guard_key} job={job_id}"))
            .await;
    }

    async fn run(&self, job_id: Uuid, target: &SourceTarget) -> Result<DedupOutcome, JobError> {
        let mut job = self.jobs.find_by_id(job_id).await?;
        job.mark_running(Utc::now())?;
        self.jobs.save(&job).await?;
        self.events
            .record(format!("job running: id={job_id}"))
            .await;

        let raw = match target {
            SourceTarget::Paged { source_key } => {
                self.collector
                    .collect_paged(job_id, self.adapters.paged.clone(), source_key)
                    .await?
            }
            SourceTarget::Cursor { app_id } => {
                self.events
                    .record(format!("cursor source: app_id={app_id} job={job_id}"))
                    .await;
                self.collector
                    .collect_cursor(job_id, self.adapters.cursor.as_ref(), app_id)
                    .await?
            }
        };

        let outcome = self.dedup.process(&job.source_key, raw, Utc::now()).await?;
        self.events
            .record(format!(
                "reviews saved: saved={} of unique={} job={job_id}",
                outcome.persisted, outcome.unique
            ))
            .await;
        Ok(outcome)
    }

    /// Loads, transitions and saves; a failure here can only be logged.
    async fn finish<F>(&self, job_id: Uuid, transition: F)
    where
        F: FnOnce(&mut ParseJob, DateTime<Utc>) -> Result<(), JobStateError>,
    {
        let finalized = async {
            let mut job = self.jobs.find_by_id(job_id).await?;
            transition(&mut job, Utc::now())?;
            self.jobs.save(&job).await?;
            Ok::<_, JobError>(job)
        }
        .await;

        match finalized {
            Ok(job) => info!(
                %job_id,
                status = %job.status,
                created = ?job.created_reviews,
                "job finalized"
            ),
            Err(err) => error!(%job_id, error = %err, "could not finalize job"),
        }
    }
}

fn body_outcome(
    job_id: Uuid,
    joined: Result<Result<DedupOutcome, JobError>, JoinError>,
) -> Result<DedupOutcome, JobError> {
    match joined {
        Ok(result) => result,
        Err(join) if join.is_panic() => Err(JobError::Panicked),
        Err(join) => {
            warn!(%job_id, error = %join, "job body cancelled");
            Err(JobError::Cancelled)
        }
    }
}
