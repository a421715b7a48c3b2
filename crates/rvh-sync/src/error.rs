use std::time::Duration;

use rvh_adapters::AdapterError;
use rvh_core::JobStateError;
use rvh_storage::StoreError;
use thiserror::Error;
use uuid::Uuid;

use crate::pool::PoolError;

/// Why one page of a parallel collection produced nothing.
#[derive(Debug, Error)]
pub enum PageFailure {
    #[error("page {page}: {source}")]
    Adapter {
        page: usize,
        #[source]
        source: AdapterError,
    },
    #[error("page {page}: fetch task panicked")]
    Panicked { page: usize },
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("page fetches did not finish within {timeout:?} (job {job_id})")]
    Timeout { timeout: Duration, job_id: Uuid },
    #[error("no reviews could be fetched (check the app id or url)")]
    EmptySource,
    #[error("page fetch failed: {first}")]
    Aggregation {
        #[source]
        first: PageFailure,
    },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("page dispatch failed: {0}")]
    Dispatch(#[from] PoolError),
}

/// Anything that ends a RUNNING job as FAILED.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    State(#[from] JobStateError),
    #[error("job execution panicked")]
    Panicked,
    #[error("job execution was cancelled")]
    Cancelled,
}

/// Errors surfaced synchronously by `JobOrchestrator::start`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}
