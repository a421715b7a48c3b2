//! Concurrent job engine: worker pools, single-flight guard, page collection,
//! deduplication and the orchestrator that ties them to the job registry.

pub mod collector;
pub mod config;
pub mod countdown;
pub mod dedup;
pub mod error;
pub mod events;
pub mod guard;
pub mod orchestrator;
pub mod pool;
pub mod schedule;

pub use collector::{CollectSettings, PageCollector};
pub use config::RvhConfig;
pub use countdown::Countdown;
pub use dedup::{DedupOutcome, Deduplicator};
pub use error::{CollectError, JobError, OrchestratorError, PageFailure};
pub use events::{AsyncEventLogger, EventSink, TracingEventSink};
pub use guard::{GuardLease, SourceGuard};
pub use orchestrator::{JobOrchestrator, OrchestratorSettings, GUARD_SKIP_MESSAGE};
pub use pool::{Admission, OverflowPolicy, PoolError, WorkerPool, WorkerPoolConfig};
pub use schedule::{
    maybe_build_scheduler, seed_sources, trigger_enabled_sources, SourceEntry, SourceRegistry,
};

pub const CRATE_NAME: &str = "rvh-sync";
