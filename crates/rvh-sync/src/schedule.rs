//! Source registry seeding + periodic re-trigger.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rvh_storage::{SourceStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RvhConfig;
use crate::orchestrator::JobOrchestrator;

/// `sources.yaml`: the seed list copied into the source store at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub url: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceRegistry {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceEntry> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// Adds every url from the seed file the store does not have yet; returns how many were added.
/// A missing file seeds nothing. Urls already in the store keep their current `enabled` flag.
pub async fn seed_sources(store: &dyn SourceStore, path: &Path) -> Result<usize> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        debug!(path = %path.display(), "no source seed file");
        return Ok(0);
    }
    let registry = SourceRegistry::load(path).await?;
    let mut added = 0;
    for entry in &registry.sources {
        match store.add(&entry.url).await {
            Ok(source) => {
                added += 1;
                if !entry.enabled {
                    store.set_enabled(source.id, false).await?;
                }
            }
            Err(StoreError::Conflict(_)) => {}
            Err(err) => return Err(err).context("seeding sources"),
        }
    }
    info!(added, path = %path.display(), "sources seeded");
    Ok(added)
}

/// Starts one job per enabled source and stamps those sources as triggered.
/// Sources that fail validation are logged, skipped and left unstamped.
pub async fn trigger_enabled_sources(
    orchestrator: &JobOrchestrator,
    sources: &dyn SourceStore,
) -> Result<Vec<Uuid>> {
    let enabled = sources
        .list_enabled()
        .await
        .context("listing enabled sources")?;
    let mut started = Vec::new();
    let mut triggered = Vec::new();
    for source in &enabled {
        match orchestrator.start(&source.url).await {
            Ok(job_id) => {
                started.push(job_id);
                triggered.push(source.id);
            }
            Err(err) => warn!(url = %source.url, error = %err, "scheduled source skipped"),
        }
    }
    sources
        .mark_triggered(&triggered, Utc::now())
        .await
        .context("stamping triggered sources")?;
    info!(started = started.len(), "scheduled trigger finished");
    Ok(started)
}

pub async fn maybe_build_scheduler(
    config: &RvhConfig,
    orchestrator: JobOrchestrator,
    sources: Arc<dyn SourceStore>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.schedule_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        let sources = sources.clone();
        Box::pin(async move {
            if let Err(err) = trigger_enabled_sources(&orchestrator, sources.as_ref()).await {
                warn!(error = %err, "scheduled trigger failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
