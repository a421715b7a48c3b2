use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rvh_adapters::SourceAdapters;
use rvh_core::JobStatus;
use rvh_storage::{
    connect_pool, run_migrations, HttpFetcher, InMemoryJobRegistry, InMemoryReviewStore,
    InMemorySourceStore, JobRegistry, PgJobRegistry, PgReviewStore, PgSourceStore, ReviewStore,
    SourceStore,
};
use rvh_sync::{
    maybe_build_scheduler, seed_sources, trigger_enabled_sources, AsyncEventLogger,
    JobOrchestrator, OrchestratorSettings, RvhConfig,
};
use rvh_web::AppState;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "rvh-cli")]
#[command(about = "Review Harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (and the cron trigger when enabled).
    Serve,
    /// Start one job and print its final state.
    Parse {
        url: String,
        #[arg(long, default_value_t = 60)]
        wait_secs: u64,
    },
    /// Start one job per enabled source in the source store.
    Trigger {
        #[arg(long, default_value_t = 60)]
        wait_secs: u64,
    },
    Migrate,
}

struct Runtime {
    orchestrator: JobOrchestrator,
    reviews: Arc<dyn ReviewStore>,
    sources: Arc<dyn SourceStore>,
}

impl Runtime {
    fn app_state(&self) -> AppState {
        AppState::new(
            self.orchestrator.clone(),
            self.reviews.clone(),
            self.sources.clone(),
        )
    }
}

type Stores = (
    Arc<dyn JobRegistry>,
    Arc<dyn ReviewStore>,
    Arc<dyn SourceStore>,
);

async fn build_runtime(config: &RvhConfig) -> Result<Runtime> {
    let (jobs, reviews, sources): Stores = match &config.database_url {
        Some(url) => {
            let pool = connect_pool(url).await?;
            run_migrations(&pool).await?;
            (
                Arc::new(PgJobRegistry::new(pool.clone())),
                Arc::new(PgReviewStore::new(pool.clone())),
                Arc::new(PgSourceStore::new(pool)),
            )
        }
        None => {
            warn!("DATABASE_URL not set; jobs, reviews and sources are kept in memory");
            (
                Arc::new(InMemoryJobRegistry::new()),
                Arc::new(InMemoryReviewStore::new()),
                Arc::new(InMemorySourceStore::new()),
            )
        }
    };
    seed_sources(sources.as_ref(), &config.sources_file).await?;

    let http = Arc::new(HttpFetcher::new(config.http_client())?);
    let adapters = SourceAdapters::over_http(http, config.stub_base_url.clone(), config.steam());
    // the drain task ends on its own once the last logger clone is dropped
    let (events, _drain) = AsyncEventLogger::start();

    let orchestrator = JobOrchestrator::new(
        OrchestratorSettings::from(config),
        jobs,
        reviews.clone(),
        adapters,
        Arc::new(events),
    );
    Ok(Runtime {
        orchestrator,
        reviews,
        sources,
    })
}

/// Paged sources are fetched from this binary's own `/stub/reviews` route. One-shot commands
/// serve it in the background unless the web port is already taken by `serve`.
async fn serve_stub_in_process(config: &RvhConfig, runtime: &Runtime) {
    match rvh_web::bind(config.web_port).await {
        Ok(listener) => {
            let state = runtime.app_state();
            tokio::spawn(async move {
                if let Err(err) = rvh_web::serve_on(listener, state).await {
                    warn!(error = %err, "in-process stub server stopped");
                }
            });
        }
        Err(err) => warn!(
            port = config.web_port,
            error = %err,
            "web port unavailable; expecting a running server to provide the stub route"
        ),
    }
}

async fn report_job(orchestrator: &JobOrchestrator, job_id: Uuid, wait: Duration) -> Result<bool> {
    let job = orchestrator.wait_for_terminal(job_id, wait).await?;
    println!(
        "job {} {:?} url={} created={} error={}",
        job.id,
        job.status,
        job.source_key,
        job.created_reviews.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
        job.error_message.as_deref().unwrap_or("-"),
    );
    Ok(job.status == JobStatus::Success)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RvhConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let runtime = build_runtime(&config).await?;
            let scheduler = maybe_build_scheduler(
                &config,
                runtime.orchestrator.clone(),
                runtime.sources.clone(),
            )
            .await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.schedule_cron, "scheduler started");
            }

            let state = runtime.app_state();
            tokio::select! {
                served = rvh_web::serve(config.web_port, state) => served?,
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
            }

            if let Some(mut sched) = scheduler {
                if let Err(err) = sched.shutdown().await {
                    warn!(error = %err, "scheduler shutdown failed");
                }
            }
            runtime.orchestrator.shutdown().await;
        }
        Commands::Parse { url, wait_secs } => {
            let runtime = build_runtime(&config).await?;
            serve_stub_in_process(&config, &runtime).await;
            let job_id = runtime.orchestrator.start(&url).await?;
            let ok =
                report_job(&runtime.orchestrator, job_id, Duration::from_secs(wait_secs)).await?;
            runtime.orchestrator.shutdown().await;
            if !ok {
                bail!("job {job_id} did not succeed");
            }
        }
        Commands::Trigger { wait_secs } => {
            let runtime = build_runtime(&config).await?;
            serve_stub_in_process(&config, &runtime).await;
            let started =
                trigger_enabled_sources(&runtime.orchestrator, runtime.sources.as_ref()).await?;
            for job_id in started {
                report_job(&runtime.orchestrator, job_id, Duration::from_secs(wait_secs)).await?;
            }
            runtime.orchestrator.shutdown().await;
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let pool = connect_pool(url).await?;
            run_migrations(&pool).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
