use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sasp_contracts::ContractManager;
use sasp_pipeline::{
    LocalCertificateIssuer, PipelineConfig, SourceClient, StatsAggregator, StatsProcessor,
    StatsWorker,
};
use sasp_store::{PgStore, StatsCache};
use sasp_web::AppState;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "sasp-cli")]
#[command(about = "Assessment stats pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web server and, unless disabled, the periodic jobs.
    Serve,
    /// Pull stats and attempts from the assessment service once.
    Fetch,
    /// Drain the staging tables once.
    Process,
    /// Scan for certifiable attempts once.
    Certificates {
        /// Restrict the scan to one student.
        #[arg(long)]
        student: Option<Uuid>,
    },
    /// Apply database migrations.
    Migrate,
}

struct Runtime {
    aggregator: Arc<StatsAggregator>,
    worker: Arc<StatsWorker>,
    processor: Arc<StatsProcessor>,
}

async fn build_runtime(config: &PipelineConfig) -> Result<Runtime> {
    let store = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("connecting to database")?,
    );
    let contracts = Arc::new(ContractManager::new(config.schemas_dir.clone()));
    let cache = StatsCache::new(
        config.cache_capacity,
        Duration::from_secs(config.cache_ttl_secs),
    );
    let aggregator = Arc::new(StatsAggregator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        cache,
    ));
    let processor = Arc::new(StatsProcessor::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        contracts.clone(),
        aggregator.clone(),
        Arc::new(LocalCertificateIssuer),
        config,
    ));
    let source = Arc::new(
        SourceClient::new(config, contracts, store.clone()).context("building source client")?,
    );
    let worker = Arc::new(StatsWorker::new(
        config.clone(),
        source,
        processor.clone(),
        store,
    ));
    Ok(Runtime {
        aggregator,
        worker,
        processor,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let runtime = build_runtime(&config).await?;
            let _scheduler = if config.scheduler_enabled {
                Some(runtime.worker.start().await?)
            } else {
                info!("scheduler disabled, serving web only");
                None
            };
            let bind_addr =
                std::env::var("SASP_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
            sasp_web::serve(
                AppState::new(runtime.aggregator, runtime.worker.clone()),
                &bind_addr,
            )
            .await?;
        }
        Commands::Fetch => {
            let runtime = build_runtime(&config).await?;
            let summary = runtime.worker.run_fetch().await?;
            println!(
                "fetch complete: students={} stats={} attempts={} failures={}",
                summary.students, summary.stats_fetched, summary.attempts_staged, summary.failures
            );
        }
        Commands::Process => {
            let runtime = build_runtime(&config).await?;
            let summary = runtime.worker.run_process().await?;
            println!(
                "process complete: processed={} failed={} refreshed_students={}",
                summary.processed, summary.failed, summary.refreshed_students
            );
        }
        Commands::Certificates { student } => {
            let runtime = build_runtime(&config).await?;
            let issued = runtime
                .processor
                .check_and_generate_certificates(student)
                .await?;
            println!("certificate scan complete: issued={issued}");
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
