//! Folder quota maintenance CLI
//!
//! # Usage
//!
//! ```bash
//! # Create the schema
//! quota-rs --config quota.toml init
//!
//! # Rebuild every quota folder's usage from the tree
//! quota-rs recalculate
//!
//! # Apply queued usage changes
//! quota-rs incremental
//!
//! # Show one folder's limit and usage
//! quota-rs usage workspace://<id>
//!
//! # Run both jobs on their configured intervals until Ctrl-C
//! quota-rs run
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use quota_rs::config::QuotaConfig;
use quota_rs::quota::{JobMode, ReconciliationJob, UpdateQueue};
use quota_rs::store::{NodeRef, QuotaProperty, SqliteTreeStore, TreeStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "quota-rs")]
#[command(about = "Maintain folder quota usage counters", long_about = None)]
struct Cli {
    /// Configuration file (TOML); QUOTA_* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database URL, overriding the configuration (e.g., sqlite://quota.db)
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store schema
    Init,
    /// Recompute every quota folder's usage from the tree
    Recalculate,
    /// Drain the update queue
    Incremental,
    /// Print a folder's quota and usage as JSON
    Usage {
        /// Node reference (e.g., workspace://<id>)
        node: String,
    },
    /// Run incremental and recalculation jobs on their intervals
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = QuotaConfig::load(cli.config.as_ref()).context("loading configuration")?;
    if let Some(db) = cli.db {
        config.store.database_url = db;
    }

    quota_rs::logging::init(&config.logging);

    let store = Arc::new(
        SqliteTreeStore::connect(&config.store.database_url)
            .await
            .context("opening quota store")?,
    );

    let policy = config.worker_pool.retry_policy();
    let drainable = config.validate_standalone_drain();
    let queue = drainable.is_ok().then(|| {
        Arc::new(UpdateQueue::new(
            config.quota.queue_strategy,
            Arc::clone(&store),
            policy.clone(),
        ))
    });
    let job = ReconciliationJob::new(store.clone(), queue, policy).run_as(config.job.run_as.clone());

    match cli.command {
        Commands::Init => {
            info!("Store schema ready at {}", config.store.database_url);
        }
        Commands::Recalculate => {
            let report = job.run(JobMode::Recalculate).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Incremental => {
            drainable.context("nothing for the incremental job to drain")?;
            let report = job.run(JobMode::Incremental).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Usage { node } => {
            let node: NodeRef = node.parse()?;
            if !store.exists(&node).await? {
                anyhow::bail!("node {} does not exist", node);
            }

            let summary = serde_json::json!({
                "node": node.to_string(),
                "has_quota": store.has_quota_marker(&node).await?,
                "size_quota": store.property(&node, QuotaProperty::SizeQuota).await?,
                "size_current": store.property(&node, QuotaProperty::SizeCurrent).await?,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Run => {
            if let Err(e) = drainable {
                warn!("Incremental runs will drain nothing: {}", e);
            }
            run_scheduled(&job, &config).await
        }
    }

    Ok(())
}

async fn run_scheduled(job: &ReconciliationJob, config: &QuotaConfig) {
    let mut incremental =
        tokio::time::interval(Duration::from_secs(config.job.incremental_interval_secs.max(1)));
    let mut recalculate =
        tokio::time::interval(Duration::from_secs(config.job.recalculate_interval_secs.max(1)));

    info!(
        "Scheduling incremental every {}s and recalculation every {}s",
        config.job.incremental_interval_secs, config.job.recalculate_interval_secs
    );

    loop {
        tokio::select! {
            _ = incremental.tick() => {
                if let Err(e) = job.run(JobMode::Incremental).await {
                    error!("Incremental quota job failed: {}", e);
                }
            }
            _ = recalculate.tick() => {
                if let Err(e) = job.run(JobMode::Recalculate).await {
                    error!("Quota recalculation failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down quota scheduler");
                break;
            }
        }
    }
}
