mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};

use vectorsync_core::JobState;
use vectorsync_infra::config::{self, Config};
use vectorsync_infra::{EnqueueRun, JobStore, LeaseReaper, PostgresDatabase, SchemaBootstrap};

use crate::cli::{CliArgs, Command};

#[tokio::main]
async fn main() -> Result<()> {
    config::load_dotenv();
    let args = CliArgs::parse();
    vectorsync_observability::init_with_default(&args.log_level);

    let config = Config::from_env().context("invalid configuration")?;
    let db_config = config.require_database()?;
    let db = Arc::new(
        PostgresDatabase::connect(db_config)
            .await
            .context("failed to connect to postgres")?,
    );

    match args.command {
        Command::Enqueue => {
            let report = EnqueueRun::new(db, config.queue).run().await?;
            println!("{report}");
        }
        Command::Reap => {
            db.ensure_schema(&config.queue.checkpoint_name).await?;
            let outcome = LeaseReaper::new(db, config.queue.retry.max_attempts)
                .reap()
                .await?;
            println!(
                "Reap done - requeued: {}, failed: {}",
                outcome.requeued, outcome.failed
            );
        }
        Command::Stats => {
            db.ensure_schema(&config.queue.checkpoint_name).await?;
            let stats = db.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Errors { limit } => {
            db.ensure_schema(&config.queue.checkpoint_name).await?;
            for job in db.list_jobs(JobState::Error, limit).await? {
                println!("{}", serde_json::to_string(&job)?);
            }
        }
        Command::Requeue { job_ids } => {
            db.ensure_schema(&config.queue.checkpoint_name).await?;
            let total = job_ids.len();
            let mut requeued = 0;
            for job_id in job_ids {
                if db.requeue(job_id, Utc::now()).await? {
                    info!(%job_id, "job requeued");
                    requeued += 1;
                } else {
                    warn!(%job_id, "job not in error state; left as is");
                }
            }
            println!("Requeued {requeued} of {total} jobs");
        }
    }

    Ok(())
}
