use clap::{Parser, Subcommand};

use vectorsync_core::JobId;

/// Embedding job queue maintenance.
///
/// Connection and queue settings come from the environment (`DATABASE_URL`,
/// `VECTORSYNC_*`), optionally loaded from a `.env` file.
#[derive(Parser, Debug)]
#[command(name = "vectorsync", about = "Embedding job queue maintenance")]
pub struct CliArgs {
    /// Default log filter when RUST_LOG is unset
    #[arg(long, env = "VECTORSYNC_LOG", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one throttled change + deletion scan
    Enqueue,
    /// Return jobs with lapsed leases to the queue
    Reap,
    /// Print job counts per state as JSON
    Stats,
    /// List failed jobs with their error messages, one JSON object per line
    Errors {
        /// Maximum number of jobs to print
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Move failed jobs back to pending with a fresh attempt budget
    Requeue {
        /// Job ids to requeue
        #[arg(required = true)]
        job_ids: Vec<JobId>,
    },
}
