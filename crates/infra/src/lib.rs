//! Infrastructure layer: storage traits, Postgres and in-memory backends,
//! scanners, claim protocol, config.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod memory;
pub mod postgres;
pub mod scan;
pub mod source;

mod integration_tests;

pub use checkpoint::CheckpointStore;
pub use config::{Config, ConfigError, DatabaseConfig, QueueConfig};
pub use error::StoreError;
pub use jobs::{
    Acker, ClaimedJob, Claimer, ExecutionError, ExecutionOutcome, Executor, JobStore,
    LeaseReaper, ReapOutcome, WorkerReport, WorkerRun,
};
pub use ledger::SeenLedger;
pub use memory::InMemoryDatabase;
pub use postgres::PostgresDatabase;
pub use scan::{ChangeScanOutcome, ChangeScanner, DeletionScanner, EnqueueReport, EnqueueRun};
pub use source::{EntryResolver, SchemaBootstrap, SourceCatalog};
