//! Embedding job queue.
//!
//! Provides:
//! - Job storage abstraction with a race-tolerant claim protocol
//! - Claimer that resolves claimed rows into work items
//! - Acker for success and failure reporting with bounded retries
//! - Lease reaper for claims that were never acked
//! - Worker run that drives an executor over one claimed batch
//!
//! ## Job lifecycle
//!
//! ```text
//! pending ──claim──> running ──ack──> done
//!    │                  │
//!    │                  ├──fail (retryable, attempts < max)──> pending
//!    │                  ├──fail (otherwise)──────────────────> error ──requeue──> pending
//!    │                  ├──stale at claim────────────────────> superseded
//!    │                  └──lease lapsed──> pending | error
//!    └──newer version scanned──> superseded
//! ```

pub mod acker;
pub mod claimer;
pub mod reaper;
pub mod store;
pub mod worker;

pub use acker::Acker;
pub use claimer::Claimer;
pub use reaper::LeaseReaper;
pub use store::{ClaimedJob, JobStore, ReapOutcome};
pub use worker::{ExecutionError, ExecutionOutcome, Executor, WorkerReport, WorkerRun};
