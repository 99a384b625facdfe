//! Scan checkpoint persistence.
//!
//! A checkpoint tracks the last processed source `changed_at` per named scan
//! stream plus the time of the last completed run. This enables:
//! - Resume after crash (scans continue from the last fully processed row)
//! - Idempotent re-scans (rows at or below the cursor are not read again)
//! - Throttling independent of whether a run found anything

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vectorsync_core::Checkpoint;

use crate::error::StoreError;

/// Checkpoint store for persisting scan cursors.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for `name`; a stream never seen before starts at the epoch.
    async fn load_checkpoint(&self, name: &str) -> Result<Checkpoint, StoreError>;

    /// Raise the cursor to `cursor` if it is ahead of the stored value.
    async fn advance_checkpoint(&self, name: &str, cursor: DateTime<Utc>) -> Result<(), StoreError>;

    /// Record that a run finished at `now`.
    async fn touch_checkpoint(&self, name: &str, now: DateTime<Utc>) -> Result<(), StoreError>;
}
