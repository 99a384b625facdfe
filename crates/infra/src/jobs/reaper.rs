//! Lease expiry.
//!
//! A claimer that dies between claim and ack leaves its rows `running`. The
//! claim select only looks at `pending`, so without this sweep such rows would
//! be stranded for good.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::StoreError;
use crate::jobs::store::{JobStore, ReapOutcome};

pub struct LeaseReaper<S> {
    store: Arc<S>,
    max_attempts: u32,
}

impl<S: JobStore> LeaseReaper<S> {
    pub fn new(store: Arc<S>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }

    pub async fn reap(&self) -> Result<ReapOutcome, StoreError> {
        self.reap_at(Utc::now()).await
    }

    /// Lapsed leases go back to `pending`; those that already used up their
    /// attempts go to `error` so every job still terminates.
    pub async fn reap_at(&self, now: DateTime<Utc>) -> Result<ReapOutcome, StoreError> {
        let outcome = self.store.reap_expired(now, self.max_attempts).await?;
        if outcome.requeued > 0 || outcome.failed > 0 {
            info!(
                requeued = outcome.requeued,
                failed = outcome.failed,
                "reaped expired leases"
            );
        }
        Ok(outcome)
    }
}
