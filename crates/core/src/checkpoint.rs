//! Scan checkpoints: a monotonic cursor over source change timestamps plus a
//! run timestamp used for throttling.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named scan cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    /// Highest `changed_at` fully processed.
    pub last_changed: DateTime<Utc>,
    /// `None` until the first completed run.
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Checkpoint for a stream that has never been scanned.
    pub fn initial(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_changed: DateTime::<Utc>::UNIX_EPOCH,
            last_run_at: None,
        }
    }

    /// Whether a run at `now` is allowed under the `min_interval` throttle.
    pub fn should_run(&self, now: DateTime<Utc>, min_interval: Duration) -> bool {
        let Some(last_run_at) = self.last_run_at else {
            return true;
        };
        let min_interval = chrono::Duration::from_std(min_interval).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(last_run_at) >= min_interval
    }

    /// Move the cursor forward; never regresses.
    pub fn advance(&mut self, cursor: DateTime<Utc>) {
        if cursor > self.last_changed {
            self.last_changed = cursor;
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_run_at = Some(now);
    }
}
