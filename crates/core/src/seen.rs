//! Seen ledger records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobId, SourceUuid, SourceVersion};

/// Last known state of a source entry, kept after the entry itself is gone.
///
/// Once the source row has vanished this is the only place that still knows
/// which collection the entry's vectors live in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub source_uuid: SourceUuid,
    pub last_seen_version: SourceVersion,
    pub last_seen_changed_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_seen_collection_key: String,
    pub missing_since: Option<DateTime<Utc>>,
    pub delete_job_id: Option<JobId>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Observation written through by the change scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenObservation {
    pub source_uuid: SourceUuid,
    pub version: SourceVersion,
    pub changed_at: DateTime<Utc>,
    pub collection_key: String,
}

impl SeenRecord {
    /// Fresh ledger row for a first observation.
    pub fn observed(obs: &SeenObservation, now: DateTime<Utc>) -> Self {
        Self {
            source_uuid: obs.source_uuid,
            last_seen_version: obs.version.clone(),
            last_seen_changed_at: obs.changed_at,
            last_seen_at: now,
            last_seen_collection_key: obs.collection_key.clone(),
            missing_since: None,
            delete_job_id: None,
            deleted_at: None,
        }
    }

    /// Apply a new observation. Seeing the entry again clears any deletion
    /// bookkeeping from an earlier disappearance.
    pub fn observe(&mut self, obs: &SeenObservation, now: DateTime<Utc>) {
        *self = Self::observed(obs, now);
    }

    pub fn is_missing(&self) -> bool {
        self.missing_since.is_some()
    }

    /// Whether an upsert job for `version` in `collection_key` is stale.
    ///
    /// Only a ledger row in the same collection counts; a row owned by
    /// another collection never supersedes.
    pub fn supersedes(&self, version: &SourceVersion, collection_key: &str) -> bool {
        if self.last_seen_version.is_empty() {
            return false;
        }
        if self.last_seen_collection_key != collection_key {
            return false;
        }
        &self.last_seen_version != version
    }
}
