//! Interfaces consumed from the source system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};

use vectorsync_core::{EntryDescriptor, SourceRecord, SourceUuid};

use crate::error::StoreError;

/// Change feed over source entries.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// Up to `limit` entries with `changed_at > cursor`, oldest first.
    async fn changed_since(
        &self,
        cursor: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError>;
}

/// Lookups needed to turn an upsert job into a payload.
#[async_trait]
pub trait EntryResolver: Send + Sync {
    /// Entry joined with its type, `None` if the entry is gone.
    async fn load_entry(&self, uuid: &SourceUuid) -> Result<Option<EntryDescriptor>, StoreError>;

    /// Full payload row `id` from `table`.
    async fn load_payload(
        &self,
        table: &str,
        id: i64,
    ) -> Result<Option<Map<String, JsonValue>>, StoreError>;

    /// Whether anonymous visitors may see the entry.
    async fn is_public(&self, entry_id: i64) -> Result<bool, StoreError>;

    /// Raw tags attached to the entry.
    async fn tags(&self, entry_id: i64) -> Result<Vec<String>, StoreError>;

    /// Entries linked to this one.
    async fn related_uuids(&self, entry_id: i64) -> Result<Vec<SourceUuid>, StoreError>;

    /// Preferred display name.
    async fn display_name(&self, entry_id: i64) -> Result<Option<String>, StoreError>;
}

/// Idempotent creation of the queue's own tables.
#[async_trait]
pub trait SchemaBootstrap: Send + Sync {
    /// Create the job, seen and checkpoint tables if missing and make sure a
    /// checkpoint row named `checkpoint` exists.
    async fn ensure_schema(&self, checkpoint: &str) -> Result<(), StoreError>;
}
