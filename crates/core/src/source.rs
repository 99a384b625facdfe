//! Source-side records (read-only to the queue).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::id::{SourceUuid, SourceVersion};

/// Collection used when a source row carries no type alias.
pub const DEFAULT_COLLECTION_KEY: &str = "default";

/// A changed row as reported by the source system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub uuid: SourceUuid,
    pub version: SourceVersion,
    pub changed_at: DateTime<Utc>,
    /// Classifies the owning collection.
    pub type_alias: Option<String>,
    /// Attributes this build does not model.
    #[serde(default, flatten)]
    pub extra: Map<String, JsonValue>,
}

impl SourceRecord {
    pub fn new(
        uuid: SourceUuid,
        version: SourceVersion,
        changed_at: DateTime<Utc>,
        type_alias: Option<String>,
    ) -> Self {
        Self {
            uuid,
            version,
            changed_at,
            type_alias,
            extra: Map::new(),
        }
    }

    /// Collection this row belongs to, falling back to `default_key`.
    pub fn collection_key(&self, default_key: &str) -> String {
        normalize_collection_key(self.type_alias.as_deref(), default_key)
    }
}

/// Trimmed collection key; blank or absent keys map to `default_key`.
pub fn normalize_collection_key(raw: Option<&str>, default_key: &str) -> String {
    match raw.map(str::trim) {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => default_key.to_string(),
    }
}

/// Entry row joined with its type, as needed to build an upsert payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDescriptor {
    /// Row id of the entry (also the payload row id)
    pub entry_id: i64,
    pub uuid: SourceUuid,
    pub version: SourceVersion,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub changed_at: DateTime<Utc>,
    pub type_id: i64,
    pub type_alias: String,
    /// Storage table holding the payload row
    pub table: String,
}

/// Table names are interpolated into SQL, so only `[A-Za-z0-9_]+` is allowed.
pub fn is_safe_table_name(table: &str) -> bool {
    !table.is_empty() && table.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}
