//! Ephemeral work items handed to the embedding executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

use crate::id::{ClaimToken, JobId, SourceUuid, SourceVersion};
use crate::job::JobType;
use crate::source::EntryDescriptor;

pub const DELETE_CONTENT_TYPE: &str = "application/x-embedding-job-delete";
pub const ENTRY_CONTENT_TYPE: &str = "application/x-entry-json";

/// Deterministic idempotency key for a (collection, entry, version) triple.
///
/// SHA-256 over `collection:UUIDHEX:VERSIONHEX`, rendered as lowercase hex.
pub fn content_hash(
    collection_key: &str,
    uuid: &SourceUuid,
    version: Option<&SourceVersion>,
) -> String {
    let version_hex = version.map(SourceVersion::to_hex).unwrap_or_default();
    let input = format!("{}:{}:{}", collection_key, uuid.to_hex(), version_hex);
    let digest = Sha256::digest(input.as_bytes());
    format!("{digest:x}")
}

/// Metadata attached to every vector written for an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainMetadata {
    pub content_uuid: SourceUuid,
    pub content_version: Option<SourceVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_alias: Option<String>,
    pub archived: bool,
    pub public: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_uuids: Vec<SourceUuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DomainMetadata {
    /// Metadata known from the job row alone.
    pub fn bare(content_uuid: SourceUuid, content_version: Option<SourceVersion>) -> Self {
        Self {
            content_uuid,
            content_version,
            type_alias: None,
            archived: false,
            public: false,
            tags: Vec::new(),
            related_uuids: Vec::new(),
            name: None,
        }
    }

    /// Tags trimmed, lower-cased and de-duplicated in first-seen order.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for tag in tags {
            let tag = tag.as_ref().trim().to_lowercase();
            if tag.is_empty() || out.contains(&tag) {
                continue;
            }
            out.push(tag);
        }
        self.tags = out;
        self
    }

    /// Related entries de-duplicated in first-seen order. A self link is kept.
    pub fn with_related(mut self, related: impl IntoIterator<Item = SourceUuid>) -> Self {
        let mut out: Vec<SourceUuid> = Vec::new();
        for uuid in related {
            if uuid.is_nil() || out.contains(&uuid) {
                continue;
            }
            out.push(uuid);
        }
        self.related_uuids = out;
        self
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        self
    }
}

/// Entry columns carried in an upsert payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub id: i64,
    pub uuid: SourceUuid,
    pub type_id: i64,
    pub version: SourceVersion,
    pub created_at: DateTime<Utc>,
    pub changed_at: DateTime<Utc>,
}

/// Type descriptor carried in an upsert payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub id: i64,
    pub alias: String,
    pub table: String,
}

/// Full source row plus its type, captured at claim time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadSnapshot {
    pub entry: EntrySnapshot,
    #[serde(rename = "type")]
    pub entry_type: TypeDescriptor,
    pub payload: Map<String, JsonValue>,
}

impl PayloadSnapshot {
    pub fn new(entry: &EntryDescriptor, payload: Map<String, JsonValue>) -> Self {
        Self {
            entry: EntrySnapshot {
                id: entry.entry_id,
                uuid: entry.uuid,
                type_id: entry.type_id,
                version: entry.version.clone(),
                created_at: entry.created_at,
                changed_at: entry.changed_at,
            },
            entry_type: TypeDescriptor {
                id: entry.type_id,
                alias: entry.type_alias.clone(),
                table: entry.table.clone(),
            },
            payload,
        }
    }

    /// Size of the JSON encoding in bytes.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// What the executor must do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkAction {
    Upsert { payload: PayloadSnapshot },
    Delete,
}

/// Unit of work produced by a claim, consumed once by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: JobId,
    /// Claim that produced this item; ack and fail only apply while it still holds.
    pub claim_token: ClaimToken,
    pub collection_key: String,
    pub content_hash: String,
    pub metadata: DomainMetadata,
    #[serde(flatten)]
    pub action: WorkAction,
}

impl WorkItem {
    pub fn delete(
        job_id: JobId,
        claim_token: ClaimToken,
        collection_key: impl Into<String>,
        metadata: DomainMetadata,
    ) -> Self {
        let collection_key = collection_key.into();
        let content_hash = content_hash(
            &collection_key,
            &metadata.content_uuid,
            metadata.content_version.as_ref(),
        );
        Self {
            job_id,
            claim_token,
            collection_key,
            content_hash,
            metadata,
            action: WorkAction::Delete,
        }
    }

    pub fn upsert(
        job_id: JobId,
        claim_token: ClaimToken,
        collection_key: impl Into<String>,
        metadata: DomainMetadata,
        payload: PayloadSnapshot,
    ) -> Self {
        let collection_key = collection_key.into();
        let content_hash = content_hash(
            &collection_key,
            &metadata.content_uuid,
            metadata.content_version.as_ref(),
        );
        Self {
            job_id,
            claim_token,
            collection_key,
            content_hash,
            metadata,
            action: WorkAction::Upsert { payload },
        }
    }

    pub fn job_type(&self) -> JobType {
        match self.action {
            WorkAction::Upsert { .. } => JobType::Upsert,
            WorkAction::Delete => JobType::Delete,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.action, WorkAction::Delete)
    }

    pub fn content_type(&self) -> &'static str {
        match self.action {
            WorkAction::Upsert { .. } => ENTRY_CONTENT_TYPE,
            WorkAction::Delete => DELETE_CONTENT_TYPE,
        }
    }

    pub fn payload(&self) -> Option<&PayloadSnapshot> {
        match &self.action {
            WorkAction::Upsert { payload } => Some(payload),
            WorkAction::Delete => None,
        }
    }

    /// Encoded payload size; zero for deletes.
    pub fn size(&self) -> usize {
        self.payload().map(PayloadSnapshot::encoded_len).unwrap_or(0)
    }
}
