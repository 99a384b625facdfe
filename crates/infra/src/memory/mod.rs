//! In-memory backend.
//!
//! Implements every storage trait over plain maps behind one `RwLock`, with
//! the same conditional-update semantics as the Postgres backend. Each trait
//! method takes the lock once, so a select followed by an update is two
//! separate critical sections exactly as it is two statements in SQL.
//!
//! Intended for tests/dev. Not optimized for performance.

mod jobs;
mod ledger;
mod source;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};

use vectorsync_core::{
    Checkpoint, ClaimToken, JobId, JobState, SeenRecord, SourceUuid, SourceVersion,
};

use crate::checkpoint::CheckpointStore;
use crate::error::StoreError;
use crate::source::SchemaBootstrap;

#[derive(Debug, Clone)]
struct EntryTypeRow {
    alias: String,
    table: String,
}

#[derive(Debug, Clone)]
struct EntryRow {
    id: i64,
    uuid: SourceUuid,
    version: SourceVersion,
    type_id: i64,
    archived: bool,
    created_at: DateTime<Utc>,
    changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct JobRow {
    id: JobId,
    source_uuid: SourceUuid,
    source_version: Option<SourceVersion>,
    collection_key: String,
    /// Raw, as another producer may have written it.
    job_type: String,
    state: JobState,
    priority: i16,
    attempts: u32,
    lease_until: Option<DateTime<Utc>>,
    claim_token: Option<ClaimToken>,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    error_message: Option<String>,
}

#[derive(Debug, Default)]
struct Tables {
    // Source side
    entry_types: BTreeMap<i64, EntryTypeRow>,
    entries: BTreeMap<i64, EntryRow>,
    next_entry_id: i64,
    payloads: HashMap<(String, i64), Map<String, JsonValue>>,
    public: HashSet<i64>,
    tags: HashMap<i64, Vec<String>>,
    links: HashMap<i64, Vec<i64>>,
    names: HashMap<i64, BTreeMap<i32, String>>,

    // Queue side
    jobs: BTreeMap<JobId, JobRow>,
    next_job_id: i64,
    seen: BTreeMap<SourceUuid, SeenRecord>,
    checkpoints: HashMap<String, Checkpoint>,
    /// Rows whose state transitions fail, see [`InMemoryDatabase::set_job_locked`].
    locked_jobs: HashSet<JobId>,
}

impl Tables {
    fn entry_by_uuid(&self, uuid: &SourceUuid) -> Option<&EntryRow> {
        self.entries.values().find(|e| &e.uuid == uuid)
    }

    fn check_unlocked(&self, id: JobId) -> Result<(), StoreError> {
        if self.locked_jobs.contains(&id) {
            return Err(StoreError::Storage(format!("job {} is locked", id)));
        }
        Ok(())
    }
}

/// Source system and queue tables in one process.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    tables: RwLock<Tables>,
    offline: AtomicBool,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable store: every trait method fails with
    /// [`StoreError::Connection`] while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Simulate a row-level failure: finishing `id` (done, failed or
    /// superseded) errors with [`StoreError::Storage`] while set.
    pub fn set_job_locked(&self, id: JobId, locked: bool) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if locked {
            tables.locked_jobs.insert(id);
        } else {
            tables.locked_jobs.remove(&id);
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.check_online()?;
        self.tables
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.check_online()?;
        self.tables
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("in-memory store is offline".to_string()));
        }
        Ok(())
    }

    // Source fixtures.

    /// Register an entry type stored in `table`.
    pub fn put_type(&self, id: i64, alias: &str, table: &str) -> Result<(), StoreError> {
        self.write()?.entry_types.insert(
            id,
            EntryTypeRow {
                alias: alias.to_string(),
                table: table.to_string(),
            },
        );
        Ok(())
    }

    /// Insert or update the entry with `uuid`. Returns its row id.
    pub fn put_entry(
        &self,
        uuid: SourceUuid,
        version: SourceVersion,
        type_id: i64,
        changed_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut tables = self.write()?;
        if let Some(entry) = tables.entries.values_mut().find(|e| e.uuid == uuid) {
            entry.version = version;
            entry.type_id = type_id;
            entry.changed_at = changed_at;
            return Ok(entry.id);
        }

        tables.next_entry_id += 1;
        let id = tables.next_entry_id;
        tables.entries.insert(
            id,
            EntryRow {
                id,
                uuid,
                version,
                type_id,
                archived: false,
                created_at: changed_at,
                changed_at,
            },
        );
        Ok(id)
    }

    pub fn set_archived(&self, entry_id: i64, archived: bool) -> Result<(), StoreError> {
        if let Some(entry) = self.write()?.entries.get_mut(&entry_id) {
            entry.archived = archived;
        }
        Ok(())
    }

    /// Delete the entry with `uuid` from the source. Returns whether it existed.
    pub fn remove_entry(&self, uuid: &SourceUuid) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        let Some(id) = tables.entry_by_uuid(uuid).map(|e| e.id) else {
            return Ok(false);
        };
        tables.entries.remove(&id);
        Ok(true)
    }

    pub fn put_payload(
        &self,
        table: &str,
        id: i64,
        row: Map<String, JsonValue>,
    ) -> Result<(), StoreError> {
        self.write()?.payloads.insert((table.to_string(), id), row);
        Ok(())
    }

    pub fn set_public(&self, entry_id: i64, public: bool) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if public {
            tables.public.insert(entry_id);
        } else {
            tables.public.remove(&entry_id);
        }
        Ok(())
    }

    pub fn add_tag(&self, entry_id: i64, tag: &str) -> Result<(), StoreError> {
        self.write()?
            .tags
            .entry(entry_id)
            .or_default()
            .push(tag.to_string());
        Ok(())
    }

    pub fn add_link(&self, entry_id: i64, peer_id: i64) -> Result<(), StoreError> {
        self.write()?.links.entry(entry_id).or_default().push(peer_id);
        Ok(())
    }

    pub fn add_name(&self, entry_id: i64, lang_id: i32, name: &str) -> Result<(), StoreError> {
        self.write()?
            .names
            .entry(entry_id)
            .or_default()
            .insert(lang_id, name.to_string());
        Ok(())
    }
}

#[async_trait]
impl SchemaBootstrap for InMemoryDatabase {
    async fn ensure_schema(&self, checkpoint: &str) -> Result<(), StoreError> {
        self.write()?
            .checkpoints
            .entry(checkpoint.to_string())
            .or_insert_with(|| Checkpoint::initial(checkpoint));
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryDatabase {
    async fn load_checkpoint(&self, name: &str) -> Result<Checkpoint, StoreError> {
        Ok(self
            .read()?
            .checkpoints
            .get(name)
            .cloned()
            .unwrap_or_else(|| Checkpoint::initial(name)))
    }

    async fn advance_checkpoint(&self, name: &str, cursor: DateTime<Utc>) -> Result<(), StoreError> {
        self.write()?
            .checkpoints
            .entry(name.to_string())
            .or_insert_with(|| Checkpoint::initial(name))
            .advance(cursor);
        Ok(())
    }

    async fn touch_checkpoint(&self, name: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.write()?
            .checkpoints
            .entry(name.to_string())
            .or_insert_with(|| Checkpoint::initial(name))
            .touch(now);
        Ok(())
    }
}
