use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};

use vectorsync_core::{EntryDescriptor, SourceRecord, SourceUuid, is_safe_table_name};

use super::InMemoryDatabase;
use crate::error::StoreError;
use crate::source::{EntryResolver, SourceCatalog};

#[async_trait]
impl SourceCatalog for InMemoryDatabase {
    async fn changed_since(
        &self,
        cursor: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        let tables = self.read()?;
        let mut rows: Vec<_> = tables
            .entries
            .values()
            .filter(|e| e.changed_at > cursor)
            .collect();
        rows.sort_by(|a, b| a.changed_at.cmp(&b.changed_at).then(a.id.cmp(&b.id)));

        Ok(rows
            .into_iter()
            .take(limit)
            .map(|e| {
                let alias = tables.entry_types.get(&e.type_id).map(|t| t.alias.clone());
                SourceRecord::new(e.uuid, e.version.clone(), e.changed_at, alias)
            })
            .collect())
    }
}

#[async_trait]
impl EntryResolver for InMemoryDatabase {
    async fn load_entry(&self, uuid: &SourceUuid) -> Result<Option<EntryDescriptor>, StoreError> {
        let tables = self.read()?;
        let Some(entry) = tables.entry_by_uuid(uuid) else {
            return Ok(None);
        };
        // Inner join semantics: an entry without a type is unresolvable.
        let Some(entry_type) = tables.entry_types.get(&entry.type_id) else {
            return Ok(None);
        };
        Ok(Some(EntryDescriptor {
            entry_id: entry.id,
            uuid: entry.uuid,
            version: entry.version.clone(),
            archived: entry.archived,
            created_at: entry.created_at,
            changed_at: entry.changed_at,
            type_id: entry.type_id,
            type_alias: entry_type.alias.clone(),
            table: entry_type.table.clone(),
        }))
    }

    async fn load_payload(
        &self,
        table: &str,
        id: i64,
    ) -> Result<Option<Map<String, JsonValue>>, StoreError> {
        if !is_safe_table_name(table) {
            return Err(StoreError::UnsafeIdentifier(table.to_string()));
        }
        Ok(self.read()?.payloads.get(&(table.to_string(), id)).cloned())
    }

    async fn is_public(&self, entry_id: i64) -> Result<bool, StoreError> {
        Ok(self.read()?.public.contains(&entry_id))
    }

    async fn tags(&self, entry_id: i64) -> Result<Vec<String>, StoreError> {
        Ok(self.read()?.tags.get(&entry_id).cloned().unwrap_or_default())
    }

    /// Peers in ascending entry id order, duplicates included.
    async fn related_uuids(&self, entry_id: i64) -> Result<Vec<SourceUuid>, StoreError> {
        let tables = self.read()?;
        let mut peers = tables.links.get(&entry_id).cloned().unwrap_or_default();
        peers.sort_unstable();
        Ok(peers
            .iter()
            .filter_map(|peer| tables.entries.get(peer).map(|e| e.uuid))
            .collect())
    }

    /// Name in the highest language id wins.
    async fn display_name(&self, entry_id: i64) -> Result<Option<String>, StoreError> {
        Ok(self
            .read()?
            .names
            .get(&entry_id)
            .and_then(|names| names.values().next_back().cloned()))
    }
}
