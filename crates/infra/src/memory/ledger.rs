use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vectorsync_core::{JobId, SeenObservation, SeenRecord, SourceUuid};

use super::InMemoryDatabase;
use crate::error::StoreError;
use crate::ledger::SeenLedger;

#[async_trait]
impl SeenLedger for InMemoryDatabase {
    async fn upsert_seen(&self, obs: &SeenObservation, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.write()?
            .seen
            .entry(obs.source_uuid)
            .and_modify(|row| row.observe(obs, now))
            .or_insert_with(|| SeenRecord::observed(obs, now));
        Ok(())
    }

    async fn get_seen(&self, uuid: &SourceUuid) -> Result<Option<SeenRecord>, StoreError> {
        Ok(self.read()?.seen.get(uuid).cloned())
    }

    async fn list_vanished(&self, limit: usize) -> Result<Vec<SeenRecord>, StoreError> {
        let tables = self.read()?;
        let mut rows: Vec<SeenRecord> = tables
            .seen
            .values()
            .filter(|row| !row.is_missing() && tables.entry_by_uuid(&row.source_uuid).is_none())
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.last_seen_changed_at
                .cmp(&b.last_seen_changed_at)
                .then(a.source_uuid.cmp(&b.source_uuid))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mark_missing(&self, uuid: &SourceUuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        match tables.seen.get_mut(uuid) {
            Some(row) if row.missing_since.is_none() => {
                row.missing_since = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_delete_job(&self, uuid: &SourceUuid, job_id: JobId) -> Result<(), StoreError> {
        if let Some(row) = self.write()?.seen.get_mut(uuid) {
            row.delete_job_id = Some(job_id);
        }
        Ok(())
    }

    async fn mark_deleted(
        &self,
        uuid: &SourceUuid,
        collection_key: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.write()?;
        match tables.seen.get_mut(uuid) {
            Some(row) if row.last_seen_collection_key == collection_key => {
                row.deleted_at = Some(now);
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vectorsync_core::SourceVersion;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    fn obs(uuid: SourceUuid, version: &str, collection: &str) -> SeenObservation {
        SeenObservation {
            source_uuid: uuid,
            version: SourceVersion::from_bytes(version.as_bytes().to_vec()),
            changed_at: at(5),
            collection_key: collection.to_string(),
        }
    }

    #[tokio::test]
    async fn vanished_rows_exclude_live_and_missing_entries() {
        let db = InMemoryDatabase::new();
        let live = SourceUuid::new();
        let gone = SourceUuid::new();
        let already = SourceUuid::new();

        db.put_entry(live, SourceVersion::from_bytes(b"v".to_vec()), 1, at(5))
            .unwrap();
        for uuid in [live, gone, already] {
            db.upsert_seen(&obs(uuid, "v", "c"), at(6)).await.unwrap();
        }
        assert!(db.mark_missing(&already, at(7)).await.unwrap());

        let vanished = db.list_vanished(10).await.unwrap();
        assert_eq!(vanished.len(), 1);
        assert_eq!(vanished[0].source_uuid, gone);
    }

    #[tokio::test]
    async fn mark_missing_wins_once() {
        let db = InMemoryDatabase::new();
        let uuid = SourceUuid::new();
        db.upsert_seen(&obs(uuid, "v", "c"), at(6)).await.unwrap();

        assert!(db.mark_missing(&uuid, at(7)).await.unwrap());
        assert!(!db.mark_missing(&uuid, at(8)).await.unwrap());
        assert_eq!(
            db.get_seen(&uuid).await.unwrap().unwrap().missing_since,
            Some(at(7))
        );
    }

    #[tokio::test]
    async fn mark_deleted_requires_matching_collection() {
        let db = InMemoryDatabase::new();
        let uuid = SourceUuid::new();
        db.upsert_seen(&obs(uuid, "v", "article"), at(6)).await.unwrap();

        assert_eq!(db.mark_deleted(&uuid, "product", at(7)).await.unwrap(), 0);
        assert_eq!(db.mark_deleted(&uuid, "article", at(8)).await.unwrap(), 1);
        assert_eq!(
            db.get_seen(&uuid).await.unwrap().unwrap().deleted_at,
            Some(at(8))
        );
    }

    #[tokio::test]
    async fn reobserving_clears_deletion_state() {
        let db = InMemoryDatabase::new();
        let uuid = SourceUuid::new();
        db.upsert_seen(&obs(uuid, "v1", "c"), at(6)).await.unwrap();
        db.mark_missing(&uuid, at(7)).await.unwrap();
        db.set_delete_job(&uuid, JobId(9)).await.unwrap();

        db.upsert_seen(&obs(uuid, "v2", "c"), at(8)).await.unwrap();
        let row = db.get_seen(&uuid).await.unwrap().unwrap();
        assert!(row.missing_since.is_none());
        assert!(row.delete_job_id.is_none());
        assert_eq!(row.last_seen_at, at(8));
    }
}
