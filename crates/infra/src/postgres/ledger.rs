use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use tracing::instrument;

use vectorsync_core::{JobId, SeenObservation, SeenRecord, SourceUuid, SourceVersion};

use super::PostgresDatabase;
use crate::error::{StoreError, map_sqlx_error};
use crate::ledger::SeenLedger;

const SEEN_COLUMNS: &str = "source_uuid, last_seen_version, last_seen_changed_at, last_seen_at, \
     last_seen_collection_key, missing_since, delete_job_id, deleted_at";

struct SeenRow {
    source_uuid: uuid::Uuid,
    last_seen_version: Vec<u8>,
    last_seen_changed_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    last_seen_collection_key: String,
    missing_since: Option<DateTime<Utc>>,
    delete_job_id: Option<i64>,
    deleted_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for SeenRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(SeenRow {
            source_uuid: row.try_get("source_uuid")?,
            last_seen_version: row.try_get("last_seen_version")?,
            last_seen_changed_at: row.try_get("last_seen_changed_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
            last_seen_collection_key: row.try_get("last_seen_collection_key")?,
            missing_since: row.try_get("missing_since")?,
            delete_job_id: row.try_get("delete_job_id")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

impl From<SeenRow> for SeenRecord {
    fn from(row: SeenRow) -> Self {
        SeenRecord {
            source_uuid: SourceUuid::from_uuid(row.source_uuid),
            last_seen_version: SourceVersion::from_bytes(row.last_seen_version),
            last_seen_changed_at: row.last_seen_changed_at,
            last_seen_at: row.last_seen_at,
            last_seen_collection_key: row.last_seen_collection_key,
            missing_since: row.missing_since,
            delete_job_id: row.delete_job_id.map(JobId),
            deleted_at: row.deleted_at,
        }
    }
}

#[async_trait]
impl SeenLedger for PostgresDatabase {
    /// Re-observing an entry resets its deletion bookkeeping.
    #[instrument(skip(self, obs), fields(source_uuid = %obs.source_uuid), err)]
    async fn upsert_seen(&self, obs: &SeenObservation, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO embedding_seen
                (source_uuid, last_seen_version, last_seen_changed_at, last_seen_at,
                 last_seen_collection_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_uuid) DO UPDATE
            SET last_seen_version = EXCLUDED.last_seen_version,
                last_seen_changed_at = EXCLUDED.last_seen_changed_at,
                last_seen_at = EXCLUDED.last_seen_at,
                last_seen_collection_key = EXCLUDED.last_seen_collection_key,
                missing_since = NULL,
                delete_job_id = NULL,
                deleted_at = NULL
            "#,
        )
        .bind(obs.source_uuid.as_uuid())
        .bind(obs.version.as_bytes())
        .bind(obs.changed_at)
        .bind(now)
        .bind(&obs.collection_key)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_seen", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_seen(&self, uuid: &SourceUuid) -> Result<Option<SeenRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM embedding_seen WHERE source_uuid = $1",
            SEEN_COLUMNS
        ))
        .bind(uuid.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_seen", e))?;

        row.map(|r| SeenRow::from_row(&r).map(SeenRecord::from))
            .transpose()
            .map_err(|e| map_sqlx_error("get_seen", e))
    }

    /// Anti-join of the ledger against the live `entries` table.
    #[instrument(skip(self), err)]
    async fn list_vanished(&self, limit: usize) -> Result<Vec<SeenRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM embedding_seen s
            WHERE s.missing_since IS NULL
              AND NOT EXISTS (SELECT 1 FROM entries e WHERE e.uuid = s.source_uuid)
            ORDER BY s.last_seen_changed_at ASC, s.source_uuid ASC
            LIMIT $1
            "#,
            SEEN_COLUMNS
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_vanished", e))?;

        rows.iter()
            .map(|r| SeenRow::from_row(r).map(SeenRecord::from))
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("list_vanished", e))
    }

    #[instrument(skip(self), err)]
    async fn mark_missing(&self, uuid: &SourceUuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_seen
            SET missing_since = $2
            WHERE source_uuid = $1 AND missing_since IS NULL
            "#,
        )
        .bind(uuid.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_missing", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn set_delete_job(&self, uuid: &SourceUuid, job_id: JobId) -> Result<(), StoreError> {
        sqlx::query("UPDATE embedding_seen SET delete_job_id = $2 WHERE source_uuid = $1")
            .bind(uuid.as_uuid())
            .bind(job_id.get())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_delete_job", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn mark_deleted(
        &self,
        uuid: &SourceUuid,
        collection_key: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_seen
            SET deleted_at = $3
            WHERE source_uuid = $1 AND last_seen_collection_key = $2
            "#,
        )
        .bind(uuid.as_uuid())
        .bind(collection_key)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_deleted", e))?;

        Ok(result.rows_affected())
    }
}
