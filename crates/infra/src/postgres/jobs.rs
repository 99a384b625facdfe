use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use tracing::{Span, instrument};

use vectorsync_core::{
    ClaimToken, Job, JobId, JobKey, JobState, JobStats, JobType, NewJob, SourceUuid,
    SourceVersion,
};

use super::PostgresDatabase;
use crate::error::{StoreError, map_sqlx_error};
use crate::jobs::store::{ClaimedJob, JobStore, ReapOutcome};

const TABLE: &str = "embedding_job";

const JOB_COLUMNS: &str = "job_id, source_uuid, source_version, collection_key, job_type, state, \
     priority, attempts, lease_until, claim_token, claimed_at, created_at, updated_at, error_message";

/// Raw `embedding_job` row.
struct JobRow {
    job_id: i64,
    source_uuid: uuid::Uuid,
    source_version: Option<Vec<u8>>,
    collection_key: String,
    job_type: String,
    state: String,
    priority: i16,
    attempts: i32,
    lease_until: Option<DateTime<Utc>>,
    claim_token: Option<uuid::Uuid>,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    error_message: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            job_id: row.try_get("job_id")?,
            source_uuid: row.try_get("source_uuid")?,
            source_version: row.try_get("source_version")?,
            collection_key: row.try_get("collection_key")?,
            job_type: row.try_get("job_type")?,
            state: row.try_get("state")?,
            priority: row.try_get("priority")?,
            attempts: row.try_get("attempts")?,
            lease_until: row.try_get("lease_until")?,
            claim_token: row.try_get("claim_token")?,
            claimed_at: row.try_get("claimed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId(row.job_id),
            source_uuid: SourceUuid::from_uuid(row.source_uuid),
            source_version: row.source_version.map(SourceVersion::from_bytes),
            collection_key: row.collection_key,
            job_type: row
                .job_type
                .parse::<JobType>()
                .map_err(|e| StoreError::from_domain(TABLE, e))?,
            state: row
                .state
                .parse::<JobState>()
                .map_err(|e| StoreError::from_domain(TABLE, e))?,
            priority: row.priority,
            attempts: attempts_from_db(row.attempts)?,
            lease_until: row.lease_until,
            claim_token: row.claim_token.map(ClaimToken::from_uuid),
            claimed_at: row.claimed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            error_message: row.error_message,
        })
    }
}

fn attempts_from_db(attempts: i32) -> Result<u32, StoreError> {
    u32::try_from(attempts)
        .map_err(|_| StoreError::invalid_row(TABLE, format!("negative attempts {}", attempts)))
}

fn job_from_row(row: &PgRow, operation: &str) -> Result<Job, StoreError> {
    let raw = JobRow::from_row(row).map_err(|e| map_sqlx_error(operation, e))?;
    Job::try_from(raw)
}

fn raw_ids(ids: &[JobId]) -> Vec<i64> {
    ids.iter().map(|id| id.get()).collect()
}

#[async_trait]
impl JobStore for PostgresDatabase {
    #[instrument(
        skip(self, job),
        fields(source_uuid = %job.key.source_uuid, collection = %job.key.collection_key),
        err
    )]
    async fn insert_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Option<JobId>, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO embedding_job
                (source_uuid, source_version, collection_key, job_type, state, priority,
                 attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, 0, $6, $6)
            ON CONFLICT DO NOTHING
            RETURNING job_id
            "#,
        )
        .bind(job.key.source_uuid.as_uuid())
        .bind(job.key.source_version.as_ref().map(SourceVersion::as_bytes))
        .bind(&job.key.collection_key)
        .bind(job.key.job_type.as_str())
        .bind(job.priority)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        row.map(|r| r.try_get::<i64, _>("job_id").map(JobId))
            .transpose()
            .map_err(|e| map_sqlx_error("insert_job", e))
    }

    #[instrument(skip(self), err)]
    async fn find_job_id(&self, key: &JobKey) -> Result<Option<JobId>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT job_id
            FROM embedding_job
            WHERE source_uuid = $1
              AND source_version IS NOT DISTINCT FROM $2
              AND collection_key = $3
              AND job_type = $4
            LIMIT 1
            "#,
        )
        .bind(key.source_uuid.as_uuid())
        .bind(key.source_version.as_ref().map(SourceVersion::as_bytes))
        .bind(&key.collection_key)
        .bind(key.job_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_job_id", e))?;

        row.map(|r| r.try_get::<i64, _>("job_id").map(JobId))
            .transpose()
            .map_err(|e| map_sqlx_error("find_job_id", e))
    }

    #[instrument(skip(self), err)]
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM embedding_job WHERE job_id = $1",
            JOB_COLUMNS
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|r| job_from_row(&r, "get_job")).transpose()
    }

    #[instrument(skip(self, current), err)]
    async fn supersede_pending(
        &self,
        uuid: &SourceUuid,
        collection_key: &str,
        current: &SourceVersion,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_job
            SET state = 'superseded', lease_until = NULL, claim_token = NULL, updated_at = $4
            WHERE source_uuid = $1
              AND collection_key = $2
              AND job_type = 'upsert'
              AND state = 'pending'
              AND source_version IS DISTINCT FROM $3
            "#,
        )
        .bind(uuid.as_uuid())
        .bind(collection_key)
        .bind(current.as_bytes())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("supersede_pending", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn select_claimable(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<JobId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id
            FROM embedding_job
            WHERE state = 'pending'
              AND (lease_until IS NULL OR lease_until < $1)
            ORDER BY priority DESC, job_id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_claimable", e))?;

        rows.iter()
            .map(|r| r.try_get::<i64, _>("job_id").map(JobId))
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("select_claimable", e))
    }

    /// The `state = 'pending'` predicate is re-checked here; rows a concurrent
    /// claimer already took are left alone.
    #[instrument(
        skip(self, ids),
        fields(selected = ids.len(), claimed = tracing::field::Empty),
        err
    )]
    async fn mark_running(
        &self,
        ids: &[JobId],
        token: ClaimToken,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_job
            SET state = 'running',
                lease_until = $1,
                attempts = attempts + 1,
                claim_token = $2,
                claimed_at = $3,
                updated_at = $3
            WHERE state = 'pending' AND job_id = ANY($4)
            "#,
        )
        .bind(lease_until)
        .bind(token.as_uuid())
        .bind(now)
        .bind(raw_ids(ids))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_running", e))?;

        Span::current().record("claimed", result.rows_affected());
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, ids), fields(selected = ids.len()), err)]
    async fn load_claimed(&self, ids: &[JobId], token: ClaimToken) -> Result<Vec<ClaimedJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, job_type, source_uuid, source_version, collection_key, attempts
            FROM embedding_job
            WHERE state = 'running' AND claim_token = $1 AND job_id = ANY($2)
            ORDER BY job_id ASC
            "#,
        )
        .bind(token.as_uuid())
        .bind(raw_ids(ids))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_claimed", e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let attempts: i32 = row
                .try_get("attempts")
                .map_err(|e| map_sqlx_error("load_claimed", e))?;
            claimed.push(ClaimedJob {
                id: JobId(
                    row.try_get("job_id")
                        .map_err(|e| map_sqlx_error("load_claimed", e))?,
                ),
                job_type: row
                    .try_get("job_type")
                    .map_err(|e| map_sqlx_error("load_claimed", e))?,
                source_uuid: SourceUuid::from_uuid(
                    row.try_get("source_uuid")
                        .map_err(|e| map_sqlx_error("load_claimed", e))?,
                ),
                source_version: row
                    .try_get::<Option<Vec<u8>>, _>("source_version")
                    .map_err(|e| map_sqlx_error("load_claimed", e))?
                    .map(SourceVersion::from_bytes),
                collection_key: row
                    .try_get("collection_key")
                    .map_err(|e| map_sqlx_error("load_claimed", e))?,
                attempts: attempts_from_db(attempts)?,
            });
        }
        Ok(claimed)
    }

    #[instrument(skip(self), err)]
    async fn mark_superseded(
        &self,
        id: JobId,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_job
            SET state = 'superseded', lease_until = NULL, claim_token = NULL, updated_at = $3
            WHERE job_id = $1 AND state = 'running' AND claim_token = $2
            "#,
        )
        .bind(id.get())
        .bind(token.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_superseded", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn mark_done(&self, id: JobId, token: ClaimToken, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_job
            SET state = 'done', lease_until = NULL, claim_token = NULL,
                error_message = NULL, updated_at = $3
            WHERE job_id = $1 AND state = 'running' AND claim_token = $2
            "#,
        )
        .bind(id.get())
        .bind(token.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_done", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn load_attempts(&self, id: JobId) -> Result<Option<u32>, StoreError> {
        let row = sqlx::query("SELECT attempts FROM embedding_job WHERE job_id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_attempts", e))?;

        match row {
            Some(row) => {
                let attempts: i32 = row
                    .try_get("attempts")
                    .map_err(|e| map_sqlx_error("load_attempts", e))?;
                attempts_from_db(attempts).map(Some)
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, message), err)]
    async fn release_failed(
        &self,
        id: JobId,
        token: ClaimToken,
        next: JobState,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_job
            SET state = $3, lease_until = NULL, claim_token = NULL,
                error_message = $4, updated_at = $5
            WHERE job_id = $1 AND state = 'running' AND claim_token = $2
            "#,
        )
        .bind(id.get())
        .bind(token.as_uuid())
        .bind(next.as_str())
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_failed", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn reap_expired(&self, now: DateTime<Utc>, max_attempts: u32) -> Result<ReapOutcome, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE embedding_job
            SET state = CASE WHEN attempts >= $2 THEN 'error' ELSE 'pending' END,
                error_message = CASE
                    WHEN attempts >= $2 THEN 'lease expired after ' || attempts || ' attempts'
                    ELSE error_message
                END,
                lease_until = NULL,
                claim_token = NULL,
                updated_at = $1
            WHERE state = 'running' AND lease_until < $1
            RETURNING state
            "#,
        )
        .bind(now)
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap_expired", e))?;

        let mut outcome = ReapOutcome::default();
        for row in rows {
            let state: String = row
                .try_get("state")
                .map_err(|e| map_sqlx_error("reap_expired", e))?;
            if state == JobState::Error.as_str() {
                outcome.failed += 1;
            } else {
                outcome.requeued += 1;
            }
        }
        Ok(outcome)
    }

    #[instrument(skip(self), err)]
    async fn requeue(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_job
            SET state = 'pending', attempts = 0, error_message = NULL,
                lease_until = NULL, claim_token = NULL, updated_at = $2
            WHERE job_id = $1 AND state = 'error'
            "#,
        )
        .bind(id.get())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn list_jobs(&self, state: JobState, limit: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM embedding_job WHERE state = $1 ORDER BY job_id ASC LIMIT $2",
            JOB_COLUMNS
        ))
        .bind(state.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(|r| job_from_row(r, "list_jobs")).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM embedding_job GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let state = state
                .parse::<JobState>()
                .map_err(|e| StoreError::from_domain(TABLE, e))?;
            stats.record(state, u64::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}
