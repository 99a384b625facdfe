use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vectorsync_core::{
    ClaimToken, Job, JobId, JobKey, JobState, JobStats, JobType, NewJob, SourceUuid,
    SourceVersion,
};

use super::{InMemoryDatabase, JobRow};
use crate::error::StoreError;
use crate::jobs::store::{ClaimedJob, JobStore, ReapOutcome};

impl JobRow {
    fn matches_key(&self, key: &JobKey) -> bool {
        self.source_uuid == key.source_uuid
            && self.source_version == key.source_version
            && self.collection_key == key.collection_key
            && self.job_type == key.job_type.as_str()
    }

    fn held_by(&self, token: ClaimToken) -> bool {
        self.state == JobState::Running && self.claim_token == Some(token)
    }

    fn release(&mut self, state: JobState, now: DateTime<Utc>) {
        self.state = state;
        self.lease_until = None;
        self.claim_token = None;
        self.updated_at = now;
    }

    fn to_job(&self) -> Result<Job, StoreError> {
        let job_type = self
            .job_type
            .parse::<JobType>()
            .map_err(|e| StoreError::from_domain("embedding_job", e))?;
        Ok(Job {
            id: self.id,
            source_uuid: self.source_uuid,
            source_version: self.source_version.clone(),
            collection_key: self.collection_key.clone(),
            job_type,
            state: self.state,
            priority: self.priority,
            attempts: self.attempts,
            lease_until: self.lease_until,
            claim_token: self.claim_token,
            claimed_at: self.claimed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            error_message: self.error_message.clone(),
        })
    }
}

impl InMemoryDatabase {
    /// Insert a job row with an arbitrary `job_type` string, bypassing the
    /// typed API. Lets tests reproduce rows written by other producers.
    pub fn insert_raw_job(
        &self,
        source_uuid: SourceUuid,
        source_version: Option<SourceVersion>,
        collection_key: &str,
        job_type: &str,
        now: DateTime<Utc>,
    ) -> Result<JobId, StoreError> {
        let mut tables = self.write()?;
        tables.next_job_id += 1;
        let id = JobId(tables.next_job_id);
        tables.jobs.insert(
            id,
            JobRow {
                id,
                source_uuid,
                source_version,
                collection_key: collection_key.to_string(),
                job_type: job_type.to_string(),
                state: JobState::Pending,
                priority: vectorsync_core::job::DEFAULT_PRIORITY,
                attempts: 0,
                lease_until: None,
                claim_token: None,
                claimed_at: None,
                created_at: now,
                updated_at: now,
                error_message: None,
            },
        );
        Ok(id)
    }
}

#[async_trait]
impl JobStore for InMemoryDatabase {
    async fn insert_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Option<JobId>, StoreError> {
        let mut tables = self.write()?;
        if tables.jobs.values().any(|row| row.matches_key(&job.key)) {
            return Ok(None);
        }

        tables.next_job_id += 1;
        let id = JobId(tables.next_job_id);
        tables.jobs.insert(
            id,
            JobRow {
                id,
                source_uuid: job.key.source_uuid,
                source_version: job.key.source_version.clone(),
                collection_key: job.key.collection_key.clone(),
                job_type: job.key.job_type.as_str().to_string(),
                state: JobState::Pending,
                priority: job.priority,
                attempts: 0,
                lease_until: None,
                claim_token: None,
                claimed_at: None,
                created_at: now,
                updated_at: now,
                error_message: None,
            },
        );
        Ok(Some(id))
    }

    async fn find_job_id(&self, key: &JobKey) -> Result<Option<JobId>, StoreError> {
        Ok(self
            .read()?
            .jobs
            .values()
            .find(|row| row.matches_key(key))
            .map(|row| row.id))
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.read()?.jobs.get(&id).map(JobRow::to_job).transpose()
    }

    async fn supersede_pending(
        &self,
        uuid: &SourceUuid,
        collection_key: &str,
        current: &SourceVersion,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.write()?;
        let mut count = 0;
        for row in tables.jobs.values_mut() {
            if &row.source_uuid == uuid
                && row.collection_key == collection_key
                && row.job_type == JobType::Upsert.as_str()
                && row.state == JobState::Pending
                && row.source_version.as_ref() != Some(current)
            {
                row.release(JobState::Superseded, now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn select_claimable(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<JobId>, StoreError> {
        let tables = self.read()?;
        let mut rows: Vec<&JobRow> = tables
            .jobs
            .values()
            .filter(|row| row.state.is_claimable(row.lease_until, now))
            .collect();
        rows.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(rows.into_iter().take(limit).map(|row| row.id).collect())
    }

    async fn mark_running(
        &self,
        ids: &[JobId],
        token: ClaimToken,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.write()?;
        let mut count = 0;
        for id in ids {
            let Some(row) = tables.jobs.get_mut(id) else {
                continue;
            };
            if row.state != JobState::Pending {
                continue;
            }
            row.state = JobState::Running;
            row.lease_until = Some(lease_until);
            row.attempts += 1;
            row.claim_token = Some(token);
            row.claimed_at = Some(now);
            row.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn load_claimed(&self, ids: &[JobId], token: ClaimToken) -> Result<Vec<ClaimedJob>, StoreError> {
        let tables = self.read()?;
        let mut claimed: Vec<ClaimedJob> = ids
            .iter()
            .filter_map(|id| tables.jobs.get(id))
            .filter(|row| row.held_by(token))
            .map(|row| ClaimedJob {
                id: row.id,
                job_type: row.job_type.clone(),
                source_uuid: row.source_uuid,
                source_version: row.source_version.clone(),
                collection_key: row.collection_key.clone(),
                attempts: row.attempts,
            })
            .collect();
        claimed.sort_by_key(|job| job.id);
        claimed.dedup_by_key(|job| job.id);
        Ok(claimed)
    }

    async fn mark_superseded(
        &self,
        id: JobId,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        tables.check_unlocked(id)?;
        match tables.jobs.get_mut(&id) {
            Some(row) if row.held_by(token) => {
                row.release(JobState::Superseded, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_done(&self, id: JobId, token: ClaimToken, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        tables.check_unlocked(id)?;
        let Some(row) = tables.jobs.get_mut(&id).filter(|row| row.held_by(token)) else {
            return Ok(false);
        };
        row.release(JobState::Done, now);
        row.error_message = None;
        Ok(true)
    }

    async fn load_attempts(&self, id: JobId) -> Result<Option<u32>, StoreError> {
        Ok(self.read()?.jobs.get(&id).map(|row| row.attempts))
    }

    async fn release_failed(
        &self,
        id: JobId,
        token: ClaimToken,
        next: JobState,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        tables.check_unlocked(id)?;
        let Some(row) = tables.jobs.get_mut(&id).filter(|row| row.held_by(token)) else {
            return Ok(false);
        };
        row.release(next, now);
        row.error_message = Some(message.to_string());
        Ok(true)
    }

    async fn reap_expired(&self, now: DateTime<Utc>, max_attempts: u32) -> Result<ReapOutcome, StoreError> {
        let mut tables = self.write()?;
        let mut outcome = ReapOutcome::default();
        for row in tables.jobs.values_mut() {
            if row.state != JobState::Running || !row.lease_until.is_some_and(|until| until < now) {
                continue;
            }
            if row.attempts >= max_attempts {
                row.release(JobState::Error, now);
                row.error_message = Some(format!("lease expired after {} attempts", row.attempts));
                outcome.failed += 1;
            } else {
                row.release(JobState::Pending, now);
                outcome.requeued += 1;
            }
        }
        Ok(outcome)
    }

    async fn requeue(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        match tables.jobs.get_mut(&id) {
            Some(row) if row.state == JobState::Error => {
                row.release(JobState::Pending, now);
                row.attempts = 0;
                row.error_message = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_jobs(&self, state: JobState, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.read()?
            .jobs
            .values()
            .filter(|row| row.state == state)
            .take(limit)
            .map(JobRow::to_job)
            .collect()
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let tables = self.read()?;
        let mut stats = JobStats::default();
        for row in tables.jobs.values() {
            stats.record(row.state, 1);
        }
        Ok(stats)
    }
}
