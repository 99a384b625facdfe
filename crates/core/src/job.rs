//! Embedding job types, state machine and retry policy.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{ClaimToken, JobId, SourceUuid, SourceVersion};

/// Longest error message persisted on a job row (in characters).
pub const MAX_ERROR_MESSAGE_CHARS: usize = 4000;

/// Priority assigned to jobs created by the scanners.
pub const DEFAULT_PRIORITY: i16 = 1;

/// What the downstream executor has to do with the vector for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Upsert,
    Delete,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Upsert => "upsert",
            JobType::Delete => "delete",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upsert" => Ok(JobType::Upsert),
            "delete" => Ok(JobType::Delete),
            other => Err(DomainError::unknown_variant("job_type", other)),
        }
    }
}

/// Job execution state.
///
/// ```text
/// pending --claim--> running --ack--> done
///    |                  |----fail (retryable, attempts < max)--> pending
///    |                  |----fail (terminal or attempts >= max)--> error
///    |                  |----stale at claim time--> superseded
///    |                  `----lease lapsed--> pending | error
///    `--newer version scanned--> superseded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed under a lease
    Running,
    /// Acknowledged by the executor
    Done,
    /// Failed terminally; needs operator action
    Error,
    /// Replaced by a newer version of the same entry
    Superseded,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Running,
        JobState::Done,
        JobState::Error,
        JobState::Superseded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Error => "error",
            JobState::Superseded => "superseded",
        }
    }

    /// Whether a claim running at `now` may select a row in this state.
    ///
    /// Only pending rows qualify; a leftover lease must have lapsed.
    pub fn is_claimable(self, lease_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        self == JobState::Pending && lease_until.is_none_or(|until| until < now)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "done" => Ok(JobState::Done),
            "error" => Ok(JobState::Error),
            "superseded" => Ok(JobState::Superseded),
            other => Err(DomainError::unknown_variant("job state", other)),
        }
    }
}

/// Dedup key of a job row. Enqueuing the same key twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub source_uuid: SourceUuid,
    pub source_version: Option<SourceVersion>,
    pub collection_key: String,
    pub job_type: JobType,
}

/// A job about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub key: JobKey,
    pub priority: i16,
}

impl NewJob {
    pub fn upsert(
        source_uuid: SourceUuid,
        version: SourceVersion,
        collection_key: impl Into<String>,
    ) -> Self {
        Self::new(source_uuid, version, collection_key, JobType::Upsert)
    }

    pub fn delete(
        source_uuid: SourceUuid,
        version: SourceVersion,
        collection_key: impl Into<String>,
    ) -> Self {
        Self::new(source_uuid, version, collection_key, JobType::Delete)
    }

    fn new(
        source_uuid: SourceUuid,
        version: SourceVersion,
        collection_key: impl Into<String>,
        job_type: JobType,
    ) -> Self {
        Self {
            key: JobKey {
                source_uuid,
                source_version: Some(version),
                collection_key: collection_key.into(),
                job_type,
            },
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }
}

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source_uuid: SourceUuid,
    /// `None` only for legacy upserts enqueued without a version.
    pub source_version: Option<SourceVersion>,
    pub collection_key: String,
    pub job_type: JobType,
    pub state: JobState,
    pub priority: i16,
    pub attempts: u32,
    pub lease_until: Option<DateTime<Utc>>,
    pub claim_token: Option<ClaimToken>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Retry policy: how many claims a job gets and how long each claim lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed before a retryable failure becomes terminal
    pub max_attempts: u32,
    /// Lease granted on claim
    pub lease: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lease: Duration::from_secs(10 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, lease: Duration) -> Self {
        Self {
            max_attempts,
            lease,
        }
    }

    /// State a running job moves to after a failure on its `attempts`-th claim.
    pub fn state_after_failure(&self, attempts: u32, retryable: bool) -> JobState {
        if !retryable || attempts >= self.max_attempts {
            JobState::Error
        } else {
            JobState::Pending
        }
    }

    /// End of a lease granted at `now`.
    pub fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Truncate an error message to what the job table keeps.
pub fn clamp_error_message(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_CHARS) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub error: u64,
    pub superseded: u64,
}

impl JobStats {
    pub fn record(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Pending => self.pending += count,
            JobState::Running => self.running += count,
            JobState::Done => self.done += count,
            JobState::Error => self.error += count,
            JobState::Superseded => self.superseded += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.done + self.error + self.superseded
    }
}
