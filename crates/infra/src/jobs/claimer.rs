//! Two-phase claim protocol.
//!
//! 1. Select up to `limit` claimable ids, highest priority first.
//! 2. Move them to `running` in one conditional update that re-checks
//!    `state = 'pending'` and stamps a fresh claim token.
//! 3. Re-read by that token. Ids lost to a concurrent claimer simply do not
//!    come back, so a race yields fewer items and never a shared one.
//!
//! Each claimed row is then validated, checked against the seen ledger and
//! resolved into a [`WorkItem`]. Rows that cannot become an item are moved to a
//! terminal state here; nothing is left `running` without an item. A store
//! error while settling one row is logged and that row is left to the lease
//! reaper, so the rest of the batch is still handed out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use vectorsync_core::{
    ClaimToken, DomainMetadata, JobType, PayloadSnapshot, RetryPolicy, WorkItem,
    is_safe_table_name,
};

use crate::error::StoreError;
use crate::jobs::acker::Acker;
use crate::jobs::reaper::LeaseReaper;
use crate::jobs::store::{ClaimedJob, JobStore};
use crate::ledger::SeenLedger;
use crate::source::EntryResolver;

/// What a single claimed row turned into.
enum Resolution {
    Item(WorkItem),
    /// A newer version was seen since enqueue.
    Stale,
    /// Structurally unusable; fail without retry.
    Invalid(String),
}

pub struct Claimer<S> {
    store: Arc<S>,
    retry: RetryPolicy,
    reaper: LeaseReaper<S>,
    acker: Acker<S>,
}

impl<S> Claimer<S>
where
    S: JobStore + SeenLedger + EntryResolver,
{
    pub fn new(store: Arc<S>, retry: RetryPolicy) -> Self {
        let reaper = LeaseReaper::new(store.clone(), retry.max_attempts);
        let acker = Acker::new(store.clone(), retry);
        Self {
            store,
            retry,
            reaper,
            acker,
        }
    }

    /// Claim up to `limit` jobs.
    pub async fn claim(&self, limit: usize) -> Result<Vec<WorkItem>, StoreError> {
        self.claim_at(limit, Utc::now()).await
    }

    /// Claim with an explicit clock reading.
    ///
    /// Expired leases are reaped first so crashed claims become selectable
    /// again in the same call.
    #[instrument(skip(self, now), err)]
    pub async fn claim_at(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<WorkItem>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.reaper.reap_at(now).await?;

        let ids = self.store.select_claimable(limit, now).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let token = ClaimToken::new();
        let lease_until = self.retry.lease_until(now);
        let moved = self.store.mark_running(&ids, token, lease_until, now).await?;
        if moved < ids.len() as u64 {
            debug!(
                selected = ids.len(),
                claimed = moved,
                "lost part of the selection to a concurrent claim"
            );
        }
        if moved == 0 {
            return Ok(Vec::new());
        }

        let claimed = self.store.load_claimed(&ids, token).await?;
        let mut items = Vec::with_capacity(claimed.len());
        let mut stale = 0usize;
        let mut invalid = 0usize;

        for job in claimed {
            let resolution = match self.resolve(&job, token).await {
                Ok(resolution) => resolution,
                Err(err) => {
                    // The row is ours; hand it back instead of stranding it.
                    warn!(job_id = %job.id, error = %err, "failed to resolve claimed job");
                    if let Err(err) = self
                        .acker
                        .fail_job(job.id, token, &err.to_string(), true, now)
                        .await
                    {
                        warn!(job_id = %job.id, error = %err, "could not release job; lease will lapse");
                    }
                    continue;
                }
            };

            match resolution {
                Resolution::Item(item) => items.push(item),
                Resolution::Stale => match self.store.mark_superseded(job.id, token, now).await {
                    Ok(_) => {
                        debug!(job_id = %job.id, source_uuid = %job.source_uuid, "superseded at claim");
                        stale += 1;
                    }
                    Err(err) => {
                        warn!(job_id = %job.id, error = %err, "could not supersede job; lease will lapse");
                    }
                },
                Resolution::Invalid(reason) => {
                    warn!(job_id = %job.id, reason = %reason, "claimed job is invalid");
                    match self.acker.fail_job(job.id, token, &reason, false, now).await {
                        Ok(_) => invalid += 1,
                        Err(err) => {
                            warn!(job_id = %job.id, error = %err, "could not fail job; lease will lapse");
                        }
                    }
                }
            }
        }

        info!(
            items = items.len(),
            superseded = stale,
            failed = invalid,
            "claim finished"
        );
        Ok(items)
    }

    async fn resolve(&self, job: &ClaimedJob, token: ClaimToken) -> Result<Resolution, StoreError> {
        let job_type = match job.job_type.parse::<JobType>() {
            Ok(job_type) => job_type,
            Err(_) => {
                return Ok(Resolution::Invalid(format!(
                    "unsupported job_type '{}'",
                    job.job_type
                )));
            }
        };

        let collection_key = job.collection_key.trim();
        if job.source_uuid.is_nil() || collection_key.is_empty() {
            return Ok(Resolution::Invalid(
                "missing source_uuid or collection_key".to_string(),
            ));
        }

        let metadata = DomainMetadata::bare(job.source_uuid, job.source_version.clone());

        if job_type == JobType::Delete {
            return Ok(Resolution::Item(WorkItem::delete(job.id, token, collection_key, metadata)));
        }

        if let Some(version) = job.source_version.as_ref().filter(|v| !v.is_empty()) {
            if let Some(seen) = self.store.get_seen(&job.source_uuid).await? {
                if seen.supersedes(version, collection_key) {
                    return Ok(Resolution::Stale);
                }
            }
        }

        let Some(entry) = self.store.load_entry(&job.source_uuid).await? else {
            return Ok(Resolution::Invalid(format!(
                "entry {} not found",
                job.source_uuid
            )));
        };
        if entry.entry_id <= 0 || !is_safe_table_name(&entry.table) {
            return Ok(Resolution::Invalid(format!(
                "type table cannot be resolved for entry {}",
                job.source_uuid
            )));
        }

        let Some(payload) = self.store.load_payload(&entry.table, entry.entry_id).await? else {
            return Ok(Resolution::Invalid(format!(
                "payload row {} not found in {}",
                entry.entry_id, entry.table
            )));
        };

        let public = self.store.is_public(entry.entry_id).await?;
        let tags = self.store.tags(entry.entry_id).await?;
        let related = self.store.related_uuids(entry.entry_id).await?;
        let name = self.store.display_name(entry.entry_id).await?;

        let mut metadata = metadata.with_tags(tags).with_related(related).with_name(name);
        metadata.type_alias = Some(entry.type_alias.trim().to_string()).filter(|a| !a.is_empty());
        metadata.archived = entry.archived;
        metadata.public = public;

        let snapshot = PayloadSnapshot::new(&entry, payload);
        Ok(Resolution::Item(WorkItem::upsert(
            job.id,
            token,
            collection_key,
            metadata,
            snapshot,
        )))
    }
}
