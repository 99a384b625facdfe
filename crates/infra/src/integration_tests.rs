//! Integration tests for the full queue pipeline.
//!
//! Tests: Source → EnqueueRun → JobStore/SeenLedger → Claimer → Executor → Acker
//!
//! Verifies:
//! - Re-scans and duplicate delivery never create extra jobs
//! - Stale pending work is superseded while in-flight work is left alone
//! - Concurrent claimers never share a job
//! - Deletions are detected once and routed to the remembered collection
//! - Failures terminate after the retry ceiling

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::{Map, Value as JsonValue, json};

    use vectorsync_core::work_item::{DELETE_CONTENT_TYPE, ENTRY_CONTENT_TYPE};
    use vectorsync_core::{
        ClaimToken, JobKey, JobState, JobType, NewJob, RetryPolicy, SeenObservation, SourceUuid,
        SourceVersion, WorkItem, content_hash,
    };

    use crate::checkpoint::CheckpointStore;
    use crate::config::QueueConfig;
    use crate::error::StoreError;
    use crate::jobs::{
        Acker, Claimer, ExecutionError, ExecutionOutcome, Executor, JobStore, WorkerReport,
        WorkerRun,
    };
    use crate::ledger::SeenLedger;
    use crate::memory::InMemoryDatabase;
    use crate::scan::{ChangeScanner, DeletionScanner, EnqueueReport, EnqueueRun};

    const T0: i64 = 1_700_000_000;

    fn at(offset_secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(T0 + offset_secs, 0).unwrap()
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    fn ver(v: &str) -> SourceVersion {
        SourceVersion::from_bytes(v.as_bytes().to_vec())
    }

    fn row(value: JsonValue) -> Map<String, JsonValue> {
        value.as_object().cloned().unwrap()
    }

    fn retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_secs(600))
    }

    fn setup() -> Arc<InMemoryDatabase> {
        let db = Arc::new(InMemoryDatabase::new());
        db.put_type(1, "article", "articles").unwrap();
        db.put_type(2, "   ", "notes").unwrap();
        db
    }

    /// Add or update an `article` entry together with its payload row.
    fn put_article(db: &InMemoryDatabase, uuid: SourceUuid, version: &str, changed: DateTime<Utc>) -> i64 {
        let id = db.put_entry(uuid, ver(version), 1, changed).unwrap();
        db.put_payload("articles", id, row(json!({ "id": id, "title": format!("title {version}") })))
            .unwrap();
        id
    }

    async fn state_of(db: &InMemoryDatabase, key: &JobKey) -> JobState {
        let id = db.find_job_id(key).await.unwrap().unwrap();
        db.get_job(id).await.unwrap().unwrap().state
    }

    fn upsert_key(uuid: SourceUuid, version: &str, collection: &str) -> JobKey {
        NewJob::upsert(uuid, ver(version), collection).key
    }

    // ---------------------------------------------------------------------
    // Producer side
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn first_run_enqueues_one_upsert_and_advances_cursor() {
        let db = setup();
        let u1 = SourceUuid::new();
        put_article(&db, u1, "V1", at(10));

        let run = EnqueueRun::new(db.clone(), QueueConfig::default());
        let report = run.run_at(at(100)).await.unwrap();

        assert_eq!(
            report,
            EnqueueReport::Done {
                changed: 1,
                deleted: 0,
                cursor: at(10)
            }
        );
        assert_eq!(report.to_string(), "Enqueue done - changed: 1, deletes: 0");

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total(), 1);
        assert_eq!(state_of(&db, &upsert_key(u1, "V1", "article")).await, JobState::Pending);

        let seen = db.get_seen(&u1).await.unwrap().unwrap();
        assert_eq!(seen.last_seen_version, ver("V1"));
        assert_eq!(seen.last_seen_collection_key, "article");
        assert_eq!(seen.last_seen_changed_at, at(10));

        let cp = db.load_checkpoint("entries").await.unwrap();
        assert_eq!(cp.last_changed, at(10));
        assert_eq!(cp.last_run_at, Some(at(100)));
    }

    #[tokio::test]
    async fn rescan_with_unchanged_cursor_enqueues_nothing() {
        let db = setup();
        put_article(&db, SourceUuid::new(), "a", at(10));
        put_article(&db, SourceUuid::new(), "b", at(20));

        let scanner = ChangeScanner::new(db.clone(), "default");
        let first = scanner.scan_at(100, epoch(), at(30)).await.unwrap();
        let second = scanner.scan_at(100, epoch(), at(40)).await.unwrap();

        assert_eq!(first.enqueued, 2);
        assert_eq!(second.processed, 2);
        assert_eq!(second.enqueued, 0);
        assert_eq!(second.superseded, 0);
        assert_eq!(db.stats().await.unwrap().total(), 2);
    }

    #[tokio::test]
    async fn scan_batches_resume_from_last_processed_row() {
        let db = setup();
        for (i, v) in ["a", "b", "c"].iter().enumerate() {
            put_article(&db, SourceUuid::new(), v, at(10 * (i as i64 + 1)));
        }

        let scanner = ChangeScanner::new(db.clone(), "default");
        let first = scanner.scan_at(2, epoch(), at(50)).await.unwrap();
        assert_eq!(first.processed, 2);
        assert_eq!(first.cursor, at(20));

        let second = scanner.scan_at(2, first.cursor, at(51)).await.unwrap();
        assert_eq!(second.processed, 1);
        assert_eq!(second.cursor, at(30));

        let third = scanner.scan_at(2, second.cursor, at(52)).await.unwrap();
        assert_eq!(third.processed, 0);
        assert_eq!(third.cursor, at(30));
        assert_eq!(db.stats().await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn blank_type_alias_maps_to_default_collection() {
        let db = setup();
        let uuid = SourceUuid::new();
        db.put_entry(uuid, ver("n1"), 2, at(5)).unwrap();

        ChangeScanner::new(db.clone(), "misc")
            .scan_at(10, epoch(), at(6))
            .await
            .unwrap();

        assert_eq!(
            db.get_seen(&uuid).await.unwrap().unwrap().last_seen_collection_key,
            "misc"
        );
        assert!(db.find_job_id(&upsert_key(uuid, "n1", "misc")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn newer_version_supersedes_pending_upsert() {
        let db = setup();
        let uuid = SourceUuid::new();
        let scanner = ChangeScanner::new(db.clone(), "default");

        put_article(&db, uuid, "v1", at(10));
        let first = scanner.scan_at(10, epoch(), at(11)).await.unwrap();

        put_article(&db, uuid, "v2", at(20));
        let second = scanner.scan_at(10, first.cursor, at(21)).await.unwrap();

        assert_eq!(second.superseded, 1);
        assert_eq!(state_of(&db, &upsert_key(uuid, "v1", "article")).await, JobState::Superseded);
        assert_eq!(state_of(&db, &upsert_key(uuid, "v2", "article")).await, JobState::Pending);
    }

    #[tokio::test]
    async fn duplicate_delivery_keeps_the_pending_job() {
        let db = setup();
        let uuid = SourceUuid::new();
        put_article(&db, uuid, "v1", at(10));

        let scanner = ChangeScanner::new(db.clone(), "default");
        scanner.scan_at(10, epoch(), at(11)).await.unwrap();
        scanner.scan_at(10, epoch(), at(12)).await.unwrap();

        assert_eq!(state_of(&db, &upsert_key(uuid, "v1", "article")).await, JobState::Pending);
        assert_eq!(db.stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn running_job_is_not_superseded_but_goes_stale_at_next_claim() {
        let db = setup();
        let uuid = SourceUuid::new();
        let scanner = ChangeScanner::new(db.clone(), "default");
        let claimer = Claimer::new(db.clone(), retry(5));
        let acker = Acker::new(db.clone(), retry(5));

        put_article(&db, uuid, "v1", at(10));
        let first = scanner.scan_at(10, epoch(), at(11)).await.unwrap();

        let items = claimer.claim_at(10, at(12)).await.unwrap();
        assert_eq!(items.len(), 1);
        let in_flight = items.into_iter().next().unwrap();

        put_article(&db, uuid, "v2", at(20));
        let second = scanner.scan_at(10, first.cursor, at(21)).await.unwrap();
        assert_eq!(second.superseded, 0);
        assert_eq!(state_of(&db, &upsert_key(uuid, "v1", "article")).await, JobState::Running);
        assert_eq!(state_of(&db, &upsert_key(uuid, "v2", "article")).await, JobState::Pending);

        // The in-flight attempt fails and returns to pending; the next claim
        // notices the ledger moved on.
        acker.fail_at(&in_flight, "backend timeout", true, at(22)).await.unwrap();
        let items = claimer.claim_at(10, at(23)).await.unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].metadata.content_version, Some(ver("v2")));
        assert_eq!(state_of(&db, &upsert_key(uuid, "v1", "article")).await, JobState::Superseded);
    }

    #[tokio::test]
    async fn ledger_in_other_collection_does_not_supersede_at_claim() {
        let db = setup();
        let uuid = SourceUuid::new();
        put_article(&db, uuid, "v1", at(10));

        db.insert_job(&NewJob::upsert(uuid, ver("v1"), "article"), at(11))
            .await
            .unwrap();
        db.upsert_seen(
            &SeenObservation {
                source_uuid: uuid,
                version: ver("v9"),
                changed_at: at(12),
                collection_key: "product".to_string(),
            },
            at(12),
        )
        .await
        .unwrap();

        let items = Claimer::new(db.clone(), retry(5)).claim_at(10, at(13)).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].collection_key, "article");
    }

    #[tokio::test]
    async fn throttled_run_has_no_side_effects() {
        let db = setup();
        put_article(&db, SourceUuid::new(), "a", at(10));

        let run = EnqueueRun::new(db.clone(), QueueConfig::default());
        run.run_at(at(100)).await.unwrap();

        put_article(&db, SourceUuid::new(), "b", at(110));
        let report = run.run_at(at(160)).await.unwrap();

        assert_eq!(report, EnqueueReport::Skipped);
        assert_eq!(report.to_string(), "Skip (min interval not reached)");
        assert_eq!(db.stats().await.unwrap().total(), 1);
        let cp = db.load_checkpoint("entries").await.unwrap();
        assert_eq!(cp.last_changed, at(10));
        assert_eq!(cp.last_run_at, Some(at(100)));

        // Once the interval has passed the new row is picked up.
        let report = run.run_at(at(100 + 900)).await.unwrap();
        assert!(matches!(report, EnqueueReport::Done { changed: 1, .. }));
    }

    #[tokio::test]
    async fn empty_run_still_touches_checkpoint() {
        let db = setup();
        let run = EnqueueRun::new(db.clone(), QueueConfig::default());

        let report = run.run_at(at(100)).await.unwrap();
        assert_eq!(
            report,
            EnqueueReport::Done {
                changed: 0,
                deleted: 0,
                cursor: epoch()
            }
        );
        let cp = db.load_checkpoint("entries").await.unwrap();
        assert_eq!(cp.last_changed, epoch());
        assert_eq!(cp.last_run_at, Some(at(100)));
    }

    #[tokio::test]
    async fn unreachable_store_aborts_run_without_touching_checkpoint() {
        let db = setup();
        put_article(&db, SourceUuid::new(), "a", at(10));
        let run = EnqueueRun::new(db.clone(), QueueConfig::default());

        db.set_offline(true);
        let err = run.run_at(at(100)).await.unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
        db.set_offline(false);

        let cp = db.load_checkpoint("entries").await.unwrap();
        assert_eq!(cp.last_changed, epoch());
        assert!(cp.last_run_at.is_none());
        assert_eq!(db.stats().await.unwrap().total(), 0);
    }

    // ---------------------------------------------------------------------
    // Deletion detection
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn vanished_entry_gets_one_delete_job_in_remembered_collection() {
        let db = setup();
        let u1 = SourceUuid::new();
        put_article(&db, u1, "V1", at(10));

        let run = EnqueueRun::new(db.clone(), QueueConfig::default());
        run.run_at(at(100)).await.unwrap();

        db.remove_entry(&u1).unwrap();
        let report = run.run_at(at(1_000)).await.unwrap();
        assert_eq!(report.to_string(), "Enqueue done - changed: 0, deletes: 1");

        let delete_key = NewJob::delete(u1, ver("V1"), "article").key;
        let delete_id = db.find_job_id(&delete_key).await.unwrap().unwrap();

        let seen = db.get_seen(&u1).await.unwrap().unwrap();
        assert_eq!(seen.missing_since, Some(at(1_000)));
        assert_eq!(seen.delete_job_id, Some(delete_id));

        // Later runs neither re-mark nor re-enqueue.
        let report = run.run_at(at(2_000)).await.unwrap();
        assert!(matches!(report, EnqueueReport::Done { deleted: 0, .. }));
        let scanner = DeletionScanner::new(db.clone(), "default");
        assert_eq!(scanner.scan_at(100, at(2_100)).await.unwrap(), 0);

        let seen = db.get_seen(&u1).await.unwrap().unwrap();
        assert_eq!(seen.missing_since, Some(at(1_000)));
        let stats = db.stats().await.unwrap();
        assert_eq!(stats.total(), 2);
    }

    #[tokio::test]
    async fn reappearing_entry_clears_deletion_state() {
        let db = setup();
        let uuid = SourceUuid::new();
        put_article(&db, uuid, "v1", at(10));

        let scanner = ChangeScanner::new(db.clone(), "default");
        let deletions = DeletionScanner::new(db.clone(), "default");
        let first = scanner.scan_at(10, epoch(), at(11)).await.unwrap();

        db.remove_entry(&uuid).unwrap();
        assert_eq!(deletions.scan_at(10, at(12)).await.unwrap(), 1);

        put_article(&db, uuid, "v2", at(20));
        scanner.scan_at(10, first.cursor, at(21)).await.unwrap();

        let seen = db.get_seen(&uuid).await.unwrap().unwrap();
        assert!(seen.missing_since.is_none());
        assert!(seen.delete_job_id.is_none());
        assert_eq!(seen.last_seen_version, ver("v2"));
    }

    #[tokio::test]
    async fn delete_ack_stamps_ledger() {
        let db = setup();
        let uuid = SourceUuid::new();
        put_article(&db, uuid, "v1", at(10));
        ChangeScanner::new(db.clone(), "default")
            .scan_at(10, epoch(), at(11))
            .await
            .unwrap();
        db.remove_entry(&uuid).unwrap();
        DeletionScanner::new(db.clone(), "default")
            .scan_at(10, at(12))
            .await
            .unwrap();

        let claimer = Claimer::new(db.clone(), retry(5));
        let acker = Acker::new(db.clone(), retry(5));
        let items = claimer.claim_at(10, at(13)).await.unwrap();

        // The upsert can no longer be resolved; only the delete comes back.
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert!(item.is_delete());
        assert_eq!(item.content_type(), DELETE_CONTENT_TYPE);
        assert_eq!(item.collection_key, "article");
        assert_eq!(item.size(), 0);

        assert!(acker.ack_at(item, at(14)).await.unwrap());
        assert_eq!(db.get_job(item.job_id).await.unwrap().unwrap().state, JobState::Done);
        assert_eq!(db.get_seen(&uuid).await.unwrap().unwrap().deleted_at, Some(at(14)));
    }

    // ---------------------------------------------------------------------
    // Claim protocol
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn interleaved_claims_take_disjoint_sets() {
        let db = setup();
        for i in 0..4 {
            db.insert_job(&NewJob::delete(SourceUuid::new(), ver(&i.to_string()), "c"), at(1))
                .await
                .unwrap();
        }

        // Both claimers select before either updates.
        let seen_by_a = db.select_claimable(3, at(2)).await.unwrap();
        let seen_by_b = db.select_claimable(3, at(2)).await.unwrap();
        assert_eq!(seen_by_a, seen_by_b);

        let (token_a, token_b) = (ClaimToken::new(), ClaimToken::new());
        let moved_a = db.mark_running(&seen_by_a, token_a, at(600), at(2)).await.unwrap();
        let moved_b = db.mark_running(&seen_by_b, token_b, at(600), at(2)).await.unwrap();
        assert_eq!(moved_a, 3);
        assert_eq!(moved_b, 0);

        let claimed_a = db.load_claimed(&seen_by_a, token_a).await.unwrap();
        let claimed_b = db.load_claimed(&seen_by_b, token_b).await.unwrap();
        assert_eq!(claimed_a.len(), 3);
        assert!(claimed_b.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_never_share_a_job() {
        let db = setup();
        for i in 0..25 {
            db.insert_job(&NewJob::delete(SourceUuid::new(), ver(&i.to_string()), "c"), at(1))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..6 {
            let claimer = Claimer::new(db.clone(), retry(5));
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..3 {
                    let items = claimer.claim(3).await.unwrap();
                    ids.extend(items.into_iter().map(|item| item.job_id));
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }

        let distinct: HashSet<_> = all.iter().copied().collect();
        assert_eq!(distinct.len(), all.len(), "a job was claimed twice");
        assert_eq!(db.stats().await.unwrap().running, distinct.len() as u64);
    }

    #[tokio::test]
    async fn claim_respects_priority_and_limit() {
        let db = setup();
        let low = db
            .insert_job(&NewJob::delete(SourceUuid::new(), ver("a"), "c"), at(1))
            .await
            .unwrap()
            .unwrap();
        let high = db
            .insert_job(
                &NewJob::delete(SourceUuid::new(), ver("b"), "c").with_priority(9),
                at(1),
            )
            .await
            .unwrap()
            .unwrap();

        let claimer = Claimer::new(db.clone(), retry(5));
        let first = claimer.claim_at(1, at(2)).await.unwrap();
        let second = claimer.claim_at(1, at(2)).await.unwrap();
        let third = claimer.claim_at(1, at(2)).await.unwrap();

        assert_eq!(first[0].job_id, high);
        assert_eq!(second[0].job_id, low);
        assert!(third.is_empty());
        assert!(claimer.claim_at(0, at(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_item_carries_normalized_metadata() {
        let db = setup();
        let uuid = SourceUuid::new();
        let peer = SourceUuid::new();
        let id = put_article(&db, uuid, "v1", at(10));
        let peer_id = put_article(&db, peer, "p1", at(10));

        db.set_archived(id, true).unwrap();
        db.set_public(id, true).unwrap();
        for tag in [" News", "news", "", "Tech"] {
            db.add_tag(id, tag).unwrap();
        }
        db.add_link(id, peer_id).unwrap();
        db.add_link(id, id).unwrap();
        db.add_link(id, peer_id).unwrap();
        db.add_name(id, 1, "Hallo").unwrap();
        db.add_name(id, 2, "  Hello  ").unwrap();

        db.insert_job(&NewJob::upsert(uuid, ver("v1"), "article"), at(11))
            .await
            .unwrap();
        let items = Claimer::new(db.clone(), retry(5)).claim_at(10, at(12)).await.unwrap();
        assert_eq!(items.len(), 1);
        let item = &items[0];

        assert_eq!(item.content_type(), ENTRY_CONTENT_TYPE);
        assert_eq!(item.content_hash, content_hash("article", &uuid, Some(&ver("v1"))));
        assert!(item.size() > 0);

        let meta = &item.metadata;
        assert_eq!(meta.content_uuid, uuid);
        assert_eq!(meta.type_alias.as_deref(), Some("article"));
        assert!(meta.archived);
        assert!(meta.public);
        assert_eq!(meta.tags, vec!["news".to_string(), "tech".to_string()]);
        assert_eq!(meta.related_uuids, vec![uuid, peer]);
        assert_eq!(meta.name.as_deref(), Some("Hello"));

        let payload = item.payload().unwrap();
        assert_eq!(payload.entry.id, id);
        assert_eq!(payload.entry_type.table, "articles");
        assert_eq!(payload.payload.get("title"), Some(&json!("title v1")));
    }

    #[tokio::test]
    async fn data_errors_fail_terminally_on_first_attempt() {
        let db = setup();
        db.put_type(3, "broken", "bad-table").unwrap();

        let missing_entry = SourceUuid::new();
        let unsafe_table = SourceUuid::new();
        db.put_entry(unsafe_table, ver("x"), 3, at(5)).unwrap();
        let missing_payload = SourceUuid::new();
        db.put_entry(missing_payload, ver("y"), 1, at(5)).unwrap();

        let ids = vec![
            db.insert_job(&NewJob::upsert(missing_entry, ver("m"), "article"), at(6))
                .await
                .unwrap()
                .unwrap(),
            db.insert_job(&NewJob::upsert(unsafe_table, ver("x"), "broken"), at(6))
                .await
                .unwrap()
                .unwrap(),
            db.insert_job(&NewJob::upsert(missing_payload, ver("y"), "article"), at(6))
                .await
                .unwrap()
                .unwrap(),
            db.insert_job(&NewJob::delete(SourceUuid::from_uuid(uuid::Uuid::nil()), ver("n"), "c"), at(6))
                .await
                .unwrap()
                .unwrap(),
            db.insert_job(&NewJob::delete(SourceUuid::new(), ver("b"), "   "), at(6))
                .await
                .unwrap()
                .unwrap(),
        ];
        let unknown = db
            .insert_raw_job(SourceUuid::new(), Some(ver("r")), "article", "reindex", at(6))
            .unwrap();

        let items = Claimer::new(db.clone(), retry(5)).claim_at(10, at(7)).await.unwrap();
        assert!(items.is_empty());

        for id in ids {
            let job = db.get_job(id).await.unwrap().unwrap();
            assert_eq!(job.state, JobState::Error, "job {id}");
            assert_eq!(job.attempts, 1);
            assert!(job.error_message.is_some());
            assert!(job.lease_until.is_none());
        }
        assert_eq!(db.load_attempts(unknown).await.unwrap(), Some(1));
        assert_eq!(db.stats().await.unwrap().error, 6);
    }

    #[tokio::test]
    async fn lapsed_lease_is_reclaimed_then_exhausted() {
        let db = setup();
        let id = db
            .insert_job(&NewJob::delete(SourceUuid::new(), ver("a"), "c"), at(0))
            .await
            .unwrap()
            .unwrap();
        let claimer = Claimer::new(db.clone(), retry(2));

        assert_eq!(claimer.claim_at(5, at(1)).await.unwrap().len(), 1);
        // Lease still valid: nothing to take.
        assert!(claimer.claim_at(5, at(300)).await.unwrap().is_empty());

        // Claimer "crashed"; the lease lapses and the job is handed out again.
        let items = claimer.claim_at(5, at(602)).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(db.get_job(id).await.unwrap().unwrap().attempts, 2);

        // Second lapse exhausts the attempt budget.
        assert!(claimer.claim_at(5, at(1_203)).await.unwrap().is_empty());
        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Error);
        assert!(job.error_message.unwrap().contains("lease expired"));

        // Operator recovery.
        assert!(db.requeue(id, at(1_300)).await.unwrap());
        assert_eq!(claimer.claim_at(5, at(1_301)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_error_on_one_row_keeps_the_rest_of_the_batch() {
        let db = setup();
        let broken = db
            .insert_job(&NewJob::upsert(SourceUuid::new(), ver("m"), "article"), at(0))
            .await
            .unwrap()
            .unwrap();
        let fine = db
            .insert_job(&NewJob::delete(SourceUuid::new(), ver("d"), "c"), at(0))
            .await
            .unwrap()
            .unwrap();
        db.set_job_locked(broken, true).unwrap();
        let claimer = Claimer::new(db.clone(), retry(5));

        let items = claimer.claim_at(10, at(1)).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].job_id, fine);
        assert_eq!(db.get_job(broken).await.unwrap().unwrap().state, JobState::Running);
        assert!(Acker::new(db.clone(), retry(5)).ack_at(&items[0], at(2)).await.unwrap());

        // Once the lease lapses the row is reclaimed and settled normally.
        db.set_job_locked(broken, false).unwrap();
        assert!(claimer.claim_at(10, at(700)).await.unwrap().is_empty());
        let job = db.get_job(broken).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Error);
        assert_eq!(job.attempts, 2);
    }

    // ---------------------------------------------------------------------
    // Ack / fail
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn late_report_from_lapsed_claim_cannot_reopen_job() {
        let db = setup();
        let id = db
            .insert_job(&NewJob::delete(SourceUuid::new(), ver("a"), "c"), at(0))
            .await
            .unwrap()
            .unwrap();
        let claimer_a = Claimer::new(db.clone(), retry(5));
        let claimer_b = Claimer::new(db.clone(), retry(5));
        let acker = Acker::new(db.clone(), retry(5));

        let stale = claimer_a.claim_at(1, at(1)).await.unwrap();
        assert_eq!(stale.len(), 1);

        // A's lease lapses; B reaps, reclaims and finishes the job.
        let current = claimer_b.claim_at(1, at(700)).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_ne!(current[0].claim_token, stale[0].claim_token);
        assert!(acker.ack_at(&current[0], at(701)).await.unwrap());

        // A reports late.
        assert_eq!(acker.fail_at(&stale[0], "timeout", true, at(702)).await.unwrap(), None);
        assert!(!acker.ack_at(&stale[0], at(703)).await.unwrap());

        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Done);
        assert!(job.error_message.is_none());
        assert!(claimer_a.claim_at(5, at(800)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn late_ack_cannot_revive_a_reaped_job() {
        let db = setup();
        let id = db
            .insert_job(&NewJob::delete(SourceUuid::new(), ver("a"), "c"), at(0))
            .await
            .unwrap()
            .unwrap();
        let claimer = Claimer::new(db.clone(), retry(1));
        let acker = Acker::new(db.clone(), retry(1));

        let items = claimer.claim_at(1, at(1)).await.unwrap();
        // Out of attempts: the sweep moves the lapsed job to `error`.
        assert!(claimer.claim_at(1, at(700)).await.unwrap().is_empty());
        assert_eq!(db.get_job(id).await.unwrap().unwrap().state, JobState::Error);

        assert!(!acker.ack_at(&items[0], at(701)).await.unwrap());
        assert_eq!(db.get_job(id).await.unwrap().unwrap().state, JobState::Error);
    }

    #[tokio::test]
    async fn retryable_failures_hit_the_ceiling() {
        let db = setup();
        let id = db
            .insert_job(&NewJob::delete(SourceUuid::new(), ver("a"), "c"), at(0))
            .await
            .unwrap()
            .unwrap();
        let policy = retry(3);
        let claimer = Claimer::new(db.clone(), policy);
        let acker = Acker::new(db.clone(), policy);

        for attempt in 1..=3 {
            let items = claimer.claim_at(1, at(attempt)).await.unwrap();
            assert_eq!(items.len(), 1, "attempt {attempt}");
            let next = acker
                .fail_at(&items[0], "vector backend unavailable", true, at(attempt))
                .await
                .unwrap();
            let expected = if attempt < 3 { JobState::Pending } else { JobState::Error };
            assert_eq!(next, Some(expected));

            let job = db.get_job(id).await.unwrap().unwrap();
            assert_eq!(job.state, expected);
            assert!(job.lease_until.is_none());
            assert_eq!(job.error_message.as_deref(), Some("vector backend unavailable"));
        }

        assert!(claimer.claim_at(1, at(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_retryable_failure_is_terminal_and_message_is_clamped() {
        let db = setup();
        db.insert_job(&NewJob::delete(SourceUuid::new(), ver("a"), "c"), at(0))
            .await
            .unwrap();
        let claimer = Claimer::new(db.clone(), retry(5));
        let acker = Acker::new(db.clone(), retry(5));

        let items = claimer.claim_at(1, at(1)).await.unwrap();
        let long = "x".repeat(5_000);
        let next = acker.fail_at(&items[0], &long, false, at(2)).await.unwrap();
        assert_eq!(next, Some(JobState::Error));

        let job = db.get_job(items[0].job_id).await.unwrap().unwrap();
        assert_eq!(job.error_message.unwrap().chars().count(), 4_000);
    }

    #[tokio::test]
    async fn ack_and_fail_ignore_unknown_jobs() {
        let db = setup();
        let acker = Acker::new(db.clone(), retry(5));
        let ghost = WorkItem::delete(
            vectorsync_core::JobId(999),
            ClaimToken::new(),
            "c",
            vectorsync_core::DomainMetadata::bare(SourceUuid::new(), None),
        );

        assert!(!acker.ack_at(&ghost, at(1)).await.unwrap());
        assert_eq!(acker.fail_at(&ghost, "boom", true, at(1)).await.unwrap(), None);
    }

    // ---------------------------------------------------------------------
    // Worker run
    // ---------------------------------------------------------------------

    /// Fails scripted uuids, skips deletes, succeeds otherwise.
    #[derive(Default)]
    struct ScriptedExecutor {
        failures: HashMap<SourceUuid, ExecutionError>,
        seen: Mutex<Vec<JobType>>,
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(&self, item: &WorkItem) -> Result<ExecutionOutcome, ExecutionError> {
            self.seen.lock().unwrap().push(item.job_type());
            if let Some(err) = self.failures.get(&item.metadata.content_uuid) {
                return Err(err.clone());
            }
            if item.is_delete() {
                return Ok(ExecutionOutcome::Skipped);
            }
            Ok(ExecutionOutcome::Done)
        }
    }

    #[tokio::test]
    async fn worker_run_routes_outcomes() {
        let db = setup();
        let ok = SourceUuid::new();
        let flaky = SourceUuid::new();
        let broken = SourceUuid::new();
        let gone = SourceUuid::new();
        for (uuid, v) in [(ok, "a"), (flaky, "b"), (broken, "c"), (gone, "d")] {
            put_article(&db, uuid, v, at(10));
        }

        let run = EnqueueRun::new(db.clone(), QueueConfig::default());
        run.run_at(at(100)).await.unwrap();
        db.remove_entry(&gone).unwrap();
        run.run_at(at(1_000)).await.unwrap();

        let mut executor = ScriptedExecutor::default();
        executor
            .failures
            .insert(flaky, ExecutionError::transient("rate limited"));
        executor
            .failures
            .insert(broken, ExecutionError::permanent("payload rejected"));
        let executor = Arc::new(executor);

        let worker = WorkerRun::new(db.clone(), retry(5), executor.clone(), 10);
        let report = worker.run_at(at(1_001)).await.unwrap();

        // The upsert for `gone` fails to resolve at claim time and never
        // reaches the executor.
        assert_eq!(
            report,
            WorkerReport {
                items: 1,
                failed: 2,
                skipped: 1
            }
        );
        assert_eq!(report.to_string(), "Worker done - items: 1, failed: 2, skipped: 1");
        assert_eq!(executor.seen.lock().unwrap().len(), 4);

        assert_eq!(state_of(&db, &upsert_key(ok, "a", "article")).await, JobState::Done);
        assert_eq!(state_of(&db, &upsert_key(flaky, "b", "article")).await, JobState::Pending);
        assert_eq!(state_of(&db, &upsert_key(broken, "c", "article")).await, JobState::Error);
        assert_eq!(state_of(&db, &upsert_key(gone, "d", "article")).await, JobState::Error);
        assert_eq!(
            state_of(&db, &NewJob::delete(gone, ver("d"), "article").key).await,
            JobState::Done
        );
        assert!(db.get_seen(&gone).await.unwrap().unwrap().deleted_at.is_some());
    }
}
