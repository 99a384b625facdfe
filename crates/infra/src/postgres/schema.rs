//! Queue table definitions.
//!
//! The job key index uses `NULLS NOT DISTINCT` (Postgres 15+) so legacy upserts
//! without a version still dedup.

pub(super) const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS embedding_job (
    job_id          BIGSERIAL PRIMARY KEY,
    source_uuid     UUID NOT NULL,
    source_version  BYTEA,
    collection_key  TEXT NOT NULL,
    job_type        TEXT NOT NULL,
    state           TEXT NOT NULL DEFAULT 'pending',
    priority        SMALLINT NOT NULL DEFAULT 1,
    attempts        INTEGER NOT NULL DEFAULT 0,
    lease_until     TIMESTAMPTZ,
    claim_token     UUID,
    claimed_at      TIMESTAMPTZ,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    error_message   TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS embedding_job_key_uq
    ON embedding_job (source_uuid, source_version, collection_key, job_type)
    NULLS NOT DISTINCT;
CREATE INDEX IF NOT EXISTS embedding_job_claim_idx
    ON embedding_job (state, priority, lease_until, updated_at);
CREATE INDEX IF NOT EXISTS embedding_job_source_idx
    ON embedding_job (source_uuid, job_type);
CREATE INDEX IF NOT EXISTS embedding_job_token_idx
    ON embedding_job (claim_token);

CREATE TABLE IF NOT EXISTS embedding_seen (
    source_uuid              UUID PRIMARY KEY,
    last_seen_version        BYTEA NOT NULL,
    last_seen_changed_at     TIMESTAMPTZ NOT NULL,
    last_seen_at             TIMESTAMPTZ NOT NULL,
    last_seen_collection_key TEXT NOT NULL,
    missing_since            TIMESTAMPTZ,
    delete_job_id            BIGINT,
    deleted_at               TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS embedding_seen_missing_idx
    ON embedding_seen (missing_since);
CREATE INDEX IF NOT EXISTS embedding_seen_delete_job_idx
    ON embedding_seen (delete_job_id);
CREATE INDEX IF NOT EXISTS embedding_seen_collection_idx
    ON embedding_seen (last_seen_collection_key);

CREATE TABLE IF NOT EXISTS embedding_checkpoint (
    name         TEXT PRIMARY KEY,
    last_changed TIMESTAMPTZ NOT NULL,
    last_run_at  TIMESTAMPTZ
);
"#;
