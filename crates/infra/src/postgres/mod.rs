//! Postgres-backed queue and source access.
//!
//! The queue tables (`embedding_job`, `embedding_seen`, `embedding_checkpoint`)
//! are created idempotently by [`SchemaBootstrap::ensure_schema`]. The source
//! tables (`entries`, `entry_types`, `entry_access`, `entry_tags`,
//! `entry_links`, `entry_names` and the per-type payload tables) belong to the
//! system of record and are only read.
//!
//! ## Concurrency
//!
//! Every mutation is one conditional `UPDATE` or `INSERT ... ON CONFLICT`.
//! Independent processes may share the database without locks or
//! transactions spanning several statements:
//!
//! | Operation | Guard |
//! |-----------|-------|
//! | enqueue | unique `(source_uuid, source_version, collection_key, job_type)` |
//! | supersede | `state = 'pending'` |
//! | claim | `state = 'pending'`, then re-read by `claim_token` |
//! | mark missing | `missing_since IS NULL` |
//! | reap | `state = 'running' AND lease_until < now` |
//!
//! ## Thread Safety
//!
//! `PostgresDatabase` is `Send + Sync`; clones share one SQLx pool.

mod jobs;
mod ledger;
mod schema;
mod source;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{info, instrument};

use vectorsync_core::Checkpoint;

use crate::checkpoint::CheckpointStore;
use crate::config::DatabaseConfig;
use crate::error::{StoreError, map_sqlx_error};
use crate::source::SchemaBootstrap;

#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    /// Open a pool against `config.url`.
    #[instrument(skip(config), fields(max_connections = config.max_connections), err)]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        info!("connected to postgres");
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SchemaBootstrap for PostgresDatabase {
    #[instrument(skip(self), err)]
    async fn ensure_schema(&self, checkpoint: &str) -> Result<(), StoreError> {
        sqlx::raw_sql(schema::QUEUE_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            r#"
            INSERT INTO embedding_checkpoint (name, last_changed)
            VALUES ($1, $2)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(checkpoint)
        .bind(DateTime::<Utc>::UNIX_EPOCH)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PostgresDatabase {
    #[instrument(skip(self), err)]
    async fn load_checkpoint(&self, name: &str) -> Result<Checkpoint, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT name, last_changed, last_run_at
            FROM embedding_checkpoint
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_checkpoint", e))?;

        let Some(row) = row else {
            return Ok(Checkpoint::initial(name));
        };

        Ok(Checkpoint {
            name: row
                .try_get("name")
                .map_err(|e| map_sqlx_error("load_checkpoint", e))?,
            last_changed: row
                .try_get("last_changed")
                .map_err(|e| map_sqlx_error("load_checkpoint", e))?,
            last_run_at: row
                .try_get("last_run_at")
                .map_err(|e| map_sqlx_error("load_checkpoint", e))?,
        })
    }

    /// `GREATEST` keeps the cursor monotonic even if two runs race.
    #[instrument(skip(self), err)]
    async fn advance_checkpoint(&self, name: &str, cursor: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO embedding_checkpoint (name, last_changed)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE
            SET last_changed = GREATEST(embedding_checkpoint.last_changed, EXCLUDED.last_changed)
            "#,
        )
        .bind(name)
        .bind(cursor)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("advance_checkpoint", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn touch_checkpoint(&self, name: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO embedding_checkpoint (name, last_changed, last_run_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
            SET last_run_at = EXCLUDED.last_run_at
            "#,
        )
        .bind(name)
        .bind(DateTime::<Utc>::UNIX_EPOCH)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("touch_checkpoint", e))?;
        Ok(())
    }
}
