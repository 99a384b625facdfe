use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::Row;
use tracing::instrument;

use vectorsync_core::{
    EntryDescriptor, SourceRecord, SourceUuid, SourceVersion, is_safe_table_name,
};

use super::PostgresDatabase;
use crate::error::{StoreError, map_sqlx_error};
use crate::source::{EntryResolver, SourceCatalog};

/// An entry is public when the anonymous user holds a visitor grant on it.
const PUBLIC_USER_ID: i64 = 1;
const PUBLIC_MODE: &str = "visitor";

#[async_trait]
impl SourceCatalog for PostgresDatabase {
    #[instrument(skip(self), err)]
    async fn changed_since(
        &self,
        cursor: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT e.uuid, e.etag, e.changed, t.alias
            FROM entries e
            LEFT JOIN entry_types t ON t.id = e.type_id
            WHERE e.changed > $1
            ORDER BY e.changed ASC, e.id ASC
            LIMIT $2
            "#,
        )
        .bind(cursor)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("changed_since", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let uuid: uuid::Uuid = row
                .try_get("uuid")
                .map_err(|e| map_sqlx_error("changed_since", e))?;
            let etag: Option<Vec<u8>> = row
                .try_get("etag")
                .map_err(|e| map_sqlx_error("changed_since", e))?;
            let changed: DateTime<Utc> = row
                .try_get("changed")
                .map_err(|e| map_sqlx_error("changed_since", e))?;
            let alias: Option<String> = row
                .try_get("alias")
                .map_err(|e| map_sqlx_error("changed_since", e))?;

            records.push(SourceRecord::new(
                SourceUuid::from_uuid(uuid),
                SourceVersion::from_bytes(etag.unwrap_or_default()),
                changed,
                alias,
            ));
        }
        Ok(records)
    }
}

#[async_trait]
impl EntryResolver for PostgresDatabase {
    #[instrument(skip(self), err)]
    async fn load_entry(&self, uuid: &SourceUuid) -> Result<Option<EntryDescriptor>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT e.id, e.uuid, e.etag, e.archive, e.created, e.changed, e.type_id,
                   t.alias, t.dbtable
            FROM entries e
            JOIN entry_types t ON t.id = e.type_id
            WHERE e.uuid = $1
            LIMIT 1
            "#,
        )
        .bind(uuid.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_entry", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let get = |e| map_sqlx_error("load_entry", e);

        Ok(Some(EntryDescriptor {
            entry_id: row.try_get("id").map_err(get)?,
            uuid: SourceUuid::from_uuid(row.try_get("uuid").map_err(get)?),
            version: SourceVersion::from_bytes(
                row.try_get::<Option<Vec<u8>>, _>("etag")
                    .map_err(get)?
                    .unwrap_or_default(),
            ),
            archived: row.try_get("archive").map_err(get)?,
            created_at: row.try_get("created").map_err(get)?,
            changed_at: row.try_get("changed").map_err(get)?,
            type_id: row.try_get("type_id").map_err(get)?,
            type_alias: row
                .try_get::<Option<String>, _>("alias")
                .map_err(get)?
                .unwrap_or_default(),
            table: row
                .try_get::<Option<String>, _>("dbtable")
                .map_err(get)?
                .unwrap_or_default(),
        }))
    }

    /// The table name cannot be a bind parameter, so it is checked against
    /// `[A-Za-z0-9_]+` before being spliced in.
    #[instrument(skip(self), err)]
    async fn load_payload(
        &self,
        table: &str,
        id: i64,
    ) -> Result<Option<Map<String, JsonValue>>, StoreError> {
        if !is_safe_table_name(table) {
            return Err(StoreError::UnsafeIdentifier(table.to_string()));
        }

        let row = sqlx::query(&format!(
            "SELECT to_jsonb(t) AS row FROM {} t WHERE t.id = $1 LIMIT 1",
            table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_payload", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let value: JsonValue = row
            .try_get("row")
            .map_err(|e| map_sqlx_error("load_payload", e))?;

        match value {
            JsonValue::Object(map) => Ok(Some(map)),
            other => Err(StoreError::invalid_row(
                "payload",
                format!("expected object from {}, got {}", table, other),
            )),
        }
    }

    #[instrument(skip(self), err)]
    async fn is_public(&self, entry_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM entry_access
                WHERE entry_id = $1 AND user_id = $2 AND mode = $3
            ) AS public
            "#,
        )
        .bind(entry_id)
        .bind(PUBLIC_USER_ID)
        .bind(PUBLIC_MODE)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("is_public", e))?;

        row.try_get("public")
            .map_err(|e| map_sqlx_error("is_public", e))
    }

    #[instrument(skip(self), err)]
    async fn tags(&self, entry_id: i64) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT tag FROM entry_tags WHERE entry_id = $1 ORDER BY tag ASC")
            .bind(entry_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("tags", e))?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("tag"))
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("tags", e))
    }

    #[instrument(skip(self), err)]
    async fn related_uuids(&self, entry_id: i64) -> Result<Vec<SourceUuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT e.uuid
            FROM entry_links l
            JOIN entries e ON e.id = l.peer_id
            WHERE l.entry_id = $1
            ORDER BY e.id ASC
            "#,
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("related_uuids", e))?;

        rows.iter()
            .map(|r| r.try_get::<uuid::Uuid, _>("uuid").map(SourceUuid::from_uuid))
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("related_uuids", e))
    }

    #[instrument(skip(self), err)]
    async fn display_name(&self, entry_id: i64) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT name
            FROM entry_names
            WHERE entry_id = $1
            ORDER BY lang_id DESC
            LIMIT 1
            "#,
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("display_name", e))?;

        row.map(|r| r.try_get::<Option<String>, _>("name"))
            .transpose()
            .map(Option::flatten)
            .map_err(|e| map_sqlx_error("display_name", e))
    }
}
