// src/store.rs
//! Postgres persistence for discussion records: batched idempotent upserts
//! keyed on (source_type, source_id), the curated query paths behind the
//! HTTP API, and the helpers the validator sweep needs.

use async_trait::async_trait;
use metrics::counter;
use serde::Deserialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

use crate::clean::DerivedIndex;
use crate::error::{HarvestError, Result};
use crate::model::{DiscussionRecord, NormalizedRecord, SourceKind};

/// Records per transaction; bounds transaction size and gives the logs a
/// progress heartbeat on large runs.
const BATCH_SIZE: usize = 50;

/// Conflict-resolution knobs that have varied between pipeline revisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergePolicy {
    /// Append incoming history entries to the stored log instead of leaving
    /// the stored value untouched.
    pub append_history: bool,
}

/// A partial update accepted by the PUT /data endpoint. Absent fields keep
/// their stored values.
#[derive(Debug, Clone, Deserialize)]
pub struct PartialUpdate {
    pub id: i64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub topic_closed: Option<bool>,
    #[serde(default)]
    pub topic_summary: Option<String>,
}

#[derive(Clone)]
pub struct DiscussionStore {
    pool: PgPool,
}

const UPSERT_KEEP_HISTORY: &str = r#"
INSERT INTO discussion
    (source_id, source_type, title, body, url, clean_data, topic_summary,
     topic_closed, source_closed, history, created_at, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
ON CONFLICT (source_type, source_id) DO UPDATE SET
    title = EXCLUDED.title,
    body = EXCLUDED.body,
    url = EXCLUDED.url,
    topic_closed = EXCLUDED.topic_closed,
    source_closed = EXCLUDED.source_closed,
    updated_at = EXCLUDED.updated_at,
    clean_data = CASE WHEN EXCLUDED.clean_data <> ''
                      THEN EXCLUDED.clean_data ELSE discussion.clean_data END,
    topic_summary = CASE WHEN EXCLUDED.topic_summary <> ''
                         THEN EXCLUDED.topic_summary ELSE discussion.topic_summary END
"#;

const UPSERT_APPEND_HISTORY: &str = r#"
INSERT INTO discussion
    (source_id, source_type, title, body, url, clean_data, topic_summary,
     topic_closed, source_closed, history, created_at, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
ON CONFLICT (source_type, source_id) DO UPDATE SET
    title = EXCLUDED.title,
    body = EXCLUDED.body,
    url = EXCLUDED.url,
    topic_closed = EXCLUDED.topic_closed,
    source_closed = EXCLUDED.source_closed,
    updated_at = EXCLUDED.updated_at,
    clean_data = CASE WHEN EXCLUDED.clean_data <> ''
                      THEN EXCLUDED.clean_data ELSE discussion.clean_data END,
    topic_summary = CASE WHEN EXCLUDED.topic_summary <> ''
                         THEN EXCLUDED.topic_summary ELSE discussion.topic_summary END,
    history = discussion.history || EXCLUDED.history
"#;

/// clean_data occasionally arrives JSON-encoded one level too deep; unwrap
/// a single level and keep the raw value when that fails.
pub(crate) fn decode_double_encoded(s: &str) -> String {
    serde_json::from_str::<String>(s).unwrap_or_else(|_| s.to_string())
}

impl DiscussionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Pool that defers connecting until first use.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| HarvestError::Database(e.into()))?;
        Ok(())
    }

    /// Insert-or-update a batch of normalized records. Batches commit
    /// independently and in input order; a failure rolls back only the
    /// current batch and re-raises, leaving earlier batches committed.
    pub async fn store(&self, records: &[NormalizedRecord], policy: MergePolicy) -> Result<usize> {
        let mut stored = 0;
        for (n, batch) in records.chunks(BATCH_SIZE).enumerate() {
            let mut tx = self.pool.begin().await?;
            for record in batch {
                upsert(&mut tx, record, policy).await?;
            }
            tx.commit().await?;
            stored += batch.len();
            info!(batch = n + 1, rows = batch.len(), "committed upsert batch");
        }
        counter!("store_upserts_total").increment(stored as u64);
        Ok(stored)
    }

    /// Curated listing: open topics that either have a summary or are still
    /// present upstream.
    pub async fn fetch_page(&self, page: u64, page_size: u64) -> Result<Vec<DiscussionRecord>> {
        if page < 1 || page_size < 1 {
            return Err(HarvestError::Validation(
                "page and page_size must be positive".into(),
            ));
        }
        let offset = (page - 1) * page_size;
        sqlx::query_as::<_, DiscussionRecord>(
            r#"
            SELECT * FROM discussion
            WHERE topic_closed = FALSE
              AND (topic_summary <> ''
                   OR (topic_summary = '' AND is_deleted = FALSE))
            ORDER BY id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(page_size as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn total_count(&self) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM discussion WHERE topic_closed = FALSE AND is_deleted = FALSE",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Rows created after `cutoff`, paginated.
    pub async fn fetch_since(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
        page: u64,
        page_size: u64,
    ) -> Result<Vec<DiscussionRecord>> {
        if page < 1 || page_size < 1 {
            return Err(HarvestError::Validation(
                "page and page_size must be positive".into(),
            ));
        }
        let offset = (page - 1) * page_size;
        sqlx::query_as::<_, DiscussionRecord>(
            r#"
            SELECT * FROM discussion
            WHERE created_at > $1
            ORDER BY id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(cutoff)
        .bind(page_size as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Does a live record with this identity already carry derived content?
    pub async fn has_derived(&self, kind: SourceKind, source_id: &str) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM discussion
                WHERE source_type = $1 AND source_id = $2
                  AND is_deleted = FALSE AND clean_data <> ''
            )
            "#,
        )
        .bind(kind.as_str())
        .bind(source_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// (row id, source_type, url) of every non-deleted record, for the sweep.
    pub async fn active_identities(&self) -> Result<Vec<(i64, String, String)>> {
        sqlx::query_as::<_, (i64, String, String)>(
            "SELECT id, source_type, url FROM discussion WHERE is_deleted = FALSE ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Soft-delete one record; nothing else on the row changes.
    pub async fn mark_deleted(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE discussion SET is_deleted = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Apply allow-listed partial updates in one transaction, returning the
    /// number of affected rows.
    pub async fn apply_updates(&self, updates: &[PartialUpdate]) -> Result<u64> {
        if updates.is_empty() {
            return Ok(0);
        }
        let mut affected = 0;
        let mut tx = self.pool.begin().await?;
        for update in updates {
            let done = sqlx::query(
                r#"
                UPDATE discussion SET
                    url = COALESCE($2, url),
                    topic_closed = COALESCE($3, topic_closed),
                    topic_summary = COALESCE($4, topic_summary)
                WHERE id = $1
                "#,
            )
            .bind(update.id)
            .bind(&update.url)
            .bind(update.topic_closed)
            .bind(&update.topic_summary)
            .execute(&mut *tx)
            .await?;
            affected += done.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }
}

async fn upsert(
    tx: &mut Transaction<'_, Postgres>,
    record: &NormalizedRecord,
    policy: MergePolicy,
) -> Result<()> {
    let clean_data = decode_double_encoded(&record.clean_data);
    let sql = if policy.append_history {
        UPSERT_APPEND_HISTORY
    } else {
        UPSERT_KEEP_HISTORY
    };
    sqlx::query(sql)
        .bind(&record.source_id)
        .bind(record.source_type.as_str())
        .bind(&record.title)
        .bind(&record.body)
        .bind(&record.url)
        .bind(&clean_data)
        .bind(&record.topic_summary)
        .bind(record.topic_closed)
        .bind(record.source_closed)
        .bind(&record.history)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl DerivedIndex for DiscussionStore {
    async fn has_clean_data(&self, kind: SourceKind, source_id: &str) -> anyhow::Result<bool> {
        self.has_derived(kind, source_id)
            .await
            .map_err(anyhow::Error::from)
    }
}

/// Validate a PUT /data payload against the allow-list. Every record needs
/// an `id`; any field outside the allow-list rejects the whole payload.
pub fn parse_updates(items: &[Value]) -> std::result::Result<Vec<PartialUpdate>, String> {
    const UPDATE_FIELDS: [&str; 3] = ["url", "topic_closed", "topic_summary"];

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(obj) = item.as_object() else {
            return Err("each update must be an object".to_string());
        };
        if !obj.contains_key("id") {
            return Err("update record is missing 'id'".to_string());
        }
        for key in obj.keys() {
            if key != "id" && !UPDATE_FIELDS.contains(&key.as_str()) {
                return Err(format!("unknown field '{key}' in update record"));
            }
        }
        let update: PartialUpdate =
            serde_json::from_value(item.clone()).map_err(|e| format!("invalid update record: {e}"))?;
        out.push(update);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn double_encoded_clean_data_is_unwrapped_once() {
        assert_eq!(decode_double_encoded("\"Hello\""), "Hello");
        assert_eq!(decode_double_encoded("Hello"), "Hello");
        assert_eq!(decode_double_encoded(""), "");
        // an object is not a JSON string; keep the raw value
        assert_eq!(decode_double_encoded("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn update_payloads_reject_unknown_fields_and_missing_ids() {
        let ok = parse_updates(&[json!({"id": 1, "topic_closed": true})]).unwrap();
        assert_eq!(ok.len(), 1);
        assert_eq!(ok[0].topic_closed, Some(true));
        assert!(ok[0].url.is_none());

        assert!(parse_updates(&[json!({"topic_closed": true})]).is_err());
        assert!(parse_updates(&[json!({"id": 1, "title": "nope"})]).is_err());
        assert!(parse_updates(&[json!(42)]).is_err());
    }

    #[test]
    fn update_allow_list_accepts_all_three_fields_together() {
        let out = parse_updates(&[json!({
            "id": 7,
            "url": "https://example.test/t/7",
            "topic_closed": false,
            "topic_summary": "s"
        })])
        .unwrap();
        assert_eq!(out[0].id, 7);
        assert_eq!(out[0].topic_summary.as_deref(), Some("s"));
    }
}
