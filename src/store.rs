//! Persistence layer.
//!
//! [`Store`] is the only writer of `sources`, `summaries`, `source_entities`
//! and `pending_entities`. Every write that touches a summary or a source
//! title runs inside one transaction together with the index
//! synchronization for that source, so readers never see a summary without
//! its index entry or the other way round.
//!
//! Commits are per source. The `status` column is the resume checkpoint:
//! anything still `pending` is picked up by the next batch run.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::error::{PipelineError, Result};
use crate::index::{FtsIndex, IndexSynchronizer};
use crate::migrate::run_migrations;
use crate::models::{
    now_ts, format_ts, EntityMention, PendingEntity, PendingStatus, RoutedMentions, SourceRecord,
    SourceRow, SourceStatus, SourceType, SummaryDraft, SummaryRow,
};

const DEFAULT_RAW_TEXT_CAP: usize = 100_000;

/// What `Store::ingest` did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    New,
    /// Content hash changed; the source is pending again.
    Changed,
    /// Same content at a different path.
    Relocated,
    Unchanged,
}

/// Content read back by [`Store::stored_content`].
#[derive(Debug, Clone)]
pub struct StoredText {
    pub text: Option<String>,
    /// Only the capped raw text was available.
    pub truncated: bool,
    pub metadata: Option<String>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    index: Arc<dyn IndexSynchronizer>,
    raw_text_cap: usize,
}

impl Store {
    pub fn new(pool: SqlitePool, index: Arc<dyn IndexSynchronizer>) -> Self {
        Self {
            pool,
            index,
            raw_text_cap: DEFAULT_RAW_TEXT_CAP,
        }
    }

    /// Connect, bring the schema up to date and wire in the FTS index.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool, Arc::new(FtsIndex)).with_raw_text_cap(config.extraction.raw_text_cap))
    }

    pub fn with_raw_text_cap(mut self, cap: usize) -> Self {
        self.raw_text_cap = cap;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Upsert a discovered source and its preliminary summary.
    pub async fn ingest(&self, rec: &SourceRecord) -> Result<IngestOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT content_hash, path, status FROM sources WHERE id = ?")
            .bind(&rec.id)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match &existing {
            None => IngestOutcome::New,
            Some(row) => {
                let hash: Option<String> = row.get("content_hash");
                let path: Option<String> = row.get("path");
                if hash.as_deref() != Some(rec.content_hash.as_str()) {
                    IngestOutcome::Changed
                } else if path != rec.path {
                    IngestOutcome::Relocated
                } else {
                    IngestOutcome::Unchanged
                }
            }
        };
        let prior_status: Option<String> = existing.as_ref().and_then(|r| r.get("status"));

        let metadata = rec.metadata.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO sources (id, source_type, title, path, content_hash, created_at, updated_at,
                                 input_mode, is_subagent, project_path, metadata, full_text, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending')
            ON CONFLICT(id) DO UPDATE SET
                source_type = excluded.source_type,
                title = excluded.title,
                path = excluded.path,
                content_hash = excluded.content_hash,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                input_mode = excluded.input_mode,
                is_subagent = excluded.is_subagent,
                project_path = excluded.project_path,
                metadata = excluded.metadata,
                full_text = excluded.full_text
            "#,
        )
        .bind(&rec.id)
        .bind(rec.source_type.as_str())
        .bind(&rec.title)
        .bind(&rec.path)
        .bind(&rec.content_hash)
        .bind(rec.created_at.as_ref().map(format_ts))
        .bind(rec.updated_at.as_ref().map(format_ts))
        .bind(&rec.input_mode)
        .bind(rec.is_subagent)
        .bind(&rec.project_path)
        .bind(&metadata)
        .bind(&rec.full_text)
        .execute(&mut *tx)
        .await?;

        let has_extraction: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM summaries WHERE source_id = ? AND model_used IS NOT NULL",
        )
        .bind(&rec.id)
        .fetch_one(&mut *tx)
        .await?;

        let new_status = match outcome {
            IngestOutcome::Changed => Some(SourceStatus::Pending),
            _ if prior_status.as_deref() == Some(SourceStatus::Stale.as_str()) => {
                // re-seen at a live location
                Some(if has_extraction {
                    SourceStatus::Processed
                } else {
                    SourceStatus::Pending
                })
            }
            _ => None,
        };
        if let Some(status) = new_status {
            sqlx::query("UPDATE sources SET status = ?, error = NULL WHERE id = ?")
                .bind(status.as_str())
                .bind(&rec.id)
                .execute(&mut *tx)
                .await?;
        }

        let raw_text = cap_chars(&rec.full_text, self.raw_text_cap);
        let preliminary = match (&rec.presummary, rec.has_presummary) {
            (Some(text), true) => text.as_str(),
            _ => rec.title.as_str(),
        };
        let word_count = rec.full_text.split_whitespace().count() as i64;

        // A preliminary summary is written once; re-ingest only refreshes the
        // raw text and title, plus the preliminary text while no extraction
        // has replaced it.
        sqlx::query(
            r#"
            INSERT INTO summaries (source_id, summary_text, raw_text, title, has_presummary, word_count)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                raw_text = excluded.raw_text,
                title = excluded.title,
                summary_text = CASE WHEN summaries.model_used IS NULL
                                    THEN excluded.summary_text ELSE summaries.summary_text END,
                has_presummary = CASE WHEN summaries.model_used IS NULL
                                      THEN excluded.has_presummary ELSE summaries.has_presummary END,
                word_count = CASE WHEN summaries.model_used IS NULL
                                  THEN excluded.word_count ELSE summaries.word_count END
            "#,
        )
        .bind(&rec.id)
        .bind(preliminary)
        .bind(raw_text)
        .bind(&rec.title)
        .bind(rec.has_presummary)
        .bind(word_count)
        .execute(&mut *tx)
        .await?;

        self.index.on_summary_changed(&mut *tx, &rec.id).await?;
        tx.commit().await?;

        tracing::debug!(source_id = %rec.id, ?outcome, "ingested");
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Processing outcomes
    // ------------------------------------------------------------------

    /// Atomically mark the source processed, replace its summary, add its
    /// entity mentions, queue its pending mentions and resync the index.
    ///
    /// A non-transient failure rolls everything back and marks the source
    /// `failed`. Transient failures leave it `pending` for a retry.
    pub async fn record_processed(
        &self,
        source_id: &str,
        draft: &SummaryDraft,
        mentions: &RoutedMentions,
    ) -> Result<()> {
        match self.write_processed(source_id, draft, mentions).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() || matches!(e, PipelineError::NotFound(_)) => Err(e),
            Err(e) => {
                if let Err(mark_err) = self.record_failure(source_id, &e.to_string()).await {
                    tracing::warn!(source_id, error = %mark_err, "could not mark source failed");
                }
                Err(e)
            }
        }
    }

    async fn write_processed(
        &self,
        source_id: &str,
        draft: &SummaryDraft,
        mentions: &RoutedMentions,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let title: Option<String> = sqlx::query_scalar("SELECT title FROM sources WHERE id = ?")
            .bind(source_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| PipelineError::NotFound(source_id.to_string()))?;

        sqlx::query(
            "UPDATE sources SET status = 'processed', processed_at = ?, error = NULL WHERE id = ?",
        )
        .bind(now_ts())
        .bind(source_id)
        .execute(&mut *tx)
        .await?;

        // created_at is left untouched on replace
        sqlx::query(
            r#"
            INSERT INTO summaries (source_id, summary_text, title, has_presummary, word_count,
                                   model_used, extraction_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                summary_text = excluded.summary_text,
                title = excluded.title,
                has_presummary = excluded.has_presummary,
                word_count = excluded.word_count,
                model_used = excluded.model_used,
                extraction_json = excluded.extraction_json
            "#,
        )
        .bind(source_id)
        .bind(&draft.summary_text)
        .bind(&title)
        .bind(draft.has_presummary)
        .bind(draft.word_count)
        .bind(&draft.model_used)
        .bind(&draft.extraction_json)
        .execute(&mut *tx)
        .await?;

        insert_mentions(&mut *tx, source_id, &mentions.resolved).await?;

        for p in &mentions.pending {
            sqlx::query(
                r#"
                INSERT INTO pending_entities (mention_text, source_id, suggested_entity, confidence)
                SELECT ?, ?, ?, ?
                WHERE NOT EXISTS (
                    SELECT 1 FROM pending_entities
                    WHERE source_id = ? AND lower(mention_text) = lower(?)
                )
                "#,
            )
            .bind(&p.mention_text)
            .bind(source_id)
            .bind(&p.suggested_entity)
            .bind(p.confidence)
            .bind(source_id)
            .bind(&p.mention_text)
            .execute(&mut *tx)
            .await?;
        }

        self.index.on_summary_changed(&mut *tx, source_id).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn record_failure(&self, source_id: &str, detail: &str) -> Result<()> {
        self.set_status(source_id, SourceStatus::Failed, Some(detail))
            .await
    }

    pub async fn mark_skipped(&self, source_id: &str, reason: &str) -> Result<()> {
        self.set_status(source_id, SourceStatus::Skipped, Some(reason))
            .await
    }

    async fn set_status(&self, source_id: &str, status: SourceStatus, error: Option<&str>) -> Result<()> {
        let result =
            sqlx::query("UPDATE sources SET status = ?, error = ?, processed_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(error)
                .bind(now_ts())
                .bind(source_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(source_id.to_string()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Flag a source whose origin path no longer resolves. Its summary and
    /// mentions are kept.
    pub async fn mark_stale(&self, source_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE sources SET status = 'stale' WHERE id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(source_id.to_string()));
        }
        Ok(())
    }

    /// Remove a summary and its index entry. The source returns to
    /// `pending` so the next batch regenerates it.
    pub async fn delete_summary(&self, source_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM summaries WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("UPDATE sources SET status = 'pending', processed_at = NULL WHERE id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;

        self.index.on_summary_changed(&mut *tx, source_id).await?;
        tx.commit().await?;
        Ok(deleted > 0)
    }

    /// Hard-delete a source and everything hanging off it.
    pub async fn delete_source(&self, source_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        for sql in [
            "DELETE FROM source_entities WHERE source_id = ?",
            "DELETE FROM pending_entities WHERE source_id = ?",
            "DELETE FROM summaries WHERE source_id = ?",
        ] {
            sqlx::query(sql).bind(source_id).execute(&mut *tx).await?;
        }
        self.index.on_summary_changed(&mut *tx, source_id).await?;

        let deleted = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted > 0)
    }

    /// Sources with a recorded path that are not already stale.
    pub async fn sources_with_paths(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT id, path FROM sources WHERE path IS NOT NULL AND status != 'stale' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| (r.get("id"), r.get("path"))).collect())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Pending sources, most recently updated first. A `limit` of zero
    /// selects nothing.
    pub async fn pending_sources(
        &self,
        source_type: Option<SourceType>,
        limit: usize,
    ) -> Result<Vec<SourceRow>> {
        self.select_sources(source_type, limit, false).await
    }

    /// Sources a batch should work on: `pending`, plus `failed` when
    /// `include_failed` is set. Read-only.
    pub async fn select_sources(
        &self,
        source_type: Option<SourceType>,
        limit: usize,
        include_failed: bool,
    ) -> Result<Vec<SourceRow>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let statuses = if include_failed {
            "('pending', 'failed')"
        } else {
            "('pending')"
        };
        let source_type = source_type.map(|t| t.as_str());

        let rows = sqlx::query(&format!(
            r#"
            SELECT * FROM sources
            WHERE status IN {}
              AND (? IS NULL OR source_type = ?)
            ORDER BY updated_at DESC, id LIMIT ?
            "#,
            statuses
        ))
        .bind(source_type)
        .bind(source_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(source_row).collect())
    }

    /// Move the `failed` rows among `sources` back to `pending`, clearing
    /// their error. Returns how many moved.
    pub async fn requeue_failed(&self, sources: &[SourceRow]) -> Result<u64> {
        let mut moved = 0;
        for source in sources.iter().filter(|s| s.status == SourceStatus::Failed.as_str()) {
            moved += sqlx::query(
                "UPDATE sources SET status = 'pending', error = NULL WHERE id = ? AND status = 'failed'",
            )
            .bind(&source.id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        }
        Ok(moved)
    }

    pub async fn get_source(&self, source_id: &str) -> Result<Option<SourceRow>> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(source_row))
    }

    pub async fn get_summary(&self, source_id: &str) -> Result<Option<SummaryRow>> {
        let row = sqlx::query(
            r#"
            SELECT source_id, summary_text, raw_text, has_presummary, word_count, created_at,
                   model_used, extraction_json
            FROM summaries WHERE source_id = ?
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| SummaryRow {
            source_id: r.get("source_id"),
            summary_text: r.get("summary_text"),
            raw_text: r.get("raw_text"),
            has_presummary: r.get::<Option<bool>, _>("has_presummary").unwrap_or(false),
            word_count: r.get("word_count"),
            created_at: r.get("created_at"),
            model_used: r.get("model_used"),
            extraction_json: r.get("extraction_json"),
        }))
    }

    /// Full ingested text and metadata JSON for a source.
    ///
    /// Rows written before `sources.full_text` existed fall back to the
    /// capped `summaries.raw_text`; `truncated` reports that case.
    pub async fn stored_content(&self, source_id: &str) -> Result<Option<StoredText>> {
        let row = sqlx::query(
            r#"
            SELECT src.full_text, s.raw_text, src.metadata
            FROM sources src LEFT JOIN summaries s ON s.source_id = src.id
            WHERE src.id = ?
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let full: Option<String> = r.get("full_text");
            let truncated = full.is_none();
            StoredText {
                text: full.or_else(|| r.get("raw_text")),
                truncated,
                metadata: r.get("metadata"),
            }
        }))
    }

    pub async fn entities_for_source(&self, source_id: &str) -> Result<Vec<EntityMention>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, mention_text, confidence FROM source_entities
            WHERE source_id = ? ORDER BY entity_id, mention_text
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| EntityMention {
                entity_id: r.get("entity_id"),
                mention_text: r.get("mention_text"),
                confidence: r.get::<Option<f64>, _>("confidence").unwrap_or(0.0),
            })
            .collect())
    }

    /// Review queue entries, oldest first.
    pub async fn pending_entities(
        &self,
        status: Option<PendingStatus>,
        limit: usize,
    ) -> Result<Vec<PendingEntity>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = match status {
            Some(s) => {
                sqlx::query("SELECT * FROM pending_entities WHERE status = ? ORDER BY id LIMIT ?")
                    .bind(s.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM pending_entities ORDER BY id LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(pending_row).collect())
    }

    /// Record a human decision and attach the mention to the chosen entity.
    pub async fn resolve_pending(&self, id: i64, resolution: &str) -> Result<PendingEntity> {
        let mut tx = self.pool.begin().await?;

        let entry = open_pending(&mut *tx, id).await?;
        sqlx::query("UPDATE pending_entities SET status = 'resolved', resolution = ? WHERE id = ?")
            .bind(resolution)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if let Some(source_id) = &entry.source_id {
            let mention = EntityMention {
                entity_id: resolution.to_string(),
                mention_text: entry.mention_text.clone(),
                confidence: 1.0,
            };
            insert_mentions(&mut *tx, source_id, std::slice::from_ref(&mention)).await?;
        }

        tx.commit().await?;
        Ok(PendingEntity {
            status: PendingStatus::Resolved.as_str().to_string(),
            resolution: Some(resolution.to_string()),
            ..entry
        })
    }

    pub async fn reject_pending(&self, id: i64) -> Result<PendingEntity> {
        let mut tx = self.pool.begin().await?;

        let entry = open_pending(&mut *tx, id).await?;
        sqlx::query("UPDATE pending_entities SET status = 'rejected' WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(PendingEntity {
            status: PendingStatus::Rejected.as_str().to_string(),
            ..entry
        })
    }
}

async fn insert_mentions(
    conn: &mut SqliteConnection,
    source_id: &str,
    mentions: &[EntityMention],
) -> Result<()> {
    for m in mentions {
        sqlx::query(
            r#"
            INSERT INTO source_entities (source_id, entity_id, mention_text, confidence)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source_id, entity_id, mention_text) DO NOTHING
            "#,
        )
        .bind(source_id)
        .bind(&m.entity_id)
        .bind(&m.mention_text)
        .bind(m.confidence)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn open_pending(conn: &mut SqliteConnection, id: i64) -> Result<PendingEntity> {
    let row = sqlx::query("SELECT * FROM pending_entities WHERE id = ? AND status = 'pending'")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("pending entity {}", id)))?;
    Ok(pending_row(&row))
}

fn source_row(row: &SqliteRow) -> SourceRow {
    SourceRow {
        id: row.get("id"),
        source_type: row.get("source_type"),
        title: row.get("title"),
        path: row.get("path"),
        content_hash: row.get("content_hash"),
        status: row
            .get::<Option<String>, _>("status")
            .unwrap_or_else(|| SourceStatus::Pending.as_str().to_string()),
        processed_at: row.get("processed_at"),
        error: row.get("error"),
    }
}

fn pending_row(row: &SqliteRow) -> PendingEntity {
    PendingEntity {
        id: row.get("id"),
        mention_text: row.get("mention_text"),
        source_id: row.get("source_id"),
        suggested_entity: row.get("suggested_entity"),
        confidence: row.get("confidence"),
        status: row
            .get::<Option<String>, _>("status")
            .unwrap_or_else(|| PendingStatus::Pending.as_str().to_string()),
        resolution: row.get("resolution"),
        created_at: row.get("created_at"),
    }
}

/// Truncate to at most `max` characters.
pub fn cap_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_chars() {
        assert_eq!(cap_chars("hello", 10), "hello");
        assert_eq!(cap_chars("hello", 3), "hel");
        assert_eq!(cap_chars("ééé", 2), "éé");
        assert_eq!(cap_chars("", 0), "");
    }
}
