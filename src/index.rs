//! Full-text index maintenance.
//!
//! `summaries_fts` is a standalone FTS5 table whose rows are a projection of
//! `summaries` joined with `sources.title`, keyed by the summary's rowid. It
//! is never the system of record: [`FtsIndex::rebuild`] can regenerate it
//! from the base tables at any time, and incremental maintenance through
//! [`IndexSynchronizer::on_summary_changed`] must produce the same rows.

use async_trait::async_trait;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::config::Config;
use crate::error::Result;
use crate::store::Store;

/// Hook the store calls, inside its open transaction, after any change to a
/// source's summary or title.
#[async_trait]
pub trait IndexSynchronizer: Send + Sync {
    async fn on_summary_changed(&self, conn: &mut SqliteConnection, source_id: &str) -> Result<()>;
}

/// One row of the derived index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub rowid: i64,
    pub source_id: String,
    pub title: Option<String>,
    pub summary_text: Option<String>,
    pub raw_text: Option<String>,
}

/// Differences between the index and the base tables.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IndexReport {
    /// Summaries with no index row.
    pub missing: Vec<String>,
    /// Index rows with no matching summary.
    pub orphaned: Vec<String>,
    /// Index rows whose text differs from the base tables.
    pub mismatched: Vec<String>,
}

impl IndexReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.orphaned.is_empty() && self.mismatched.is_empty()
    }
}

const PROJECTION: &str = r#"
    INSERT INTO summaries_fts (rowid, source_id, title, summary_text, raw_text)
    SELECT s.rowid, s.source_id, src.title, s.summary_text, s.raw_text
    FROM summaries s
    JOIN sources src ON s.source_id = src.id
"#;

/// SQLite FTS5 implementation of [`IndexSynchronizer`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FtsIndex;

#[async_trait]
impl IndexSynchronizer for FtsIndex {
    async fn on_summary_changed(&self, conn: &mut SqliteConnection, source_id: &str) -> Result<()> {
        // FTS5 has no safe partial update: drop the entry, then re-project it.
        sqlx::query(
            r#"
            DELETE FROM summaries_fts
            WHERE source_id = ?
               OR rowid = (SELECT rowid FROM summaries WHERE source_id = ?)
            "#,
        )
        .bind(source_id)
        .bind(source_id)
        .execute(&mut *conn)
        .await?;

        sqlx::query(&format!("{} WHERE s.source_id = ?", PROJECTION))
            .bind(source_id)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }
}

impl FtsIndex {
    /// Regenerate the whole index from `summaries` and `sources`.
    pub async fn rebuild(&self, pool: &SqlitePool) -> Result<u64> {
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM summaries_fts")
            .execute(&mut *tx)
            .await?;
        let inserted = sqlx::query(PROJECTION).execute(&mut *tx).await?.rows_affected();

        tx.commit().await?;
        tracing::info!(rows = inserted, "rebuilt summaries_fts");
        Ok(inserted)
    }

    pub async fn verify(&self, pool: &SqlitePool) -> Result<IndexReport> {
        let missing: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT s.source_id FROM summaries s
            JOIN sources src ON s.source_id = src.id
            WHERE NOT EXISTS (SELECT 1 FROM summaries_fts f WHERE f.rowid = s.rowid)
            ORDER BY s.source_id
            "#,
        )
        .fetch_all(pool)
        .await?;

        let orphaned: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT f.source_id FROM summaries_fts f
            LEFT JOIN summaries s ON s.rowid = f.rowid
            LEFT JOIN sources src ON src.id = s.source_id
            WHERE s.source_id IS NULL OR src.id IS NULL OR s.source_id != f.source_id
            ORDER BY f.source_id
            "#,
        )
        .fetch_all(pool)
        .await?;

        let mismatched: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT s.source_id FROM summaries s
            JOIN sources src ON src.id = s.source_id
            JOIN summaries_fts f ON f.rowid = s.rowid
            WHERE f.source_id = s.source_id
              AND (f.title IS NOT src.title
                   OR f.summary_text IS NOT s.summary_text
                   OR f.raw_text IS NOT s.raw_text)
            ORDER BY s.source_id
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(IndexReport {
            missing,
            orphaned,
            mismatched,
        })
    }

    /// All index rows ordered by rowid.
    pub async fn snapshot(&self, pool: &SqlitePool) -> Result<Vec<IndexEntry>> {
        let rows = sqlx::query(
            "SELECT rowid, source_id, title, summary_text, raw_text FROM summaries_fts ORDER BY rowid",
        )
        .fetch_all(pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| IndexEntry {
                rowid: row.get("rowid"),
                source_id: row.get("source_id"),
                title: row.get("title"),
                summary_text: row.get("summary_text"),
                raw_text: row.get("raw_text"),
            })
            .collect())
    }
}

/// `garde rebuild-index`.
pub async fn run_rebuild(config: &Config) -> anyhow::Result<()> {
    let store = Store::open(config).await?;
    let rows = FtsIndex.rebuild(store.pool()).await?;
    println!("rebuilt summaries_fts: {} rows", rows);
    store.pool().close().await;
    Ok(())
}

/// `garde verify-index`. Fails when the index has drifted.
pub async fn run_verify(config: &Config) -> anyhow::Result<()> {
    let store = Store::open(config).await?;
    let report = FtsIndex.verify(store.pool()).await?;
    store.pool().close().await;

    if report.is_consistent() {
        println!("summaries_fts is consistent");
        return Ok(());
    }
    for (label, ids) in [
        ("missing", &report.missing),
        ("orphaned", &report.orphaned),
        ("mismatched", &report.mismatched),
    ] {
        for id in ids {
            println!("  {}: {}", label, id);
        }
    }
    anyhow::bail!(
        "summaries_fts is inconsistent ({} missing, {} orphaned, {} mismatched); run `garde rebuild-index`",
        report.missing.len(),
        report.orphaned.len(),
        report.mismatched.len()
    )
}
