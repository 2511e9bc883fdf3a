//! Archive status overview.
//!
//! Counts sources by status and type, summaries by provenance, and the state
//! of the entity review queue. Used by `garde status` to show whether
//! backfills are progressing and what needs attention.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// Per-type source counts.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeCounts {
    pub source_type: String,
    pub total: i64,
    pub processed: i64,
    pub pending: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedSource {
    pub id: String,
    pub error: Option<String>,
    pub processed_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub total_sources: i64,
    /// `(status, count)`, largest first.
    pub by_status: Vec<(String, i64)>,
    pub by_type: Vec<TypeCounts>,
    /// `(model_used or "preliminary", count)`, largest first.
    pub by_provenance: Vec<(String, i64)>,
    pub mentions: i64,
    pub distinct_entities: i64,
    /// `(status, count)` for the review queue.
    pub review_queue: Vec<(String, i64)>,
    pub recent_failures: Vec<FailedSource>,
}

impl StatusReport {
    pub fn count_for(&self, status: &str) -> i64 {
        self.by_status
            .iter()
            .find(|(s, _)| s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

/// Gather the report from the database.
pub async fn collect(pool: &SqlitePool) -> crate::error::Result<StatusReport> {
    let total_sources: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources")
        .fetch_one(pool)
        .await?;

    let by_status = pairs(
        pool,
        r#"
        SELECT COALESCE(status, 'pending') AS k, COUNT(*) AS n
        FROM sources GROUP BY k ORDER BY n DESC, k
        "#,
    )
    .await?;

    let type_rows = sqlx::query(
        r#"
        SELECT source_type,
               COUNT(*) AS total,
               SUM(CASE WHEN status = 'processed' THEN 1 ELSE 0 END) AS processed,
               SUM(CASE WHEN status = 'pending' OR status IS NULL THEN 1 ELSE 0 END) AS pending,
               SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed
        FROM sources
        GROUP BY source_type
        ORDER BY total DESC, source_type
        "#,
    )
    .fetch_all(pool)
    .await?;
    let by_type = type_rows
        .iter()
        .map(|row| TypeCounts {
            source_type: row.get("source_type"),
            total: row.get("total"),
            processed: row.get("processed"),
            pending: row.get("pending"),
            failed: row.get("failed"),
        })
        .collect();

    let by_provenance = pairs(
        pool,
        r#"
        SELECT COALESCE(model_used, 'preliminary') AS k, COUNT(*) AS n
        FROM summaries GROUP BY k ORDER BY n DESC, k
        "#,
    )
    .await?;

    let mentions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM source_entities")
        .fetch_one(pool)
        .await?;
    let distinct_entities: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT entity_id) FROM source_entities")
            .fetch_one(pool)
            .await?;

    let review_queue = pairs(
        pool,
        r#"
        SELECT COALESCE(status, 'pending') AS k, COUNT(*) AS n
        FROM pending_entities GROUP BY k ORDER BY k
        "#,
    )
    .await?;

    let failure_rows = sqlx::query(
        r#"
        SELECT id, error, processed_at FROM sources
        WHERE status = 'failed'
        ORDER BY processed_at DESC, id
        LIMIT 5
        "#,
    )
    .fetch_all(pool)
    .await?;
    let recent_failures = failure_rows
        .iter()
        .map(|row| FailedSource {
            id: row.get("id"),
            error: row.get("error"),
            processed_at: row.get("processed_at"),
        })
        .collect();

    Ok(StatusReport {
        total_sources,
        by_status,
        by_type,
        by_provenance,
        mentions,
        distinct_entities,
        review_queue,
        recent_failures,
    })
}

async fn pairs(pool: &SqlitePool, sql: &str) -> crate::error::Result<Vec<(String, i64)>> {
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    Ok(rows.iter().map(|r| (r.get("k"), r.get("n"))).collect())
}

/// Run the status command: query the database and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let report = collect(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("garde: archive status");
    println!("=====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Sources:     {}", report.total_sources);
    for (status, count) in &report.by_status {
        println!("    {:<12} {:>6}", status, count);
    }

    if !report.by_type.is_empty() {
        println!();
        println!("  By type:");
        println!(
            "  {:<16} {:>6} {:>10} {:>8} {:>7}",
            "TYPE", "TOTAL", "PROCESSED", "PENDING", "FAILED"
        );
        println!("  {}", "-".repeat(51));
        for t in &report.by_type {
            println!(
                "  {:<16} {:>6} {:>10} {:>8} {:>7}",
                t.source_type, t.total, t.processed, t.pending, t.failed
            );
        }
    }

    if !report.by_provenance.is_empty() {
        println!();
        println!("  Summaries by provenance:");
        for (model, count) in &report.by_provenance {
            println!("    {:<28} {:>6}", model, count);
        }
    }

    println!();
    println!(
        "  Entities:    {} mentions of {} entities",
        report.mentions, report.distinct_entities
    );
    if !report.review_queue.is_empty() {
        let queue: Vec<String> = report
            .review_queue
            .iter()
            .map(|(s, n)| format!("{} {}", n, s))
            .collect();
        println!("  Review:      {}", queue.join(", "));
    }

    if !report.recent_failures.is_empty() {
        println!();
        println!("  Recent failures:");
        for f in &report.recent_failures {
            println!(
                "    {}  {}",
                f.id,
                f.error.as_deref().map(first_line).unwrap_or("(no detail)")
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
