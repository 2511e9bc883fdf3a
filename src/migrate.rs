//! Schema migrations.
//!
//! Creates the five-table archive schema. Databases written by older tools
//! carry `summaries_ai/ad/au` triggers that maintain `summaries_fts`; those
//! are dropped here because [`crate::index::FtsIndex`] now performs the same
//! synchronization explicitly and a surviving trigger would double-insert.

use sqlx::SqlitePool;

use crate::error::Result;

const LEGACY_TRIGGERS: [&str; 3] = ["summaries_ai", "summaries_ad", "summaries_au"];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY,
            source_type TEXT NOT NULL,
            title TEXT,
            path TEXT,
            content_hash TEXT,
            created_at TEXT,
            updated_at TEXT,
            input_mode TEXT,
            is_subagent BOOLEAN DEFAULT FALSE,
            project_path TEXT,
            metadata TEXT,
            full_text TEXT,
            discovered_at TEXT DEFAULT CURRENT_TIMESTAMP,
            processed_at TEXT,
            status TEXT DEFAULT 'pending',
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS summaries (
            source_id TEXT PRIMARY KEY REFERENCES sources(id),
            summary_text TEXT NOT NULL,
            raw_text TEXT,
            title TEXT,
            has_presummary BOOLEAN DEFAULT FALSE,
            word_count INTEGER,
            created_at TEXT DEFAULT CURRENT_TIMESTAMP,
            model_used TEXT,
            extraction_json TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='summaries_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE summaries_fts USING fts5(
                source_id,
                title,
                summary_text,
                raw_text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_entities (
            source_id TEXT REFERENCES sources(id),
            entity_id TEXT NOT NULL,
            mention_text TEXT NOT NULL,
            confidence REAL,
            PRIMARY KEY (source_id, entity_id, mention_text)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_entities (
            id INTEGER PRIMARY KEY,
            mention_text TEXT NOT NULL,
            source_id TEXT REFERENCES sources(id),
            suggested_entity TEXT,
            confidence REAL,
            status TEXT DEFAULT 'pending',
            resolution TEXT,
            created_at TEXT DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Columns added after the first schema revision
    add_column_if_missing(pool, "sources", "error", "TEXT").await?;
    add_column_if_missing(pool, "sources", "full_text", "TEXT").await?;
    add_column_if_missing(pool, "summaries", "model_used", "TEXT").await?;
    add_column_if_missing(pool, "summaries", "extraction_json", "TEXT").await?;

    for trigger in LEGACY_TRIGGERS {
        sqlx::query(&format!("DROP TRIGGER IF EXISTS {}", trigger))
            .execute(pool)
            .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sources_type ON sources(source_type)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sources_status ON sources(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_source_entities_entity ON source_entities(entity_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pending_entities_status ON pending_entities(status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<()> {
    let exists: bool = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('{}') WHERE name = ?",
        table
    ))
    .bind(column)
    .fetch_one(pool)
    .await?;

    if !exists {
        tracing::info!(table, column, "adding missing column");
        sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
            .execute(pool)
            .await?;
    }
    Ok(())
}
