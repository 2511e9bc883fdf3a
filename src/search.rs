//! Lexical search over the archive.
//!
//! Queries go straight to FTS5 over title, summary and raw text. Before
//! that, [`prepare_query`] shields hyphenated terms from being read as the
//! FTS5 minus operator, expands a query naming a glossary entity into its
//! aliases, and otherwise adds prefix wildcards to bare terms.
//!
//! Stale sources are included: their summaries outlive the files they came from.

use anyhow::Context;
use regex::Regex;
use sqlx::{Row, SqlitePool};
use std::sync::LazyLock;

use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::models::{SearchHit, SourceType};
use crate::resolver::Glossary;

static HYPHENATED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w+(?:-\w+)+\b").expect("valid regex"));

const FTS_OPERATORS: [&str; 4] = ["AND", "OR", "NOT", "NEAR"];

/// Rows fetched per requested result when re-ranking by recency.
const RECENCY_OVERFETCH: i64 = 20;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub source_type: Option<SourceType>,
    /// Substring match against the source's project path.
    pub project: Option<String>,
    pub limit: i64,
    /// Half-life in days for recency decay. `None` ranks by relevance only.
    pub recency_half_life_days: Option<f64>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            source_type: None,
            project: None,
            limit: 5,
            recency_half_life_days: None,
        }
    }
}

/// Wrap hyphenated terms outside double quotes in quotes.
///
/// `claude-memory foo` becomes `"claude-memory" foo`; `"already-quoted"` is
/// left alone.
pub fn auto_quote_hyphenated(query: &str) -> String {
    // Even-numbered segments lie outside quotes.
    query
        .split('"')
        .enumerate()
        .map(|(i, segment)| {
            if i % 2 == 0 {
                HYPHENATED.replace_all(segment, "\"$0\"").into_owned()
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\"")
}

/// Append `*` to bare terms so `Reckitt` also matches `Reckitts`.
///
/// Phrases, operators, column filters and existing wildcards are untouched.
/// A phrase with a prefix star (`"claude-memory"*`) stays one token.
pub fn add_wildcard_suffix(query: &str) -> String {
    static TOKEN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#""[^"]*"\*?|\S+"#).expect("valid regex"));

    TOKEN
        .find_iter(query)
        .map(|m| {
            let token = m.as_str();
            if token.starts_with('"')
                || token.ends_with('*')
                || token.contains(':')
                || FTS_OPERATORS.contains(&token.to_uppercase().as_str())
            {
                token.to_string()
            } else {
                format!("{}*", token)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Expand a query that names a glossary entity into an OR over its name and
/// first three aliases.
pub fn expand_query(query: &str, glossary: &Glossary) -> Option<String> {
    let bare = query.trim().trim_matches('"');
    let key = glossary.lookup(bare)?;
    let entity = glossary.get(key)?;

    let mut terms = vec![entity.name.clone().unwrap_or_else(|| key.to_string())];
    terms.extend(entity.aliases.iter().take(3).cloned());
    terms.dedup();
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

/// Turn user input into an FTS5 query.
pub fn prepare_query(raw: &str, glossary: &Glossary) -> String {
    let quoted = auto_quote_hyphenated(raw.trim());
    match expand_query(&quoted, glossary) {
        Some(expanded) => expanded,
        None => add_wildcard_suffix(&quoted),
    }
}

/// Run an FTS5 query, best match first.
pub async fn search(pool: &SqlitePool, query: &str, opts: &SearchOptions) -> Result<Vec<SearchHit>> {
    if query.trim().is_empty() || opts.limit <= 0 {
        return Ok(Vec::new());
    }

    let fetch_limit = if opts.recency_half_life_days.is_some() {
        opts.limit.saturating_mul(RECENCY_OVERFETCH)
    } else {
        opts.limit
    };

    let rows = sqlx::query(
        r#"
        SELECT s.source_id, src.source_type, src.title, src.status,
               COALESCE(src.updated_at, src.created_at) AS updated_at,
               bm25(summaries_fts) AS rank,
               snippet(summaries_fts, -1, '>>>', '<<<', '...', 24) AS snippet
        FROM summaries_fts
        JOIN summaries s ON summaries_fts.rowid = s.rowid
        JOIN sources src ON s.source_id = src.id
        WHERE summaries_fts MATCH ?
          AND (? IS NULL OR src.source_type = ?)
          AND (? IS NULL OR src.project_path LIKE '%' || ? || '%')
        ORDER BY rank, s.source_id
        LIMIT ?
        "#,
    )
    .bind(query)
    .bind(opts.source_type.map(|t| t.as_str()))
    .bind(opts.source_type.map(|t| t.as_str()))
    .bind(opts.project.as_deref())
    .bind(opts.project.as_deref())
    .bind(fetch_limit)
    .fetch_all(pool)
    .await?;

    let now = chrono::Utc::now();
    let mut hits: Vec<SearchHit> = rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            let updated_at: Option<String> = row.get("updated_at");
            let decay = match opts.recency_half_life_days {
                Some(half_life) if half_life > 0.0 => updated_at
                    .as_deref()
                    .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
                    .map(|ts| {
                        let days = (now - ts.with_timezone(&chrono::Utc)).num_days().max(0);
                        0.5f64.powf(days as f64 / half_life)
                    })
                    .unwrap_or(1.0),
                _ => 1.0,
            };
            SearchHit {
                source_id: row.get("source_id"),
                source_type: row.get("source_type"),
                title: row.get("title"),
                status: row
                    .get::<Option<String>, _>("status")
                    .unwrap_or_else(|| "pending".to_string()),
                updated_at,
                // bm25 is negative, closer to zero is worse
                score: -rank * decay,
                snippet: row.get::<Option<String>, _>("snippet").unwrap_or_default(),
            }
        })
        .collect();

    if opts.recency_half_life_days.is_some() {
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        hits.truncate(opts.limit as usize);
    }

    Ok(hits)
}

/// `garde search`: prepare the query, run it, print results.
pub async fn run_search(config: &Config, raw_query: &str, opts: &SearchOptions) -> anyhow::Result<()> {
    let glossary = match &config.entities.glossary_path {
        Some(path) => Glossary::load(path)?,
        None => Glossary::empty(),
    };
    let query = prepare_query(raw_query, &glossary);
    if query != raw_query.trim() {
        eprintln!("Search: {}", query);
    }

    let pool = db::connect(config).await?;
    let hits = search(&pool, &query, opts)
        .await
        .with_context(|| format!("search failed for query: {}", query))?;

    if hits.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let title = hit.title.as_deref().unwrap_or("(untitled)");
        let date = hit
            .updated_at
            .as_deref()
            .and_then(|ts| ts.get(..10))
            .unwrap_or("unknown");

        println!("{}. [{:.2}] {} / {}", i + 1, hit.score, hit.source_type, title);
        println!("    updated: {}", date);
        if hit.status != "processed" {
            println!("    status: {}", hit.status);
        }
        println!("    excerpt: \"{}\"", hit.snippet.replace('\n', " ").trim());
        println!("    id: {}", hit.source_id);
        println!();
    }

    pool.close().await;
    Ok(())
}
