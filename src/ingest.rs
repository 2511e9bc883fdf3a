//! Source ingest and pruning.
//!
//! Adapters hand over normalized source records as JSON lines. Ingest upserts
//! each record with its preliminary summary; a changed content hash sends the
//! source back to `pending`. Pruning flags sources whose origin file has gone
//! away as `stale` without touching their summaries.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

use crate::config::Config;
use crate::models::SourceRecord;
use crate::store::{IngestOutcome, Store};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub new: usize,
    pub changed: usize,
    pub relocated: usize,
    pub unchanged: usize,
}

impl IngestSummary {
    pub fn total(&self) -> usize {
        self.new + self.changed + self.relocated + self.unchanged
    }
}

/// Parse JSON-lines source records. Blank lines are ignored.
pub fn parse_records(input: &str) -> Result<Vec<SourceRecord>> {
    let mut records = Vec::new();
    for (lineno, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut rec: SourceRecord = serde_json::from_str(line)
            .with_context(|| format!("invalid source record on line {}", lineno + 1))?;
        if rec.content_hash.is_empty() {
            rec.content_hash = content_hash(&rec.full_text);
        }
        records.push(rec);
    }
    Ok(records)
}

/// SHA-256 of the full text, hex encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub async fn ingest_records(
    store: &Store,
    records: &[SourceRecord],
) -> crate::error::Result<IngestSummary> {
    let mut summary = IngestSummary::default();
    for rec in records {
        match store.ingest(rec).await? {
            IngestOutcome::New => summary.new += 1,
            IngestOutcome::Changed => summary.changed += 1,
            IngestOutcome::Relocated => summary.relocated += 1,
            IngestOutcome::Unchanged => summary.unchanged += 1,
        }
    }
    Ok(summary)
}

/// Mark every source whose recorded path no longer exists as `stale`.
/// Returns the affected ids.
pub async fn prune(store: &Store, dry_run: bool) -> crate::error::Result<Vec<String>> {
    let mut vanished = Vec::new();
    for (id, path) in store.sources_with_paths().await? {
        if Path::new(&path).exists() {
            continue;
        }
        if !dry_run {
            store.mark_stale(&id).await?;
            tracing::info!(source_id = %id, %path, "marked stale");
        }
        vanished.push(id);
    }
    Ok(vanished)
}

/// `garde ingest <file|->`.
pub async fn run_ingest(config: &Config, input: &Path, dry_run: bool) -> Result<()> {
    let text = if input == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read records from stdin")?;
        buf
    } else {
        std::fs::read_to_string(input)
            .with_context(|| format!("Failed to read records: {}", input.display()))?
    };
    let records = parse_records(&text)?;

    if dry_run {
        println!("ingest (dry-run)");
        println!("  records: {}", records.len());
        return Ok(());
    }

    let store = Store::open(config).await?;
    let summary = ingest_records(&store, &records).await?;

    println!("ingest");
    println!("  records: {}", summary.total());
    println!("  new: {}", summary.new);
    println!("  changed: {}", summary.changed);
    println!("  relocated: {}", summary.relocated);
    println!("  unchanged: {}", summary.unchanged);
    println!("ok");

    store.pool().close().await;
    Ok(())
}

/// `garde prune`.
pub async fn run_prune(config: &Config, dry_run: bool) -> Result<()> {
    let store = Store::open(config).await?;
    let vanished = prune(&store, dry_run).await?;

    println!("prune{}", if dry_run { " (dry-run)" } else { "" });
    for id in &vanished {
        println!("  stale: {}", id);
    }
    println!("  {} source(s) {}", vanished.len(), if dry_run { "would be marked stale" } else { "marked stale" });

    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_records_fills_hash() {
        let input = r#"
{"id": "handoff:a", "type": "handoff", "title": "A", "full_text": "hello"}

{"id": "local_md:b", "type": "local_md", "title": "B", "content_hash": "abc", "full_text": "x", "path": "/tmp/b.md"}
"#;
        let records = parse_records(input).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content_hash, content_hash("hello"));
        assert_eq!(records[1].content_hash, "abc");
        assert_eq!(records[1].path.as_deref(), Some("/tmp/b.md"));
    }

    #[test]
    fn test_parse_records_reports_line() {
        let err = parse_records("{\"id\": 1}\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("").len(), 64);
    }
}
