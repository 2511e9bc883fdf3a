//! Entity review queue commands (`garde resolve ...`) and the glossary
//! audit (`garde glossary-check`).

use anyhow::{bail, Result};

use crate::backfill::load_glossary;
use crate::config::Config;
use crate::models::PendingStatus;
use crate::store::Store;

pub async fn run_list(config: &Config, all: bool, limit: usize) -> Result<()> {
    let store = Store::open(config).await?;
    let status = if all { None } else { Some(PendingStatus::Pending) };
    let entries = store.pending_entities(status, limit).await?;

    if entries.is_empty() {
        println!("Review queue is empty.");
        store.pool().close().await;
        return Ok(());
    }

    println!(
        "  {:>5}  {:<28} {:<20} {:>5}  {:<9} {}",
        "ID", "MENTION", "SUGGESTED", "CONF", "STATUS", "SOURCE"
    );
    println!("  {}", "-".repeat(96));
    for e in &entries {
        println!(
            "  {:>5}  {:<28} {:<20} {:>5}  {:<9} {}",
            e.id,
            truncate(&e.mention_text, 28),
            truncate(e.suggested_entity.as_deref().unwrap_or("-"), 20),
            e.confidence
                .map(|c| format!("{:.2}", c))
                .unwrap_or_else(|| "-".to_string()),
            e.status,
            e.source_id.as_deref().unwrap_or("-"),
        );
    }

    store.pool().close().await;
    Ok(())
}

/// Accept a queued mention as `entity`, or as its suggestion when `entity`
/// is omitted.
pub async fn run_accept(config: &Config, id: i64, entity: Option<&str>) -> Result<()> {
    let store = Store::open(config).await?;

    let resolution = match entity {
        Some(e) => e.to_string(),
        None => {
            let queued = store.pending_entities(Some(PendingStatus::Pending), usize::MAX).await?;
            match queued.into_iter().find(|p| p.id == id) {
                Some(p) => match p.suggested_entity {
                    Some(s) => s,
                    None => bail!("pending entity {} has no suggestion; pass an entity", id),
                },
                None => bail!("no open pending entity with id {}", id),
            }
        }
    };

    let glossary = load_glossary(config)?;
    if !glossary.is_empty() && glossary.get(&resolution).is_none() {
        tracing::warn!(entity = %resolution, "accepting an entity that is not in the glossary");
    }

    let entry = store.resolve_pending(id, &resolution).await?;
    println!("resolved {} '{}' -> {}", entry.id, entry.mention_text, resolution);

    store.pool().close().await;
    Ok(())
}

pub async fn run_reject(config: &Config, id: i64) -> Result<()> {
    let store = Store::open(config).await?;
    let entry = store.reject_pending(id).await?;
    println!("rejected {} '{}'", entry.id, entry.mention_text);
    store.pool().close().await;
    Ok(())
}

/// `garde glossary-check`: print lookup problems in the glossary. Fails
/// when any are found so scripts can gate on it.
pub fn run_glossary_check(config: &Config) -> Result<()> {
    let glossary = load_glossary(config)?;
    let issues = glossary.check();

    println!("glossary: {} entities", glossary.len());

    if !issues.key_not_searchable.is_empty() {
        println!("\nKeys that are neither the name nor an alias:");
        for (key, name) in &issues.key_not_searchable {
            println!("  {} -> \"{}\"  (add \"{}\" to aliases)", key, name, key);
        }
    }
    if !issues.duplicate_aliases.is_empty() {
        println!("\nTerms claimed by more than one entity:");
        for (term, keys) in &issues.duplicate_aliases {
            println!("  \"{}\" -> {}", term, keys.join(", "));
        }
    }
    if !issues.orphaned_mappings.is_empty() {
        println!("\nauto_mappings pointing at unknown entities:");
        for (alias, key) in &issues.orphaned_mappings {
            println!("  \"{}\" -> {}", alias, key);
        }
    }
    if !issues.missing_parents.is_empty() {
        println!("\nUnknown parents:");
        for (key, parent) in &issues.missing_parents {
            println!("  {} -> {}", key, parent);
        }
    }
    if !issues.parent_cycles.is_empty() {
        println!("\nParent cycles through: {}", issues.parent_cycles.join(", "));
    }
    if issues.valid_mappings > 0 {
        println!("\n{} auto_mappings could graduate to aliases", issues.valid_mappings);
    }

    if issues.is_clean() {
        println!("ok");
        Ok(())
    } else {
        bail!("glossary has issues")
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
    }
}
