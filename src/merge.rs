//! Combine per-chunk extractions into one record per source.
//!
//! Fields are concatenated in chunk order and deduplicated on a normalized
//! key (trimmed, lower-cased, inner whitespace collapsed). The first
//! occurrence of a duplicate wins, except for entity mentions, where the
//! highest confidence is kept. Merging the same sequence twice gives the
//! same result.

use std::collections::{HashMap, HashSet};

use crate::models::{Extraction, MentionCandidate, StoryArc};

pub fn merge_extractions(mut parts: Vec<Extraction>) -> Extraction {
    if parts.len() == 1 {
        return parts.remove(0);
    }
    if parts.is_empty() {
        return Extraction::default();
    }

    let summary = parts
        .iter()
        .map(|p| p.summary.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    let arc = StoryArc {
        started_with: parts.iter().find_map(|p| p.arc.started_with.clone()),
        key_turns: dedup_by(
            parts.iter().flat_map(|p| p.arc.key_turns.iter().cloned()),
            |t| normalize(t),
        ),
        ended_at: parts.iter().rev().find_map(|p| p.arc.ended_at.clone()),
    };

    let builds = dedup_by(parts.iter().flat_map(|p| p.builds.iter().cloned()), |b| {
        normalize(&b.what)
    });
    let learnings = dedup_by(parts.iter().flat_map(|p| p.learnings.iter().cloned()), |l| {
        normalize(&l.insight)
    });
    let friction = dedup_by(parts.iter().flat_map(|p| p.friction.iter().cloned()), |f| {
        normalize(&f.problem)
    });
    let patterns = dedup_by(parts.iter().flat_map(|p| p.patterns.iter().cloned()), |s| {
        normalize(s)
    });
    let open_threads = dedup_by(
        parts.iter().flat_map(|p| p.open_threads.iter().cloned()),
        |s| normalize(s),
    );
    let entities = merge_mentions(parts.iter().flat_map(|p| p.entities.iter().cloned()));

    Extraction {
        summary,
        arc,
        builds,
        learnings,
        friction,
        patterns,
        open_threads,
        entities,
    }
}

/// Deduplicate by lower-cased mention text, keeping the first position and
/// the highest confidence seen. A missing canonical suggestion is filled in
/// from a later duplicate.
pub fn merge_mentions(mentions: impl IntoIterator<Item = MentionCandidate>) -> Vec<MentionCandidate> {
    let mut out: Vec<MentionCandidate> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for m in mentions {
        let key = normalize(&m.mention);
        if key.is_empty() {
            continue;
        }
        match index.get(&key) {
            Some(&i) => {
                let existing = &mut out[i];
                if m.confidence > existing.confidence {
                    existing.confidence = m.confidence;
                }
                if existing.suggested_canonical.is_none() {
                    existing.suggested_canonical = m.suggested_canonical;
                }
            }
            None => {
                index.insert(key, out.len());
                out.push(m);
            }
        }
    }
    out
}

fn dedup_by<T>(items: impl IntoIterator<Item = T>, key: impl Fn(&T) -> String) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| {
            let k = key(item);
            !k.is_empty() && seen.insert(k)
        })
        .collect()
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Build, Learning};

    fn part(summary: &str) -> Extraction {
        Extraction {
            summary: summary.into(),
            ..Default::default()
        }
    }

    fn mention(text: &str, confidence: f64) -> MentionCandidate {
        MentionCandidate {
            mention: text.into(),
            confidence,
            suggested_canonical: None,
        }
    }

    #[test]
    fn test_single_part_passthrough() {
        let mut p = part("only");
        p.patterns = vec!["x".into(), "x".into()];
        let merged = merge_extractions(vec![p.clone()]);
        assert_eq!(merged, p);
    }

    #[test]
    fn test_order_and_dedup() {
        let mut a = part("First half.");
        a.arc.started_with = Some("goal".into());
        a.arc.key_turns = vec!["found bug".into()];
        a.builds = vec![Build {
            what: "Parser".into(),
            details: Some("v1".into()),
        }];
        a.learnings = vec![Learning {
            insight: "FTS needs quoting".into(),
            why_it_matters: None,
            context: None,
        }];

        let mut b = part("Second half.");
        b.arc.key_turns = vec!["Found  bug".into(), "shipped".into()];
        b.arc.ended_at = Some("released".into());
        b.builds = vec![
            Build {
                what: "parser".into(),
                details: Some("v2".into()),
            },
            Build {
                what: "CLI".into(),
                details: None,
            },
        ];

        let merged = merge_extractions(vec![a, b]);
        assert_eq!(merged.summary, "First half.\n\nSecond half.");
        assert_eq!(merged.arc.started_with.as_deref(), Some("goal"));
        assert_eq!(merged.arc.ended_at.as_deref(), Some("released"));
        assert_eq!(merged.arc.key_turns, vec!["found bug", "shipped"]);
        assert_eq!(merged.builds.len(), 2);
        assert_eq!(merged.builds[0].details.as_deref(), Some("v1"));
        assert_eq!(merged.learnings.len(), 1);
    }

    #[test]
    fn test_mentions_keep_max_confidence() {
        let mut a = part("a");
        a.entities = vec![mention("Rust", 0.3), mention("SQLite", 0.9)];
        let mut b = part("b");
        b.entities = vec![mention("rust", 0.9)];
        b.entities[0].suggested_canonical = Some("Rust".into());

        let merged = merge_extractions(vec![a, b]);
        assert_eq!(merged.entities.len(), 2);
        assert_eq!(merged.entities[0].mention, "Rust");
        assert_eq!(merged.entities[0].confidence, 0.9);
        assert_eq!(merged.entities[0].suggested_canonical.as_deref(), Some("Rust"));
    }

    #[test]
    fn test_merge_is_repeatable() {
        let mut a = part("a");
        a.patterns = vec!["tdd".into()];
        let mut b = part("b");
        b.patterns = vec!["TDD".into(), "pairing".into()];
        let parts = vec![a, b];
        assert_eq!(merge_extractions(parts.clone()), merge_extractions(parts));
    }
}
