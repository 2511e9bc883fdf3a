//! Glossary loading and entity resolution.
//!
//! The glossary maps canonical entity keys to a display name, a type, an
//! optional parent and a list of aliases. `auto_mappings` adds extra
//! alias → key pairs learned over time. The file is TOML:
//!
//! ```toml
//! [entities.garde]
//! name = "Garde"
//! type = "project"
//! aliases = ["garde-manger", "gm"]
//!
//! [auto_mappings]
//! "the archive" = "garde"
//! ```
//!
//! Resolution is exact (case-insensitive) first, then fuzzy. Only mentions
//! that clear the acceptance threshold become entity mentions; everything
//! else is queued for a human decision.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::config::EntitiesConfig;
use crate::models::{EntityMention, MentionCandidate, PendingMention, RoutedMentions};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GlossaryEntity {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GlossaryFile {
    #[serde(default)]
    entities: BTreeMap<String, GlossaryEntity>,
    #[serde(default)]
    auto_mappings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct Glossary {
    entities: BTreeMap<String, GlossaryEntity>,
    auto_mappings: BTreeMap<String, String>,
    /// Lower-cased name/alias → entity key, sorted for deterministic scans.
    aliases: Vec<(String, String)>,
    lookup: HashMap<String, String>,
}

impl Glossary {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load from a TOML file. A missing file is an empty glossary.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no glossary file, using empty glossary");
            return Ok(Self::empty());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read glossary: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse glossary: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: GlossaryFile = toml::from_str(content)?;
        Ok(Self::build(file.entities, file.auto_mappings))
    }

    fn build(
        entities: BTreeMap<String, GlossaryEntity>,
        auto_mappings: BTreeMap<String, String>,
    ) -> Self {
        let mut lookup: HashMap<String, String> = HashMap::new();
        for (key, entity) in &entities {
            lookup.insert(key.to_lowercase(), key.clone());
            if let Some(name) = &entity.name {
                lookup.insert(name.to_lowercase(), key.clone());
            }
            for alias in &entity.aliases {
                lookup.insert(alias.to_lowercase(), key.clone());
            }
        }
        for (alias, key) in &auto_mappings {
            lookup.insert(alias.to_lowercase(), key.clone());
        }
        lookup.retain(|alias, _| !alias.trim().is_empty());

        let mut aliases: Vec<(String, String)> =
            lookup.iter().map(|(a, k)| (a.clone(), k.clone())).collect();
        aliases.sort();

        Self {
            entities,
            auto_mappings,
            aliases,
            lookup,
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&GlossaryEntity> {
        self.entities.get(key)
    }

    /// Entity key for an exact (case-insensitive) name, alias or mapping.
    pub fn lookup(&self, mention: &str) -> Option<&str> {
        self.lookup.get(&mention.trim().to_lowercase()).map(String::as_str)
    }

    /// Parent chain from the immediate parent up, stopping on cycles.
    pub fn ancestors(&self, key: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut current = self.get(key).and_then(|e| e.parent.clone());
        while let Some(parent) = current {
            if parent == key || out.contains(&parent) {
                break;
            }
            current = self.get(&parent).and_then(|e| e.parent.clone());
            out.push(parent);
        }
        out
    }

    /// Audit the glossary for entries that make lookups misbehave.
    pub fn check(&self) -> GlossaryIssues {
        let mut issues = GlossaryIssues::default();
        let mut claims: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (key, entity) in &self.entities {
            let lower_key = key.to_lowercase();
            let aliases: Vec<String> = entity.aliases.iter().map(|a| a.to_lowercase()).collect();
            if let Some(name) = &entity.name {
                if name.to_lowercase() != lower_key && !aliases.contains(&lower_key) {
                    issues.key_not_searchable.push((key.clone(), name.clone()));
                }
            }

            let mut terms: Vec<String> = std::iter::once(lower_key)
                .chain(entity.name.iter().map(|n| n.to_lowercase()))
                .chain(aliases)
                .collect();
            terms.sort();
            terms.dedup();
            for term in terms {
                claims.entry(term).or_default().push(key.clone());
            }

            if let Some(parent) = entity.parent.as_deref() {
                if self.get(parent).is_none() {
                    issues.missing_parents.push((key.clone(), parent.to_string()));
                }
            }
            // ancestors() stops short of the repeat; a cycle shows as the
            // last ancestor pointing back into the chain
            let chain = self.ancestors(key);
            let end = chain.last().map(String::as_str).unwrap_or(key);
            if let Some(next) = self.get(end).and_then(|e| e.parent.as_deref()) {
                if next == key || chain.iter().any(|c| c == next) {
                    issues.parent_cycles.push(key.clone());
                }
            }
        }

        issues.duplicate_aliases = claims.into_iter().filter(|(_, keys)| keys.len() > 1).collect();
        issues.orphaned_mappings = self
            .auto_mappings
            .iter()
            .filter(|(_, key)| !self.entities.contains_key(*key))
            .map(|(alias, key)| (alias.clone(), key.clone()))
            .collect();
        issues.valid_mappings = self.auto_mappings.len() - issues.orphaned_mappings.len();
        issues
    }

    /// Short listing of known entities for extraction prompts.
    pub fn sample_for_prompt(&self, max_entities: usize) -> String {
        let mut lines: Vec<String> = self
            .entities
            .iter()
            .take(max_entities)
            .map(|(key, e)| {
                let name = e.name.as_deref().unwrap_or(key);
                let kind = e.entity_type.as_deref().unwrap_or("unknown");
                if e.aliases.is_empty() {
                    format!("- {} [{}]", name, kind)
                } else {
                    let shown: Vec<&str> = e.aliases.iter().take(3).map(String::as_str).collect();
                    format!("- {} [{}] (also: {})", name, kind, shown.join(", "))
                }
            })
            .collect();
        if self.entities.len() > max_entities {
            lines.push(format!(
                "... and {} more entities",
                self.entities.len() - max_entities
            ));
        }
        lines.join("\n")
    }
}

/// Findings from [`Glossary::check`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GlossaryIssues {
    /// `(key, name)` where searching for the key finds nothing: it differs
    /// from the name and is not an alias.
    pub key_not_searchable: Vec<(String, String)>,
    /// Lower-cased term → every entity claiming it.
    pub duplicate_aliases: Vec<(String, Vec<String>)>,
    /// `(alias, key)` auto mappings pointing at unknown entities.
    pub orphaned_mappings: Vec<(String, String)>,
    pub valid_mappings: usize,
    /// `(key, parent)` where the parent is not an entity.
    pub missing_parents: Vec<(String, String)>,
    pub parent_cycles: Vec<String>,
}

impl GlossaryIssues {
    pub fn is_clean(&self) -> bool {
        self.key_not_searchable.is_empty()
            && self.duplicate_aliases.is_empty()
            && self.orphaned_mappings.is_empty()
            && self.missing_parents.is_empty()
            && self.parent_cycles.is_empty()
    }
}

/// Best glossary match for one mention.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub entity: Option<String>,
    pub confidence: f64,
}

pub struct EntityResolver {
    glossary: Glossary,
    accept_threshold: f64,
    fuzzy_threshold: f64,
}

impl EntityResolver {
    pub fn new(glossary: Glossary, config: &EntitiesConfig) -> Self {
        Self {
            glossary,
            accept_threshold: config.accept_threshold,
            fuzzy_threshold: config.fuzzy_threshold,
        }
    }

    pub fn glossary(&self) -> &Glossary {
        &self.glossary
    }

    /// Exact match → 1.0, fuzzy match at or above the fuzzy threshold → the
    /// similarity, otherwise no entity and 0.
    pub fn resolve(&self, mention: &str) -> Resolution {
        if let Some(key) = self.glossary.lookup(mention) {
            return Resolution {
                entity: Some(key.to_string()),
                confidence: 1.0,
            };
        }

        let needle = mention.trim().to_lowercase();
        let mut best: Option<(&str, f64)> = None;
        for (alias, key) in &self.glossary.aliases {
            let score = similarity(&needle, alias);
            if score >= self.fuzzy_threshold && best.map_or(true, |(_, s)| score > s) {
                best = Some((key.as_str(), score));
            }
        }

        match best {
            Some((key, score)) => Resolution {
                entity: Some(key.to_string()),
                confidence: score,
            },
            None => Resolution {
                entity: None,
                confidence: 0.0,
            },
        }
    }

    /// Split extracted mentions into accepted entity mentions and review
    /// queue entries.
    ///
    /// Acceptance depends only on how well the mention text itself matches
    /// the glossary. The extraction's own canonical suggestion is used as a
    /// fallback best guess for the reviewer, never to accept.
    pub fn route(&self, candidates: &[MentionCandidate]) -> RoutedMentions {
        let mut routed = RoutedMentions::default();

        for candidate in candidates {
            let mention = candidate.mention.trim();
            if mention.is_empty() {
                continue;
            }
            let r = self.resolve(mention);

            match r.entity {
                Some(entity) if r.confidence >= self.accept_threshold => {
                    routed.resolved.push(EntityMention {
                        entity_id: entity,
                        mention_text: mention.to_string(),
                        confidence: r.confidence,
                    });
                }
                entity => {
                    let suggested = entity.or_else(|| {
                        candidate
                            .suggested_canonical
                            .as_deref()
                            .and_then(|s| self.resolve(s).entity)
                    });
                    routed.pending.push(PendingMention {
                        mention_text: mention.to_string(),
                        suggested_entity: suggested,
                        confidence: r.confidence,
                    });
                }
            }
        }

        routed
    }
}

/// Case-insensitive similarity in [0, 1]: the larger of the containment
/// ratio and the Sørensen–Dice coefficient over character bigrams.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let (la, lb) = (a.chars().count(), b.chars().count());
    let containment = if a.contains(&b) || b.contains(&a) {
        la.min(lb) as f64 / la.max(lb) as f64
    } else {
        0.0
    };

    containment.max(dice(&a, &b))
}

fn dice(a: &str, b: &str) -> f64 {
    let bigrams = |s: &str| -> Vec<(char, char)> {
        let chars: Vec<char> = s.chars().collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    };
    let (ba, bb) = (bigrams(a), bigrams(b));
    if ba.is_empty() || bb.is_empty() {
        return 0.0;
    }

    let mut counts: HashMap<(char, char), usize> = HashMap::new();
    for g in &ba {
        *counts.entry(*g).or_default() += 1;
    }
    let mut shared = 0usize;
    for g in &bb {
        if let Some(c) = counts.get_mut(g) {
            if *c > 0 {
                *c -= 1;
                shared += 1;
            }
        }
    }

    (2 * shared) as f64 / (ba.len() + bb.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const GLOSSARY: &str = r#"
[entities.rust]
name = "Rust"
type = "language"
aliases = ["rustlang"]

[entities.garde]
name = "Garde"
type = "project"
aliases = ["garde-manger"]
parent = "tools"

[entities.tools]
name = "Tools"
type = "area"

[auto_mappings]
"the archive" = "garde"
"#;

    fn resolver() -> EntityResolver {
        EntityResolver::new(
            Glossary::from_toml(GLOSSARY).unwrap(),
            &EntitiesConfig::default(),
        )
    }

    fn candidate(mention: &str) -> MentionCandidate {
        MentionCandidate {
            mention: mention.into(),
            confidence: 0.9,
            suggested_canonical: None,
        }
    }

    #[test]
    fn test_exact_alias_resolves_fully() {
        let r = resolver();
        assert_eq!(
            r.resolve("RustLang"),
            Resolution {
                entity: Some("rust".into()),
                confidence: 1.0
            }
        );
        assert_eq!(r.resolve("The Archive").entity.as_deref(), Some("garde"));

        let routed = r.route(&[candidate("rustlang")]);
        assert_eq!(routed.resolved.len(), 1);
        assert_eq!(routed.resolved[0].confidence, 1.0);
        assert!(routed.pending.is_empty());
    }

    #[test]
    fn test_no_overlap_goes_to_review_with_no_suggestion() {
        let routed = resolver().route(&[candidate("Kubernetes")]);
        assert!(routed.resolved.is_empty());
        assert_eq!(
            routed.pending,
            vec![PendingMention {
                mention_text: "Kubernetes".into(),
                suggested_entity: None,
                confidence: 0.0,
            }]
        );
    }

    #[test]
    fn test_fuzzy_below_accept_is_queued_with_guess() {
        let r = resolver();
        let res = r.resolve("rustlng");
        assert_eq!(res.entity.as_deref(), Some("rust"));
        assert!(res.confidence >= 0.6 && res.confidence < 0.8, "{}", res.confidence);

        let routed = r.route(&[candidate("rustlng")]);
        assert!(routed.resolved.is_empty());
        assert_eq!(routed.pending[0].suggested_entity.as_deref(), Some("rust"));
    }

    #[test]
    fn test_llm_suggestion_only_guides_review() {
        let mut c = candidate("GM tooling");
        c.suggested_canonical = Some("garde-manger".into());
        let routed = resolver().route(&[c]);
        assert!(routed.resolved.is_empty());
        assert_eq!(routed.pending[0].suggested_entity.as_deref(), Some("garde"));
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("abc", "ABC"), 1.0);
        assert_eq!(similarity("", "abc"), 0.0);
        assert_eq!(similarity("xyz", "abc"), 0.0);
        assert!((similarity("garde", "garde-manger") - 5.0 / 12.0).abs() < 0.2);
    }

    #[test]
    fn test_ancestors_and_sample() {
        let g = Glossary::from_toml(GLOSSARY).unwrap();
        assert_eq!(g.ancestors("garde"), vec!["tools".to_string()]);
        let sample = g.sample_for_prompt(2);
        assert!(sample.contains("- Garde [project] (also: garde-manger)"));
        assert!(sample.ends_with("... and 1 more entities"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let g = Glossary::load(Path::new("/nonexistent/glossary.toml")).unwrap();
        assert!(g.is_empty());
    }

    #[test]
    fn test_check_flags_broken_entries() {
        let g = Glossary::from_toml(
            r#"
            [entities.csp]
            name = "CS&P"

            [entities.rust]
            name = "Rust"
            aliases = ["rustlang", "oxide"]

            [entities.oxide]
            name = "Oxide"
            parent = "computers"

            [entities.a]
            parent = "b"

            [entities.b]
            parent = "a"

            [auto_mappings]
            "the db" = "sqlite"
            "rs" = "rust"
            "#,
        )
        .unwrap();

        let issues = g.check();
        assert!(!issues.is_clean());
        assert_eq!(issues.key_not_searchable, vec![("csp".to_string(), "CS&P".to_string())]);
        assert_eq!(
            issues.duplicate_aliases,
            vec![("oxide".to_string(), vec!["oxide".to_string(), "rust".to_string()])]
        );
        assert_eq!(issues.orphaned_mappings, vec![("the db".to_string(), "sqlite".to_string())]);
        assert_eq!(issues.valid_mappings, 1);
        assert_eq!(
            issues.missing_parents,
            vec![("oxide".to_string(), "computers".to_string())]
        );
        assert_eq!(issues.parent_cycles, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_check_accepts_tidy_glossary() {
        assert!(Glossary::from_toml(GLOSSARY).unwrap().check().is_clean());
    }
}
