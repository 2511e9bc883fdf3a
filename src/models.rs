//! Core data models used throughout the archive.
//!
//! These types represent the sources, summaries, extractions and entity
//! mentions that flow through the extraction pipeline.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Provenance marker for extractions persisted from the staging area.
pub const PROVENANCE_STAGED: &str = "staged:in-session";
/// Provenance marker for sources too short to send for extraction.
pub const PROVENANCE_TOO_SHORT: &str = "skipped:content_too_short";

/// Kinds of source the archive understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    ClaudeCode,
    ClaudeAi,
    CloudSession,
    Handoff,
    LocalMd,
    Beads,
    Arc,
    Knowledge,
    Other,
}

impl SourceType {
    pub const ALL: [SourceType; 9] = [
        SourceType::ClaudeCode,
        SourceType::ClaudeAi,
        SourceType::CloudSession,
        SourceType::Handoff,
        SourceType::LocalMd,
        SourceType::Beads,
        SourceType::Arc,
        SourceType::Knowledge,
        SourceType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::ClaudeCode => "claude_code",
            SourceType::ClaudeAi => "claude_ai",
            SourceType::CloudSession => "cloud_session",
            SourceType::Handoff => "handoff",
            SourceType::LocalMd => "local_md",
            SourceType::Beads => "beads",
            SourceType::Arc => "arc",
            SourceType::Knowledge => "knowledge",
            SourceType::Other => "other",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| {
                let known: Vec<&str> = SourceType::ALL.iter().map(|t| t.as_str()).collect();
                format!("unknown source type '{}', expected one of: {}", s, known.join(", "))
            })
    }
}

/// Processing status of a source. `Pending` doubles as the resume checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Pending,
    Processed,
    Skipped,
    Failed,
    Stale,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Pending => "pending",
            SourceStatus::Processed => "processed",
            SourceStatus::Skipped => "skipped",
            SourceStatus::Failed => "failed",
            SourceStatus::Stale => "stale",
        }
    }
}

impl FromStr for SourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SourceStatus::Pending),
            "processed" => Ok(SourceStatus::Processed),
            "skipped" => Ok(SourceStatus::Skipped),
            "failed" => Ok(SourceStatus::Failed),
            "stale" => Ok(SourceStatus::Stale),
            other => Err(format!("unknown source status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    Pending,
    Resolved,
    Rejected,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Resolved => "resolved",
            PendingStatus::Rejected => "rejected",
        }
    }
}

/// Normalized record handed over by a source adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub title: String,
    #[serde(default)]
    pub path: Option<String>,
    /// Filled from `full_text` at ingest when the adapter leaves it empty.
    #[serde(default)]
    pub content_hash: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    pub full_text: String,
    #[serde(default)]
    pub has_presummary: bool,
    /// Verbatim summary shipped with the source, used when `has_presummary`.
    #[serde(default)]
    pub presummary: Option<String>,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub is_subagent: bool,
    #[serde(default)]
    pub input_mode: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Timestamps are stored as RFC 3339 text, matching existing databases.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn now_ts() -> String {
    format_ts(&Utc::now())
}

/// A `sources` row as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub id: String,
    pub source_type: String,
    pub title: Option<String>,
    pub path: Option<String>,
    pub content_hash: Option<String>,
    pub status: String,
    pub processed_at: Option<String>,
    pub error: Option<String>,
}

/// A `summaries` row as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub source_id: String,
    pub summary_text: String,
    pub raw_text: Option<String>,
    pub has_presummary: bool,
    pub word_count: Option<i64>,
    pub created_at: Option<String>,
    pub model_used: Option<String>,
    pub extraction_json: Option<String>,
}

/// Summary content ready to be written by `Store::record_processed`.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryDraft {
    pub summary_text: String,
    pub has_presummary: bool,
    pub word_count: i64,
    pub model_used: String,
    pub extraction_json: Option<String>,
}

impl SummaryDraft {
    /// Build a draft from a structured extraction.
    pub fn from_extraction(extraction: &Extraction, model_used: &str) -> serde_json::Result<Self> {
        let summary_text = extraction.searchable_text();
        Ok(Self {
            word_count: summary_text.split_whitespace().count() as i64,
            summary_text,
            has_presummary: false,
            model_used: model_used.to_string(),
            extraction_json: Some(serde_json::to_string(extraction)?),
        })
    }

    /// Build a stub for content below the invocation threshold.
    pub fn stub(content: &str) -> Self {
        Self {
            summary_text: content.trim().to_string(),
            has_presummary: true,
            word_count: content.split_whitespace().count() as i64,
            model_used: PROVENANCE_TOO_SHORT.to_string(),
            extraction_json: None,
        }
    }
}

/// A resolved association between a source and a canonical entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMention {
    pub entity_id: String,
    pub mention_text: String,
    pub confidence: f64,
}

/// A mention that did not clear the acceptance threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMention {
    pub mention_text: String,
    pub suggested_entity: Option<String>,
    pub confidence: f64,
}

/// Mentions for one source after glossary routing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutedMentions {
    pub resolved: Vec<EntityMention>,
    pub pending: Vec<PendingMention>,
}

/// A row of the human review queue.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntity {
    pub id: i64,
    pub mention_text: String,
    pub source_id: Option<String>,
    pub suggested_entity: Option<String>,
    pub confidence: Option<f64>,
    pub status: String,
    pub resolution: Option<String>,
    pub created_at: Option<String>,
}

/// A search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub source_id: String,
    pub source_type: String,
    pub title: Option<String>,
    pub status: String,
    pub updated_at: Option<String>,
    pub score: f64,
    pub snippet: String,
}

// ---------------------------------------------------------------------------
// Structured extraction
// ---------------------------------------------------------------------------

/// Structured digest of one source, as produced by the extraction capability
/// or supplied by a staged file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Extraction {
    #[serde(deserialize_with = "nullable")]
    pub summary: String,
    #[serde(deserialize_with = "nullable")]
    pub arc: StoryArc,
    #[serde(deserialize_with = "nullable")]
    pub builds: Vec<Build>,
    #[serde(deserialize_with = "nullable")]
    pub learnings: Vec<Learning>,
    #[serde(deserialize_with = "nullable")]
    pub friction: Vec<Friction>,
    #[serde(deserialize_with = "nullable")]
    pub patterns: Vec<String>,
    #[serde(deserialize_with = "nullable")]
    pub open_threads: Vec<String>,
    #[serde(deserialize_with = "nullable")]
    pub entities: Vec<MentionCandidate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryArc {
    pub started_with: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub key_turns: Vec<String>,
    pub ended_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "BuildRepr")]
pub struct Build {
    pub what: String,
    pub details: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BuildRepr {
    Text(String),
    Full {
        what: String,
        details: Option<String>,
    },
}

impl From<BuildRepr> for Build {
    fn from(repr: BuildRepr) -> Self {
        match repr {
            BuildRepr::Text(what) => Build {
                what,
                details: None,
            },
            BuildRepr::Full { what, details } => Build { what, details },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "LearningRepr")]
pub struct Learning {
    pub insight: String,
    pub why_it_matters: Option<String>,
    pub context: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LearningRepr {
    Text(String),
    Full {
        insight: String,
        why_it_matters: Option<String>,
        context: Option<String>,
    },
}

impl From<LearningRepr> for Learning {
    fn from(repr: LearningRepr) -> Self {
        match repr {
            LearningRepr::Text(insight) => Learning {
                insight,
                why_it_matters: None,
                context: None,
            },
            LearningRepr::Full {
                insight,
                why_it_matters,
                context,
            } => Learning {
                insight,
                why_it_matters,
                context,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "FrictionRepr")]
pub struct Friction {
    pub problem: String,
    pub resolution: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FrictionRepr {
    Text(String),
    Full {
        problem: String,
        resolution: Option<String>,
    },
}

impl From<FrictionRepr> for Friction {
    fn from(repr: FrictionRepr) -> Self {
        match repr {
            FrictionRepr::Text(problem) => Friction {
                problem,
                resolution: None,
            },
            FrictionRepr::Full {
                problem,
                resolution,
            } => Friction {
                problem,
                resolution,
            },
        }
    }
}

/// An entity mention proposed by the extraction, before glossary routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionCandidate {
    pub mention: String,
    #[serde(default = "default_confidence", deserialize_with = "confidence_score")]
    pub confidence: f64,
    #[serde(default)]
    pub suggested_canonical: Option<String>,
}

fn default_confidence() -> f64 {
    0.5
}

/// Map a `high`/`medium`/`low` label to a score.
pub fn confidence_to_float(label: &str) -> f64 {
    match label.trim().to_lowercase().as_str() {
        "high" => 0.9,
        "medium" => 0.6,
        "low" => 0.3,
        _ => 0.5,
    }
}

fn confidence_score<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Score(f64),
        Label(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Score(s)) => s.clamp(0.0, 1.0),
        Some(Raw::Label(label)) => confidence_to_float(&label),
        None => default_confidence(),
    })
}

/// Treat an explicit `null` the same as a missing field.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Extraction {
    /// Flatten into the text stored as `summary_text` and indexed for search.
    pub fn searchable_text(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        if !self.summary.trim().is_empty() {
            parts.push(self.summary.trim().to_string());
        }
        for l in &self.learnings {
            parts.push(format!("Learning: {}", l.insight));
            if let Some(why) = l.why_it_matters.as_deref().filter(|w| !w.is_empty()) {
                parts.push(why.to_string());
            }
        }
        for b in &self.builds {
            parts.push(format!("Built: {}", b.what));
            if let Some(details) = b.details.as_deref().filter(|d| !d.is_empty()) {
                parts.push(details.to_string());
            }
        }
        for f in &self.friction {
            parts.push(format!("Friction: {}", f.problem));
        }

        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_accepts_strings_and_objects() {
        let json = r#"{
            "summary": "Wired up the importer.",
            "arc": {"started_with": "broken import", "key_turns": ["found encoding bug"], "ended_at": null},
            "builds": ["importer", {"what": "fixture set", "details": "three files"}],
            "learnings": [{"insight": "BOMs break csv", "why_it_matters": "silent data loss"}],
            "friction": "not a list",
            "patterns": null,
            "entities": [{"mention": "GeoX", "confidence": "high"}, {"mention": "Lift", "confidence": 0.4}]
        }"#;
        let parsed: std::result::Result<Extraction, _> = serde_json::from_str(json);
        // a bare string where a list is expected is malformed
        assert!(parsed.is_err());

        let json = json.replace("\"friction\": \"not a list\"", "\"friction\": [\"flaky CI\"]");
        let ex: Extraction = serde_json::from_str(&json).unwrap();
        assert_eq!(ex.builds.len(), 2);
        assert_eq!(ex.builds[0].what, "importer");
        assert_eq!(ex.builds[1].details.as_deref(), Some("three files"));
        assert_eq!(ex.friction[0].problem, "flaky CI");
        assert!(ex.patterns.is_empty());
        assert!(ex.open_threads.is_empty());
        assert_eq!(ex.entities[0].confidence, 0.9);
        assert_eq!(ex.entities[1].confidence, 0.4);
        assert_eq!(ex.arc.ended_at, None);
    }

    #[test]
    fn test_searchable_text_layout() {
        let ex = Extraction {
            summary: "Summary line.".into(),
            learnings: vec![Learning {
                insight: "WAL helps".into(),
                why_it_matters: Some("readers stop blocking".into()),
                context: None,
            }],
            builds: vec![Build {
                what: "indexer".into(),
                details: None,
            }],
            friction: vec![Friction {
                problem: "locks".into(),
                resolution: Some("busy_timeout".into()),
            }],
            ..Default::default()
        };
        assert_eq!(
            ex.searchable_text(),
            "Summary line.\nLearning: WAL helps\nreaders stop blocking\nBuilt: indexer\nFriction: locks"
        );
    }

    #[test]
    fn test_confidence_labels() {
        assert_eq!(confidence_to_float("HIGH"), 0.9);
        assert_eq!(confidence_to_float("medium"), 0.6);
        assert_eq!(confidence_to_float("low"), 0.3);
        assert_eq!(confidence_to_float("maybe"), 0.5);
    }

    #[test]
    fn test_source_type_parse() {
        assert_eq!("claude_code".parse::<SourceType>(), Ok(SourceType::ClaudeCode));
        assert!("gdoc".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_serialized_extraction_reparses() {
        let ex = Extraction {
            summary: "s".into(),
            entities: vec![MentionCandidate {
                mention: "Rust".into(),
                confidence: 0.9,
                suggested_canonical: Some("rust".into()),
            }],
            ..Default::default()
        };
        let back: Extraction = serde_json::from_str(&serde_json::to_string(&ex).unwrap()).unwrap();
        assert_eq!(back, ex);
    }
}
