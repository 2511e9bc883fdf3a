//! Topic-aware text chunker.
//!
//! Splits long source content into [`Chunk`]s small enough for a single
//! extraction call. When message metadata is available the split points are
//! chosen at detected topic changes; oversized pieces are then hard-split at
//! the paragraph break (`\n\n`) nearest the target size.
//!
//! Sizes are measured in bytes and every cut is snapped back to a UTF-8
//! character boundary. The chunker does no I/O and is deterministic, so
//! reprocessing a source always yields the same chunk sequence.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use crate::config::ChunkingConfig;

const GAP_WEIGHT: f64 = 1.0;
const USER_RETURN_WEIGHT: f64 = 0.5;
const TOOL_END_WEIGHT: f64 = 0.3;
const MARKER_WEIGHT: f64 = 0.2;

/// Consecutive assistant turns before a user turn counts as a new question.
const USER_RETURN_RUN: usize = 3;

static TOPIC_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)let's move on",
        r"(?i)new topic:",
        r"(?i)moving on to",
        r"(?i)switching to",
        r"(?m)^---+$",
        r"(?im)^#+\s",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("topic marker pattern is valid"))
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Position and shape of one conversational turn inside the content.
///
/// `offset` and `len` are byte positions into the full text. Messages must
/// be ordered by offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub role: Role,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub offset: usize,
    pub len: usize,
    #[serde(default)]
    pub has_tool_use: bool,
}

/// One bounded segment of a source's content.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub hash: String,
}

/// Split content into chunks. Always returns at least one chunk.
pub fn chunk_content(content: &str, messages: &[MessageMeta], cfg: &ChunkingConfig) -> Vec<Chunk> {
    let pieces = split_semantic(content, messages, cfg);
    if pieces.is_empty() {
        return vec![make_chunk(0, content)];
    }
    pieces
        .iter()
        .enumerate()
        .map(|(i, text)| make_chunk(i, text))
        .collect()
}

/// Indices of messages that start a new topic (the boundary falls just
/// before that message).
pub fn detect_topic_boundaries(
    messages: &[MessageMeta],
    content: &str,
    cfg: &ChunkingConfig,
) -> Vec<usize> {
    if messages.len() < 2 {
        return Vec::new();
    }

    let mut boundaries = Vec::new();
    let first_is_assistant = messages[0].role == Role::Assistant;
    let mut consecutive_assistant = usize::from(first_is_assistant);
    let mut prev_assistant_had_tools = first_is_assistant && messages[0].has_tool_use;

    for i in 1..messages.len() {
        let msg = &messages[i];
        let prev = &messages[i - 1];
        let mut score = 0.0;

        if let (Some(t), Some(p)) = (msg.timestamp, prev.timestamp) {
            if (t - p).num_seconds() > cfg.gap_secs {
                score += GAP_WEIGHT;
            }
        }

        if msg.role == Role::User && consecutive_assistant >= USER_RETURN_RUN {
            score += USER_RETURN_WEIGHT;
        }

        if msg.role == Role::Assistant
            && prev.role == Role::Assistant
            && prev_assistant_had_tools
            && !msg.has_tool_use
        {
            score += TOOL_END_WEIGHT;
        }

        if has_topic_marker(message_text(content, msg)) {
            score += MARKER_WEIGHT;
        }

        match msg.role {
            Role::Assistant => {
                consecutive_assistant += 1;
                prev_assistant_had_tools = msg.has_tool_use;
            }
            Role::User => {
                consecutive_assistant = 0;
                prev_assistant_had_tools = false;
            }
        }

        if score >= cfg.boundary_threshold {
            boundaries.push(i);
        }
    }

    boundaries
}

/// Whether the text carries an explicit "new topic" marker.
pub fn has_topic_marker(text: &str) -> bool {
    TOPIC_MARKERS.iter().any(|re| re.is_match(text))
}

/// Split at topic boundaries, merge undersized segments, then hard-split
/// anything still above `max_chars`.
pub fn split_semantic(content: &str, messages: &[MessageMeta], cfg: &ChunkingConfig) -> Vec<String> {
    let boundaries = detect_topic_boundaries(messages, content, cfg);
    if boundaries.is_empty() {
        return split_at_paragraphs(content, cfg);
    }

    let mut segments: Vec<&str> = Vec::new();
    let mut prev = 0usize;
    for idx in boundaries {
        let offset = floor_boundary(content, messages[idx].offset);
        if offset <= prev {
            continue;
        }
        let segment = content[prev..offset].trim_end();
        if !segment.is_empty() {
            segments.push(segment);
        }
        prev = offset;
    }
    let last = content[prev..].trim_end();
    if !last.is_empty() {
        segments.push(last);
    }

    // A segment below the minimum always absorbs its successor
    let mut merged: Vec<String> = Vec::new();
    let mut current = String::new();
    for segment in segments {
        if current.is_empty() {
            current.push_str(segment);
        } else if current.len() < cfg.min_chars {
            current.push_str("\n\n");
            current.push_str(segment);
        } else {
            merged.push(std::mem::take(&mut current));
            current.push_str(segment);
        }
    }
    if !current.is_empty() {
        match merged.last_mut() {
            Some(prev) if current.len() < cfg.min_chars => {
                prev.push_str("\n\n");
                prev.push_str(&current);
            }
            _ => merged.push(current),
        }
    }

    merged
        .into_iter()
        .flat_map(|chunk| {
            if chunk.len() > cfg.max_chars {
                split_at_paragraphs(&chunk, cfg)
            } else {
                vec![chunk]
            }
        })
        .collect()
}

/// Cut content above `max_chars` at the paragraph break nearest
/// `target_chars`, looking `paragraph_window` bytes either side. Without a
/// break in the window the cut falls at the target itself.
pub fn split_at_paragraphs(content: &str, cfg: &ChunkingConfig) -> Vec<String> {
    if content.len() <= cfg.max_chars {
        return vec![content.to_string()];
    }

    let target = cfg.target_chars;
    let mut chunks = Vec::new();
    let mut remaining = content;

    while remaining.len() > cfg.max_chars {
        let lo = floor_boundary(remaining, target.saturating_sub(cfg.paragraph_window));
        let hi = floor_boundary(remaining, target + cfg.paragraph_window);

        let best = remaining[lo..hi]
            .match_indices("\n\n")
            .map(|(i, _)| lo + i)
            .filter(|&pos| pos > 0)
            .min_by_key(|&pos| pos.abs_diff(target));

        let cut = match best {
            Some(pos) => pos,
            None => floor_boundary(remaining, target).max(1),
        };
        let cut = ceil_boundary(remaining, cut);

        chunks.push(remaining[..cut].to_string());
        remaining = remaining[cut..].trim_start_matches('\n');
    }

    if !remaining.is_empty() {
        chunks.push(remaining.to_string());
    }

    chunks
}

fn message_text<'a>(content: &'a str, msg: &MessageMeta) -> &'a str {
    let start = floor_boundary(content, msg.offset);
    let end = floor_boundary(content, msg.offset.saturating_add(msg.len));
    &content[start..end.max(start)]
}

fn floor_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn make_chunk(index: usize, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        index,
        text: text.to_string(),
        hash,
    }
}
