//! TOML configuration for the archive.
//!
//! Only `[db]` is required. Every other section falls back to defaults so a
//! two-line config file is enough to run the pipeline:
//!
//! ```toml
//! [db]
//! path = "./data/garde.sqlite"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub entities: EntitiesConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// Topic-aware chunking thresholds. Sizes are in bytes of UTF-8 text.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_target_chars")]
    pub target_chars: usize,
    /// How far either side of `target_chars` to look for a paragraph break.
    #[serde(default = "default_paragraph_window")]
    pub paragraph_window: usize,
    /// Silence between turns that counts as a full topic boundary.
    #[serde(default = "default_gap_secs")]
    pub gap_secs: i64,
    #[serde(default = "default_boundary_threshold")]
    pub boundary_threshold: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_chars: default_min_chars(),
            max_chars: default_max_chars(),
            target_chars: default_target_chars(),
            paragraph_window: default_paragraph_window(),
            gap_secs: default_gap_secs(),
            boundary_threshold: default_boundary_threshold(),
        }
    }
}

fn default_min_chars() -> usize {
    15_000
}
fn default_max_chars() -> usize {
    80_000
}
fn default_target_chars() -> usize {
    40_000
}
fn default_paragraph_window() -> usize {
    5_000
}
fn default_gap_secs() -> i64 {
    300
}
fn default_boundary_threshold() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Executable for the external extraction capability.
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_min_content_chars")]
    pub min_content_chars: usize,
    #[serde(default = "default_raw_text_cap")]
    pub raw_text_cap: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            min_content_chars: default_min_content_chars(),
            raw_text_cap: default_raw_text_cap(),
        }
    }
}

fn default_command() -> String {
    "claude".to_string()
}
fn default_model() -> String {
    "opus".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_min_content_chars() -> usize {
    100
}
fn default_raw_text_cap() -> usize {
    100_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EntitiesConfig {
    #[serde(default)]
    pub glossary_path: Option<PathBuf>,
    /// Mentions at or above this confidence are recorded directly.
    #[serde(default = "default_accept_threshold")]
    pub accept_threshold: f64,
    /// Minimum similarity for a fuzzy glossary match to count at all.
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
}

impl Default for EntitiesConfig {
    fn default() -> Self {
        Self {
            glossary_path: None,
            accept_threshold: default_accept_threshold(),
            fuzzy_threshold: default_fuzzy_threshold(),
        }
    }
}

fn default_accept_threshold() -> f64 {
    0.8
}
fn default_fuzzy_threshold() -> f64 {
    0.6
}

#[derive(Debug, Deserialize, Clone)]
pub struct StagingConfig {
    #[serde(default = "default_staging_dir")]
    pub dir: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: default_staging_dir(),
        }
    }
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("./data/staged")
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default = "default_batch_limit")]
    pub default_limit: usize,
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_batch_limit(),
            transient_retries: default_transient_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_batch_limit() -> usize {
    10
}
fn default_transient_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    250
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_search_limit")]
    pub default_limit: i64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_search_limit(),
        }
    }
}

fn default_search_limit() -> i64 {
    5
}

impl Config {
    /// A config with every default and the database at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
                busy_timeout_ms: default_busy_timeout_ms(),
            },
            chunking: ChunkingConfig::default(),
            extraction: ExtractionConfig::default(),
            entities: EntitiesConfig::default(),
            staging: StagingConfig::default(),
            batch: BatchConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let c = &config.chunking;

    if c.min_chars == 0 {
        anyhow::bail!("chunking.min_chars must be > 0");
    }
    // Hard-split pieces land within target ± window, so both ends of that
    // range must stay inside [min, max).
    if c.target_chars < c.paragraph_window || c.target_chars - c.paragraph_window < c.min_chars {
        anyhow::bail!("chunking.target_chars - paragraph_window must be >= min_chars");
    }
    if c.target_chars + c.paragraph_window >= c.max_chars {
        anyhow::bail!("chunking.target_chars + paragraph_window must be < max_chars");
    }
    // The remainder after a cut is at least max - (target + window)
    if c.max_chars - c.target_chars - c.paragraph_window < c.min_chars {
        anyhow::bail!("chunking.max_chars - target_chars - paragraph_window must be >= min_chars");
    }
    if c.gap_secs <= 0 {
        anyhow::bail!("chunking.gap_secs must be > 0");
    }
    if !(0.0..=1.0).contains(&c.boundary_threshold) || c.boundary_threshold == 0.0 {
        anyhow::bail!("chunking.boundary_threshold must be in (0.0, 1.0]");
    }

    if config.extraction.timeout_secs == 0 {
        anyhow::bail!("extraction.timeout_secs must be > 0");
    }
    if config.extraction.raw_text_cap == 0 {
        anyhow::bail!("extraction.raw_text_cap must be > 0");
    }

    let e = &config.entities;
    if !(0.0..=1.0).contains(&e.accept_threshold) {
        anyhow::bail!("entities.accept_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&e.fuzzy_threshold) {
        anyhow::bail!("entities.fuzzy_threshold must be in [0.0, 1.0]");
    }

    if config.search.default_limit < 1 {
        anyhow::bail!("search.default_limit must be >= 1");
    }

    Ok(())
}
