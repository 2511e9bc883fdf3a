//! Pipeline commands: `backfill`, `process`, `store-extraction`, and
//! `extract-prompt` for producers that extract out of band.
//!
//! Each command that can persist acquires a [`ReentrancyToken`] before
//! doing anything else, so a process spawned by an extraction can never
//! start another pipeline run.

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::batch::{BatchOptions, BatchRunner, Outcome, SourceContent, StoredContent};
use crate::config::Config;
use crate::guard::ReentrancyToken;
use crate::invoke::{parse_extraction, ClaudeCli, ExtractionBackend, Extractor};
use crate::models::SourceType;
use crate::resolver::{EntityResolver, Glossary};
use crate::staging::StagingArea;
use crate::store::Store;

/// Entities listed in extraction prompts.
const PROMPT_GLOSSARY_ENTITIES: usize = 20;

/// Characters of content placed in a single out-of-band prompt.
const OUT_OF_BAND_CONTENT_CAP: usize = 140_000;

pub fn load_glossary(config: &Config) -> Result<Glossary> {
    match &config.entities.glossary_path {
        Some(path) => Glossary::load(path),
        None => Ok(Glossary::empty()),
    }
}

/// Wire a batch runner from configuration around an existing store.
pub fn build_runner(
    config: &Config,
    store: Store,
    backend: Arc<dyn ExtractionBackend>,
) -> Result<BatchRunner> {
    let glossary = load_glossary(config)?;
    tracing::debug!(entities = glossary.len(), "glossary loaded");

    let extractor = build_extractor(config, &glossary, backend);
    let resolver = EntityResolver::new(glossary, &config.entities);
    let staging = StagingArea::new(&config.staging.dir);

    Ok(BatchRunner::new(store, extractor, resolver, staging).with_retry(
        config.batch.transient_retries,
        Duration::from_millis(config.batch.retry_backoff_ms),
    ))
}

pub fn build_extractor(
    config: &Config,
    glossary: &Glossary,
    backend: Arc<dyn ExtractionBackend>,
) -> Extractor {
    Extractor::new(
        backend,
        config.chunking.clone(),
        config.extraction.min_content_chars,
        glossary.sample_for_prompt(PROMPT_GLOSSARY_ENTITIES),
    )
}

/// `garde backfill`.
pub async fn run_backfill(
    config: &Config,
    limit: Option<usize>,
    source_type: Option<SourceType>,
    retry_failed: bool,
    dry_run: bool,
) -> Result<()> {
    let token = ReentrancyToken::acquire()?;
    let store = Store::open(config).await?;
    let limit = limit.unwrap_or(config.batch.default_limit);

    if dry_run {
        let pending = store.select_sources(source_type, limit, retry_failed).await?;
        println!("backfill (dry-run)");
        for source in &pending {
            let retry = if source.status == "failed" { "  (retry)" } else { "" };
            println!(
                "  {}  {}{}",
                source.id,
                source.title.as_deref().unwrap_or("(untitled)"),
                retry
            );
        }
        println!("  would process: {}", pending.len());
        store.pool().close().await;
        return Ok(());
    }

    let runner = build_runner(config, store.clone(), Arc::new(ClaudeCli::new(&config.extraction)))?;
    let report = runner
        .run(
            &BatchOptions {
                source_type,
                limit,
                retry_failed,
            },
            &token,
        )
        .await?;

    println!("backfill");
    println!("  selected: {}", report.selected);
    println!("  processed: {}", report.processed);
    println!("  stubbed: {}", report.stubbed);
    println!("  staged: {}", report.staged);
    println!("  failed: {}", report.failed);
    println!("  skipped: {}", report.skipped);
    println!("  deferred: {}", report.deferred);
    println!("ok");

    store.pool().close().await;
    Ok(())
}

/// `garde process <id>`: run one source regardless of its status.
pub async fn run_process(config: &Config, source_id: &str) -> Result<()> {
    let token = ReentrancyToken::acquire()?;
    let store = Store::open(config).await?;
    let runner = build_runner(config, store.clone(), Arc::new(ClaudeCli::new(&config.extraction)))?;

    let outcome = runner.process_source(source_id, &token).await?;
    report_single(&store, source_id, outcome).await?;

    store.pool().close().await;
    Ok(())
}

/// `garde store-extraction <id>`: stage an extraction read from `input`
/// (or stdin) and, unless `stage_only`, persist it right away.
pub async fn run_store_extraction(
    config: &Config,
    source_id: &str,
    input: Option<&Path>,
    stage_only: bool,
) -> Result<()> {
    let token = ReentrancyToken::acquire()?;

    let text = match input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read extraction: {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read extraction from stdin")?;
            buf
        }
    };
    let extraction = parse_extraction(&text).context("Invalid extraction")?;

    let store = Store::open(config).await?;
    if store.get_source(source_id).await?.is_none() {
        bail!("Source not found: {}", source_id);
    }

    let staging = StagingArea::new(&config.staging.dir);
    let path = staging.stage(source_id, &extraction)?;
    println!("staged: {}", path.display());

    if !stage_only {
        let runner = build_runner(config, store.clone(), Arc::new(ClaudeCli::new(&config.extraction)))?;
        let outcome = runner.process_source(source_id, &token).await?;
        report_single(&store, source_id, outcome).await?;
        println!(
            "  {} builds, {} learnings",
            extraction.builds.len(),
            extraction.learnings.len()
        );
    }

    store.pool().close().await;
    Ok(())
}

/// The prompt an out-of-band producer answers to produce a staged
/// extraction for `source_id`: the whole content in one part, capped at
/// [`OUT_OF_BAND_CONTENT_CAP`] characters.
pub async fn extraction_prompt(store: &Store, extractor: &Extractor, source_id: &str) -> Result<String> {
    let source = store
        .get_source(source_id)
        .await?
        .with_context(|| format!("Source not found: {}", source_id))?;
    let content = StoredContent::new(store.clone())
        .load(&source)
        .await
        .with_context(|| format!("Failed to load content for {}", source_id))?;

    let text = match content.text.char_indices().nth(OUT_OF_BAND_CONTENT_CAP) {
        Some((cut, _)) => format!(
            "{}\n\n[... truncated, showing first {} chars ...]",
            &content.text[..cut],
            OUT_OF_BAND_CONTENT_CAP
        ),
        None => content.text,
    };
    Ok(extractor.build_prompt(&text, 1, 1))
}

/// `garde extract-prompt <id>`: print the prompt on stdout. The answer goes
/// back in through `garde store-extraction <id>`.
pub async fn run_extract_prompt(config: &Config, source_id: &str) -> Result<()> {
    let store = Store::open(config).await?;
    let glossary = load_glossary(config)?;
    // never invoked; the prompt is answered elsewhere
    let extractor = build_extractor(config, &glossary, Arc::new(ClaudeCli::new(&config.extraction)));

    let prompt = extraction_prompt(&store, &extractor, source_id).await?;
    let staging = StagingArea::new(&config.staging.dir);
    if let Ok(path) = staging.path_for(source_id) {
        tracing::info!(source_id, path = %path.display(), "answer is staged here by store-extraction");
    }
    println!("{}", prompt);

    store.pool().close().await;
    Ok(())
}

async fn report_single(store: &Store, source_id: &str, outcome: Outcome) -> Result<()> {
    let source = store.get_source(source_id).await?;
    let status = source.as_ref().map(|s| s.status.as_str()).unwrap_or("missing");

    println!("{}: {:?} (status: {})", source_id, outcome, status);
    if let Some(error) = source.as_ref().and_then(|s| s.error.as_deref()) {
        println!("  error: {}", error);
    }
    if outcome == Outcome::Failed {
        bail!("processing failed for {}", source_id);
    }
    Ok(())
}
