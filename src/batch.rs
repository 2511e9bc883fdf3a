//! Batch orchestration.
//!
//! Selects `pending` sources and runs each one through
//! staged-check → load → chunk → invoke → merge → route → persist, strictly
//! one source at a time. Each source commits on its own, so killing a run
//! loses at most the source in flight, and rerunning picks up exactly the
//! sources that are still `pending`.
//!
//! Per-source failures are recorded on the source row and never stop the
//! batch. The only fatal condition is a recursion guard violation.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::chunk::MessageMeta;
use crate::error::{PipelineError, Result};
use crate::guard::ReentrancyToken;
use crate::invoke::Extractor;
use crate::models::{RoutedMentions, SourceRow, SourceType, SummaryDraft, PROVENANCE_STAGED};
use crate::resolver::EntityResolver;
use crate::staging::{StagedExtraction, StagingArea};
use crate::store::Store;

/// Full text of a source plus any message structure an adapter provided.
#[derive(Debug, Clone, Default)]
pub struct LoadedContent {
    pub text: String,
    pub messages: Vec<MessageMeta>,
}

/// Where the orchestrator gets source content from.
///
/// Implementations report unreadable sources as [`PipelineError::Adapter`],
/// which marks the source `skipped`.
#[async_trait]
pub trait SourceContent: Send + Sync {
    async fn load(&self, source: &SourceRow) -> Result<LoadedContent>;
}

/// Reads the full text captured at ingest, with message boundaries from
/// `sources.metadata.messages` when present.
pub struct StoredContent {
    store: Store,
}

impl StoredContent {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SourceContent for StoredContent {
    async fn load(&self, source: &SourceRow) -> Result<LoadedContent> {
        let stored = self
            .store
            .stored_content(&source.id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(source.id.clone()))?;

        let text = stored.text.ok_or_else(|| PipelineError::Adapter {
            source_id: source.id.clone(),
            detail: "no content".to_string(),
        })?;
        if stored.truncated {
            tracing::warn!(
                source_id = %source.id,
                chars = text.chars().count(),
                "only capped raw text is stored; re-ingest to extract the full content"
            );
        }

        let mut messages = stored
            .metadata
            .as_deref()
            .map(|m| parse_messages(&source.id, m))
            .unwrap_or_default();
        // fallback text may have been capped below the last message
        messages.retain(|m| m.offset < text.len());

        Ok(LoadedContent { text, messages })
    }
}

fn parse_messages(source_id: &str, metadata: &str) -> Vec<MessageMeta> {
    let value: serde_json::Value = match serde_json::from_str(metadata) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(source_id, error = %e, "metadata is not JSON");
            return Vec::new();
        }
    };
    match value.get("messages") {
        Some(messages) => serde_json::from_value(messages.clone()).unwrap_or_else(|e| {
            tracing::debug!(source_id, error = %e, "ignoring malformed message metadata");
            Vec::new()
        }),
        None => Vec::new(),
    }
}

/// Selection for one batch run.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub source_type: Option<SourceType>,
    /// Maximum sources to select. Zero selects none.
    pub limit: usize,
    /// Also select `failed` sources, moving them back to `pending`.
    pub retry_failed: bool,
}

/// What happened to one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    /// Too short to send; stored verbatim.
    Stubbed,
    /// Persisted from the staging area.
    Staged,
    Failed,
    Skipped,
    /// Lock contention outlasted the retries; still pending.
    Deferred,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub selected: usize,
    pub processed: usize,
    pub stubbed: usize,
    pub staged: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deferred: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Processed => self.processed += 1,
            Outcome::Stubbed => self.stubbed += 1,
            Outcome::Staged => self.staged += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Deferred => self.deferred += 1,
        }
    }
}

pub struct BatchRunner {
    store: Store,
    extractor: Extractor,
    resolver: EntityResolver,
    staging: StagingArea,
    content: Arc<dyn SourceContent>,
    transient_retries: u32,
    retry_backoff: Duration,
}

impl BatchRunner {
    pub fn new(
        store: Store,
        extractor: Extractor,
        resolver: EntityResolver,
        staging: StagingArea,
    ) -> Self {
        let content = Arc::new(StoredContent::new(store.clone()));
        Self {
            store,
            extractor,
            resolver,
            staging,
            content,
            transient_retries: 3,
            retry_backoff: Duration::from_millis(250),
        }
    }

    pub fn with_content(mut self, content: Arc<dyn SourceContent>) -> Self {
        self.content = content;
        self
    }

    pub fn with_retry(mut self, retries: u32, backoff: Duration) -> Self {
        self.transient_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    /// Process pending sources one by one.
    pub async fn run(&self, opts: &BatchOptions, token: &ReentrancyToken) -> Result<BatchReport> {
        let sources = self
            .store
            .select_sources(opts.source_type, opts.limit, opts.retry_failed)
            .await?;
        let requeued = self.store.requeue_failed(&sources).await?;
        if requeued > 0 {
            tracing::info!(requeued, "retrying failed sources");
        }
        let mut report = BatchReport {
            selected: sources.len(),
            ..Default::default()
        };
        tracing::info!(selected = report.selected, limit = opts.limit, "batch started");

        for source in &sources {
            match self.process_one(source, token).await {
                Ok(outcome) => report.record(outcome),
                Err(e @ PipelineError::RecursionGuard(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(source_id = %source.id, error = %e, "source failed");
                    if let Err(mark_err) = self.store.record_failure(&source.id, &e.to_string()).await {
                        tracing::warn!(source_id = %source.id, error = %mark_err, "could not mark source failed");
                    }
                    report.record(Outcome::Failed);
                }
            }
        }

        tracing::info!(
            processed = report.processed,
            stubbed = report.stubbed,
            staged = report.staged,
            failed = report.failed,
            skipped = report.skipped,
            deferred = report.deferred,
            "batch finished"
        );
        Ok(report)
    }

    /// Process one source by id regardless of its current status.
    pub async fn process_source(&self, source_id: &str, token: &ReentrancyToken) -> Result<Outcome> {
        let source = self
            .store
            .get_source(source_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(source_id.to_string()))?;
        self.process_one(&source, token).await
    }

    /// Extraction runs at most once per call. Only the store reads and the
    /// final write are retried on lock contention, so a busy database never
    /// repeats an invocation.
    async fn process_one(&self, source: &SourceRow, token: &ReentrancyToken) -> Result<Outcome> {
        let id = source.id.as_str();
        let Some(settle) = self.prepare(source, token).await? else {
            return Ok(Outcome::Deferred);
        };

        let written = self
            .retry_transient(id, "persist", || self.write(id, &settle))
            .await?;
        if written.is_none() {
            if matches!(settle, Settle::Persist { outcome: Outcome::Processed, .. }) {
                tracing::warn!(source_id = id, "extraction discarded; source stays pending");
            }
            return Ok(Outcome::Deferred);
        }

        let outcome = match settle {
            Settle::Persist { outcome, staged, mentions, .. } => {
                if let Some(staged) = staged {
                    if let Err(e) = self.staging.mark_spent(&staged) {
                        tracing::warn!(source_id = id, error = %e, "persisted staged extraction but could not retire file");
                    }
                }
                tracing::info!(
                    source_id = id,
                    ?outcome,
                    entities = mentions.resolved.len(),
                    queued = mentions.pending.len(),
                    "persisted"
                );
                outcome
            }
            Settle::Fail(_) => Outcome::Failed,
            Settle::Skip(_) => Outcome::Skipped,
        };
        Ok(outcome)
    }

    /// Decide how a source settles. `None` means the store stayed busy
    /// while loading content.
    async fn prepare(&self, source: &SourceRow, token: &ReentrancyToken) -> Result<Option<Settle>> {
        let id = source.id.as_str();

        match self.staging.take(id) {
            Ok(Some(staged)) => {
                let draft = SummaryDraft::from_extraction(&staged.extraction, PROVENANCE_STAGED)?;
                let mentions = self.resolver.route(&staged.extraction.entities);
                return Ok(Some(Settle::Persist {
                    draft,
                    mentions,
                    outcome: Outcome::Staged,
                    staged: Some(staged),
                }));
            }
            Ok(None) => {}
            Err(e @ PipelineError::Staging(_)) => {
                tracing::warn!(source_id = id, error = %e, "unreadable staged extraction");
                return Ok(Some(Settle::Fail(e.to_string())));
            }
            Err(e) => return Err(e),
        }

        let content = match self
            .retry_transient(id, "load", || self.content.load(source))
            .await
        {
            Ok(Some(content)) => content,
            Ok(None) => return Ok(None),
            Err(PipelineError::Adapter { detail, .. }) => {
                tracing::info!(source_id = id, %detail, "skipping source");
                return Ok(Some(Settle::Skip(detail)));
            }
            Err(e) => return Err(e),
        };

        match self
            .extractor
            .extract(id, &content.text, &content.messages, token)
            .await
        {
            Ok(extraction) => Ok(Some(Settle::Persist {
                draft: SummaryDraft::from_extraction(&extraction, self.extractor.model())?,
                mentions: self.resolver.route(&extraction.entities),
                outcome: Outcome::Processed,
                staged: None,
            })),
            Err(PipelineError::ContentTooShort { len, min }) => {
                tracing::debug!(source_id = id, len, min, "content too short, storing stub");
                Ok(Some(Settle::Persist {
                    draft: SummaryDraft::stub(&content.text),
                    mentions: RoutedMentions::default(),
                    outcome: Outcome::Stubbed,
                    staged: None,
                }))
            }
            Err(e @ PipelineError::ExtractionInvocation { .. }) => {
                tracing::warn!(source_id = id, error = %e, "extraction failed");
                Ok(Some(Settle::Fail(e.to_string())))
            }
            Err(e) => Err(e),
        }
    }

    async fn write(&self, source_id: &str, settle: &Settle) -> Result<()> {
        match settle {
            Settle::Persist { draft, mentions, .. } => {
                self.store.record_processed(source_id, draft, mentions).await
            }
            Settle::Fail(detail) => self.store.record_failure(source_id, detail).await,
            Settle::Skip(reason) => self.store.mark_skipped(source_id, reason).await,
        }
    }

    /// Run `op` until it succeeds or fails for good. `Ok(None)` means lock
    /// contention outlasted the retries.
    async fn retry_transient<T, F, Fut>(&self, source_id: &str, step: &str, mut op: F) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(e) if e.is_transient() => {
                    if attempt >= self.transient_retries {
                        tracing::warn!(source_id, step, error = %e, "store busy, leaving source pending");
                        return Ok(None);
                    }
                    let delay = self.retry_backoff * 2u32.saturating_pow(attempt.min(5));
                    tracing::debug!(source_id, step, attempt, ?delay, "transient store error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// The one store write that settles a source.
enum Settle {
    Persist {
        draft: SummaryDraft,
        mentions: RoutedMentions,
        outcome: Outcome,
        staged: Option<StagedExtraction>,
    },
    Fail(String),
    Skip(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_messages_from_metadata() {
        let meta = r#"{"tools": 3, "messages": [
            {"role": "user", "offset": 0, "len": 5},
            {"role": "assistant", "offset": 7, "len": 9, "has_tool_use": true,
             "timestamp": "2026-01-02T03:04:05Z"}
        ]}"#;
        let messages = parse_messages("x", meta);
        assert_eq!(messages.len(), 2);
        assert!(messages[1].has_tool_use);
        assert!(messages[1].timestamp.is_some());
    }

    #[test]
    fn test_parse_messages_tolerates_junk() {
        assert!(parse_messages("x", "not json").is_empty());
        assert!(parse_messages("x", r#"{"messages": "nope"}"#).is_empty());
        assert!(parse_messages("x", r#"{"other": 1}"#).is_empty());
    }

    #[test]
    fn test_report_counts() {
        let mut r = BatchReport::default();
        r.record(Outcome::Processed);
        r.record(Outcome::Stubbed);
        r.record(Outcome::Deferred);
        assert_eq!((r.processed, r.stubbed, r.deferred), (1, 1, 1));
    }
}
