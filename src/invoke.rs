//! Extraction invocation.
//!
//! An [`ExtractionBackend`] turns a prompt into raw model text. The default
//! backend, [`ClaudeCli`], runs the `claude` CLI in pipe mode with tools and
//! session persistence disabled, marks the child with the recursion guard,
//! and unwraps the JSON envelope it prints.
//!
//! [`Extractor`] sits on top: it refuses content below the length
//! threshold, chunks what is left, invokes the backend once per chunk in
//! order, and merges the per-chunk results.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::chunk::{chunk_content, MessageMeta};
use crate::config::{ChunkingConfig, ExtractionConfig};
use crate::error::{PipelineError, Result};
use crate::guard::ReentrancyToken;
use crate::merge::merge_extractions;
use crate::models::Extraction;

/// Longest stderr excerpt carried into an error detail.
const STDERR_EXCERPT: usize = 500;

/// A text-in, text-out generation capability.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Identifier recorded as the summary's provenance.
    fn model(&self) -> &str;

    async fn complete(&self, prompt: &str, token: &ReentrancyToken) -> Result<String>;
}

/// Runs the `claude` CLI as a child process.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    command: String,
    model: String,
    timeout: Duration,
}

impl ClaudeCli {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            command: config.command.clone(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl ExtractionBackend for ClaudeCli {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, token: &ReentrancyToken) -> Result<String> {
        let mut cmd = Command::new(&self.command);
        cmd.args([
            "-p",
            "--output-format",
            "json",
            "--model",
            &self.model,
            "--allowedTools",
            "",
            "--no-session-persistence",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        token.apply(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            PipelineError::invocation(format!("failed to spawn '{}': {}", self.command, e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits early closes the pipe; its exit status says more.
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                tracing::debug!(error = %e, "writing prompt to extraction stdin failed");
            }
            let _ = stdin.shutdown().await;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(PipelineError::invocation(format!("process error: {}", e)));
            }
            Err(_) => {
                return Err(PipelineError::invocation(format!(
                    "'{}' timed out after {}s",
                    self.command,
                    self.timeout.as_secs()
                )));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            tracing::debug!(command = %self.command, stderr = %stderr.trim(), "extraction stderr");
        }

        if !output.status.success() {
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            return Err(PipelineError::invocation(format!(
                "'{}' exited with code {}: {}",
                self.command,
                output.status.code().unwrap_or(-1),
                excerpt
            )));
        }

        parse_envelope(&String::from_utf8_lossy(&output.stdout))
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
}

/// Unwrap the `{"result": "..."}` envelope printed by `--output-format json`.
pub fn parse_envelope(stdout: &str) -> Result<String> {
    let envelope: Envelope = serde_json::from_str(stdout.trim())
        .map_err(|e| PipelineError::invocation(format!("unparseable CLI output: {}", e)))?;

    match envelope.result {
        Some(text) if envelope.is_error => Err(PipelineError::invocation(format!(
            "CLI reported an error: {}",
            text
        ))),
        Some(text) => Ok(text),
        None => Err(PipelineError::invocation("CLI output has no result field")),
    }
}

/// Parse the first-to-last brace span of the model text as an extraction.
pub fn parse_extraction(text: &str) -> Result<Extraction> {
    let (start, end) = match (text.find('{'), text.rfind('}')) {
        (Some(s), Some(e)) if e > s => (s, e),
        _ => return Err(PipelineError::invocation("no JSON object in model output")),
    };

    let extraction: Extraction = serde_json::from_str(&text[start..=end])
        .map_err(|e| PipelineError::invocation(format!("malformed extraction: {}", e)))?;

    if extraction == Extraction::default() {
        return Err(PipelineError::invocation("model returned an empty extraction"));
    }
    Ok(extraction)
}

/// Chunk, invoke and merge for one source.
pub struct Extractor {
    backend: Arc<dyn ExtractionBackend>,
    chunking: ChunkingConfig,
    min_content_chars: usize,
    glossary_sample: String,
}

impl Extractor {
    pub fn new(
        backend: Arc<dyn ExtractionBackend>,
        chunking: ChunkingConfig,
        min_content_chars: usize,
        glossary_sample: String,
    ) -> Self {
        Self {
            backend,
            chunking,
            min_content_chars,
            glossary_sample,
        }
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    /// Fails with `ContentTooShort` before any invocation when the content
    /// has fewer than `min_content_chars` characters.
    pub fn check_length(&self, content: &str) -> Result<()> {
        let len = content.chars().count();
        if len < self.min_content_chars {
            return Err(PipelineError::ContentTooShort {
                len,
                min: self.min_content_chars,
            });
        }
        Ok(())
    }

    pub async fn extract(
        &self,
        source_id: &str,
        content: &str,
        messages: &[MessageMeta],
        token: &ReentrancyToken,
    ) -> Result<Extraction> {
        self.check_length(content)?;

        let chunks = chunk_content(content, messages, &self.chunking);
        let total = chunks.len();
        tracing::debug!(source_id, chunks = total, "extracting");

        let mut results = Vec::with_capacity(total);
        for chunk in &chunks {
            let prompt = self.build_prompt(&chunk.text, chunk.index + 1, total);
            let text = self.backend.complete(&prompt, token).await?;
            let extraction = parse_extraction(&text).map_err(|e| match e {
                PipelineError::ExtractionInvocation { detail } if total > 1 => {
                    PipelineError::invocation(format!("chunk {}/{}: {}", chunk.index + 1, total, detail))
                }
                other => other,
            })?;
            results.push(extraction);
        }

        Ok(merge_extractions(results))
    }

    pub fn build_prompt(&self, content: &str, part: usize, total: usize) -> String {
        let scope = if total > 1 {
            format!(
                "This is part {} of {} of one conversation. Extract only what this part shows.",
                part, total
            )
        } else {
            "Extract a structured digest from this conversation.".to_string()
        };

        let known = if self.glossary_sample.is_empty() {
            "(none)".to_string()
        } else {
            self.glossary_sample.clone()
        };

        format!(
            r#"{scope}

<known_entities>
{known}
</known_entities>

<content>
{content}
</content>

Return one JSON object with these fields:
- summary: 2-3 sentences on what happened and why it matters
- arc: {{"started_with": initial goal, "key_turns": [pivots and discoveries], "ended_at": final state}}
- builds: [{{"what": thing created or changed, "details": context}}]
- learnings: [{{"insight": what was learned, "why_it_matters": specific significance, "context": how it was found}}]
- friction: [{{"problem": what was hard, "resolution": how it was resolved or "unresolved"}}]
- patterns: [recurring themes or collaboration style]
- open_threads: [unfinished or deferred work]
- entities: [{{"mention": exact text, "confidence": "high" | "medium" | "low", "suggested_canonical": known entity name or null}}]

Name people, products, projects and organizations as entities. Be conservative.
Return ONLY valid JSON, no markdown code blocks."#
        )
    }
}
