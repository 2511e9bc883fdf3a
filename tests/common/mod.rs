#![allow(dead_code)]

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use garde_archive::backfill::build_runner;
use garde_archive::batch::BatchRunner;
use garde_archive::config::Config;
use garde_archive::error::Result;
use garde_archive::guard::ReentrancyToken;
use garde_archive::ingest::content_hash;
use garde_archive::invoke::ExtractionBackend;
use garde_archive::models::{SourceRecord, SourceType};
use garde_archive::store::Store;

pub const GLOSSARY: &str = r#"
[entities.rust]
name = "Rust"
type = "language"
aliases = ["rustlang"]

[entities.sqlite]
name = "SQLite"
type = "tool"
aliases = ["sqlite3"]
"#;

/// Deterministic in-process backend. The reply depends only on the prompt:
/// a `topic:<word>` marker in the content becomes the summary subject, and
/// content containing `MALFORMED` gets a reply that is not JSON. Every
/// prompt is kept for inspection.
pub struct MockBackend {
    calls: AtomicUsize,
    delay: Duration,
    model: String,
    prompts: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::slow(Duration::ZERO)
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
            model: "mock-model".to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

/// The word after the first `topic:` marker, as the mock backend reads it.
pub fn topic_of(text: &str) -> String {
    text.find("topic:")
        .map(|i| {
            text[i + "topic:".len()..]
                .chars()
                .take_while(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .unwrap_or_else(|| "nothing".to_string())
}

#[async_trait]
impl ExtractionBackend for MockBackend {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, _token: &ReentrancyToken) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if prompt.contains("MALFORMED") {
            return Ok("I could not produce JSON for this one, sorry.".to_string());
        }

        let topic = topic_of(prompt);

        Ok(format!(
            r#"Here is the extraction:
{{
  "summary": "Worked on {topic} with the team.",
  "arc": {{"started_with": "a question about {topic}", "key_turns": [], "ended_at": "shipped"}},
  "builds": [{{"what": "{topic} importer", "details": "streams rows"}}],
  "learnings": [{{"insight": "WAL avoids reader stalls", "why_it_matters": "backfills run beside searches"}}],
  "friction": ["lock contention"],
  "patterns": [],
  "open_threads": ["benchmark {topic}"],
  "entities": [
    {{"mention": "rustlang", "confidence": "high"}},
    {{"mention": "Zanzibar widget", "confidence": "low"}}
  ]
}}"#
        ))
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub config: Config,
    pub store: Store,
    pub backend: Arc<MockBackend>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_backend(MockBackend::new()).await
    }

    pub async fn with_backend(backend: MockBackend) -> Self {
        Self::with_config(backend, |_| {}).await
    }

    /// Harness whose config is adjusted by `tweak` before the store opens.
    pub async fn with_config(backend: MockBackend, tweak: impl FnOnce(&mut Config)) -> Self {
        let tmp = TempDir::new().unwrap();
        let glossary_path = tmp.path().join("glossary.toml");
        std::fs::write(&glossary_path, GLOSSARY).unwrap();

        let mut config = Config::minimal(tmp.path().join("data/garde.sqlite"));
        config.staging.dir = tmp.path().join("staged");
        config.entities.glossary_path = Some(glossary_path);
        config.batch.retry_backoff_ms = 10;
        tweak(&mut config);

        let store = Store::open(&config).await.unwrap();
        Self {
            tmp,
            config,
            store,
            backend: Arc::new(backend),
        }
    }

    pub fn runner(&self) -> BatchRunner {
        build_runner(&self.config, self.store.clone(), self.backend.clone()).unwrap()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.tmp.path().join(name)
    }

    pub async fn ingest(&self, rec: &SourceRecord) {
        self.store.ingest(rec).await.unwrap();
    }
}

pub fn token() -> ReentrancyToken {
    ReentrancyToken::from_vars(std::iter::empty()).unwrap()
}

/// Content long enough to be sent for extraction.
pub fn long_text(topic: &str) -> String {
    format!(
        "user: can we look at topic:{topic} today?\n\nassistant: sure, reading the code now. \
         The loader buffers everything in memory, which is why large files stall.\n\n\
         user: ok, let's stream it instead."
    )
}

pub fn record(id: &str, text: &str) -> SourceRecord {
    SourceRecord {
        id: id.to_string(),
        source_type: id
            .split_once(':')
            .and_then(|(t, _)| t.parse().ok())
            .unwrap_or(SourceType::Other),
        title: format!("Session {}", id),
        path: None,
        content_hash: content_hash(text),
        created_at: Some("2026-03-01T10:00:00Z".parse().unwrap()),
        updated_at: Some("2026-03-01T11:00:00Z".parse().unwrap()),
        full_text: text.to_string(),
        has_presummary: false,
        presummary: None,
        project_path: Some("/home/dev/garde".to_string()),
        is_subagent: false,
        input_mode: None,
        metadata: None,
    }
}
