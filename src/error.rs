//! Error taxonomy for the extraction pipeline.
//!
//! Variants map directly onto how the batch orchestrator treats a failure:
//! transient store errors are retried, extraction errors mark the source
//! `failed`, adapter errors mark it `skipped`, and a recursion guard
//! violation aborts the whole run.

use thiserror::Error;

/// SQLite primary result codes that indicate lock contention.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Lock contention or pool exhaustion. Retry later.
    #[error("transient store error: {0}")]
    TransientStore(#[source] sqlx::Error),

    #[error("store error: {0}")]
    Store(#[source] sqlx::Error),

    /// The external capability failed, timed out, or returned output that
    /// could not be parsed into an extraction.
    #[error("extraction invocation failed: {detail}")]
    ExtractionInvocation { detail: String },

    /// Content below the invocation threshold. Recorded as a stub.
    #[error("content too short for extraction ({len} < {min} chars)")]
    ContentTooShort { len: usize, min: usize },

    /// A source adapter could not produce content for this source.
    #[error("adapter error for {source_id}: {detail}")]
    Adapter { source_id: String, detail: String },

    #[error("recursion guard: {0} is set, refusing to re-enter the pipeline")]
    RecursionGuard(&'static str),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("staging error: {0}")]
    Staging(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn invocation(detail: impl Into<String>) -> Self {
        PipelineError::ExtractionInvocation {
            detail: detail.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientStore(_))
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        if is_lock_error(&err) {
            PipelineError::TransientStore(err)
        } else {
            PipelineError::Store(err)
        }
    }
}

fn is_lock_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i64>().ok())
            // extended codes carry the primary code in the low byte
            .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
            .unwrap_or(false),
        _ => false,
    }
}
