// ABOUTME: Error taxonomy for the sync engine, lock and worker
// ABOUTME: Adapters speak anyhow; the engine wraps their failures into SyncError

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by sync pipelines and their lifecycle wrappers.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Source table is missing or has no columns.
    #[error("schema error: {0}")]
    Schema(String),

    /// DDL or insert against the sink failed.
    #[error("sink error: {context}")]
    Sink {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// Reading from the source failed.
    #[error("source error: {context}")]
    Source {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// Persisting watermark, mapping or progress state failed.
    #[error("state error: {0:#}")]
    State(#[source] anyhow::Error),

    #[error("sync exceeded maximum duration of {limit:?} after {batches} batches")]
    Timeout { limit: Duration, batches: u64 },

    #[error("sync exceeded maximum of {max_iterations} batch iterations")]
    IterationLimit { max_iterations: u64 },

    #[error("another sync holds the lock: {0}")]
    LockContention(String),

    #[error("invalid sync request: {0}")]
    Validation(String),

    #[error("sync worker is already running")]
    AlreadyRunning,

    #[error("failed to start sync worker thread")]
    Spawn(#[source] std::io::Error),

    /// A cooperative stop was observed between batches.
    #[error("sync stopped on request after {rows} rows")]
    Stopped { rows: u64 },
}

impl SyncError {
    pub fn sink(context: impl Into<String>, source: anyhow::Error) -> Self {
        SyncError::Sink {
            context: context.into(),
            source,
        }
    }

    pub fn extract(context: impl Into<String>, source: anyhow::Error) -> Self {
        SyncError::Source {
            context: context.into(),
            source,
        }
    }

    /// Whether retrying the whole operation could change the outcome.
    ///
    /// Stop requests, malformed requests and schema mismatches are final.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SyncError::Stopped { .. }
                | SyncError::Validation(_)
                | SyncError::Schema(_)
                | SyncError::AlreadyRunning
                | SyncError::Spawn(_)
        )
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_error_keeps_cause() {
        let err = SyncError::sink("insert into events", anyhow::anyhow!("connection reset"));
        assert_eq!(err.to_string(), "sink error: insert into events");
        let cause = std::error::Error::source(&err).unwrap();
        assert_eq!(cause.to_string(), "connection reset");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!SyncError::Schema("no columns".into()).is_retryable());
        assert!(SyncError::Timeout {
            limit: Duration::from_secs(1),
            batches: 2
        }
        .is_retryable());
        assert!(!SyncError::Stopped { rows: 10 }.is_retryable());
        assert!(!SyncError::Validation("missing time column".into()).is_retryable());
    }
}
