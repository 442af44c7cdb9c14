//! Service-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KbError {
    /// No record exists for the requested key, in cache or on disk.
    #[error("record not found: {0}")]
    NotFound(String),

    /// Per-key lock busy or global build admission exhausted.
    /// Propagates immediately without queueing — callers retry later.
    #[error("concurrency limit: {0}")]
    ConcurrencyLimit(String),

    /// Generator output stayed unparsable through every allowed attempt.
    #[error("generation output unparsable after {attempts} attempts")]
    GenerationParse { attempts: u32 },

    /// Transport-level generator failure (HTTP error, timeout, bad body).
    #[error("generator request failed: {0}")]
    Generator(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
