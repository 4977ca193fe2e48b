//! Error types for the input pipeline

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Failed to load tokenizer '{path}': {reason}")]
    TokenizerLoad { path: String, reason: String },

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Sequence of {length} tokens does not fit a slot of {capacity}")]
    OversizedSequence { length: usize, capacity: usize },

    #[error("Host {host} disagrees at step {step}: expected shape {expected:?}, got {got:?}")]
    ShardMismatch {
        host: usize,
        step: u64,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Source error: {0}")]
    Source(String),

    #[error("Record has no '{0}' field")]
    MissingField(String),

    #[error("Rendezvous error: {0}")]
    Rendezvous(String),

    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
