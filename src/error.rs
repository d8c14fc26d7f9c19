use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to load policy corpus from {path}: {message}")]
    CorpusLoad { path: PathBuf, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid formal query: {0}")]
    InvalidFormula(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Reasoning service error: {0}")]
    ReasoningService(String),

    #[error("Oracle error: {0}")]
    Oracle(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Structured reason a fact was rejected at the validation boundary.
/// Rejection drops the fact with a warning; it is never fatal to a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FactError {
    #[error("unknown predicate '{0}'")]
    UnknownPredicate(String),

    #[error("arity mismatch for '{predicate}': expected {expected} arguments, got {actual}")]
    ArityMismatch {
        predicate: String,
        expected: usize,
        actual: usize,
    },
}

pub type Result<T> = std::result::Result<T, VerifyError>;
