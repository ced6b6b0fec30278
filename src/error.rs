//! Error types for ranking, retries and score sources.

use thiserror::Error;

/// Errors raised by the ranking core and stream layout.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RankError {
    /// The z-score is undefined for this input (too few values, zero dispersion)
    #[error("Domain error: {0}")]
    Domain(String),

    /// Stream layout cannot be built from the given settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A poll tick did not carry the expected stream scores
    #[error("Input shape error: {0}")]
    InputShape(String),
}

impl RankError {
    /// Short label used for per-kind failure counters
    pub fn kind(&self) -> &'static str {
        match self {
            RankError::Domain(_) => "domain",
            RankError::Configuration(_) => "configuration",
            RankError::InputShape(_) => "input_shape",
        }
    }
}

/// Errors returned by [`crate::retry::RetryPolicy`].
#[derive(Debug, Error)]
pub enum RetryError<E: std::fmt::Display> {
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("Aborted on attempt {attempt}: {error}")]
    Fatal { attempt: u32, error: E },
}

impl<E: std::fmt::Display> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal { error, .. } => error,
        }
    }
}

/// Errors talking to the remote app server.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("App server rejected '{command}': {detail}")]
    Rejected { command: String, detail: String },

    #[error("Malformed response to '{command}': {detail}")]
    Malformed { command: String, detail: String },
}

impl SourceError {
    /// Transport failures are worth another attempt; a rejected command is not
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Request(_))
    }
}
