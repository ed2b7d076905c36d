use std::io;

use thiserror::Error;

/// Failure to read or write the durable state document.
///
/// Never fatal: the in-memory record stays authoritative until the next
/// successful save, and a failed load falls back to built-in defaults.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to open state document: {0}")]
    Open(#[source] io::Error),
    #[error("failed to read state document: {0}")]
    Read(#[source] io::Error),
    #[error("failed to write state document: {0}")]
    Write(#[source] io::Error),
    #[error("failed to encode state document: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("state document is truncated or incomplete: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub const CODE_INVALID_PARAMS: i32 = 400;
pub const CODE_UNKNOWN_METHOD: i32 = 404;

/// A remote command that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct ValidationError {
    pub code: i32,
    pub message: String,
}

impl ValidationError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: CODE_INVALID_PARAMS,
            message: message.into(),
        }
    }

    pub fn unknown_method(method: &str) -> Self {
        Self {
            code: CODE_UNKNOWN_METHOD,
            message: format!("unknown method `{method}`"),
        }
    }

    pub fn malformed(err: &serde_json::Error) -> Self {
        Self::invalid_params(format!("malformed command payload: {err}"))
    }
}

/// Startup cannot continue: configuration is missing or a peripheral failed.
#[derive(Debug, Error)]
pub enum BringUpError {
    #[error("required configuration `{0}` is missing")]
    MissingConfig(&'static str),
    #[error("configuration `{field}` is invalid: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
    #[error("peripheral initialization failed: {0}")]
    Peripheral(String),
}
