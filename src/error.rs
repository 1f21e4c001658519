//! Error taxonomy for the reconciliation service.
//!
//! Errors are classified by the `kind` the HTTP layer reports back to
//! clients, independently of the human-readable message:
//! - `bad-argument`: the caller sent something we cannot work with
//! - `bad-path`: a property path failed to lex or parse
//! - `upstream-error`: the Wikibase/SPARQL endpoints misbehaved
//! - `cache-error`: a cache write failed (reads degrade to misses instead)

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadArgument(String),

    #[error("could not parse property path '{path}': {reason}")]
    BadPath { path: String, reason: String },

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("cache write failed: {0}")]
    Cache(String),
}

impl ServiceError {
    pub fn bad_argument(msg: impl Into<String>) -> Self {
        ServiceError::BadArgument(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        ServiceError::Upstream(msg.into())
    }

    /// Stable machine-readable kind, used in error payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::BadArgument(_) => "bad-argument",
            ServiceError::BadPath { .. } => "bad-path",
            ServiceError::Upstream(_) => "upstream-error",
            ServiceError::Cache(_) => "cache-error",
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::Upstream(err.to_string())
    }
}

impl From<redis::RedisError> for ServiceError {
    fn from(err: redis::RedisError) -> Self {
        ServiceError::Cache(err.to_string())
    }
}
