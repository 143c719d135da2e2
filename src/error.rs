//! Error handling utilities shared across the crate.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Convenient result type used throughout the crate.
pub type Result<T, E = PrepError> = std::result::Result<T, E>;

/// Domain-specific error describing failures during setup, shard transformation, or record IO.
#[derive(Debug, Error)]
pub enum PrepError {
    /// Pipeline configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Filesystem IO error with optional context path.
    #[error("io error while processing {path:?}: {source}")]
    Io {
        /// Underlying IO error returned by the standard library.
        source: std::io::Error,
        /// Target path associated with the IO failure if available.
        path: Option<PathBuf>,
    },
    /// Error bubbled up from the `tokenizers` crate or a missing special token.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    /// The model hub reference could not be resolved.
    #[error("model hub error: {0}")]
    Hub(String),
    /// An input shard could not be decoded as a delimited table.
    #[error("malformed shard {path:?}: {message}")]
    MalformedShard {
        /// Shard being decoded.
        path: PathBuf,
        /// Description of the decoding failure.
        message: String,
    },
    /// The label distribution of a shard cannot be stratified into every partition.
    #[error("stratification failed: {0}")]
    Stratification(String),
    /// A record carried a label outside the configured closed label set.
    #[error("label {label} is not one of the configured labels {allowed:?}")]
    UnknownLabel {
        /// Offending label value.
        label: i64,
        /// Configured label set.
        allowed: Vec<i64>,
    },
    /// A record could not be converted into features.
    #[error("encoding error: {0}")]
    Encoding(String),
    /// A record file is truncated or fails checksum/protobuf validation.
    #[error("corrupt record file {path:?}: {message}")]
    Record {
        /// Record file being read.
        path: PathBuf,
        /// Description of the corruption.
        message: String,
    },
    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A shard job exceeded the per-job timeout.
    #[error("shard {shard} did not finish within {limit:?}")]
    Timeout {
        /// Shard key of the overdue job.
        shard: String,
        /// Configured per-job limit.
        limit: Duration,
    },
    /// One or more shards failed; completed shards are left in place.
    #[error("{failed} of {total} shards did not complete successfully")]
    RunFailed {
        /// Number of failed or timed-out shards.
        failed: usize,
        /// Number of discovered shards.
        total: usize,
    },
    /// Catch-all variant for invariants that should not occur.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<tokenizers::Error> for PrepError {
    fn from(err: tokenizers::Error) -> Self {
        Self::Tokenizer(err.to_string())
    }
}

impl From<serde_json::Error> for PrepError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "hub")]
impl From<hf_hub::api::sync::ApiError> for PrepError {
    fn from(err: hf_hub::api::sync::ApiError) -> Self {
        Self::Hub(err.to_string())
    }
}

impl PrepError {
    /// Helper constructor that attaches an optional path when wrapping IO errors.
    pub fn io(source: std::io::Error, path: Option<PathBuf>) -> Self {
        Self::Io { source, path }
    }

    /// Helper constructor for shard decoding failures.
    pub fn malformed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::MalformedShard {
            path: path.into(),
            message: message.into(),
        }
    }
}
