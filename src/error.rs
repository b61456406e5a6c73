//! typed errors for the cache and job boundaries
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("unable to canonicalize cache key: {0}")]
    Canonicalize(String),

    #[error("unable to serialize cache value: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("cache write failed for {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache clear failed for {path}: {source}")]
    Clear {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl CacheError {
    pub(crate) fn write(path: impl Into<PathBuf>, source: io::Error) -> CacheError {
        CacheError::Write {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),

    #[error("job terminated before completion")]
    Terminated,

    #[error("unable to dispatch job: {0}")]
    Dispatch(String),
}
