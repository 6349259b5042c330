//! Crate-wide error type.
//!
//! A tool that ran and exited non-zero is not an error here: it is reported
//! through [`crate::exec::ExecutionStatus::Failure`].

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Missing binary, missing resume path, missing execution log.
    #[error("not found: {0}")]
    NotFound(String),

    /// The OS refused to start the child process.
    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed credentials, variables or file names, detected before any I/O.
    #[error("validation error: {0}")]
    Validation(String),

    /// A variable value has no representation in the tool's input format.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProvisionError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// True for the "session expired, start over" class of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
