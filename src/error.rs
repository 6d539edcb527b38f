use std::path::PathBuf;
use thiserror::Error;

/// Pipeline error types
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("No role matches {path}")]
    UnclassifiedPath { path: PathBuf },

    #[error("Failed to compile {path}: {message}")]
    Compile { path: PathBuf, message: String },

    #[error("Failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Delivery of {key} to {destination} failed: {message}")]
    Delivery {
        destination: String,
        key: String,
        message: String,
    },

    #[error("Unknown destination: {destination}")]
    UnknownDestination { destination: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("File watcher failed")]
    Watch {
        #[source]
        source: notify::Error,
    },

    #[error("Sync cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Shorthand for a compile failure on `path`
    pub fn compile(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        SyncError::Compile {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
