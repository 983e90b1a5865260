//! Structured error types for reqscope
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Correlation itself never fails; these cover the edges (config files,
//! capture logs, trace export).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Header rule has an empty name")]
    EmptyHeaderName,

    #[error("Sanity slop must be positive, got {0}ms")]
    InvalidSlop(i64),
}

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Malformed capture event on line {line}: {source}")]
    MalformedEvent {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Ticks per millisecond must be positive, got {0}")]
    InvalidFrequency(i64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write trace JSON: {0}")]
    Json(#[from] serde_json::Error),
}
