use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Data alignment error: {0}")]
    DataAlignment(String),
    #[error("Worker failure in stage '{stage}' (chunk {chunk}, items {}..{}): {reason}", .range.start, .range.end)]
    WorkerFailure {
        stage: String,
        chunk: usize,
        range: Range<usize>,
        reason: String,
    },
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),
    #[error("Failed to read or write file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
