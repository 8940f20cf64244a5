use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpoofError {
    #[error("prefix file {path}: {source}")]
    PrefixFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed flow record: expected {expected} bytes, got {got}")]
    RecordSize { expected: usize, got: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SpoofError>;
