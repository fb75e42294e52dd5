use std::{io, result};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected a CRC value `{0}` but received value `{1}`")]
    InvalidCrc(u32, u32),

    #[error("Table record needs `{0}` bytes but only `{1}` remain in the file")]
    TruncatedRecord(usize, usize),

    #[error("Invalid table file header")]
    InvalidTableHeader,

    #[error("Invalid representation code: `{0}`")]
    InvalidRepresentation(u8),

    #[error("The `{0}` background worker is no longer running")]
    WorkerGone(&'static str),

    #[error("The hash-partitioned representation requires a prefix length greater than zero")]
    MissingPrefixLength,
}

pub type Result<T> = result::Result<T, Error>;
