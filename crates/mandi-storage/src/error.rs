use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("{path} line {line}: {source}")]
    Codec {
        path: String,
        line: u64,
        #[source]
        source: CodecError,
    },
    #[error("{path}: header {found:?} does not match the archive columns")]
    Header { path: String, found: Vec<String> },
    #[error("{path} line {line}: {key} sorts before the preceding row {previous}")]
    OutOfOrder {
        path: String,
        line: u64,
        key: String,
        previous: String,
    },
    #[error("{path} line {line}: duplicate natural key {key}")]
    DuplicateKey { path: String, line: u64, key: String },
    #[error("{path} line {line}: prices of {key} violate min <= modal <= max")]
    PriceOrder { path: String, line: u64, key: String },
    #[error("{path}: verification failed: {reason}")]
    Verification { path: String, reason: String },
    #[error("manifest {path}: {source}")]
    Manifest {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest schema version {found} is not supported (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },
    #[error("parquet mirror {path}: {reason}")]
    Mirror { path: String, reason: String },
}

impl StoreError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }

    /// Set when stored rows are not in canonical order; the partition can
    /// still be rebuilt by sorting.
    pub fn is_ordering(&self) -> bool {
        matches!(self, StoreError::OutOfOrder { .. })
    }
}
