//! Upstream sources for the mandi archive.
//!
//! Every source yields a [`Snapshot`] of raw rows; mapping field names and
//! validating values is left to the normalizer so a renamed upstream column
//! never needs an adapter change. Large sources can also be read as a
//! [`RecordBatches`] stream so a run never holds the whole input at once.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mandi_core::{DateWindow, RawRecord};
use mandi_storage::FetchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod datagov;
pub mod snapshot;

pub use datagov::{parse_envelope, DataGovConfig, DataGovSource, EnvelopePage, DEFAULT_API_URL};
pub use snapshot::{CsvBatches, CsvFileSource, FixtureSource};

pub const CRATE_NAME: &str = "mandi-adapters";

/// One retrieved batch of upstream rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub source_id: String,
    pub window: Option<DateWindow>,
    pub fetched_at: DateTime<Utc>,
    pub pages: usize,
    /// Row count the upstream claimed for the query, when it reports one.
    pub upstream_total: Option<u64>,
    pub records: Vec<RawRecord>,
}

impl Snapshot {
    pub fn new(source_id: impl Into<String>, window: Option<DateWindow>) -> Self {
        Self {
            source_id: source_id.into(),
            window,
            fetched_at: Utc::now(),
            pages: 0,
            upstream_total: None,
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("malformed response from {url}: {reason}")]
    Envelope { url: String, reason: String },
    #[error("upstream reported an error: {message}")]
    Upstream { message: String },
    #[error("pagination did not finish within {max_pages} pages ({fetched_rows} rows fetched)")]
    TooManyPages { max_pages: usize, fetched_rows: usize },
    #[error("reading snapshot {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("reading fixture {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SourceError {
    /// Whether the failure belongs to a class that retrying could fix.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Http(err) => err.is_transient(),
            _ => false,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, SourceError::Http(FetchError::Unauthorized { .. }))
    }
}

#[async_trait]
pub trait UpstreamSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Remote feeds are queried per date window. Snapshot sources return
    /// their whole content and ignore the window.
    fn is_windowed(&self) -> bool {
        true
    }

    async fn fetch(&self, window: Option<DateWindow>) -> Result<Snapshot, SourceError>;

    /// Rows in batches of at most `batch_rows`. The default fetches the
    /// whole snapshot first; file sources override it to read lazily.
    async fn stream(
        &self,
        window: Option<DateWindow>,
        batch_rows: usize,
    ) -> Result<Box<dyn RecordBatches>, SourceError> {
        let snapshot = self.fetch(window).await?;
        Ok(Box::new(SnapshotBatches::new(snapshot.records, batch_rows)))
    }
}

#[async_trait]
pub trait RecordBatches: Send {
    /// The next non-empty batch, or `None` once the source is exhausted.
    async fn next_batch(&mut self) -> Result<Option<Vec<RawRecord>>, SourceError>;
}

/// Splits rows already in memory into batches.
#[derive(Debug)]
pub struct SnapshotBatches {
    records: std::vec::IntoIter<RawRecord>,
    batch_rows: usize,
}

impl SnapshotBatches {
    pub fn new(records: Vec<RawRecord>, batch_rows: usize) -> Self {
        Self {
            records: records.into_iter(),
            batch_rows: batch_rows.max(1),
        }
    }
}

#[async_trait]
impl RecordBatches for SnapshotBatches {
    async fn next_batch(&mut self) -> Result<Option<Vec<RawRecord>>, SourceError> {
        let batch: Vec<RawRecord> = self.records.by_ref().take(self.batch_rows).collect();
        Ok((!batch.is_empty()).then_some(batch))
    }
}
