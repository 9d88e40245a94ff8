//! Local snapshot sources: a CSV dataset dump for seeding, and captured
//! API pages replayed as fixtures.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mandi_core::{DateWindow, RawRecord};
use tracing::info;

use crate::datagov::parse_envelope;
use crate::{RecordBatches, Snapshot, SourceError, UpstreamSource};

/// A CSV file with one header row, such as the full dataset download.
#[derive(Debug, Clone)]
pub struct CsvFileSource {
    path: PathBuf,
}

impl CsvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Lazily reads a CSV snapshot as raw rows, `batch_rows` at a time.
///
/// Short or long rows are kept as-is so the normalizer can reject them
/// individually instead of failing the import.
pub struct CsvBatches {
    path: PathBuf,
    display: String,
    reader: csv::Reader<File>,
    headers: csv::StringRecord,
    batch_rows: usize,
}

impl CsvBatches {
    pub fn open(path: &Path, batch_rows: usize) -> Result<Self, SourceError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|source| SourceError::Snapshot {
                path: path.to_path_buf(),
                source,
            })?;
        let headers = reader
            .headers()
            .map_err(|source| SourceError::Snapshot {
                path: path.to_path_buf(),
                source,
            })?
            .clone();
        Ok(Self {
            path: path.to_path_buf(),
            display: path.display().to_string(),
            reader,
            headers,
            batch_rows: batch_rows.max(1),
        })
    }

    fn read_batch(&mut self) -> Result<Option<Vec<RawRecord>>, SourceError> {
        let mut batch = Vec::with_capacity(self.batch_rows.min(READ_AHEAD_HINT));
        let mut row = csv::StringRecord::new();
        while batch.len() < self.batch_rows {
            let more = self
                .reader
                .read_record(&mut row)
                .map_err(|source| SourceError::Snapshot {
                    path: self.path.clone(),
                    source,
                })?;
            if !more {
                break;
            }
            let line = row.position().map(|p| p.line()).unwrap_or_default();
            batch.push(RawRecord {
                origin: format!("{}:{line}", self.display),
                fields: self
                    .headers
                    .iter()
                    .zip(row.iter())
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect(),
            });
        }
        Ok((!batch.is_empty()).then_some(batch))
    }
}

const READ_AHEAD_HINT: usize = 8192;

#[async_trait]
impl RecordBatches for CsvBatches {
    async fn next_batch(&mut self) -> Result<Option<Vec<RawRecord>>, SourceError> {
        self.read_batch()
    }
}

/// Reads every row of a CSV snapshot into memory.
pub fn read_csv_snapshot(path: &Path) -> Result<Vec<RawRecord>, SourceError> {
    let mut batches = CsvBatches::open(path, usize::MAX)?;
    Ok(batches.read_batch()?.unwrap_or_default())
}

#[async_trait]
impl UpstreamSource for CsvFileSource {
    fn source_id(&self) -> &str {
        "csv-file"
    }

    fn is_windowed(&self) -> bool {
        false
    }

    async fn fetch(&self, window: Option<DateWindow>) -> Result<Snapshot, SourceError> {
        let mut snapshot = Snapshot::new(self.source_id(), window);
        snapshot.records = read_csv_snapshot(&self.path)?;
        snapshot.pages = 1;
        snapshot.upstream_total = Some(snapshot.records.len() as u64);
        info!(path = %self.path.display(), rows = snapshot.records.len(), "csv snapshot loaded");
        Ok(snapshot)
    }

    async fn stream(
        &self,
        _window: Option<DateWindow>,
        batch_rows: usize,
    ) -> Result<Box<dyn RecordBatches>, SourceError> {
        info!(path = %self.path.display(), batch_rows, "streaming csv snapshot");
        Ok(Box::new(CsvBatches::open(&self.path, batch_rows)?))
    }
}

/// Fixed set of raw rows, served the same way on every fetch.
#[derive(Debug, Clone, Default)]
pub struct FixtureSource {
    records: Vec<RawRecord>,
}

impl FixtureSource {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self { records }
    }

    /// Loads captured API response pages, in order.
    pub fn from_envelope_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, SourceError> {
        let mut records = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let body = fs::read(path).map_err(|source| SourceError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let page = parse_envelope(&body, &path.display().to_string())?;
            records.extend(page.records);
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[RawRecord] {
        &self.records
    }
}

#[async_trait]
impl UpstreamSource for FixtureSource {
    fn source_id(&self) -> &str {
        "fixture"
    }

    async fn fetch(&self, window: Option<DateWindow>) -> Result<Snapshot, SourceError> {
        let mut snapshot = Snapshot::new(self.source_id(), window);
        snapshot.records = self.records.clone();
        snapshot.pages = 1;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixtures_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
    }

    #[tokio::test]
    async fn csv_snapshot_keeps_ragged_rows_for_the_normalizer() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("dump.csv");
        fs::write(
            &path,
            "State,District,Market,Commodity,Variety,Grade,Arrival_Date,Min_Price,Max_Price,Modal_Price\n\
             Kerala,Kollam,Punalur,Banana,Nendra Bale,FAQ,01/06/2024,4000,4500,4200\n\
             Kerala,Kollam\n",
        )
        .unwrap();

        let source = CsvFileSource::new(&path);
        assert!(!source.is_windowed());
        let snapshot = source.fetch(None).await.expect("snapshot");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.records[0].fields["Modal_Price"], "4200");
        assert!(snapshot.records[0].origin.ends_with(":2"));
        assert_eq!(snapshot.records[1].fields.len(), 2);
    }

    #[tokio::test]
    async fn missing_csv_is_an_error() {
        let source = CsvFileSource::new("/nonexistent/mandi.csv");
        assert!(matches!(
            source.fetch(None).await,
            Err(SourceError::Snapshot { .. })
        ));
    }

    #[tokio::test]
    async fn fixture_pages_replay_in_order() {
        let dir = fixtures_dir().join("data-gov");
        let source =
            FixtureSource::from_envelope_files(&[dir.join("page-1.json"), dir.join("page-2.json")])
                .expect("fixture pages");
        let snapshot = source.fetch(None).await.unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.records[2].fields["Commodity"], "Onion");
    }

    #[tokio::test]
    async fn csv_stream_yields_bounded_batches_in_file_order() {
        let source = CsvFileSource::new(fixtures_dir().join("snapshots/prices-sample.csv"));
        let mut batches = source.stream(None, 4).await.expect("stream");
        let mut sizes = Vec::new();
        let mut origins = Vec::new();
        while let Some(batch) = batches.next_batch().await.unwrap() {
            sizes.push(batch.len());
            origins.extend(batch.into_iter().map(|r| r.origin));
        }
        assert_eq!(sizes, vec![4, 2]);
        assert!(origins[0].ends_with(":2"));
        assert!(origins[5].ends_with(":7"));
    }

    #[test]
    fn bundled_dataset_sample_reads() {
        let records = read_csv_snapshot(&fixtures_dir().join("snapshots/prices-sample.csv"))
            .expect("sample");
        assert_eq!(records.len(), 6);
    }
}
