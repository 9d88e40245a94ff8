//! Streaming reader/writer for one year partition.
//!
//! A partition file is CSV with the archive header followed by rows in
//! strictly increasing natural-key order. Both directions hash the bytes
//! they move so a written file can be checked against its manifest entry.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::StringRecord;
use mandi_core::{NaturalKey, PriceRecord, STORE_COLUMNS};
use sha2::{Digest, Sha256};

use crate::codec::{decode_record, encode_record, header_matches};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStats {
    pub rows: u64,
    pub bytes: u64,
    pub sha256: String,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// Tracks key order across rows and the date range seen.
#[derive(Default)]
struct OrderTracker {
    last_key: Option<NaturalKey>,
    first_date: Option<NaiveDate>,
    last_date: Option<NaiveDate>,
    rows: u64,
}

impl OrderTracker {
    fn observe(&mut self, path: &Path, line: u64, record: &PriceRecord) -> Result<(), StoreError> {
        if let Some(previous) = &self.last_key {
            if record.key == *previous {
                return Err(StoreError::DuplicateKey {
                    path: path.display().to_string(),
                    line,
                    key: record.key.to_string(),
                });
            }
            if record.key < *previous {
                return Err(StoreError::OutOfOrder {
                    path: path.display().to_string(),
                    line,
                    key: record.key.to_string(),
                    previous: previous.to_string(),
                });
            }
        }
        let date = record.arrival_date();
        self.first_date.get_or_insert(date);
        self.last_date = Some(date);
        self.last_key = Some(record.key.clone());
        self.rows += 1;
        Ok(())
    }
}

pub struct PartitionWriter {
    path: PathBuf,
    writer: csv::Writer<HashingWriter<BufWriter<File>>>,
    tracker: OrderTracker,
}

impl PartitionWriter {
    /// Creates a new partition file; refuses to overwrite an existing one.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| StoreError::io(format!("creating partition {}", path.display()), e))?;
        let sink = HashingWriter {
            inner: BufWriter::new(file),
            hasher: Sha256::new(),
            bytes: 0,
        };
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(sink);
        writer
            .write_record(STORE_COLUMNS)
            .map_err(|source| StoreError::Csv {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            path,
            writer,
            tracker: OrderTracker::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one row. Rows must arrive in strictly increasing key order.
    pub fn push(&mut self, record: &PriceRecord) -> Result<(), StoreError> {
        let line = self.tracker.rows + 2;
        self.tracker.observe(&self.path, line, record)?;
        self.writer
            .write_record(encode_record(record))
            .map_err(|source| StoreError::Csv {
                path: self.path.display().to_string(),
                source,
            })
    }

    pub fn rows(&self) -> u64 {
        self.tracker.rows
    }

    /// Flushes and fsyncs the file, returning its stats.
    pub fn finish(self) -> Result<PartitionStats, StoreError> {
        let display = self.path.display().to_string();
        let sink = self
            .writer
            .into_inner()
            .map_err(|e| StoreError::io(format!("flushing partition {display}"), e.into_error()))?;
        let HashingWriter { inner, hasher, bytes } = sink;
        let file = inner
            .into_inner()
            .map_err(|e| StoreError::io(format!("flushing partition {display}"), e.into_error()))?;
        file.sync_all()
            .map_err(|e| StoreError::io(format!("syncing partition {display}"), e))?;

        Ok(PartitionStats {
            rows: self.tracker.rows,
            bytes,
            sha256: hex::encode(hasher.finalize()),
            first_date: self.tracker.first_date,
            last_date: self.tracker.last_date,
        })
    }
}

pub struct PartitionReader {
    path: PathBuf,
    reader: csv::Reader<HashingReader<BufReader<File>>>,
    row: StringRecord,
}

impl PartitionReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = File::open(&path)
            .map_err(|e| StoreError::io(format!("opening partition {}", path.display()), e))?;
        let source = HashingReader {
            inner: BufReader::new(file),
            hasher: Sha256::new(),
            bytes: 0,
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(source);
        let header = reader.headers().map_err(|source| StoreError::Csv {
            path: path.display().to_string(),
            source,
        })?;
        if !header_matches(header) {
            return Err(StoreError::Header {
                path: path.display().to_string(),
                found: header.iter().map(str::to_string).collect(),
            });
        }
        Ok(Self {
            path,
            reader,
            row: StringRecord::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_record(&mut self) -> Result<Option<PriceRecord>, StoreError> {
        let more = self
            .reader
            .read_record(&mut self.row)
            .map_err(|source| StoreError::Csv {
                path: self.path.display().to_string(),
                source,
            })?;
        if !more {
            return Ok(None);
        }
        let line = self.row.position().map(|p| p.line()).unwrap_or_default();
        decode_record(&self.row)
            .map(Some)
            .map_err(|source| StoreError::Codec {
                path: self.path.display().to_string(),
                line,
                source,
            })
    }

    /// Line number of the most recently read row.
    pub fn line(&self) -> u64 {
        self.row.position().map(|p| p.line()).unwrap_or_default()
    }

    /// Byte count and sha256 of everything read so far; call after the last
    /// row to get the digest of the whole file.
    pub fn finish(self) -> (u64, String) {
        let source = self.reader.into_inner();
        (source.bytes, hex::encode(source.hasher.finalize()))
    }
}

impl Iterator for PartitionReader {
    type Item = Result<PriceRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Re-reads a partition end to end and checks every archive invariant that
/// can be checked locally: header, decodable rows, strictly increasing keys,
/// non-negative ordered prices. Returns the observed stats.
pub fn verify_partition(path: &Path) -> Result<PartitionStats, StoreError> {
    let mut reader = PartitionReader::open(path)?;
    let mut tracker = OrderTracker::default();
    while let Some(record) = reader.next_record()? {
        let line = reader.line();
        if !record.prices.is_ordered() || !record.prices.is_non_negative() {
            return Err(StoreError::PriceOrder {
                path: path.display().to_string(),
                line,
                key: record.key.to_string(),
            });
        }
        tracker.observe(path, line, &record)?;
    }
    let (bytes, sha256) = reader.finish();
    Ok(PartitionStats {
        rows: tracker.rows,
        bytes,
        sha256,
        first_date: tracker.first_date,
        last_date: tracker.last_date,
    })
}
