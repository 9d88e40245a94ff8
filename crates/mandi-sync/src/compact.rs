//! Rewrites touched partitions into staging.
//!
//! The stored partition and the sorted additions are merged as two ordered
//! streams, so memory stays bounded by the batch rather than the partition.

use std::cmp::Ordering;
use std::fs;
use std::iter::Peekable;
use std::path::Path;

use mandi_core::PriceRecord;
use mandi_storage::mirror::write_parquet_mirror;
use mandi_storage::{
    verify_partition, ArchiveStore, Manifest, PartitionEntry, PartitionStats, PartitionWriter,
    StagedPartition, StagingArea, StoreError,
};
use tracing::{debug, info, warn};

pub struct Compactor<'a> {
    store: &'a ArchiveStore,
    manifest: &'a Manifest,
    staging: &'a StagingArea,
}

impl<'a> Compactor<'a> {
    /// `manifest` may name partitions staged earlier in the same run; they
    /// are read and checked exactly like committed ones.
    pub fn new(store: &'a ArchiveStore, manifest: &'a Manifest, staging: &'a StagingArea) -> Self {
        Self {
            store,
            manifest,
            staging,
        }
    }

    /// Writes `year`'s partition plus `additions` (already in archive order)
    /// to a fresh staging file and verifies the result.
    pub fn compact(&self, year: i32, additions: &[PriceRecord]) -> Result<StagedPartition, StoreError> {
        let dest = self.staging.fresh_path(year, "csv");
        let existing = self.manifest.partitions.get(&year);

        let stats = match self.stream_merge(&dest, existing, additions) {
            Err(err) if err.is_ordering() => {
                warn!(year, error = %err, "stored partition out of order; rebuilding in memory");
                remove_partial(&dest)?;
                self.rebuild(&dest, existing, additions)?
            }
            other => other?,
        };

        let expected_rows = existing.map_or(0, |e| e.rows) + additions.len() as u64;
        let verified = verify_partition(&dest)?;
        if verified != stats || verified.rows != expected_rows {
            return Err(StoreError::Verification {
                path: dest.display().to_string(),
                reason: format!(
                    "staged {} rows ({}), expected {} rows ({})",
                    verified.rows, verified.sha256, expected_rows, stats.sha256
                ),
            });
        }

        info!(year, rows = verified.rows, added = additions.len(), "partition staged");
        Ok(StagedPartition {
            year,
            csv_path: dest,
            stats: verified,
            parquet: None,
        })
    }

    /// Fails when a partition read back differs from what the manifest
    /// recorded for it.
    fn check_unchanged(
        &self,
        entry: &PartitionEntry,
        rows: Option<u64>,
        bytes: u64,
        sha256: &str,
    ) -> Result<(), StoreError> {
        let rows_differ = rows.is_some_and(|rows| rows != entry.rows);
        if rows_differ || bytes != entry.bytes || sha256 != entry.sha256 {
            return Err(StoreError::Verification {
                path: self.store.partition_path(entry).display().to_string(),
                reason: format!(
                    "stored partition changed since commit: {bytes} bytes ({sha256}), manifest has {} rows, {} bytes ({})",
                    entry.rows, entry.bytes, entry.sha256
                ),
            });
        }
        Ok(())
    }

    fn stream_merge(
        &self,
        dest: &Path,
        existing: Option<&PartitionEntry>,
        additions: &[PriceRecord],
    ) -> Result<PartitionStats, StoreError> {
        let mut writer = PartitionWriter::create(dest)?;
        let mut incoming = additions.iter().peekable();

        if let Some(entry) = existing {
            let mut reader = self.store.open_partition(entry)?;
            let mut stored = std::iter::from_fn(|| reader.next_record().transpose()).peekable();
            merge_streams(&mut writer, &mut stored, &mut incoming)?;
            drop(stored);

            let (bytes, sha256) = reader.finish();
            self.check_unchanged(entry, None, bytes, &sha256)?;
        }
        for record in incoming {
            writer.push(record)?;
        }
        debug!(path = %writer.path().display(), rows = writer.rows(), "partition merge written");
        writer.finish()
    }

    /// Fallback for a stored partition that is not in canonical order. The
    /// stored file must still hash to its manifest entry.
    fn rebuild(
        &self,
        dest: &Path,
        existing: Option<&PartitionEntry>,
        additions: &[PriceRecord],
    ) -> Result<PartitionStats, StoreError> {
        let mut rows: Vec<PriceRecord> = Vec::new();
        if let Some(entry) = existing {
            let mut reader = self.store.open_partition(entry)?;
            while let Some(record) = reader.next_record()? {
                rows.push(record);
            }
            let (bytes, sha256) = reader.finish();
            self.check_unchanged(entry, Some(rows.len() as u64), bytes, &sha256)?;
        }
        rows.extend_from_slice(additions);
        rows.sort_by(|a, b| a.key.cmp(&b.key));

        // A duplicate stored key fails the push with DuplicateKey.
        let mut writer = PartitionWriter::create(dest)?;
        for record in &rows {
            writer.push(record)?;
        }
        writer.finish()
    }
}

fn merge_streams<'r, S>(
    writer: &mut PartitionWriter,
    stored: &mut Peekable<S>,
    incoming: &mut Peekable<std::slice::Iter<'r, PriceRecord>>,
) -> Result<(), StoreError>
where
    S: Iterator<Item = Result<PriceRecord, StoreError>>,
{
    loop {
        let take_stored = match (stored.peek(), incoming.peek()) {
            (None, _) => return Ok(()),
            (Some(Err(_)), _) => true,
            (Some(Ok(_)), None) => true,
            (Some(Ok(s)), Some(i)) => match s.key.cmp(&i.key) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => true,
            },
        };
        if take_stored {
            match stored.next() {
                Some(Ok(record)) => writer.push(&record)?,
                Some(Err(err)) => return Err(err),
                None => return Ok(()),
            }
        } else if let Some(record) = incoming.next() {
            writer.push(record)?;
        }
    }
}

/// Stages the optional parquet copy of a final staged partition.
pub fn stage_mirror(
    staging: &StagingArea,
    mut staged: StagedPartition,
) -> Result<StagedPartition, StoreError> {
    let mirror_path = staging.fresh_path(staged.year, "parquet");
    let entry = write_parquet_mirror(&staged.csv_path, &mirror_path)?;
    debug!(year = staged.year, bytes = entry.bytes, "parquet mirror staged");
    staged.parquet = Some((mirror_path, entry));
    Ok(staged)
}

/// Removes a staged file; one that is already gone is fine.
pub fn remove_partial(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::io(format!("removing {}", path.display()), err)),
    }
}
