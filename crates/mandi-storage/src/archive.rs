//! On-disk archive layout and the manifest commit protocol.
//!
//! `manifest.json` is the only file readers trust: it names the current file
//! of every year partition. A run writes replacement partitions under a new
//! generation number, verifies them, then replaces the manifest in a single
//! rename. Files the manifest does not reference are garbage.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use chrono::{DateTime, NaiveDate, Utc};
use mandi_core::PriceRecord;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::partition::{PartitionReader, PartitionStats};

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const PARTITIONS_DIR: &str = "partitions";
const STAGING_DIR: &str = "staging";
const REPORTS_DIR: &str = "reports";
const RUN_STATE_FILE: &str = "run_state.json";
const LOCK_FILE: &str = ".run.lock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorEntry {
    pub file: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub file: String,
    pub rows: u64,
    pub bytes: u64,
    pub sha256: String,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parquet: Option<MirrorEntry>,
}

impl PartitionEntry {
    pub fn matches(&self, stats: &PartitionStats) -> bool {
        self.rows == stats.rows && self.bytes == stats.bytes && self.sha256 == stats.sha256
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub generation: u64,
    pub committed_at: Option<DateTime<Utc>>,
    pub total_rows: u64,
    #[serde(default)]
    pub partitions: BTreeMap<i32, PartitionEntry>,
    /// Commodity_Code -> Commodity, one name per code archive-wide.
    #[serde(default)]
    pub commodity_codes: BTreeMap<u32, String>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            generation: 0,
            committed_at: None,
            total_rows: 0,
            partitions: BTreeMap::new(),
            commodity_codes: BTreeMap::new(),
        }
    }
}

impl Manifest {
    pub fn latest_arrival_date(&self) -> Option<NaiveDate> {
        self.partitions.values().filter_map(|p| p.last_date).max()
    }

    fn referenced_files(&self) -> HashSet<String> {
        self.partitions
            .values()
            .flat_map(|p| {
                std::iter::once(p.file.clone()).chain(p.parquet.as_ref().map(|m| m.file.clone()))
            })
            .collect()
    }
}

/// A verified partition written to staging, not yet visible to readers.
#[derive(Debug, Clone)]
pub struct StagedPartition {
    pub year: i32,
    pub csv_path: PathBuf,
    pub stats: PartitionStats,
    pub parquet: Option<(PathBuf, MirrorEntry)>,
}

/// Scratch directory for one run. Removed on drop, so an aborted or
/// cancelled run leaves nothing behind.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
    next_pass: AtomicU32,
}

impl StagingArea {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, year: i32, extension: &str) -> PathBuf {
        self.dir.join(format!("{year}.{extension}"))
    }

    /// A path no earlier call has returned, for rewriting a year that is
    /// already staged while its previous staged file is still being read.
    pub fn fresh_path(&self, year: i32, extension: &str) -> PathBuf {
        let pass = self.next_pass.fetch_add(1, AtomicOrdering::Relaxed);
        self.dir.join(format!("{year}-{pass:04}.{extension}"))
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %err, "could not remove staging directory");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join(REPORTS_DIR)
    }

    pub fn run_state_path(&self) -> PathBuf {
        self.root.join(RUN_STATE_FILE)
    }

    pub fn ensure_layout(&self) -> Result<(), StoreError> {
        for dir in [
            self.root.clone(),
            self.root.join(PARTITIONS_DIR),
            self.root.join(STAGING_DIR),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| StoreError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }

    /// Current manifest; an archive without one is empty.
    pub fn load_manifest(&self) -> Result<Manifest, StoreError> {
        let path = self.manifest_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Manifest::default())
            }
            Err(err) => return Err(StoreError::io(format!("reading {}", path.display()), err)),
        };
        let manifest: Manifest =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Manifest {
                path: path.display().to_string(),
                source,
            })?;
        if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
            return Err(StoreError::SchemaVersion {
                found: manifest.schema_version,
                expected: MANIFEST_SCHEMA_VERSION,
            });
        }
        Ok(manifest)
    }

    pub fn partition_path(&self, entry: &PartitionEntry) -> PathBuf {
        self.root.join(&entry.file)
    }

    pub fn open_partition(&self, entry: &PartitionEntry) -> Result<PartitionReader, StoreError> {
        PartitionReader::open(self.partition_path(entry))
    }

    /// Manifest entry naming a staged partition in place, so later passes of
    /// the same run can read it like a committed one.
    pub fn staged_entry(&self, staged: &StagedPartition) -> Result<PartitionEntry, StoreError> {
        let file = staged
            .csv_path
            .strip_prefix(&self.root)
            .map_err(|_| StoreError::Verification {
                path: staged.csv_path.display().to_string(),
                reason: format!("staged file is outside the archive {}", self.root.display()),
            })?
            .to_string_lossy()
            .replace('\\', "/");
        Ok(PartitionEntry {
            file,
            rows: staged.stats.rows,
            bytes: staged.stats.bytes,
            sha256: staged.stats.sha256.clone(),
            first_date: staged.stats.first_date,
            last_date: staged.stats.last_date,
            parquet: None,
        })
    }

    fn relative_partition_file(year: i32, generation: u64, extension: &str) -> String {
        format!("{PARTITIONS_DIR}/{year}/prices-{generation:06}.{extension}")
    }

    pub fn create_staging(&self, run_id: Uuid) -> Result<StagingArea, StoreError> {
        let dir = self.root.join(STAGING_DIR).join(run_id.to_string());
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::io(format!("creating staging {}", dir.display()), e))?;
        Ok(StagingArea {
            dir,
            next_pass: AtomicU32::new(0),
        })
    }

    /// Publishes staged partitions as the next generation.
    ///
    /// Staged files are moved beside the live ones under new names, then the
    /// manifest is replaced atomically. Until that rename the previous
    /// manifest, and every file it names, is untouched.
    pub fn commit(
        &self,
        current: &Manifest,
        staged: Vec<StagedPartition>,
        commodity_codes: BTreeMap<u32, String>,
    ) -> Result<Manifest, StoreError> {
        let generation = current.generation + 1;
        let mut next = current.clone();
        next.generation = generation;
        next.committed_at = Some(Utc::now());
        next.commodity_codes = commodity_codes;

        let mut moved = Vec::new();
        let mut superseded = Vec::new();
        let result = (|| -> Result<(), StoreError> {
            for part in staged {
                let csv_rel = Self::relative_partition_file(part.year, generation, "csv");
                self.move_into_place(&part.csv_path, &csv_rel)?;
                moved.push(csv_rel.clone());

                let parquet = match part.parquet {
                    Some((path, mut entry)) => {
                        let rel = Self::relative_partition_file(part.year, generation, "parquet");
                        self.move_into_place(&path, &rel)?;
                        moved.push(rel.clone());
                        entry.file = rel;
                        Some(entry)
                    }
                    None => None,
                };

                let entry = PartitionEntry {
                    file: csv_rel,
                    rows: part.stats.rows,
                    bytes: part.stats.bytes,
                    sha256: part.stats.sha256,
                    first_date: part.stats.first_date,
                    last_date: part.stats.last_date,
                    parquet,
                };
                if let Some(old) = next.partitions.insert(part.year, entry) {
                    superseded.push(old);
                }
            }
            next.total_rows = next.partitions.values().map(|p| p.rows).sum();

            let bytes = serde_json::to_vec_pretty(&next).map_err(|source| StoreError::Manifest {
                path: self.manifest_path().display().to_string(),
                source,
            })?;
            write_atomic(&self.manifest_path(), &bytes)
        })();

        if let Err(err) = result {
            for rel in &moved {
                let _ = fs::remove_file(self.root.join(rel));
            }
            return Err(err);
        }

        info!(generation, total_rows = next.total_rows, "manifest committed");
        for old in superseded {
            let files = std::iter::once(old.file).chain(old.parquet.map(|m| m.file));
            for rel in files {
                if let Err(err) = fs::remove_file(self.root.join(&rel)) {
                    warn!(file = %rel, error = %err, "superseded partition file left for orphan cleanup");
                }
            }
        }
        Ok(next)
    }

    fn move_into_place(&self, from: &Path, rel: &str) -> Result<(), StoreError> {
        let dest = self.root.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::io(format!("creating {}", parent.display()), e))?;
        }
        fs::rename(from, &dest).map_err(|e| {
            StoreError::io(
                format!("moving {} -> {}", from.display(), dest.display()),
                e,
            )
        })
    }

    /// Deletes staging leftovers and partition files the manifest does not
    /// reference, e.g. from a run killed between staging and commit. Only
    /// safe while holding the run lock.
    pub fn remove_orphans(&self, manifest: &Manifest) -> Result<usize, StoreError> {
        let referenced = manifest.referenced_files();
        let mut removed = 0usize;

        let staging = self.root.join(STAGING_DIR);
        for entry in read_dir_if_exists(&staging)? {
            let path = entry.path();
            fs::remove_dir_all(&path)
                .or_else(|_| fs::remove_file(&path))
                .map_err(|e| StoreError::io(format!("removing {}", path.display()), e))?;
            removed += 1;
        }

        let partitions = self.root.join(PARTITIONS_DIR);
        for year_dir in read_dir_if_exists(&partitions)? {
            for file in read_dir_if_exists(&year_dir.path())? {
                let name = file.file_name().to_string_lossy().to_string();
                let year = year_dir.file_name().to_string_lossy().to_string();
                let rel = format!("{PARTITIONS_DIR}/{year}/{name}");
                if !referenced.contains(&rel) {
                    fs::remove_file(file.path()).map_err(|e| {
                        StoreError::io(format!("removing orphan {}", file.path().display()), e)
                    })?;
                    removed += 1;
                }
            }
        }

        for entry in read_dir_if_exists(&self.root)? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') && name.ends_with(".tmp") {
                fs::remove_file(entry.path()).map_err(|e| {
                    StoreError::io(format!("removing {}", entry.path().display()), e)
                })?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "removed orphaned archive files");
        }
        Ok(removed)
    }

    /// Every stored record in archive order, across all partitions.
    pub fn records(&self, manifest: &Manifest) -> ArchiveRecords {
        ArchiveRecords {
            store: self.clone(),
            pending: manifest.partitions.values().cloned().collect(),
            current: None,
        }
    }
}

fn read_dir_if_exists(dir: &Path) -> Result<Vec<fs::DirEntry>, StoreError> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::io(format!("listing {}", dir.display()), e)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(StoreError::io(format!("listing {}", dir.display()), err)),
    }
}

pub struct ArchiveRecords {
    store: ArchiveStore,
    pending: VecDeque<PartitionEntry>,
    current: Option<PartitionReader>,
}

impl Iterator for ArchiveRecords {
    type Item = Result<PriceRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                match reader.next_record() {
                    Ok(Some(record)) => return Some(Ok(record)),
                    Ok(None) => self.current = None,
                    Err(err) => {
                        self.current = None;
                        self.pending.clear();
                        return Some(Err(err));
                    }
                }
            }
            let entry = self.pending.pop_front()?;
            match self.store.open_partition(&entry) {
                Ok(reader) => self.current = Some(reader),
                Err(err) => {
                    self.pending.clear();
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Replaces `path` with `bytes` so readers see either the old or the new
/// content, never a mix: temp file in the same directory, fsync, rename,
/// then fsync the directory entry.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|e| StoreError::io(format!("creating {}", parent.display()), e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let write = || -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()
    };
    if let Err(err) = write() {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::io(
            format!("writing temp file {}", temp_path.display()),
            err,
        ));
    }

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::io(
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            ),
            err,
        ));
    }

    sync_dir(parent);
    debug!(path = %path.display(), bytes = bytes.len(), "atomic write complete");
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        warn!(dir = %dir.display(), error = %err, "directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionWriter;
    use mandi_core::{NaturalKey, PriceQuote};
    use rust_decimal::Decimal;
    use tempfile::tempdir;

    fn record(year: i32, commodity: &str) -> PriceRecord {
        PriceRecord {
            key: NaturalKey {
                arrival_date: NaiveDate::from_ymd_opt(year, 3, 14).unwrap(),
                commodity: commodity.into(),
                state: "Punjab".into(),
                district: "Ludhiana".into(),
                market: "Khanna".into(),
                variety: "Dara".into(),
                grade: None,
            },
            prices: PriceQuote {
                min: Decimal::new(2100, 0),
                max: Decimal::new(2300, 0),
                modal: Decimal::new(2200, 0),
            },
            commodity_code: Some(1),
        }
    }

    fn stage(staging: &StagingArea, year: i32, rows: &[PriceRecord]) -> StagedPartition {
        let path = staging.path_for(year, "csv");
        let mut writer = PartitionWriter::create(&path).unwrap();
        for row in rows {
            writer.push(row).unwrap();
        }
        StagedPartition {
            year,
            csv_path: path,
            stats: writer.finish().unwrap(),
            parquet: None,
        }
    }

    #[test]
    fn missing_manifest_means_empty_archive() {
        let dir = tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path());
        let manifest = store.load_manifest().expect("load");
        assert_eq!(manifest, Manifest::default());
        assert_eq!(store.records(&manifest).count(), 0);
    }

    #[test]
    fn commit_replaces_only_touched_partitions() {
        let dir = tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path());
        store.ensure_layout().unwrap();

        let staging = store.create_staging(Uuid::new_v4()).unwrap();
        let staged = vec![
            stage(&staging, 2023, &[record(2023, "Wheat")]),
            stage(&staging, 2024, &[record(2024, "Wheat")]),
        ];
        let first = store
            .commit(&Manifest::default(), staged, BTreeMap::from([(1, "Wheat".to_string())]))
            .unwrap();
        drop(staging);
        assert_eq!(first.generation, 1);
        assert_eq!(first.total_rows, 2);

        let untouched_2023 = fs::read(store.partition_path(&first.partitions[&2023])).unwrap();

        let staging = store.create_staging(Uuid::new_v4()).unwrap();
        let staged = vec![stage(
            &staging,
            2024,
            &[record(2024, "Barley"), record(2024, "Wheat")],
        )];
        let second = store.commit(&first, staged, first.commodity_codes.clone()).unwrap();
        drop(staging);

        assert_eq!(second.generation, 2);
        assert_eq!(second.total_rows, 3);
        assert_eq!(second.partitions[&2023], first.partitions[&2023]);
        assert_eq!(
            fs::read(store.partition_path(&second.partitions[&2023])).unwrap(),
            untouched_2023
        );
        assert!(!store.partition_path(&first.partitions[&2024]).exists());
        assert_eq!(store.load_manifest().unwrap(), second);

        let commodities: Vec<_> = store
            .records(&second)
            .map(|r| r.unwrap().key.commodity)
            .collect();
        assert_eq!(commodities, vec!["Wheat", "Barley", "Wheat"]);
    }

    #[test]
    fn orphan_cleanup_keeps_referenced_files() {
        let dir = tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path());
        store.ensure_layout().unwrap();
        let staging = store.create_staging(Uuid::new_v4()).unwrap();
        let staged = vec![stage(&staging, 2024, &[record(2024, "Wheat")])];
        let manifest = store.commit(&Manifest::default(), staged, BTreeMap::new()).unwrap();
        drop(staging);

        let stray = dir.path().join("partitions/2024/prices-000009.csv");
        fs::write(&stray, "half written").unwrap();
        fs::create_dir_all(dir.path().join("staging/dead-run")).unwrap();
        fs::write(dir.path().join(".manifest.json.x.tmp"), "{").unwrap();

        let removed = store.remove_orphans(&manifest).unwrap();
        assert_eq!(removed, 3);
        assert!(!stray.exists());
        assert!(store.partition_path(&manifest.partitions[&2024]).exists());
    }

    #[test]
    fn staging_area_is_removed_on_drop() {
        let dir = tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path());
        let staging = store.create_staging(Uuid::new_v4()).unwrap();
        let path = staging.dir().to_path_buf();
        fs::write(staging.path_for(2024, "csv"), "partial").unwrap();
        drop(staging);
        assert!(!path.exists());
    }

    #[test]
    fn staged_partition_reads_back_through_its_entry() {
        let dir = tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path());
        let staging = store.create_staging(Uuid::new_v4()).unwrap();
        let first = staging.fresh_path(2024, "csv");
        let second = staging.fresh_path(2024, "csv");
        assert_ne!(first, second);

        let mut staged = stage(&staging, 2024, &[record(2024, "Wheat")]);
        fs::rename(&staged.csv_path, &first).unwrap();
        staged.csv_path = first;
        let entry = store.staged_entry(&staged).unwrap();
        assert!(entry.file.starts_with("staging/"), "{}", entry.file);
        assert!(entry.matches(&staged.stats));

        let rows: Vec<_> = store
            .open_partition(&entry)
            .unwrap()
            .map(|r| r.unwrap().key.commodity)
            .collect();
        assert_eq!(rows, vec!["Wheat"]);
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        write_atomic(&path, b"{\"v\":1}").unwrap();
        write_atomic(&path, b"{\"v\":2}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"v\":2}");
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
