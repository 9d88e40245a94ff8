//! Read-only views of an archive: `status` and `verify`.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use mandi_storage::{verify_partition, ArchiveStore, Manifest, PartitionEntry, StoreError};
use serde::Serialize;
use tracing::{info, warn};

use crate::outcome::RunStatus;
use crate::state::RunState;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveStatus {
    pub archive_dir: PathBuf,
    pub generation: u64,
    pub committed_at: Option<DateTime<Utc>>,
    pub total_rows: u64,
    pub partitions: usize,
    pub latest_arrival_date: Option<NaiveDate>,
    pub commodity_codes: usize,
    pub last_run_id: Option<uuid::Uuid>,
    pub last_status: Option<RunStatus>,
    pub last_exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub hours_since_success: Option<f64>,
    /// True when no run has succeeded within the allowed age.
    pub stale: bool,
    pub locked: bool,
}

/// Summarizes the manifest and run state. A missing archive reads as empty.
pub fn archive_status(
    store: &ArchiveStore,
    max_age_hours: Option<f64>,
    now: DateTime<Utc>,
) -> Result<ArchiveStatus, StoreError> {
    let manifest = store.load_manifest()?;
    let state = RunState::load(&store.run_state_path())?;
    let hours_since_success = state.hours_since_success(now);
    let stale = match (max_age_hours, hours_since_success) {
        (Some(limit), Some(hours)) => hours > limit,
        (Some(_), None) => true,
        (None, _) => false,
    };
    Ok(ArchiveStatus {
        archive_dir: store.root().to_path_buf(),
        generation: manifest.generation,
        committed_at: manifest.committed_at,
        total_rows: manifest.total_rows,
        partitions: manifest.partitions.len(),
        latest_arrival_date: manifest.latest_arrival_date(),
        commodity_codes: manifest.commodity_codes.len(),
        last_run_id: state.last_run_id,
        last_status: state.last_status,
        last_exit_code: state.last_exit_code,
        last_error: state.last_error,
        last_success_at: state.last_success_at,
        hours_since_success,
        stale,
        locked: store.lock_path().exists(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionCheck {
    pub year: i32,
    pub file: String,
    pub rows: u64,
    pub problems: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub generation: u64,
    pub total_rows: u64,
    pub partitions: Vec<PartitionCheck>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.partitions.iter().all(|p| p.problems.is_empty())
    }

    pub fn problem_count(&self) -> usize {
        self.partitions.iter().map(|p| p.problems.len()).sum()
    }
}

/// Re-reads every committed partition and checks it against the manifest:
/// content hash and size, row order and uniqueness, price ordering, the
/// partition year, and the archive-wide commodity code map.
///
/// Only a missing or unreadable manifest is an error; everything found in
/// the partitions is reported.
pub fn verify_archive(store: &ArchiveStore) -> Result<VerifyReport, StoreError> {
    let manifest = store.load_manifest()?;
    let mut partitions = Vec::with_capacity(manifest.partitions.len());
    let mut counted = 0u64;
    for (year, entry) in &manifest.partitions {
        let check = check_partition(store, &manifest, *year, entry);
        counted += check.rows;
        if check.problems.is_empty() {
            info!(year, rows = check.rows, "partition verified");
        } else {
            warn!(year, problems = ?check.problems, "partition failed verification");
        }
        partitions.push(check);
    }
    if counted != manifest.total_rows {
        if let Some(first) = partitions.first_mut() {
            first.problems.push(format!(
                "manifest total_rows {} but partitions hold {counted}",
                manifest.total_rows
            ));
        }
    }
    Ok(VerifyReport {
        generation: manifest.generation,
        total_rows: manifest.total_rows,
        partitions,
    })
}

fn check_partition(
    store: &ArchiveStore,
    manifest: &Manifest,
    year: i32,
    entry: &PartitionEntry,
) -> PartitionCheck {
    let path = store.partition_path(entry);
    let mut check = PartitionCheck {
        year,
        file: entry.file.clone(),
        rows: 0,
        problems: Vec::new(),
    };

    let stats = match verify_partition(&path) {
        Ok(stats) => stats,
        Err(err) => {
            check.problems.push(err.to_string());
            return check;
        }
    };
    check.rows = stats.rows;
    if !entry.matches(&stats) {
        check.problems.push(format!(
            "content differs from manifest (rows {} vs {}, bytes {} vs {})",
            stats.rows, entry.rows, stats.bytes, entry.bytes
        ));
    }
    if (stats.first_date, stats.last_date) != (entry.first_date, entry.last_date) {
        check
            .problems
            .push("date range differs from manifest".to_string());
    }

    let mut reader = match store.open_partition(entry) {
        Ok(reader) => reader,
        Err(err) => {
            check.problems.push(err.to_string());
            return check;
        }
    };
    loop {
        let record = match reader.next_record() {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(err) => {
                check.problems.push(err.to_string());
                break;
            }
        };
        if record.partition_year() != year {
            check.problems.push(format!(
                "line {}: {} belongs to partition {}",
                reader.line(),
                record.key,
                record.partition_year()
            ));
        }
        if let Some(code) = record.commodity_code {
            match manifest.commodity_codes.get(&code) {
                Some(name) if *name == record.key.commodity => {}
                Some(name) => check.problems.push(format!(
                    "line {}: code {code} is {name} in the manifest but {} here",
                    reader.line(),
                    record.key.commodity
                )),
                None => check.problems.push(format!(
                    "line {}: code {code} is missing from the manifest",
                    reader.line()
                )),
            }
        }
    }

    if let Some(mirror) = &entry.parquet {
        let mirror_path = store.root().join(&mirror.file);
        match std::fs::metadata(&mirror_path) {
            Ok(meta) if meta.len() == mirror.bytes => {}
            Ok(meta) => check.problems.push(format!(
                "parquet mirror is {} bytes, manifest says {}",
                meta.len(),
                mirror.bytes
            )),
            Err(err) => check
                .problems
                .push(format!("parquet mirror {}: {err}", mirror.file)),
        }
    }
    check
}
