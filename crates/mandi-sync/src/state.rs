//! `run_state.json`: what the last run did and where the next one starts.

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use mandi_storage::{write_atomic, StoreError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::outcome::{RunOutcome, RunStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub last_run_id: Option<Uuid>,
    pub last_status: Option<RunStatus>,
    pub last_exit_code: Option<i32>,
    pub last_finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// End of the newest window fetched by a successful run.
    pub last_success_window_end: Option<NaiveDate>,
    #[serde(default)]
    pub total_appended: u64,
    #[serde(default)]
    pub runs: u64,
}

impl RunState {
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(StoreError::io(format!("reading {}", path.display()), err)),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Manifest {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|source| StoreError::Manifest {
            path: path.display().to_string(),
            source,
        })?;
        write_atomic(path, &bytes)
    }

    pub fn record_success(&mut self, outcome: &RunOutcome) {
        self.record_attempt(outcome.run_id, outcome.status, outcome.exit_code, outcome.finished_at);
        self.last_error = None;
        self.last_success_at = Some(outcome.finished_at);
        if let Some(window) = outcome.window {
            self.last_success_window_end = Some(
                self.last_success_window_end
                    .map_or(window.end, |end| end.max(window.end)),
            );
        }
        self.total_appended += outcome.counts.appended as u64;
    }

    pub fn record_failure(&mut self, run_id: Uuid, exit_code: i32, error: String, at: DateTime<Utc>) {
        self.record_attempt(run_id, RunStatus::Failed, exit_code, at);
        self.last_error = Some(error);
    }

    fn record_attempt(&mut self, run_id: Uuid, status: RunStatus, exit_code: i32, at: DateTime<Utc>) {
        self.last_run_id = Some(run_id);
        self.last_status = Some(status);
        self.last_exit_code = Some(exit_code);
        self.last_finished_at = Some(at);
        self.runs += 1;
    }

    /// Hours since the last successful run, `None` if there never was one.
    pub fn hours_since_success(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_success_at
            .map(|at| (now - at).num_seconds().max(0) as f64 / 3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{QualitySummary, RunCounts};
    use mandi_core::DateWindow;
    use tempfile::tempdir;

    fn outcome(end: NaiveDate, appended: usize) -> RunOutcome {
        let now = Utc::now();
        RunOutcome {
            run_id: Uuid::new_v4(),
            source: "fixture".into(),
            status: RunStatus::Success,
            exit_code: 0,
            window: Some(DateWindow::trailing(end, 2)),
            started_at: now,
            finished_at: now,
            elapsed_ms: 1,
            counts: RunCounts {
                appended,
                ..RunCounts::default()
            },
            quality: QualitySummary::default(),
            partitions_rewritten: vec![],
            generation: 1,
            total_rows: appended as u64,
            error: None,
        }
    }

    #[test]
    fn missing_file_is_a_fresh_state() {
        let dir = tempdir().unwrap();
        let state = RunState::load(&dir.path().join("run_state.json")).unwrap();
        assert_eq!(state, RunState::default());
    }

    #[test]
    fn success_then_failure_keeps_last_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run_state.json");
        let june_2 = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();

        let mut state = RunState::default();
        state.record_success(&outcome(june_2, 5));
        state.record_failure(Uuid::new_v4(), 3, "upstream down".into(), Utc::now());
        state.save(&path).unwrap();

        let loaded = RunState::load(&path).unwrap();
        assert_eq!(loaded.last_status, Some(RunStatus::Failed));
        assert_eq!(loaded.last_exit_code, Some(3));
        assert_eq!(loaded.last_success_window_end, Some(june_2));
        assert_eq!(loaded.total_appended, 5);
        assert_eq!(loaded.runs, 2);
        assert!(loaded.hours_since_success(Utc::now()).is_some());
    }

    #[test]
    fn backfill_does_not_move_window_end_backwards() {
        let mut state = RunState::default();
        state.record_success(&outcome(NaiveDate::from_ymd_opt(2024, 6, 2).unwrap(), 1));
        state.record_success(&outcome(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(), 1));
        assert_eq!(
            state.last_success_window_end,
            NaiveDate::from_ymd_opt(2024, 6, 2)
        );
    }
}
