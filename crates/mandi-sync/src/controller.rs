//! The run controller: one locked run of fetch, normalize, merge, compact
//! and commit, streamed in bounded batches.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Instant;

use chrono::{DateTime, Days, NaiveDate, Utc};
use mandi_adapters::UpstreamSource;
use mandi_core::{india_today, DateWindow, PriceRecord};
use mandi_storage::{
    ArchiveStore, Manifest, RunLockGuard, StagedPartition, StagingArea, StoreError,
};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::compact::{remove_partial, stage_mirror, Compactor};
use crate::config::SyncConfig;
use crate::error::RunError;
use crate::merge::{plan_merge, ArchiveIndex, CodeConflict, Collision};
use crate::normalize::{Normalizer, Rejection};
use crate::outcome::{QualitySummary, QualityTally, RunCounts, RunOutcome, RunStatus};
use crate::report::{write_reports, RunAudit, REJECTION_DETAIL_LIMIT};
use crate::state::RunState;

/// Called with the verified staged partitions just before the manifest is
/// replaced; an error aborts the commit.
pub trait CommitHook: Send + Sync {
    fn before_commit(&self, staged: &[StagedPartition]) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct NoopCommitHook;

impl CommitHook for NoopCommitHook {
    fn before_commit(&self, _staged: &[StagedPartition]) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunRequest {
    /// Explicit arrival-date window; defaults to the lookback window after
    /// the last success.
    pub window: Option<DateWindow>,
}

impl RunRequest {
    pub fn window(window: DateWindow) -> Self {
        Self {
            window: Some(window),
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: ArchiveStore,
    source: Box<dyn UpstreamSource>,
    commit_hook: Box<dyn CommitHook>,
    today: Option<NaiveDate>,
}

/// Everything a successful locked run produced, before bookkeeping.
struct Completed {
    outcome: RunOutcome,
    collisions: Vec<Collision>,
    code_conflicts: Vec<CodeConflict>,
    rejections: Vec<Rejection>,
}

/// Run-wide totals folded in from each batch.
#[derive(Default)]
struct Totals {
    counts: RunCounts,
    quality: QualityTally,
    rejections_by_kind: BTreeMap<String, usize>,
    rejections: Vec<Rejection>,
    collisions: Vec<Collision>,
    code_conflicts: Vec<CodeConflict>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, source: Box<dyn UpstreamSource>) -> Self {
        let store = ArchiveStore::new(config.archive_dir.clone());
        Self {
            config,
            store,
            source,
            commit_hook: Box::<NoopCommitHook>::default(),
            today: None,
        }
    }

    /// Pipeline against the configured upstream API.
    pub fn from_config(config: SyncConfig) -> Result<Self, RunError> {
        let source = config.data_gov_source()?;
        Ok(Self::new(config, Box::new(source)))
    }

    pub fn with_commit_hook(mut self, hook: Box<dyn CommitHook>) -> Self {
        self.commit_hook = hook;
        self
    }

    /// Pins "today" (India time by default) for window defaults and the
    /// future-date check.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn store(&self) -> &ArchiveStore {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(india_today)
    }

    /// Runs the pipeline once under the archive lock.
    ///
    /// The archive is mutated at most once, by the final manifest swap.
    /// Dropping the returned future before that point leaves the archive
    /// untouched: the staging directory and the lock are released on drop.
    pub async fn run_once(&self, request: RunRequest) -> Result<RunOutcome, RunError> {
        self.run_until(request, std::future::pending()).await
    }

    /// Like [`SyncPipeline::run_once`], but abandons the run with
    /// [`RunError::Cancelled`] once `shutdown` resolves. The manifest swap
    /// itself has no await point, so a cancelled run never half-commits.
    pub async fn run_until<F>(&self, request: RunRequest, shutdown: F) -> Result<RunOutcome, RunError>
    where
        F: Future<Output = ()>,
    {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source = self.source.source_id());
        self.run_locked(run_id, request, shutdown).instrument(span).await
    }

    async fn run_locked<F>(
        &self,
        run_id: Uuid,
        request: RunRequest,
        shutdown: F,
    ) -> Result<RunOutcome, RunError>
    where
        F: Future<Output = ()>,
    {
        let started_at = Utc::now();
        let clock = Instant::now();
        tokio::pin!(shutdown);

        let lock = tokio::select! {
            lock = RunLockGuard::acquire(self.store.lock_path(), run_id, self.config.lock) => lock?,
            () = &mut shutdown => {
                warn!("shutdown requested while waiting for the run lock");
                return Err(RunError::Cancelled);
            }
        };
        debug!("run lock held");

        let result = tokio::select! {
            result = self.execute(run_id, request, started_at, clock, &lock) => result,
            () = &mut shutdown => {
                warn!("shutdown requested; run abandoned before commit");
                Err(RunError::Cancelled)
            }
        };

        match result {
            Ok(completed) => {
                self.record_success(&completed).await;
                Ok(completed.outcome)
            }
            Err(err) => {
                error!(error = %err, exit_code = err.exit_code(), "run failed");
                self.record_failure(run_id, started_at, clock, &err).await;
                Err(err)
            }
        }
    }

    fn resolve_window(
        &self,
        request: &RunRequest,
        state: &RunState,
        manifest: &Manifest,
    ) -> Option<DateWindow> {
        if let Some(window) = request.window {
            return Some(window);
        }
        if !self.source.is_windowed() {
            return None;
        }
        let today = self.today();
        let anchor = state
            .last_success_window_end
            .or_else(|| manifest.latest_arrival_date())
            .unwrap_or(today)
            .min(today);
        let start = anchor
            .checked_sub_days(Days::new(self.config.lookback_days))
            .unwrap_or(anchor);
        Some(DateWindow { start, end: today })
    }

    /// Streams the source in batches. Each batch is normalized, checked
    /// against the archive plus everything staged so far, and folded into
    /// per-year staged partitions; the manifest is replaced once at the end.
    async fn execute(
        &self,
        run_id: Uuid,
        request: RunRequest,
        started_at: DateTime<Utc>,
        clock: Instant,
        lock: &RunLockGuard,
    ) -> Result<Completed, RunError> {
        self.store.ensure_layout()?;
        let manifest = self.store.load_manifest()?;
        self.store.remove_orphans(&manifest)?;
        let state = RunState::load(&self.store.run_state_path())?;

        let window = self.resolve_window(&request, &state, &manifest);
        info!(window = ?window.map(|w| w.to_string()), generation = manifest.generation, "fetching");
        let mut batches = self.source.stream(window, self.config.batch_rows).await?;

        let normalizer = Normalizer::new(self.today());
        let staging = self.store.create_staging(run_id)?;
        // The committed manifest with already-staged years pointing at their
        // staged files.
        let mut working = manifest.clone();
        let mut staged: BTreeMap<i32, StagedPartition> = BTreeMap::new();
        let mut totals = Totals::default();
        let mut batch_no = 0usize;

        while let Some(raw) = batches.next_batch().await? {
            batch_no += 1;
            totals.counts.fetched += raw.len();
            let mut accepted: Vec<PriceRecord> = Vec::with_capacity(raw.len());
            for result in normalizer.normalize_all(&raw) {
                match result {
                    Ok(record) => accepted.push(record),
                    Err(rejection) => {
                        debug!(origin = %rejection.origin, reason = %rejection.reason, "row rejected");
                        totals.counts.rejected += 1;
                        *totals
                            .rejections_by_kind
                            .entry(rejection.reason.kind().to_string())
                            .or_default() += 1;
                        if totals.rejections.len() < REJECTION_DETAIL_LIMIT {
                            totals.rejections.push(rejection);
                        }
                    }
                }
            }
            drop(raw);
            totals.counts.accepted += accepted.len();
            totals.quality.extend(&accepted);

            let index = match DateWindow::spanning(accepted.iter().map(PriceRecord::arrival_date)) {
                Some(span) => ArchiveIndex::load(&self.store, &working, span)?,
                None => ArchiveIndex::default(),
            };
            let plan = plan_merge(&index, &working.commodity_codes, accepted);
            drop(index);

            for collision in &plan.collisions {
                warn!(key = %collision.key, against = ?collision.against, "key collision; stored value kept");
            }
            for conflict in &plan.code_conflicts {
                warn!(conflict = ?conflict, "commodity code conflict; record skipped");
            }
            let appended = plan.appended();
            totals.counts.duplicates += plan.duplicates;
            totals.counts.appended += appended;
            totals.collisions.extend(plan.collisions);
            totals.code_conflicts.extend(plan.code_conflicts);
            working.commodity_codes = plan.commodity_codes;

            self.stage_additions(&staging, &mut working, &mut staged, plan.additions)
                .await?;
            debug!(batch = batch_no, appended, fetched = totals.counts.fetched, "batch staged");
        }

        let Totals {
            mut counts,
            quality,
            rejections_by_kind,
            rejections,
            collisions,
            code_conflicts,
        } = totals;
        counts.collisions = collisions.len();
        counts.code_conflicts = code_conflicts.len();

        if counts.rejected > 0 {
            warn!(rejected = counts.rejected, fetched = counts.fetched, by_kind = ?rejections_by_kind, "rows rejected");
        }
        if counts.fetched > 0 {
            let ratio = counts.rejected as f64 / counts.fetched as f64;
            if ratio > self.config.max_reject_ratio {
                return Err(RunError::ValidationThreshold {
                    rejected: counts.rejected,
                    fetched: counts.fetched,
                    ratio,
                    limit: self.config.max_reject_ratio,
                });
            }
        }

        let partitions_rewritten: Vec<i32> = staged.keys().copied().collect();
        let committed = if staged.is_empty() {
            info!("nothing new to append; archive left untouched");
            manifest
        } else {
            self.commit_staged(&staging, &manifest, staged, working.commodity_codes, lock)
                .await?
        };
        drop(staging);

        let quality = quality.summary(rejections_by_kind);
        let status = RunStatus::for_counts(&counts);
        let finished_at = Utc::now();
        let outcome = RunOutcome {
            run_id,
            source: self.source.source_id().to_string(),
            status,
            exit_code: 0,
            window: window.or(DateWindow::spanning(
                quality.first_date.into_iter().chain(quality.last_date),
            )),
            started_at,
            finished_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
            counts,
            quality,
            partitions_rewritten,
            generation: committed.generation,
            total_rows: committed.total_rows,
            error: None,
        };
        info!(
            status = ?outcome.status,
            batches = batch_no,
            fetched = counts.fetched,
            accepted = counts.accepted,
            rejected = counts.rejected,
            duplicates = counts.duplicates,
            collisions = counts.collisions,
            appended = counts.appended,
            total_rows = outcome.total_rows,
            elapsed_ms = outcome.elapsed_ms,
            "run complete"
        );
        Ok(Completed {
            outcome,
            collisions,
            code_conflicts,
            rejections,
        })
    }

    /// Rewrites every year a batch touched into a fresh staged file and
    /// points `working` at it. The file it replaces, if staged earlier in
    /// this run, is deleted.
    async fn stage_additions(
        &self,
        staging: &StagingArea,
        working: &mut Manifest,
        staged: &mut BTreeMap<i32, StagedPartition>,
        additions: BTreeMap<i32, Vec<PriceRecord>>,
    ) -> Result<(), RunError> {
        for (year, rows) in additions {
            let next = Compactor::new(&self.store, working, staging).compact(year, &rows)?;
            working.partitions.insert(year, self.store.staged_entry(&next)?);
            if let Some(previous) = staged.insert(year, next) {
                remove_partial(&previous.csv_path)?;
            }
            // Cancellation point between partition rewrites.
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn commit_staged(
        &self,
        staging: &StagingArea,
        manifest: &Manifest,
        staged: BTreeMap<i32, StagedPartition>,
        commodity_codes: BTreeMap<u32, String>,
        lock: &RunLockGuard,
    ) -> Result<Manifest, RunError> {
        let mut ready = Vec::with_capacity(staged.len());
        for part in staged.into_values() {
            ready.push(if self.config.parquet_mirror {
                stage_mirror(staging, part)?
            } else {
                part
            });
            tokio::task::yield_now().await;
        }

        self.commit_hook.before_commit(&ready)?;
        // The lock has no heartbeat; past its stale age another run may
        // have broken it.
        lock.ensure_held()?;
        Ok(self.store.commit(manifest, ready, commodity_codes)?)
    }

    async fn record_success(&self, completed: &Completed) {
        let state_path = self.store.run_state_path();
        let saved = RunState::load(&state_path).and_then(|mut state| {
            state.record_success(&completed.outcome);
            state.save(&state_path)
        });
        if let Err(err) = saved {
            warn!(error = %err, "could not update run state");
        }

        let audit = RunAudit {
            collisions: &completed.collisions,
            code_conflicts: &completed.code_conflicts,
            rejections: &completed.rejections,
        };
        match write_reports(&self.store.reports_dir(), &completed.outcome, &audit).await {
            Ok(dir) => debug!(dir = %dir.display(), "run reports written"),
            Err(err) => warn!(error = %format!("{err:#}"), "could not write run reports"),
        }
    }

    async fn record_failure(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        clock: Instant,
        err: &RunError,
    ) {
        let finished_at = Utc::now();
        // Nothing was committed, so the outcome reports the archive as it
        // stands.
        let current = self.store.load_manifest().unwrap_or_else(|load_err| {
            warn!(error = %load_err, "could not read manifest for the failure report");
            Manifest::default()
        });
        let state_path = self.store.run_state_path();
        let saved = RunState::load(&state_path).and_then(|mut state| {
            state.record_failure(run_id, err.exit_code(), err.to_string(), finished_at);
            state.save(&state_path)
        });
        if let Err(save_err) = saved {
            warn!(error = %save_err, "could not update run state");
        }

        let outcome = RunOutcome {
            run_id,
            source: self.source.source_id().to_string(),
            status: RunStatus::Failed,
            exit_code: err.exit_code(),
            window: None,
            started_at,
            finished_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
            counts: RunCounts::default(),
            quality: QualitySummary::default(),
            partitions_rewritten: Vec::new(),
            generation: current.generation,
            total_rows: current.total_rows,
            error: Some(err.to_string()),
        };
        if let Err(report_err) =
            write_reports(&self.store.reports_dir(), &outcome, &RunAudit::default()).await
        {
            warn!(error = %format!("{report_err:#}"), "could not write failure report");
        }
    }
}
