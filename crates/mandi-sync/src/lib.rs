//! Incremental update engine for the mandi price archive.
//!
//! A run fetches a window of rows from upstream, normalizes them, drops
//! rows the archive already has, folds the rest into the affected yearly
//! partitions and publishes the result with a single manifest swap.

pub mod compact;
pub mod config;
pub mod controller;
pub mod error;
pub mod inspect;
pub mod merge;
pub mod normalize;
pub mod outcome;
pub mod report;
pub mod state;

pub use compact::{stage_mirror, Compactor};
pub use config::{ConfigError, SyncConfig};
pub use controller::{CommitHook, NoopCommitHook, RunRequest, SyncPipeline};
pub use error::RunError;
pub use inspect::{archive_status, verify_archive, ArchiveStatus, PartitionCheck, VerifyReport};
pub use merge::{plan_merge, ArchiveIndex, CodeConflict, Collision, CollisionSource, MergePlan};
pub use normalize::{Normalizer, RejectReason, Rejection};
pub use outcome::{QualitySummary, QualityTally, RunCounts, RunOutcome, RunStatus};
pub use report::{report_daily_markdown, write_reports, RunAudit};
pub use state::RunState;

pub const CRATE_NAME: &str = "mandi-sync";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_name_is_stable() {
        assert_eq!(CRATE_NAME, "mandi-sync");
    }
}
