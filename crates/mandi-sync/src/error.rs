use mandi_adapters::SourceError;
use mandi_storage::{LockError, StoreError};
use thiserror::Error;

use crate::config::ConfigError;

/// Run-level failure. Every variant aborts the run before the manifest is
/// replaced.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("fetch failed: {0}")]
    Fetch(#[from] SourceError),
    #[error(
        "rejected {rejected} of {fetched} fetched rows ({ratio:.3}), above the limit of {limit:.3}"
    )]
    ValidationThreshold {
        rejected: usize,
        fetched: usize,
        ratio: f64,
        limit: f64,
    },
    #[error("another run holds the archive: {0}")]
    LockContention(#[source] LockError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("run cancelled before commit")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<LockError> for RunError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Contended { .. } | LockError::Lost { .. } | LockError::Expired { .. } => {
                RunError::LockContention(err)
            }
            LockError::Io { path, source } => {
                RunError::Persistence(StoreError::io(format!("lock file {path}"), source))
            }
        }
    }
}

impl RunError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Config(_) | RunError::Other(_) => 1,
            RunError::Fetch(_) => 3,
            RunError::ValidationThreshold { .. } => 4,
            RunError::LockContention(_) => 5,
            RunError::Persistence(_) => 6,
            RunError::Cancelled => 7,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Config(_) => "config",
            RunError::Fetch(_) => "fetch",
            RunError::ValidationThreshold { .. } => "validation_threshold",
            RunError::LockContention(_) => "lock_contention",
            RunError::Persistence(_) => "persistence",
            RunError::Cancelled => "cancelled",
            RunError::Other(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn exit_codes_are_distinct_per_failure_class() {
        let contended = RunError::from(LockError::Contended {
            holder: None,
            waited: Duration::ZERO,
        });
        let lock_io = RunError::from(LockError::Io {
            path: "/archive/.run.lock".into(),
            source: std::io::Error::other("read-only"),
        });
        let threshold = RunError::ValidationThreshold {
            rejected: 9,
            fetched: 10,
            ratio: 0.9,
            limit: 0.5,
        };
        let fetch = RunError::from(SourceError::Upstream {
            message: "down".into(),
        });

        let expired = RunError::from(LockError::Expired {
            held_for: Duration::from_secs(7),
            limit: Duration::from_secs(5),
        });

        assert_eq!(contended.exit_code(), 5);
        assert_eq!(expired.exit_code(), 5);
        assert_eq!(lock_io.exit_code(), 6);
        assert_eq!(threshold.exit_code(), 4);
        assert_eq!(fetch.exit_code(), 3);
        assert_eq!(RunError::Cancelled.exit_code(), 7);
        assert_eq!(
            RunError::from(ConfigError::Missing { var: "MANDI_API_KEY" }).exit_code(),
            1
        );
        assert!(threshold.to_string().contains("0.900"));
    }
}
