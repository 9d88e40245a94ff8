//! Exclusive run lock over the archive.
//!
//! The lock is a file created with create-new semantics, so exactly one
//! process can hold it. Its body names the holder; a lock older than the
//! stale threshold is assumed to belong to a crashed run and is broken.
//!
//! There is no heartbeat: a run may hold the lock for at most the stale
//! threshold. [`RunLockGuard::ensure_held`] enforces that limit, and must be
//! called right before the holder publishes anything.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub run_id: Uuid,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    /// How long to keep retrying; zero means a single attempt.
    pub timeout: Duration,
    pub stale_after: Duration,
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            stale_after: Duration::from_secs(6 * 3600),
            poll_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("archive is locked by {}; waited {waited:?}", describe_holder(.holder))]
    Contended {
        holder: Option<LockHolder>,
        waited: Duration,
    },
    #[error("run lock was taken over by {}", describe_holder(.holder))]
    Lost { holder: Option<LockHolder> },
    #[error("run lock held for {held_for:?}, past the stale limit of {limit:?}")]
    Expired { held_for: Duration, limit: Duration },
    #[error("lock file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn describe_holder(holder: &Option<LockHolder>) -> String {
    match holder {
        Some(h) => format!("run {} (pid {}) since {}", h.run_id, h.pid, h.acquired_at.to_rfc3339()),
        None => "an unidentified run".to_string(),
    }
}

/// Held lock; the file is removed when the guard drops.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    holder: LockHolder,
    acquired: Instant,
    stale_after: Duration,
}

impl RunLockGuard {
    pub async fn acquire(
        path: impl Into<PathBuf>,
        run_id: Uuid,
        options: LockOptions,
    ) -> Result<Self, LockError> {
        let path = path.into();
        let started = Instant::now();
        loop {
            let holder = LockHolder {
                run_id,
                pid: std::process::id(),
                acquired_at: Utc::now(),
            };
            match try_create(&path, &holder) {
                Ok(()) => {
                    debug!(path = %path.display(), %run_id, "run lock acquired");
                    return Ok(Self {
                        path,
                        holder,
                        acquired: Instant::now(),
                        stale_after: options.stale_after,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(source) => {
                    return Err(LockError::Io {
                        path: path.display().to_string(),
                        source,
                    })
                }
            }

            let current = read_holder(&path);
            if lock_age(&path, current.as_ref()).is_some_and(|age| age >= options.stale_after) {
                if break_stale(&path, current.as_ref(), options.stale_after)? {
                    warn!(path = %path.display(), holder = ?current, "broke stale run lock");
                }
                continue;
            }

            let waited = started.elapsed();
            if waited >= options.timeout {
                return Err(LockError::Contended {
                    holder: current,
                    waited,
                });
            }
            let remaining = options.timeout - waited;
            tokio::time::sleep(options.poll_interval.min(remaining)).await;
        }
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    /// Fails if the lock file no longer names this run, or if the run has
    /// held it long enough for another process to consider it stale.
    pub fn ensure_held(&self) -> Result<(), LockError> {
        let held_for = self.acquired.elapsed();
        if held_for >= self.stale_after {
            return Err(LockError::Expired {
                held_for,
                limit: self.stale_after,
            });
        }
        match read_holder(&self.path) {
            Some(current) if current == self.holder => Ok(()),
            other => Err(LockError::Lost { holder: other }),
        }
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        match read_holder(&self.path) {
            Some(current) if current.run_id == self.holder.run_id => {
                if let Err(err) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %err, "failed to release run lock");
                } else {
                    debug!(path = %self.path.display(), "run lock released");
                }
            }
            other => {
                warn!(path = %self.path.display(), holder = ?other, "run lock no longer ours; leaving it");
            }
        }
    }
}

fn try_create(path: &Path, holder: &LockHolder) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let body = serde_json::to_vec(holder).map_err(std::io::Error::other)?;
    let written = file.write_all(&body).and_then(|()| file.sync_all());
    if let Err(err) = written {
        let _ = fs::remove_file(path);
        return Err(err);
    }
    Ok(())
}

fn read_holder(path: &Path) -> Option<LockHolder> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Age from the holder's own timestamp, falling back to file mtime when the
/// body is unreadable (e.g. a holder that died mid-write).
fn lock_age(path: &Path, holder: Option<&LockHolder>) -> Option<Duration> {
    if let Some(holder) = holder {
        return (Utc::now() - holder.acquired_at).to_std().ok();
    }
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Moves the lock aside under a unique name and removes it only if it is
/// still the stale lock observed by the caller. A lock that changed hands in
/// between is put back. Returns whether the stale lock was removed.
fn break_stale(
    path: &Path,
    observed: Option<&LockHolder>,
    stale_after: Duration,
) -> Result<bool, LockError> {
    let io_err = |source| LockError::Io {
        path: path.display().to_string(),
        source,
    };
    let tombstone = path.with_extension(format!("stale-{}", Uuid::new_v4()));
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(source) => return Err(io_err(source)),
    }

    let taken = read_holder(&tombstone);
    let is_observed = match (observed, taken.as_ref()) {
        (Some(seen), Some(taken)) => seen == taken,
        (None, None) => lock_age(&tombstone, None).is_some_and(|age| age >= stale_after),
        _ => false,
    };
    if is_observed {
        let _ = fs::remove_file(&tombstone);
        return Ok(true);
    }

    // Hard link keeps create-new semantics: never clobber a lock created
    // after the rename.
    match fs::hard_link(&tombstone, path) {
        Ok(()) => debug!(path = %path.display(), holder = ?taken, "live run lock restored"),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            warn!(path = %path.display(), holder = ?taken, "live run lock displaced by a newer lock");
        }
        Err(_) => {
            return fs::rename(&tombstone, path).map(|()| false).map_err(io_err);
        }
    }
    let _ = fs::remove_file(&tombstone);
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn second_acquire_fails_fast_while_held() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".run.lock");
        let first_id = Uuid::new_v4();
        let first = RunLockGuard::acquire(&path, first_id, LockOptions::default())
            .await
            .expect("first lock");

        let err = RunLockGuard::acquire(&path, Uuid::new_v4(), LockOptions::default())
            .await
            .unwrap_err();
        match err {
            LockError::Contended { holder, .. } => {
                assert_eq!(holder.map(|h| h.run_id), Some(first_id));
            }
            other => panic!("unexpected error: {other}"),
        }

        drop(first);
        assert!(!path.exists());
        RunLockGuard::acquire(&path, Uuid::new_v4(), LockOptions::default())
            .await
            .expect("lock free after release");
    }

    #[tokio::test]
    async fn waiting_acquire_succeeds_once_holder_releases() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".run.lock");
        let first = RunLockGuard::acquire(&path, Uuid::new_v4(), LockOptions::default())
            .await
            .expect("first lock");

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            drop(first);
        });

        let options = LockOptions {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(25),
            ..LockOptions::default()
        };
        let second = RunLockGuard::acquire(&path, Uuid::new_v4(), options).await;
        release.await.unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn stale_lock_is_broken() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".run.lock");
        let crashed = LockHolder {
            run_id: Uuid::new_v4(),
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(12),
        };
        fs::write(&path, serde_json::to_vec(&crashed).unwrap()).unwrap();

        let run_id = Uuid::new_v4();
        let guard = RunLockGuard::acquire(&path, run_id, LockOptions::default())
            .await
            .expect("stale lock broken");
        assert_eq!(guard.holder().run_id, run_id);
        assert_eq!(read_holder(&path).map(|h| h.run_id), Some(run_id));
    }

    #[tokio::test]
    async fn contenders_racing_on_one_stale_lock_do_not_both_win() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".run.lock");
        let crashed = LockHolder {
            run_id: Uuid::new_v4(),
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(12),
        };
        fs::write(&path, serde_json::to_vec(&crashed).unwrap()).unwrap();
        let stale_after = LockOptions::default().stale_after;

        // Both contenders read the same stale holder; the first one wins.
        let seen_by_late = read_holder(&path);
        let winner = RunLockGuard::acquire(&path, Uuid::new_v4(), LockOptions::default())
            .await
            .expect("first contender");

        let removed = break_stale(&path, seen_by_late.as_ref(), stale_after).unwrap();
        assert!(!removed);
        assert_eq!(read_holder(&path).as_ref(), Some(winner.holder()));
        let late = try_create(&path, &crashed);
        assert_eq!(late.unwrap_err().kind(), std::io::ErrorKind::AlreadyExists);
        winner.ensure_held().expect("winner still holds the lock");

        let err = RunLockGuard::acquire(&path, Uuid::new_v4(), LockOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Contended { .. }));
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn ensure_held_detects_takeover_and_expiry() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".run.lock");
        let guard = RunLockGuard::acquire(&path, Uuid::new_v4(), LockOptions::default())
            .await
            .expect("lock");
        guard.ensure_held().expect("fresh lock");

        let short = RunLockGuard {
            path: dir.path().join("other.lock"),
            holder: guard.holder().clone(),
            acquired: Instant::now(),
            stale_after: Duration::ZERO,
        };
        assert!(matches!(short.ensure_held(), Err(LockError::Expired { .. })));

        let intruder = LockHolder {
            run_id: Uuid::new_v4(),
            pid: 7,
            acquired_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_vec(&intruder).unwrap()).unwrap();
        match guard.ensure_held() {
            Err(LockError::Lost { holder }) => assert_eq!(holder, Some(intruder)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn guard_leaves_foreign_lock_alone() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".run.lock");
        let guard = RunLockGuard::acquire(&path, Uuid::new_v4(), LockOptions::default())
            .await
            .expect("lock");

        let other = LockHolder {
            run_id: Uuid::new_v4(),
            pid: 42,
            acquired_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_vec(&other).unwrap()).unwrap();
        drop(guard);
        assert_eq!(read_holder(&path), Some(other));
    }
}
