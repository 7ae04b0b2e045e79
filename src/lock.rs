// ABOUTME: Advisory filesystem lock bounding the host to one active sync
// ABOUTME: Stale or corrupt lock files are reclaimed; creation is a single exclusive open

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    /// Unix seconds when the lock was taken.
    pub timestamp: f64,
    pub hostname: String,
}

impl LockRecord {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            timestamp: unix_now(),
            hostname: crate::utils::hostname(),
        }
    }

    /// Time since the lock was taken. Saturates for unreadable timestamps.
    pub fn age(&self) -> Duration {
        self.checked_age().unwrap_or(Duration::MAX)
    }

    /// `None` when the timestamp is not a usable unix time.
    fn checked_age(&self) -> Option<Duration> {
        if !self.timestamp.is_finite() {
            return None;
        }
        Duration::try_from_secs_f64((unix_now() - self.timestamp).max(0.0)).ok()
    }
}

enum LockFileState {
    Absent,
    Held(LockRecord),
    Stale(LockRecord),
    Corrupt,
}

/// Cross-process mutual exclusion through a lock file.
///
/// Not owner-checked and not reentrant: whoever finds a fresh lock file
/// assumes its holder is legitimate, and `release` removes the file regardless
/// of who wrote it.
#[derive(Debug, Clone)]
pub struct SyncLock {
    path: PathBuf,
    stale_after: Duration,
}

impl SyncLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock, polling until `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout and never sleeps when `timeout` is zero.
    /// Errors when a stale or corrupt lock file cannot be removed.
    pub fn acquire(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create lock directory {:?}", parent))?;
            }
        }

        loop {
            if self.try_create()? {
                tracing::debug!("Acquired sync lock {:?}", self.path);
                return Ok(true);
            }

            let holder = match self.inspect() {
                LockFileState::Held(record) => Some(record),
                LockFileState::Stale(record) => {
                    tracing::warn!(
                        "Reclaiming stale sync lock held by pid {} on {} ({:?} old)",
                        record.pid,
                        record.hostname,
                        record.age()
                    );
                    self.remove_file()?;
                    None
                }
                LockFileState::Corrupt => {
                    tracing::warn!("Removing corrupt sync lock {:?}", self.path);
                    self.remove_file()?;
                    None
                }
                // Released between our create attempt and the read
                LockFileState::Absent => None,
            };
            if holder.is_none() && self.try_create()? {
                tracing::debug!("Acquired sync lock {:?}", self.path);
                return Ok(true);
            }

            if Instant::now() >= deadline {
                match holder {
                    Some(record) => tracing::info!(
                        "Sync lock held by pid {} on {} since {:.0}; giving up",
                        record.pid,
                        record.hostname,
                        record.timestamp
                    ),
                    None => tracing::info!("Sync lock {:?} still contended; giving up", self.path),
                }
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// Remove the lock file. Never fails; problems are logged.
    pub fn release(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Released sync lock {:?}", self.path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove sync lock {:?}: {}", self.path, e),
        }
    }

    /// Whether a fresh lock is held. Stale and corrupt files count as unlocked.
    pub fn is_locked(&self) -> bool {
        matches!(self.inspect(), LockFileState::Held(_))
    }

    /// The current holder, if the lock is held and fresh.
    pub fn lock_info(&self) -> Option<LockRecord> {
        match self.inspect() {
            LockFileState::Held(record) => Some(record),
            _ => None,
        }
    }

    /// Exclusive create closes the gap between "absent" and "written".
    fn try_create(&self) -> Result<bool> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create lock file {:?}", self.path))
            }
        };

        let record = serde_json::to_string(&LockRecord::current())
            .context("Failed to serialize lock record")?;
        if let Err(e) = file.write_all(record.as_bytes()).and_then(|_| file.sync_all()) {
            drop(file);
            if let Err(cleanup) = self.remove_file() {
                tracing::warn!("{:#}", cleanup);
            }
            return Err(e).with_context(|| format!("Failed to write lock file {:?}", self.path));
        }
        Ok(true)
    }

    fn inspect(&self) -> LockFileState {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return LockFileState::Absent,
            Err(_) => return LockFileState::Corrupt,
        };
        match serde_json::from_str::<LockRecord>(&contents) {
            Ok(record) => match record.checked_age() {
                Some(age) if age > self.stale_after => LockFileState::Stale(record),
                Some(_) => LockFileState::Held(record),
                None => LockFileState::Corrupt,
            },
            Err(_) if contents.is_empty() && self.is_fresh_file() => {
                // A concurrent acquirer created the file and has not written it yet
                LockFileState::Held(LockRecord {
                    pid: 0,
                    timestamp: unix_now(),
                    hostname: String::new(),
                })
            }
            Err(_) => LockFileState::Corrupt,
        }
    }

    fn is_fresh_file(&self) -> bool {
        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map(|age| age < Duration::from_secs(2))
            .unwrap_or(false)
    }

    /// A lock file that cannot be removed can never be reclaimed, so this errors.
    fn remove_file(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove lock file {:?}", self.path)),
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_in(dir: &TempDir) -> SyncLock {
        SyncLock::new(dir.path().join("sync.lock"), Duration::from_secs(3600))
    }

    #[test]
    fn test_acquire_writes_record() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        assert!(lock.acquire(Duration::ZERO).unwrap());

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(lock.path()).unwrap()).unwrap();
        assert_eq!(raw["pid"], std::process::id());
        assert!(raw["timestamp"].is_f64());
        assert!(raw["hostname"].is_string());

        let info = lock.lock_info().unwrap();
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        lock.release();
        assert!(lock.acquire(Duration::ZERO).unwrap());
        lock.release();
        lock.release();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_corrupt_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        fs::write(lock.path(), "{not-json").unwrap();

        assert!(!lock.is_locked());
        assert!(lock.lock_info().is_none());
        assert!(lock.acquire(Duration::ZERO).unwrap());
        assert!(lock.is_locked());
    }

    #[test]
    fn test_acquire_times_out_while_held() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        assert!(lock.acquire(Duration::ZERO).unwrap());

        let started = Instant::now();
        assert!(!lock.acquire(Duration::from_millis(300)).unwrap());
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_age_saturates_for_unusable_timestamps() {
        let record = LockRecord {
            pid: 1,
            timestamp: -1e300,
            hostname: "h".to_string(),
        };
        assert!(record.checked_age().is_none());
        assert_eq!(record.age(), Duration::MAX);

        let fresh = LockRecord::current();
        assert!(fresh.checked_age().unwrap() < Duration::from_secs(60));
    }
}
