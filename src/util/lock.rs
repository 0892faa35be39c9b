//! Run-lock preventing concurrent backup runs of the same site.
//!
//! The lock is a file created exclusively inside the staging directory.
//! It records its owner and an expiry, so a lock left behind by a crashed
//! run is taken over once it expired.

use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use derive_more::{Display, Error, From};
use uuid::Uuid;

/// File name of the run-lock inside the staging directory.
pub const LOCK_FILE: &str = ".backup.lock";

/// Content of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LockRecord {
    pub owner: Uuid,
    pub pid: u32,
    /// Unix timestamp in seconds.
    pub acquired_at: i64,
    /// Unix timestamp in seconds.
    pub expires_at: i64,
}

#[derive(Debug, Display, Error, From)]
/// Errors on acquiring the run-lock.
pub enum LockError {
    /// Another run holds the lock.
    #[display("Another backup run ({owner}) is in progress, its lock expires at unix time {expires_at}")]
    Held { owner: Uuid, expires_at: i64 },
    /// The lock changed hands while it was being taken over.
    #[display("The run-lock is contended")]
    Contended,
    #[from]
    #[display("Run-lock I/O failed: {_0}")]
    Io(io::Error),
    #[from]
    #[display("Writing the run-lock failed: {_0}")]
    Encode(serde_json::Error),
}

/// An acquired run-lock. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    record: LockRecord,
}

impl RunLock {
    /// Acquires the lock at `path` for at most `ttl`.
    pub fn acquire(path: &Path, ttl: Duration) -> Result<Self, LockError> {
        Self::acquire_at(path, ttl, Utc::now().timestamp())
    }

    pub fn acquire_at(path: &Path, ttl: Duration, now: i64) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let record = LockRecord {
            owner: Uuid::new_v4(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)),
        };

        // second attempt only after a stale lock was removed
        for _ in 0..2 {
            match File::create_new(path) {
                Ok(file) => {
                    serde_json::to_writer(&file, &record)?;
                    file.sync_all()?;
                    log::debug!(target: "util::lock", "Acquired run-lock {} as {}", path.display(), record.owner);
                    return Ok(Self {
                        path: path.to_path_buf(),
                        record,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match read_record(path) {
                    Some(held) if held.expires_at > now => {
                        return Err(LockError::Held {
                            owner: held.owner,
                            expires_at: held.expires_at,
                        });
                    }
                    stale => {
                        log::warn!(target: "util::lock", "Taking over stale run-lock {}: {stale:?}", path.display());
                        match fs::remove_file(path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == ErrorKind::NotFound => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }

        Err(LockError::Contended)
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // only remove the lock if nobody took it over meanwhile
        if read_record(&self.path).is_some_and(|held| held.owner == self.record.owner) {
            if let Err(e) = fs::remove_file(&self.path) {
                log::warn!(target: "util::lock", "Releasing run-lock {} failed: {e}", self.path.display());
            } else {
                log::debug!(target: "util::lock", "Released run-lock {}", self.path.display());
            }
        }
    }
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let content = fs::read(path).ok()?;
    serde_json::from_slice(&content).ok()
}
