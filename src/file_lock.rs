//! Advisory cross-process file locks with a TTL.
//!
//! The lock is a small JSON file created with `create_new`. A holder that
//! crashed leaves the file behind; once `acquired_at + ttl` has passed, the
//! next contender renames it to a tombstone, checks the tombstone still holds
//! the expired token, and takes over. Acquisition busy-polls up to a timeout.
//! Timestamps come from the caller's [`Clock`].

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::context::Clock;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock {path} is held by {holder}")]
    Contended { path: PathBuf, holder: String },

    #[error("I/O error on lock file: {0}")]
    Io(#[from] std::io::Error),
}

/// Contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub owner: String,
    pub pid: u32,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl LockInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::seconds(self.ttl_secs.min(i64::MAX as u64) as i64);
        self.acquired_at + ttl <= now
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub ttl: Duration,
    /// Zero means a single attempt.
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            wait_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// RAII guard. Dropping it removes the lock file if this holder still owns it.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    token: String,
}

impl FileLock {
    /// Acquire `path`, polling until `options.wait_timeout` elapses.
    pub fn acquire(
        path: &Path,
        owner: &str,
        options: LockOptions,
        clock: &dyn Clock,
    ) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let deadline = Instant::now() + options.wait_timeout;

        loop {
            match Self::try_create(path, owner, options.ttl, clock.now()) {
                Ok(lock) => {
                    tracing::debug!(path = %path.display(), owner, "Lock acquired");
                    return Ok(lock);
                }
                Err(LockError::Contended { holder, .. }) => {
                    if Self::remove_if_stale(path, clock.now())? {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        tracing::info!(path = %path.display(), holder = %holder, "Lock contended");
                        return Err(LockError::Contended {
                            path: path.to_path_buf(),
                            holder,
                        });
                    }
                    std::thread::sleep(options.poll_interval);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read the current holder without acquiring. `None` if unlocked.
    pub fn inspect(path: &Path) -> Option<LockInfo> {
        let data = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&data).ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_create(
        path: &Path,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, LockError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = Self::inspect(path)
                    .map(|info| format!("{} (pid {})", info.owner, info.pid))
                    .unwrap_or_else(|| "unknown holder".to_string());
                return Err(LockError::Contended {
                    path: path.to_path_buf(),
                    holder,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let info = LockInfo {
            owner: owner.to_string(),
            pid: std::process::id(),
            token: Uuid::new_v4().to_string(),
            acquired_at: now,
            ttl_secs: ttl.as_secs().max(1),
        };
        let body = serde_json::to_vec(&info).map_err(std::io::Error::other)?;
        file.write_all(&body)?;
        file.sync_all()?;

        Ok(Self {
            path: path.to_path_buf(),
            token: info.token,
        })
    }

    /// Remove an expired (or unreadable and old) lock. Returns true if removed.
    fn remove_if_stale(path: &Path, now: DateTime<Utc>) -> Result<bool, LockError> {
        let observed = Self::inspect(path);
        let stale = match &observed {
            Some(info) => info.is_expired(now),
            // Half-written lock file: treat as stale once it is older than a few seconds.
            None => std::fs::metadata(path)
                .and_then(|m| m.modified())
                .map(|t| t.elapsed().unwrap_or_default() > Duration::from_secs(5))
                .unwrap_or(false),
        };
        if !stale {
            return Ok(false);
        }
        Self::retire(path, observed.as_ref().map(|info| info.token.as_str()))
    }

    /// Move the lock aside and delete it only if it is still the one judged
    /// stale. A lock created in between is put back.
    fn retire(path: &Path, stale_token: Option<&str>) -> Result<bool, LockError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "lock".to_string());
        let tombstone = path.with_file_name(format!("{name}.stale-{}", Uuid::new_v4()));
        match std::fs::rename(path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let captured = Self::inspect(&tombstone).map(|info| info.token);
        if captured.as_deref() == stale_token {
            std::fs::remove_file(&tombstone)?;
            tracing::warn!(path = %path.display(), "Removed stale lock");
            return Ok(true);
        }

        // A live holder's lock was captured; hand it back unless the path is taken again.
        match std::fs::hard_link(&tombstone, path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::warn!(path = %path.display(), "Live lock displaced during stale cleanup");
            }
            Err(e) => return Err(e.into()),
        }
        std::fs::remove_file(&tombstone)?;
        Ok(false)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let owned = Self::inspect(&self.path)
            .map(|info| info.token == self.token)
            .unwrap_or(false);
        if owned {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to release lock");
            }
        }
    }
}
