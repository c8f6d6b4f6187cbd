use crate::Error;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A lock holder is expected to complete or fail well within this window.
/// Files older than it are treated as leftovers of a crashed process and
/// are reclaimed.
pub const STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// Advisory cross-node lock, realised as a file in the shared data
/// directory whose sole existence denotes possession. Released on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

#[derive(serde::Serialize)]
struct Owner<'a> {
    pid: u32,
    host: &'a str,
    time: chrono::DateTime<chrono::Utc>,
}

impl LockFile {
    /// Acquire the lock for `operation` (e.g. "fetch" or "rebuild") within
    /// `dir`. Fails with `Error::LockedByPeer` when another process holds a
    /// non-stale lock.
    pub fn acquire(dir: &Path, operation: &str) -> Result<LockFile, Error> {
        Self::acquire_with_stale_after(dir, operation, STALE_AFTER)
    }

    fn acquire_with_stale_after(
        dir: &Path,
        operation: &str,
        stale_after: Duration,
    ) -> Result<LockFile, Error> {
        let path = dir.join(format!("{operation}.lock"));

        // Reclaim a stale lock left by a crashed holder. Unlink is
        // best-effort: a concurrent reclaimer may get there first, and the
        // create-exclusive open below still decides the winner.
        if let Ok(meta) = std::fs::metadata(&path) {
            let age = meta
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .unwrap_or_default();
            if age > stale_after {
                tracing::warn!(path = %path.display(), ?age, "removing stale lock file");
                let _ = std::fs::remove_file(&path);
            }
        }

        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::LockedByPeer);
            }
            Err(err) => return Err(err.into()),
        };

        // Owner metadata is recorded for forensic value only; nothing reads
        // it back programmatically.
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        let owner = Owner {
            pid: std::process::id(),
            host: &host,
            time: chrono::Utc::now(),
        };
        if let Ok(payload) = serde_json::to_vec(&owner) {
            let _ = file.write_all(&payload);
        }

        tracing::debug!(path = %path.display(), "acquired lock");
        Ok(LockFile { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), %err, "failed to release lock file");
        }
    }
}
