//! Named-lock discipline (§4.4/§5): a lock is the presence of a file
//! created with `O_CREAT | O_EXCL` inside a table's `.tmp/` directory.
//! Acquiring blocks (with bounded exponential backoff) until the marker
//! can be created; releasing is an unlink. [`LockGuard`]'s `Drop`
//! guarantees the marker is unlinked on every exit path — including a
//! panic unwind — so a cancelled or failed mutation never leaves a stale
//! lock behind.

use crate::error::{InibaseError, Result};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_millis(2);
const MAX_DELAY: Duration = Duration::from_millis(100);
const MAX_ATTEMPTS: u32 = 50;

/// A held named lock. Dropping it unlinks the marker file.
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Block (with exponential backoff) until `key`'s marker under
    /// `tmp_dir` can be exclusively created.
    pub fn acquire(tmp_dir: &Path, key: &str) -> Result<Self> {
        let path = tmp_dir.join(format!("{key}.lock"));
        let mut delay = INITIAL_DELAY;

        for attempt in 0..MAX_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(LockGuard { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tracing::trace!(key, attempt, ?delay, "lock contended, backing off");
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(MAX_DELAY);
                }
                Err(e) => return Err(crate::error::io_at(path, e)),
            }
        }
        Err(InibaseError::LockTimeout {
            key: key.to_string(),
            attempts: MAX_ATTEMPTS,
        })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock marker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_blocks_until_first_drops() {
        let dir = tempfile::tempdir().unwrap();
        let guard = LockGuard::acquire(dir.path(), "users").unwrap();
        assert!(dir.path().join("users.lock").exists());
        drop(guard);
        assert!(!dir.path().join("users.lock").exists());

        // Now a fresh acquire should succeed immediately.
        let _guard2 = LockGuard::acquire(dir.path(), "users").unwrap();
    }

    #[test]
    fn contended_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let _held = LockGuard::acquire(dir.path(), "contended").unwrap();
        // A real contender would retry for ~2.5s total; we don't want the
        // test suite to pay that, so we just assert the marker exists and
        // that a manual create_new attempt fails, which is what acquire()
        // loops against.
        let result = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.path().join("contended.lock"));
        assert!(result.is_err());
    }
}
