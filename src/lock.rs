//! Single-instance locking.
//!
//! Two daemons scanning with the same configuration would both fire every
//! action. The lock is taken once at startup and held for the life of the
//! process; it is released when dropped.

use anyhow::{Context, Result, bail};
use fs4::fs_std::FileExt;
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_FILE_NAME: &str = "proximity.lock";

pub fn default_path() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_FILE_NAME)
}

/// Holds an exclusive advisory lock on the lock file.
pub struct InstanceLock {
    lock_file: File,
    lock_path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or another process
    /// already holds the lock.
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        // Not truncated before locking: the holder's pid stays readable.
        let mut lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path)
            .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;

        match lock_file.try_lock_exclusive() {
            Ok(true) => {}
            Ok(false) => bail!(
                "Another instance is already running (lock held at {})",
                lock_path.display()
            ),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to lock {}", lock_path.display())
                });
            }
        }

        lock_file.set_len(0)?;
        if let Err(err) = writeln!(lock_file, "{}", std::process::id()) {
            warn!("Failed to record pid in {}: {}", lock_path.display(), err);
        }
        debug!("Acquired instance lock at {}", lock_path.display());

        Ok(Self {
            lock_file,
            lock_path: lock_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // The file stays: unlinking it would let one process lock the old
        // inode while another creates and locks a new one.
        if let Err(e) = FileExt::unlock(&self.lock_file) {
            debug!("Failed to unlock {}: {}", self.lock_path.display(), e);
        }
    }
}
