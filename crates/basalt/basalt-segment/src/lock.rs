//! Advisory lock files.
//!
//! Every queue or cache instance has one lock file. Its contents are never
//! read; the file only exists so processes can `flock(2)` it, shared for
//! readers and exclusive for writers. The lock is released when the returned
//! guard is dropped.

use basalt_core::{Result, ShmError};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct LockFile {
    file: File,
    path: PathBuf,
}

/// The lock of one shared-memory instance. May be disabled, in which case
/// every acquisition succeeds immediately and nothing is serialized.
pub struct AdvisoryLock {
    inner: Option<LockFile>,
}

impl AdvisoryLock {
    /// Create the lock file read/write if needed, then keep it open read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .mode(0o666)
            .open(path)
            .map_err(|e| ShmError::io(format!("failed to create lock file '{}'", path.display()), e))?;

        let file = File::open(path)
            .map_err(|e| ShmError::io(format!("failed to open lock file '{}'", path.display()), e))?;

        Ok(Self {
            inner: Some(LockFile {
                file,
                path: path.to_path_buf(),
            }),
        })
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.as_ref().map(|l| l.path.as_path())
    }

    pub fn shared(&self) -> Result<LockGuard<'_>> {
        self.acquire(LockMode::Shared)
    }

    pub fn exclusive(&self) -> Result<LockGuard<'_>> {
        self.acquire(LockMode::Exclusive)
    }

    fn acquire(&self, mode: LockMode) -> Result<LockGuard<'_>> {
        let Some(lock) = &self.inner else {
            return Ok(LockGuard { lock: None, mode });
        };

        let op = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        };
        flock(&lock.file, op).map_err(|e| {
            ShmError::io(format!("failed to lock '{}' ({mode:?})", lock.path.display()), e)
        })?;

        Ok(LockGuard {
            lock: Some(lock),
            mode,
        })
    }
}

/// Holds the lock until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: Option<&'a LockFile>,
    mode: LockMode,
}

impl LockGuard<'_> {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock {
            if let Err(e) = flock(&lock.file, libc::LOCK_UN) {
                tracing::warn!(path = %lock.path.display(), error = %e, "failed to release lock");
            }
        }
    }
}

fn flock(file: &File, op: libc::c_int) -> io::Result<()> {
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
