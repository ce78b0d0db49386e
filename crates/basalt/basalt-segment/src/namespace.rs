use basalt_core::{Result, ShmError};
use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of a shared-memory segment, stable across all processes.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SegmentKey(pub u32);

impl SegmentKey {
    /// The key `by` places after this one, used to derive companion segments.
    #[inline]
    pub fn offset(self, by: u32) -> Self {
        SegmentKey(self.0.wrapping_add(by))
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SegmentKey {
    fn from(value: u32) -> Self {
        SegmentKey(value)
    }
}

/// Where segments and lock files for a set of keys live.
///
/// Two handles see the same segment exactly when they use the same namespace
/// and key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShmNamespace {
    segment_dir: PathBuf,
    lock_dir: PathBuf,
}

impl ShmNamespace {
    pub fn new(segment_dir: impl Into<PathBuf>, lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            segment_dir: segment_dir.into(),
            lock_dir: lock_dir.into(),
        }
    }

    /// Segments and lock files side by side in one directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self::new(dir.clone(), dir)
    }

    pub fn segment_dir(&self) -> &Path {
        &self.segment_dir
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn segment_path(&self, key: SegmentKey) -> PathBuf {
        self.segment_dir.join(format!("basalt_{:08x}.shm", key.0))
    }

    pub fn lock_path(&self, key: SegmentKey) -> PathBuf {
        self.lock_dir.join(format!("basalt.lock_{}", key.0))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.segment_dir, &self.lock_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| ShmError::io(format!("failed to create '{}'", dir.display()), e))?;
        }
        Ok(())
    }
}

impl Default for ShmNamespace {
    fn default() -> Self {
        let shm = Path::new("/dev/shm");
        let segment_dir = if shm.is_dir() {
            shm.to_path_buf()
        } else {
            std::env::temp_dir()
        };
        Self::new(segment_dir, std::env::temp_dir())
    }
}
