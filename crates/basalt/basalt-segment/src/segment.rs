//! File-backed shared-memory segments.
//!
//! A segment is a file (normally under `/dev/shm`) mapped `MAP_SHARED`, so
//! every process that maps the same file sees the same bytes. All access goes
//! through offset-checked `read`/`write` calls; an out-of-bounds offset comes
//! back as an error instead of touching memory outside the mapping.

use basalt_core::{Result, ShmError};
use memmap2::MmapMut;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Whether `Segment::create_or_open` found an existing segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opened {
    Created,
    Existing,
}

pub struct Segment {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
}

impl Segment {
    /// Open the segment at `path`, creating it zero-filled at `size_bytes` if
    /// it does not exist yet. An existing segment keeps its current length.
    pub fn create_or_open<P: AsRef<Path>>(path: P, size_bytes: u64) -> Result<(Self, Opened)> {
        let path = path.as_ref();
        if size_bytes == 0 {
            return Err(ShmError::BadArgument(format!(
                "segment '{}' must be larger than zero bytes",
                path.display()
            )));
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o666)
            .open(path)
            .map_err(|e| ShmError::io(format!("failed to open segment '{}'", path.display()), e))?;

        let current = file
            .metadata()
            .map_err(|e| ShmError::io(format!("failed to stat segment '{}'", path.display()), e))?
            .len();

        let opened = if current == 0 {
            file.set_len(size_bytes).map_err(|e| {
                ShmError::io(format!("failed to size segment '{}'", path.display()), e)
            })?;
            Opened::Created
        } else {
            Opened::Existing
        };

        let mmap = map(&file, path)?;
        Ok((
            Self {
                file,
                mmap,
                path: path.to_path_buf(),
            },
            opened,
        ))
    }

    /// Open an existing segment read-write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ShmError::not_found(format!("segment '{}'", path.display())));
            }
            Err(e) => {
                return Err(ShmError::io(
                    format!("failed to open segment '{}'", path.display()),
                    e,
                ));
            }
        };

        let len = file
            .metadata()
            .map_err(|e| ShmError::io(format!("failed to stat segment '{}'", path.display()), e))?
            .len();
        if len == 0 {
            return Err(ShmError::not_found(format!("segment '{}'", path.display())));
        }

        let mmap = map(&file, path)?;
        Ok(Self {
            file,
            mmap,
            path: path.to_path_buf(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.mmap.len() => Ok(()),
            _ => Err(ShmError::OutOfBounds {
                offset,
                len,
                size: self.mmap.len(),
            }),
        }
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        Ok(&self.mmap[offset..offset + len])
    }

    /// Copy `bytes` into the segment at `offset`.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check(offset, bytes.len())?;
        self.mmap[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Set `len` bytes starting at `offset` to `byte`.
    pub fn fill(&mut self, offset: usize, len: usize, byte: u8) -> Result<()> {
        self.check(offset, len)?;
        self.mmap[offset..offset + len].fill(byte);
        Ok(())
    }

    /// Extend the backing file to `new_len` bytes and remap. Never shrinks.
    pub fn grow(&mut self, new_len: u64) -> Result<()> {
        if new_len <= self.mmap.len() as u64 {
            return Ok(());
        }
        self.file.set_len(new_len).map_err(|e| {
            ShmError::io(format!("failed to grow segment '{}'", self.path.display()), e)
        })?;
        self.mmap = map(&self.file, &self.path)?;
        Ok(())
    }

    /// Remap if another process has grown the backing file.
    pub fn refresh(&mut self) -> Result<()> {
        let len = self
            .file
            .metadata()
            .map_err(|e| {
                ShmError::io(format!("failed to stat segment '{}'", self.path.display()), e)
            })?
            .len();
        if len > self.mmap.len() as u64 {
            self.mmap = map(&self.file, &self.path)?;
        }
        Ok(())
    }

    /// Unmap and delete the backing file. Other processes that still have it
    /// mapped keep their mapping until they detach. A file someone else has
    /// already unlinked counts as removed.
    pub fn remove(self) -> Result<()> {
        let Segment { file, mmap, path } = self;
        drop(mmap);
        drop(file);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ShmError::io(
                format!("failed to remove segment '{}'", path.display()),
                e,
            )),
        }
    }
}

fn map(file: &File, path: &Path) -> Result<MmapMut> {
    // SAFETY: the mapping is shared with other processes by design; every
    // access goes through the bounds-checked accessors above and cross-process
    // writers are serialized by the instance's advisory lock.
    unsafe { MmapMut::map_mut(file) }
        .map_err(|e| ShmError::io(format!("failed to map segment '{}'", path.display()), e))
}
