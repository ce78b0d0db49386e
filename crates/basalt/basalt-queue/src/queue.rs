//! Multi-process FIFO of byte messages in one shared-memory segment.
//!
//! # Protocol
//!
//! Every mutation runs under the instance's exclusive lock:
//! 1. compare the generation prefix on the segment with the last one this
//!    handle saw; reload the header if another process has written since
//! 2. compute the new ring and arena state in memory
//! 3. write descriptor and payload bytes
//! 4. rewrite the header with the next generation
//!
//! If any write fails the in-memory state is rolled back before the lock is
//! released, so the segment still describes the last committed state.
//!
//! Cross-process visibility is only guaranteed while holding the lock. The
//! generation check is an optimistic "did anyone write since I last looked"
//! test, not a memory-ordering primitive.

use crate::entry::{Descriptor, QueueEntry};
use crate::header::QueueHeader;
use crate::layout::{DESCRIPTOR_SIZE, HEADER_BODY_CAPACITY, HEADER_BODY_OFFSET, HEADER_REGION_SIZE, QueueGeometry};
use crate::ring::advance;
use basalt_core::codec::{self, HEX_FIELD_LEN};
use basalt_core::{ErrorKind, Result, ShmError};
use basalt_segment::{AdvisoryLock, Opened, Segment, SegmentKey, ShmNamespace};
use std::path::Path;
use tracing::{debug, info, warn};

/// How to attach to a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueOptions {
    pub queue_depth: u32,
    pub arena_size: u32,
    /// Serialize access through the instance lock file. Only safe to turn off
    /// when a single process uses the queue.
    pub locking: bool,
}

impl QueueOptions {
    pub fn new(queue_depth: u32, arena_size: u32) -> Self {
        Self {
            queue_depth,
            arena_size,
            locking: true,
        }
    }

    pub fn with_locking(mut self, locking: bool) -> Self {
        self.locking = locking;
        self
    }
}

pub struct ShmRingQueue {
    lock: AdvisoryLock,
    ring: Ring,
}

/// Everything except the lock, so a held guard on `lock` does not block
/// mutable access to the ring.
struct Ring {
    key: SegmentKey,
    segment: Segment,
    geometry: QueueGeometry,
    header: QueueHeader,
    /// Last generation this handle read or wrote. `None` forces a reload.
    generation: Option<u32>,
}

impl ShmRingQueue {
    /// Attach to the queue at `key`, creating and initializing it if needed.
    ///
    /// An existing queue with a different depth or arena size is rejected with
    /// `SizeMismatch` and left untouched. An existing segment whose header is
    /// missing or corrupt is re-initialized empty.
    pub fn attach(namespace: &ShmNamespace, key: SegmentKey, options: QueueOptions) -> Result<Self> {
        let geometry = QueueGeometry::new(options.queue_depth, options.arena_size)?;
        namespace.ensure_dirs()?;

        let lock = if options.locking {
            AdvisoryLock::open(namespace.lock_path(key))?
        } else {
            AdvisoryLock::disabled()
        };
        // only the name: the directory can be arbitrarily long and the header
        // region is fixed
        let lock_filename = lock
            .path()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let guard = lock.exclusive()?;

        let path = namespace.segment_path(key);
        let (segment, opened) = Segment::create_or_open(&path, geometry.shm_size())?;
        if segment.len() as u64 != geometry.shm_size() {
            return Err(ShmError::SizeMismatch {
                what: "queue segment size",
                expected: geometry.shm_size(),
                found: segment.len() as u64,
            });
        }

        let mut ring = Ring {
            key,
            segment,
            geometry,
            header: QueueHeader::fresh(&geometry, lock_filename, options.locking),
            generation: None,
        };
        ring.load_or_init()?;
        drop(guard);

        info!(
            key = %key,
            path = %path.display(),
            depth = geometry.queue_depth(),
            arena = geometry.arena_size(),
            created = (opened == Opened::Created),
            "attached to queue"
        );
        Ok(Self { lock, ring })
    }

    pub fn key(&self) -> SegmentKey {
        self.ring.key
    }

    pub fn geometry(&self) -> QueueGeometry {
        self.ring.geometry
    }

    pub fn path(&self) -> &Path {
        self.ring.segment.path()
    }

    /// Header as of the last time this handle read or wrote it.
    pub fn cached_header(&self) -> &QueueHeader {
        &self.ring.header
    }

    /// Append `msg`.
    ///
    /// Fails with `QueueFull` when all usable slots are taken and `ArenaFull`
    /// when the arena has no room for the payload; in both cases nothing on
    /// the segment changes. A message larger than the whole arena is a
    /// `BadArgument` since it could never fit.
    pub fn enqueue(&mut self, msg: &[u8]) -> Result<()> {
        let len = u32::try_from(msg.len())
            .ok()
            .filter(|&len| len <= self.ring.geometry.arena_size())
            .ok_or_else(|| {
                ShmError::BadArgument(format!(
                    "message of {} bytes exceeds the {} byte arena",
                    msg.len(),
                    self.ring.geometry.arena_size()
                ))
            })?;

        let _guard = self.lock.exclusive()?;
        self.ring.enqueue(msg, len)
    }

    /// Take the oldest message. Fails with `Empty` if there is none.
    pub fn dequeue(&mut self) -> Result<QueueEntry> {
        let _guard = self.lock.exclusive()?;
        self.ring.dequeue()
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        let _guard = self.lock.shared()?;
        self.ring.sync()?;
        Ok(self.ring.header.is_empty())
    }

    pub fn is_full(&mut self) -> Result<bool> {
        let _guard = self.lock.shared()?;
        self.ring.sync()?;
        Ok(self.ring.header.is_full())
    }

    /// Number of messages waiting.
    pub fn len(&mut self) -> Result<u32> {
        let _guard = self.lock.shared()?;
        self.ring.sync()?;
        Ok(self.ring.header.len())
    }

    /// Whether another process has written the header since this handle last
    /// looked. Cheap: reads only the generation prefix.
    pub fn generation_changed(&self) -> Result<bool> {
        let _guard = self.lock.shared()?;
        self.ring.generation_changed()
    }

    /// Forget the last seen generation so the next operation reloads.
    pub fn reset_local_generation(&mut self) {
        self.ring.generation = None;
    }

    /// Discard every queued message and write a fresh, empty header.
    pub fn reinitialize(&mut self) -> Result<()> {
        let _guard = self.lock.exclusive()?;
        warn!(key = %self.ring.key, "re-initializing queue");
        self.ring.write_fresh_header()
    }

    /// Blank the header and remove the segment. Processes still attached keep
    /// their mapping but will see the queue as gone on their next operation.
    pub fn delete(self) -> Result<()> {
        let ShmRingQueue { lock, ring } = self;
        let _guard = lock.exclusive()?;
        let Ring { key, mut segment, .. } = ring;
        segment.fill(0, HEADER_REGION_SIZE, 0)?;
        segment.remove()?;
        info!(key = %key, "deleted queue");
        Ok(())
    }

    pub fn close(self) {
        debug!(key = %self.ring.key, "detached from queue");
    }
}

impl Ring {
    fn load_or_init(&mut self) -> Result<()> {
        match self.read_header() {
            Ok((generation, header)) => {
                header.check_geometry(&self.geometry)?;
                self.header = header;
                self.generation = Some(generation);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(key = %self.key, "initializing empty queue header");
                self.write_fresh_header()
            }
            Err(e) if e.kind() == ErrorKind::Corrupt => {
                warn!(key = %self.key, error = %e, "queue header is corrupt, re-initializing");
                self.write_fresh_header()
            }
            Err(e) => Err(e),
        }
    }

    fn write_fresh_header(&mut self) -> Result<()> {
        let fresh = QueueHeader::fresh(
            &self.geometry,
            self.header.lock_filename.clone(),
            self.header.locking,
        );
        let previous = std::mem::replace(&mut self.header, fresh);
        if let Err(e) = self.write_header() {
            self.header = previous;
            return Err(e);
        }
        Ok(())
    }

    fn stored_generation(&self) -> Result<Option<u32>> {
        codec::decode_generation(self.segment.read(0, HEX_FIELD_LEN)?)
    }

    fn generation_changed(&self) -> Result<bool> {
        Ok(self.stored_generation()? != self.generation)
    }

    /// Reads and validates the header on the segment.
    fn read_header(&self) -> Result<(u32, QueueHeader)> {
        let generation = self
            .stored_generation()?
            .ok_or_else(|| ShmError::not_found(format!("queue header for key {}", self.key)))?;
        let body = self.segment.read(HEADER_BODY_OFFSET, HEADER_BODY_CAPACITY)?;
        let header: QueueHeader = codec::unseal("queue header", body)?;
        header.validate()?;
        Ok((generation, header))
    }

    /// Reloads the header if another process has written since we last did.
    fn sync(&mut self) -> Result<()> {
        if !self.generation_changed()? {
            return Ok(());
        }
        let (generation, header) = self.read_header()?;
        header.check_geometry(&self.geometry)?;
        debug!(
            key = %self.key,
            from = ?self.generation,
            to = generation,
            "queue header changed, reloaded"
        );
        self.header = header;
        self.generation = Some(generation);
        Ok(())
    }

    /// Seals `self.header` and writes it with the next generation.
    fn write_header(&mut self) -> Result<()> {
        let body = codec::seal("queue header", &mut self.header)?;
        if body.len() > HEADER_BODY_CAPACITY {
            return Err(ShmError::BadArgument(format!(
                "queue header of {} bytes exceeds the {HEADER_BODY_CAPACITY} byte header region",
                body.len()
            )));
        }

        let current = self.stored_generation().ok().flatten().or(self.generation);
        let next = current.map_or(1, |g| g.wrapping_add(1));

        let mut region = vec![b' '; HEADER_REGION_SIZE];
        region[..HEX_FIELD_LEN].copy_from_slice(&codec::encode_hex_u32(next));
        region[HEADER_BODY_OFFSET..HEADER_BODY_OFFSET + body.len()].copy_from_slice(&body);
        self.segment.write(0, &region)?;

        self.generation = Some(next);
        Ok(())
    }

    fn enqueue(&mut self, msg: &[u8], len: u32) -> Result<()> {
        self.sync()?;
        if self.header.is_full() {
            return Err(ShmError::QueueFull);
        }

        let saved = self.header.clone();
        let result = self.try_enqueue(msg, len);
        if result.is_err() {
            self.header = saved;
        }
        result
    }

    fn try_enqueue(&mut self, msg: &[u8], len: u32) -> Result<()> {
        let mut arena = self.header.arena();
        let wrapped_before = arena.write < arena.read;
        let msg_offset = arena
            .reserve(len, self.header.is_empty())
            .ok_or(ShmError::ArenaFull {
                requested: msg.len(),
            })?;
        if !wrapped_before && arena.write < arena.read {
            debug!(key = %self.key, len, "message arena wrapped");
        }

        let qidx = self.header.in_ptr;
        let descriptor = Descriptor {
            qidx,
            offset: self.geometry.descriptor_offset(qidx),
            msg_offset,
            msg_len: len,
        };

        self.segment.write(descriptor.offset as usize, &descriptor.encode())?;
        let at = self.geometry.arena_offset() as usize + msg_offset as usize;
        self.segment.write(at, msg)?;

        self.header.set_arena(arena);
        self.header.in_ptr = advance(qidx, self.header.queue_depth);
        self.write_header()
    }

    fn dequeue(&mut self) -> Result<QueueEntry> {
        self.sync()?;
        if self.header.is_empty() {
            return Err(ShmError::Empty);
        }

        let qidx = self.header.out_ptr;
        let offset = self.geometry.descriptor_offset(qidx) as usize;
        let descriptor = Descriptor::decode(self.segment.read(offset, DESCRIPTOR_SIZE)?)?;
        descriptor.validate(qidx, &self.geometry)?;

        let at = self.geometry.arena_offset() as usize + descriptor.msg_offset as usize;
        let payload = self.segment.read(at, descriptor.msg_len as usize)?.to_vec();

        let saved = self.header.clone();
        let mut arena = self.header.arena();
        arena.release(descriptor.msg_offset, descriptor.msg_len);
        self.header.set_arena(arena);
        self.header.out_ptr = advance(qidx, self.header.queue_depth);

        if let Err(e) = self.write_header() {
            self.header = saved;
            return Err(e);
        }
        Ok(descriptor.into_entry(payload))
    }
}
