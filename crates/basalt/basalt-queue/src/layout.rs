//! Binary layout of a queue segment.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ header region (HEADER_REGION_SIZE bytes)                       │
//! │  ┌──────────────┬───────────────────────────────────────────┐  │
//! │  │ generation   │ JSON QueueHeader, space padded            │  │
//! │  │ (8 hex)      │                                           │  │
//! │  └──────────────┴───────────────────────────────────────────┘  │
//! ├────────────────────────────────────────────────────────────────┤
//! │ descriptor[0]  qidx │ offset │ msg_offset │ msg_len  (16 B)    │
//! │ descriptor[1]                                                  │
//! │ ...                                                            │
//! │ descriptor[queue_depth-1]                                      │
//! ├──────────────── padding to LAYOUT_ALIGN ───────────────────────┤
//! │ message arena (arena_size bytes, circular)                     │
//! ├──────────────── padding to LAYOUT_ALIGN ───────────────────────┤
//! └────────────────────────────────────────────────────────────────┘
//! ```

use basalt_core::codec::HEX_FIELD_LEN;
use basalt_core::{Result, ShmError, round_up};

/// Bytes reserved at offset 0 for the generation prefix and header body.
pub const HEADER_REGION_SIZE: usize = 1024;

/// Offset of the serialized header body inside the header region.
pub const HEADER_BODY_OFFSET: usize = HEX_FIELD_LEN;

/// Largest serialized header body that fits the region.
pub const HEADER_BODY_CAPACITY: usize = HEADER_REGION_SIZE - HEADER_BODY_OFFSET;

/// Size of one queue entry descriptor.
pub const DESCRIPTOR_SIZE: usize = 16;

/// Descriptor table and arena both start on this boundary.
pub const LAYOUT_ALIGN: u64 = 1024;

/// Shape of a queue segment. Two processes can share a queue only if they
/// agree on its geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueGeometry {
    queue_depth: u32,
    arena_size: u32,
}

impl QueueGeometry {
    /// Validates the geometry.
    ///
    /// `queue_depth` must be at least 2 because one slot is always left empty
    /// to tell a full ring from an empty one. The whole segment must stay
    /// addressable with 32-bit offsets.
    pub fn new(queue_depth: u32, arena_size: u32) -> Result<Self> {
        if queue_depth < 2 {
            return Err(ShmError::BadArgument(format!(
                "queue depth {queue_depth} is below the minimum of 2"
            )));
        }
        if arena_size == 0 {
            return Err(ShmError::BadArgument("message arena size must be non-zero".into()));
        }
        let geometry = Self {
            queue_depth,
            arena_size,
        };
        if geometry.shm_size() > u64::from(u32::MAX) {
            return Err(ShmError::BadArgument(format!(
                "queue of depth {queue_depth} with a {arena_size} byte arena exceeds 4 GiB"
            )));
        }
        Ok(geometry)
    }

    #[inline]
    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }

    #[inline]
    pub fn arena_size(&self) -> u32 {
        self.arena_size
    }

    /// Offset of the descriptor for slot `qidx`.
    #[inline]
    pub fn descriptor_offset(&self, qidx: u32) -> u32 {
        (HEADER_REGION_SIZE + qidx as usize * DESCRIPTOR_SIZE) as u32
    }

    /// Offset of the first arena byte.
    #[inline]
    pub fn arena_offset(&self) -> u64 {
        let table_end = HEADER_REGION_SIZE as u64 + u64::from(self.queue_depth) * DESCRIPTOR_SIZE as u64;
        round_up(table_end, LAYOUT_ALIGN)
    }

    /// Total bytes of the segment.
    #[inline]
    pub fn shm_size(&self) -> u64 {
        round_up(self.arena_offset() + u64::from(self.arena_size), LAYOUT_ALIGN)
    }
}
