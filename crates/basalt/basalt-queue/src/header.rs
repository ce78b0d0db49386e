use crate::layout::{DESCRIPTOR_SIZE, QueueGeometry};
use crate::ring::{Arena, outstanding};
use basalt_core::codec::hex32;
use basalt_core::{Checksummed, Result, ShmError};
use serde::{Deserialize, Serialize};

/// Format version written into every header. Headers with another version
/// are treated as corrupt.
pub const QUEUE_VERSION: &str = "1.0";

/// Queue metadata stored at the front of the segment.
///
/// Every enqueue and dequeue rewrites it as a whole under the exclusive lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHeader {
    pub version: String,
    /// Next slot to fill.
    pub in_ptr: u32,
    /// Next slot to drain.
    pub out_ptr: u32,
    pub queue_depth: u32,
    pub shm_size: u64,
    pub entry_size: u32,
    /// Name of the lock file inside the lock directory, empty when unlocked.
    pub lock_filename: String,
    pub locking: bool,
    pub msg_arena_size: u32,
    pub msg_arena_in_ptr: u32,
    pub msg_arena_out_ptr: u32,
    #[serde(with = "hex32")]
    pub crc32: u32,
}

impl Checksummed for QueueHeader {
    fn checksum(&self) -> u32 {
        self.crc32
    }

    fn set_checksum(&mut self, crc: u32) {
        self.crc32 = crc;
    }
}

impl QueueHeader {
    /// Header of an empty ring.
    pub fn fresh(geometry: &QueueGeometry, lock_filename: String, locking: bool) -> Self {
        Self {
            version: QUEUE_VERSION.to_string(),
            in_ptr: 0,
            out_ptr: 0,
            queue_depth: geometry.queue_depth(),
            shm_size: geometry.shm_size(),
            entry_size: DESCRIPTOR_SIZE as u32,
            lock_filename,
            locking,
            msg_arena_size: geometry.arena_size(),
            msg_arena_in_ptr: 0,
            msg_arena_out_ptr: 0,
            crc32: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.in_ptr == self.out_ptr
    }

    /// One slot always stays unused, so a depth-N ring holds N-1 messages.
    #[inline]
    pub fn is_full(&self) -> bool {
        (self.in_ptr + 1) % self.queue_depth == self.out_ptr
    }

    #[inline]
    pub fn len(&self) -> u32 {
        outstanding(self.in_ptr, self.out_ptr, self.queue_depth)
    }

    pub(crate) fn arena(&self) -> Arena {
        Arena {
            size: self.msg_arena_size,
            write: self.msg_arena_in_ptr,
            read: self.msg_arena_out_ptr,
        }
    }

    pub(crate) fn set_arena(&mut self, arena: Arena) {
        self.msg_arena_in_ptr = arena.write;
        self.msg_arena_out_ptr = arena.read;
    }

    /// Fails with `SizeMismatch` if the header describes a different queue.
    pub fn check_geometry(&self, geometry: &QueueGeometry) -> Result<()> {
        let checks = [
            ("queue depth", u64::from(geometry.queue_depth()), u64::from(self.queue_depth)),
            ("message arena size", u64::from(geometry.arena_size()), u64::from(self.msg_arena_size)),
            ("queue segment size", geometry.shm_size(), self.shm_size),
        ];
        for (what, expected, found) in checks {
            if expected != found {
                return Err(ShmError::SizeMismatch {
                    what,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Structural checks on a header that passed its checksum.
    pub fn validate(&self) -> Result<()> {
        let bad = |detail: String| Err(ShmError::corrupt("queue header", detail));
        if self.version != QUEUE_VERSION {
            return bad(format!("unsupported version '{}'", self.version));
        }
        if self.entry_size as usize != DESCRIPTOR_SIZE {
            return bad(format!("entry size {} is not {DESCRIPTOR_SIZE}", self.entry_size));
        }
        if self.queue_depth < 2 || self.in_ptr >= self.queue_depth || self.out_ptr >= self.queue_depth {
            return bad(format!(
                "ring pointers in={} out={} invalid for depth {}",
                self.in_ptr, self.out_ptr, self.queue_depth
            ));
        }
        if self.msg_arena_in_ptr > self.msg_arena_size || self.msg_arena_out_ptr > self.msg_arena_size {
            return bad(format!(
                "arena pointers in={} out={} invalid for size {}",
                self.msg_arena_in_ptr, self.msg_arena_out_ptr, self.msg_arena_size
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_core::ErrorKind;
    use basalt_core::codec::{seal, unseal};

    fn header() -> QueueHeader {
        let g = QueueGeometry::new(4, 64).unwrap();
        QueueHeader::fresh(&g, "basalt.lock_1".into(), true)
    }

    #[test]
    fn body_uses_the_documented_field_names() {
        let mut h = header();
        let json = String::from_utf8(seal("queue header", &mut h).unwrap()).unwrap();
        for field in [
            "\"version\":\"1.0\"",
            "\"inPtr\":0",
            "\"outPtr\":0",
            "\"queueDepth\":4",
            "\"entrySize\":16",
            "\"locking\":true",
            "\"msgArenaSize\":64",
            "\"msgArenaInPtr\":0",
            "\"msgArenaOutPtr\":0",
        ] {
            assert!(json.contains(field), "{field} missing from {json}");
        }
        assert!(json.ends_with(&format!("\"crc32\":\"{:08X}\"}}", h.crc32)));
    }

    #[test]
    fn full_and_empty_do_not_collide() {
        let mut h = header();
        assert!(h.is_empty());
        assert!(!h.is_full());

        h.in_ptr = 3;
        assert_eq!(h.len(), 3);
        assert!(h.is_full());

        h.out_ptr = 2;
        h.in_ptr = 1;
        assert_eq!(h.len(), 3);
        assert!(h.is_full());
        assert!(!h.is_empty());
    }

    #[test]
    fn geometry_mismatch_is_reported() {
        let h = header();
        let other = QueueGeometry::new(8, 64).unwrap();
        let err = h.check_geometry(&other).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SizeMismatch);
        assert!(h.check_geometry(&QueueGeometry::new(4, 64).unwrap()).is_ok());
    }

    #[test]
    fn validate_rejects_wild_pointers() {
        let mut h = header();
        h.in_ptr = 4;
        assert_eq!(h.validate().unwrap_err().kind(), ErrorKind::Corrupt);

        let mut h = header();
        h.msg_arena_out_ptr = 65;
        assert_eq!(h.validate().unwrap_err().kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn sealed_header_round_trips() {
        let mut h = header();
        h.in_ptr = 2;
        h.msg_arena_in_ptr = 10;
        let bytes = seal("queue header", &mut h).unwrap();
        let back: QueueHeader = unseal("queue header", &bytes).unwrap();
        assert_eq!(back, h);
    }
}
