//! Slot index arithmetic and the circular message arena.
//!
//! Slots are plain modulo-`queue_depth` indices; depth is not required to be
//! a power of two. Payload bytes live in a separate circular arena with a
//! write cursor and a read cursor.
//!
//! # Arena allocation
//!
//! ```text
//! not wrapped (write >= read):  free = [write, size) then [0, read)
//!
//!     0        read              write          size
//!     │ reclaimed │ unread bytes   │   free      │
//!
//! wrapped (write < read):       free = [write, read)
//!
//!     0        write             read           size
//!     │ unread   │   free          │ unread      │
//! ```
//!
//! A request goes at `write` when it fits before the end, otherwise at 0 when
//! it fits before `read`. Both checks are strict against `read` so that
//! `write == read` only ever means "nothing unread". Space is reclaimed lazily:
//! a dequeue moves `read` to the end of the message it consumed.

/// Advances a slot index by one, wrapping at `depth`.
#[inline(always)]
pub fn advance(idx: u32, depth: u32) -> u32 {
    (idx + 1) % depth
}

/// Number of slots between `out_ptr` and `in_ptr`.
#[inline(always)]
pub fn outstanding(in_ptr: u32, out_ptr: u32, depth: u32) -> u32 {
    (in_ptr + depth - out_ptr) % depth
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Arena {
    pub size: u32,
    pub write: u32,
    pub read: u32,
}

impl Arena {
    /// Reserves `len` bytes and returns their arena offset.
    ///
    /// `queue_empty` lets the arena rewind both cursors to 0 once every
    /// message has been consumed.
    pub fn reserve(&mut self, len: u32, queue_empty: bool) -> Option<u32> {
        if queue_empty {
            self.write = 0;
            self.read = 0;
        }

        if self.write >= self.read {
            if u64::from(self.write) + u64::from(len) <= u64::from(self.size) {
                let at = self.write;
                self.write += len;
                return Some(at);
            }
            if len < self.read {
                self.write = len;
                return Some(0);
            }
            return None;
        }

        if u64::from(self.write) + u64::from(len) < u64::from(self.read) {
            let at = self.write;
            self.write += len;
            return Some(at);
        }
        None
    }

    /// Marks everything up to the end of a consumed message as free.
    #[inline]
    pub fn release(&mut self, msg_offset: u32, msg_len: u32) {
        self.read = msg_offset + msg_len;
    }
}
