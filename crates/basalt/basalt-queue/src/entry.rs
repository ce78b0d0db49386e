use crate::layout::{DESCRIPTOR_SIZE, QueueGeometry};
use basalt_core::{Result, ShmError};

/// A message taken off the queue together with the descriptor that located it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    /// Ring slot the message occupied.
    pub qidx: u32,
    /// Segment offset of the slot's descriptor.
    pub offset: u32,
    /// Offset of the payload inside the message arena.
    pub msg_offset: u32,
    pub msg_len: u32,
    pub payload: Vec<u8>,
}

/// Fixed-size slot record, four little-endian `u32`s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Descriptor {
    pub qidx: u32,
    pub offset: u32,
    pub msg_offset: u32,
    pub msg_len: u32,
}

impl Descriptor {
    pub fn encode(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut out = [0u8; DESCRIPTOR_SIZE];
        out[0..4].copy_from_slice(&self.qidx.to_le_bytes());
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.msg_offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.msg_len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let word = |i: usize| -> Result<u32> {
            bytes
                .get(i * 4..i * 4 + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
                .ok_or_else(|| {
                    ShmError::corrupt("queue descriptor", format!("{} bytes is too short", bytes.len()))
                })
        };
        Ok(Self {
            qidx: word(0)?,
            offset: word(1)?,
            msg_offset: word(2)?,
            msg_len: word(3)?,
        })
    }

    /// Checks that the descriptor read from slot `qidx` points where a
    /// descriptor for that slot must point.
    pub fn validate(&self, qidx: u32, geometry: &QueueGeometry) -> Result<()> {
        if self.qidx != qidx || self.offset != geometry.descriptor_offset(qidx) {
            return Err(ShmError::corrupt(
                "queue descriptor",
                format!(
                    "slot {qidx} holds descriptor for slot {} at offset {}",
                    self.qidx, self.offset
                ),
            ));
        }
        let end = u64::from(self.msg_offset) + u64::from(self.msg_len);
        if end > u64::from(geometry.arena_size()) {
            return Err(ShmError::corrupt(
                "queue descriptor",
                format!(
                    "message [{}, {end}) leaves the {} byte arena",
                    self.msg_offset,
                    geometry.arena_size()
                ),
            ));
        }
        Ok(())
    }

    pub fn into_entry(self, payload: Vec<u8>) -> QueueEntry {
        QueueEntry {
            qidx: self.qidx,
            offset: self.offset,
            msg_offset: self.msg_offset,
            msg_len: self.msg_len,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_core::ErrorKind;

    #[test]
    fn encodes_little_endian_words() {
        let d = Descriptor {
            qidx: 1,
            offset: 1040,
            msg_offset: 0x0102_0304,
            msg_len: 7,
        };
        let bytes = d.encode();
        assert_eq!(&bytes[8..12], &[4, 3, 2, 1]);
        assert_eq!(Descriptor::decode(&bytes).unwrap(), d);
        assert!(Descriptor::decode(&bytes[..12]).is_err());
    }

    #[test]
    fn validation_catches_misplaced_descriptors() {
        let g = QueueGeometry::new(4, 64).unwrap();
        let good = Descriptor {
            qidx: 2,
            offset: g.descriptor_offset(2),
            msg_offset: 60,
            msg_len: 4,
        };
        assert!(good.validate(2, &g).is_ok());
        assert_eq!(good.validate(1, &g).unwrap_err().kind(), ErrorKind::Corrupt);

        let overflow = Descriptor { msg_len: 5, ..good };
        assert_eq!(overflow.validate(2, &g).unwrap_err().kind(), ErrorKind::Corrupt);

        let zeroed = Descriptor::decode(&[0u8; DESCRIPTOR_SIZE]).unwrap();
        assert!(zeroed.validate(0, &g).is_err());
    }
}
