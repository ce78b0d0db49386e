//! Header codec shared by the ring queue and the page cache.
//!
//! Both structures keep their metadata as a compact JSON body that carries its
//! own CRC-32. The checksum is computed over the body serialized with the
//! checksum field set to zero, so a reader can re-serialize what it decoded,
//! blank the field and compare.
//!
//! ```text
//! ring header region              catalog segment
//! ┌──────────┬──────────────┐     ┌──────────┬──────────┬──────────────┐
//! │ 8 hex    │ JSON body    │     │ 8 byte   │ 8 hex    │ JSON body    │
//! │ gen      │ ... padding  │     │ magic    │ body len │              │
//! └──────────┴──────────────┘     └──────────┴──────────┴──────────────┘
//! ```

use crate::error::{Result, ShmError};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Width of the ASCII hex fields used in segment headers.
pub const HEX_FIELD_LEN: usize = 8;

/// Size of a magic + length header.
pub const SEGMENT_HEADER_LEN: usize = 16;

/// A serializable body that embeds its own CRC-32.
pub trait Checksummed: Serialize + DeserializeOwned {
    fn checksum(&self) -> u32;
    fn set_checksum(&mut self, crc: u32);
}

/// Rounds `value` up to the next multiple of `unit`.
#[inline]
pub fn round_up(value: u64, unit: u64) -> u64 {
    debug_assert!(unit > 0);
    value.div_ceil(unit) * unit
}

fn to_json<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| ShmError::BadArgument(format!("{what} cannot be serialized: {e}")))
}

/// Stamps the checksum into `value` and returns its serialized bytes.
pub fn seal<T: Checksummed>(what: &'static str, value: &mut T) -> Result<Vec<u8>> {
    value.set_checksum(0);
    let blank = to_json(what, value)?;
    value.set_checksum(crc32fast::hash(&blank));
    to_json(what, value)
}

/// Decodes a sealed body and verifies its checksum.
///
/// Trailing space or NUL padding is ignored. A body that is nothing but
/// padding was never written and reports `NotFound`; anything else that fails
/// to decode or verify reports `Corrupt`.
pub fn unseal<T: Checksummed>(what: &'static str, bytes: &[u8]) -> Result<T> {
    let body = trim_padding(bytes);
    if body.is_empty() {
        return Err(ShmError::not_found(what));
    }

    let mut value: T =
        serde_json::from_slice(body).map_err(|e| ShmError::corrupt(what, e.to_string()))?;

    let stored = value.checksum();
    value.set_checksum(0);
    let blank = serde_json::to_vec(&value).map_err(|e| ShmError::corrupt(what, e.to_string()))?;
    let computed = crc32fast::hash(&blank);
    if stored != computed {
        return Err(ShmError::corrupt(
            what,
            format!("checksum {stored:08X} does not match computed {computed:08X}"),
        ));
    }

    value.set_checksum(stored);
    Ok(value)
}

fn trim_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == b' ' || b == 0)
}

/// Formats `value` as eight uppercase hex digits.
pub fn encode_hex_u32(value: u32) -> [u8; HEX_FIELD_LEN] {
    let mut out = [0u8; HEX_FIELD_LEN];
    out.copy_from_slice(format!("{value:08X}").as_bytes());
    out
}

/// Parses eight hex digits.
pub fn decode_hex_u32(what: &'static str, bytes: &[u8]) -> Result<u32> {
    if bytes.len() != HEX_FIELD_LEN {
        return Err(ShmError::corrupt(
            what,
            format!("expected {HEX_FIELD_LEN} hex digits, got {} bytes", bytes.len()),
        ));
    }
    let text = std::str::from_utf8(bytes).map_err(|e| ShmError::corrupt(what, e.to_string()))?;
    u32::from_str_radix(text, 16).map_err(|e| ShmError::corrupt(what, format!("'{text}': {e}")))
}

/// Reads the generation prefix of a header region.
///
/// Returns `None` for a region that has never been written.
pub fn decode_generation(bytes: &[u8]) -> Result<Option<u32>> {
    if is_blank(bytes) {
        return Ok(None);
    }
    decode_hex_u32("generation counter", bytes).map(Some)
}

/// Builds the 16-byte `magic + hex length` header placed in front of a body.
pub fn encode_segment_header(magic: &[u8; 8], body_len: usize) -> Result<[u8; SEGMENT_HEADER_LEN]> {
    let len = u32::try_from(body_len)
        .map_err(|_| ShmError::BadArgument(format!("body of {body_len} bytes is too large")))?;
    let mut out = [0u8; SEGMENT_HEADER_LEN];
    out[..8].copy_from_slice(magic);
    out[8..].copy_from_slice(&encode_hex_u32(len));
    Ok(out)
}

/// Parses a 16-byte segment header and returns the body length.
///
/// A wrong magic means there is no live object in the segment (`NotFound`).
pub fn decode_segment_header(what: &'static str, magic: &[u8; 8], bytes: &[u8]) -> Result<usize> {
    if bytes.len() < SEGMENT_HEADER_LEN || &bytes[..8] != magic {
        return Err(ShmError::not_found(what));
    }
    decode_hex_u32(what, &bytes[8..SEGMENT_HEADER_LEN]).map(|len| len as usize)
}

/// Serde adapter storing a `u32` as eight uppercase hex digits.
pub mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &u32, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{value:08X}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let text = String::deserialize(d)?;
        if text.len() != 8 {
            return Err(D::Error::custom(format!("'{text}' is not 8 hex digits")));
        }
        u32::from_str_radix(&text, 16).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Probe {
        in_ptr: u32,
        label: String,
        #[serde(with = "hex32")]
        crc32: u32,
    }

    impl Checksummed for Probe {
        fn checksum(&self) -> u32 {
            self.crc32
        }
        fn set_checksum(&mut self, crc: u32) {
            self.crc32 = crc;
        }
    }

    fn probe() -> Probe {
        Probe {
            in_ptr: 3,
            label: "queue".into(),
            crc32: 0,
        }
    }

    #[test]
    fn sealed_body_verifies() {
        let mut p = probe();
        let bytes = seal("probe", &mut p).unwrap();
        assert_ne!(p.crc32, 0);

        let mut padded = bytes.clone();
        padded.extend_from_slice(b"        ");
        let back: Probe = unseal("probe", &padded).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn flipped_value_byte_is_corrupt() {
        let mut p = probe();
        let mut bytes = seal("probe", &mut p).unwrap();
        let pos = bytes.iter().position(|&b| b == b'3').unwrap();
        bytes[pos] = b'7';

        let err = unseal::<Probe>("probe", &bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn flipped_structure_byte_is_corrupt() {
        let mut p = probe();
        let mut bytes = seal("probe", &mut p).unwrap();
        bytes[0] = b'[';

        let err = unseal::<Probe>("probe", &bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn blank_body_is_not_found() {
        let err = unseal::<Probe>("probe", &[0u8; 64]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn generation_prefix() {
        assert_eq!(decode_generation(&[0u8; 8]).unwrap(), None);
        assert_eq!(decode_generation(&encode_hex_u32(0x2A)).unwrap(), Some(0x2A));
        assert_eq!(&encode_hex_u32(0xBEEF), b"0000BEEF");
        assert_eq!(
            decode_generation(b"00ZZ0001").unwrap_err().kind(),
            ErrorKind::Corrupt
        );
    }

    #[test]
    fn segment_header() {
        let magic = b"TESTMAGC";
        let header = encode_segment_header(magic, 300).unwrap();
        assert_eq!(&header, b"TESTMAGC0000012C");
        assert_eq!(decode_segment_header("catalog", magic, &header).unwrap(), 300);

        let err = decode_segment_header("catalog", magic, &[b' '; 16]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn round_up_to_unit() {
        assert_eq!(round_up(0, 1024), 0);
        assert_eq!(round_up(1, 1024), 1024);
        assert_eq!(round_up(1024, 1024), 1024);
        assert_eq!(round_up(1500, 1024), 2048);
    }
}
