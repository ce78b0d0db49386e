//! The cache catalog: table of contents plus page bitmap.
//!
//! The catalog lives in its own segment and is rewritten as a whole on every
//! mutation:
//!
//! ```text
//! ┌──────────┬──────────────┬───────────────────────────────┬───────────┐
//! │ magic    │ body length  │ JSON Catalog (crc32 sealed)   │ unused    │
//! │ 8 bytes  │ 8 hex        │                               │           │
//! └──────────┴──────────────┴───────────────────────────────┴───────────┘
//! 0          8              16
//! ```
//!
//! The segment starts at `SEGMENT_HEADER_LEN + CATALOG_MIN_SIZE` bytes and
//! grows in `CATALOG_MIN_SIZE` steps when the body outgrows it.

use basalt_bitmap::Bitmap;
use basalt_core::codec::{self, SEGMENT_HEADER_LEN, hex32};
use basalt_core::{Checksummed, Result, ShmError, round_up};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marks a live catalog. Anything else at offset 0 means "no cache here".
pub const CATALOG_MAGIC: &[u8; 8] = b"BSLTCTLG";

/// Catalog body capacity granularity.
pub const CATALOG_MIN_SIZE: u64 = 32 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    /// Byte offset of the first page in the data segment.
    pub dcache_offset: u64,
    pub page_count: u32,
    /// Length of the value currently stored.
    pub value_len: u64,
}

impl CacheEntry {
    /// Bytes reserved for this entry.
    #[inline]
    pub fn capacity(&self, page_size: u32) -> u64 {
        u64::from(self.page_count) * u64::from(page_size)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    cache_size: u64,
    page_size: u32,
    bitmap: Bitmap,
    toc: BTreeMap<String, CacheEntry>,
    #[serde(with = "hex32")]
    crc32: u32,
}

impl Checksummed for Catalog {
    fn checksum(&self) -> u32 {
        self.crc32
    }

    fn set_checksum(&mut self, crc: u32) {
        self.crc32 = crc;
    }
}

impl Catalog {
    /// An empty catalog for `cache_size` bytes, which must be a whole number
    /// of pages.
    pub fn new(cache_size: u64, page_size: u32) -> Result<Self> {
        if page_size == 0 || cache_size == 0 || cache_size % u64::from(page_size) != 0 {
            return Err(ShmError::BadArgument(format!(
                "cache of {cache_size} bytes is not a whole number of {page_size} byte pages"
            )));
        }
        let pages = usize::try_from(cache_size / u64::from(page_size))
            .map_err(|_| ShmError::BadArgument(format!("cache of {cache_size} bytes is too large")))?;
        Ok(Self {
            cache_size,
            page_size,
            bitmap: Bitmap::new(pages),
            toc: BTreeMap::new(),
            crc32: 0,
        })
    }

    #[inline]
    pub fn cache_size(&self) -> u64 {
        self.cache_size
    }

    #[inline]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    #[inline]
    pub fn num_pages(&self) -> usize {
        self.bitmap.capacity()
    }

    pub fn free_pages(&self) -> usize {
        self.bitmap.count_clear()
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.toc.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.toc.get_mut(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.toc.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.toc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.toc.is_empty()
    }

    /// Pages needed to hold `len` bytes. Even an empty value takes a page.
    pub fn pages_for(&self, len: u64) -> u64 {
        len.div_ceil(u64::from(self.page_size)).max(1)
    }

    /// Claims a run of pages big enough for `size` bytes and records `key`.
    pub fn allocate(&mut self, key: &str, size: u64) -> Result<CacheEntry> {
        let pages = self.pages_for(size);
        let (start, page_count) = u32::try_from(pages)
            .ok()
            .and_then(|n| self.bitmap.get_range(n as usize).map(|start| (start, n)))
            .ok_or(ShmError::NoSpace {
                pages: pages as usize,
            })?;

        let entry = CacheEntry {
            key: key.to_string(),
            dcache_offset: start as u64 * u64::from(self.page_size),
            page_count,
            value_len: 0,
        };
        self.toc.insert(key.to_string(), entry.clone());
        Ok(entry)
    }

    /// Drops `key` and frees its pages.
    pub fn release(&mut self, key: &str) -> Result<Option<CacheEntry>> {
        let Some(entry) = self.toc.remove(key) else {
            return Ok(None);
        };
        let first = (entry.dcache_offset / u64::from(self.page_size)) as usize;
        self.bitmap.clear_range(first, entry.page_count as usize)?;
        Ok(Some(entry))
    }

    pub fn clear(&mut self) {
        self.toc.clear();
        self.bitmap.reset();
    }

    /// Structural checks on a catalog that passed its checksum.
    pub fn validate(&self) -> Result<()> {
        let bad = |detail: String| Err(ShmError::corrupt("cache catalog", detail));
        let page = u64::from(self.page_size);
        if page == 0 || self.cache_size % page != 0 {
            return bad(format!(
                "cache size {} is not a multiple of page size {}",
                self.cache_size, self.page_size
            ));
        }
        if self.bitmap.capacity() as u64 != self.cache_size / page {
            return bad(format!(
                "bitmap tracks {} pages, cache has {}",
                self.bitmap.capacity(),
                self.cache_size / page
            ));
        }
        for (key, entry) in &self.toc {
            let capacity = entry.capacity(self.page_size);
            let in_bounds = entry.dcache_offset % page == 0
                && entry.page_count > 0
                && entry
                    .dcache_offset
                    .checked_add(capacity)
                    .is_some_and(|end| end <= self.cache_size)
                && entry.value_len <= capacity;
            if entry.key != *key || !in_bounds {
                return bad(format!("entry '{key}' is out of bounds: {entry:?}"));
            }
            let first = (entry.dcache_offset / page) as usize;
            for bit in first..first + entry.page_count as usize {
                if !self.bitmap.is_set(bit)? {
                    return bad(format!("page {bit} of '{key}' is not marked allocated"));
                }
            }
        }
        Ok(())
    }

    /// Seals the catalog and prefixes the segment header.
    pub fn encode(&mut self) -> Result<Vec<u8>> {
        let body = codec::seal("cache catalog", self)?;
        let header = codec::encode_segment_header(CATALOG_MAGIC, body.len())?;
        let mut out = Vec::with_capacity(SEGMENT_HEADER_LEN + body.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes and validates a catalog body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let catalog: Catalog = codec::unseal("cache catalog", body)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Catalog segment size needed for an encoded catalog of `encoded_len` bytes.
    pub fn segment_size_for(encoded_len: usize) -> u64 {
        let body = (encoded_len.saturating_sub(SEGMENT_HEADER_LEN)) as u64;
        SEGMENT_HEADER_LEN as u64 + round_up(body.max(1), CATALOG_MIN_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_core::ErrorKind;

    #[test]
    fn allocation_rounds_up_to_pages() {
        let mut c = Catalog::new(4 * 1024, 1024).unwrap();
        let x = c.allocate("x", 1500).unwrap();
        assert_eq!((x.dcache_offset, x.page_count), (0, 2));

        let empty = c.allocate("empty", 0).unwrap();
        assert_eq!((empty.dcache_offset, empty.page_count), (2048, 1));
        assert_eq!(c.free_pages(), 1);

        let err = c.allocate("y", 3000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Full);
        assert!(c.get("y").is_none());
    }

    #[test]
    fn release_frees_pages_for_reuse() {
        let mut c = Catalog::new(4 * 1024, 1024).unwrap();
        c.allocate("x", 1500).unwrap();
        assert!(c.allocate("y", 3000).is_err());

        let gone = c.release("x").unwrap().unwrap();
        assert_eq!(gone.page_count, 2);
        assert!(c.release("x").unwrap().is_none());

        let y = c.allocate("y", 3000).unwrap();
        assert_eq!((y.dcache_offset, y.page_count), (0, 3));
    }

    #[test]
    fn encoded_catalog_decodes() {
        let mut c = Catalog::new(8 * 1024, 1024).unwrap();
        c.allocate("alpha", 10).unwrap();
        c.get_mut("alpha").unwrap().value_len = 10;

        let bytes = c.encode().unwrap();
        assert_eq!(&bytes[..8], CATALOG_MAGIC);
        let len = codec::decode_segment_header("cache catalog", CATALOG_MAGIC, &bytes).unwrap();
        assert_eq!(len, bytes.len() - SEGMENT_HEADER_LEN);

        let back = Catalog::decode(&bytes[SEGMENT_HEADER_LEN..]).unwrap();
        assert_eq!(back, c);
        assert_eq!(back.keys().collect::<Vec<_>>(), vec!["alpha"]);
    }

    #[test]
    fn validate_catches_unmarked_pages() {
        let mut c = Catalog::new(4 * 1024, 1024).unwrap();
        c.allocate("x", 10).unwrap();
        c.bitmap.reset();
        assert_eq!(c.validate().unwrap_err().kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn rejects_partial_pages() {
        assert!(Catalog::new(1000, 1024).is_err());
        assert!(Catalog::new(1024, 0).is_err());
    }

    #[test]
    fn segment_grows_in_whole_units() {
        assert_eq!(Catalog::segment_size_for(100), 16 + CATALOG_MIN_SIZE);
        assert_eq!(
            Catalog::segment_size_for(16 + CATALOG_MIN_SIZE as usize + 1),
            16 + 2 * CATALOG_MIN_SIZE
        );
    }
}
