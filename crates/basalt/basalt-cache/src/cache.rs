//! Key/value cache over two shared-memory segments.
//!
//! The catalog segment (at the base key) holds the table of contents and page
//! bitmap; the data segment (at base key + `DATA_KEY_OFFSET`) holds the values,
//! each in a contiguous run of pages. Every operation reloads the catalog under
//! the instance lock, so changes made by other processes are always seen.

use crate::catalog::{CATALOG_MAGIC, CATALOG_MIN_SIZE, CacheEntry, Catalog};
use basalt_core::codec::{self, SEGMENT_HEADER_LEN};
use basalt_core::{ErrorKind, Result, ShmError, round_up};
use basalt_segment::{AdvisoryLock, Opened, Segment, SegmentKey, ShmNamespace};
use tracing::{debug, info, warn};

/// Distance between the catalog key and the data segment key.
pub const DATA_KEY_OFFSET: u32 = 4096;

pub const DEFAULT_PAGE_SIZE: u32 = 1024;

/// Data segment zeroing is done in chunks of this size.
pub const ZERO_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheMode {
    /// Create the cache at this size if it does not exist yet. An existing
    /// cache must have the same size.
    Manual { size: u64 },
    /// Adopt whatever cache exists at the key.
    Auto,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheOptions {
    pub mode: CacheMode,
    pub page_size: u32,
}

impl CacheOptions {
    pub fn manual(size: u64) -> Self {
        Self {
            mode: CacheMode::Manual { size },
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn auto() -> Self {
        Self {
            mode: CacheMode::Auto,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// `Some(size)` for manual mode, `None` for auto discovery.
    pub fn from_size(size: Option<u64>, page_size: u32) -> Self {
        match size {
            Some(size) => Self::manual(size),
            None => Self::auto(),
        }
        .with_page_size(page_size)
    }
}

pub struct ShmPageCache {
    lock: AdvisoryLock,
    store: Store,
}

struct Store {
    key: SegmentKey,
    mode: CacheMode,
    catalog_segment: Segment,
    data: Segment,
    catalog: Catalog,
}

impl ShmPageCache {
    /// Attach to the cache at `key`.
    ///
    /// Manual mode creates the cache if none exists (or the existing catalog
    /// is unreadable) and fails with `SizeMismatch` if one exists with another
    /// size or page size. Auto mode fails with `NotFound` if there is no cache
    /// and `SizeMismatch` if the page size differs.
    pub fn attach(namespace: &ShmNamespace, key: SegmentKey, options: CacheOptions) -> Result<Self> {
        if options.page_size == 0 {
            return Err(ShmError::BadArgument("page size must be non-zero".into()));
        }
        let requested_size = match options.mode {
            CacheMode::Manual { size: 0 } => {
                return Err(ShmError::BadArgument("manual cache size must be non-zero".into()));
            }
            CacheMode::Manual { size } => Some(round_up(size, u64::from(options.page_size))),
            CacheMode::Auto => None,
        };

        namespace.ensure_dirs()?;
        let lock = AdvisoryLock::open(namespace.lock_path(key))?;
        let guard = lock.exclusive()?;

        let catalog_path = namespace.segment_path(key);
        let data_path = namespace.segment_path(key.offset(DATA_KEY_OFFSET));

        let (mut catalog_segment, created) = match requested_size {
            Some(_) => {
                let (segment, opened) = Segment::create_or_open(
                    &catalog_path,
                    SEGMENT_HEADER_LEN as u64 + CATALOG_MIN_SIZE,
                )?;
                (segment, opened == Opened::Created)
            }
            None => (Segment::open(&catalog_path)?, false),
        };

        let (catalog, fresh) = match (read_catalog(&mut catalog_segment), requested_size) {
            (Ok(catalog), _) => {
                check_geometry(&catalog, requested_size, options.page_size)?;
                (catalog, false)
            }
            (Err(e), Some(size)) if e.kind() == ErrorKind::NotFound => {
                debug!(key = %key, "no catalog found, creating one");
                (Catalog::new(size, options.page_size)?, true)
            }
            (Err(e), Some(size)) if e.kind() == ErrorKind::Corrupt => {
                warn!(key = %key, error = %e, "cache catalog is corrupt, re-initializing");
                (Catalog::new(size, options.page_size)?, true)
            }
            (Err(e), _) => return Err(e),
        };

        let (mut data, _) = Segment::create_or_open(&data_path, catalog.cache_size())?;
        if (data.len() as u64) < catalog.cache_size() {
            if requested_size.is_none() {
                return Err(ShmError::SizeMismatch {
                    what: "cache data segment size",
                    expected: catalog.cache_size(),
                    found: data.len() as u64,
                });
            }
            data.grow(catalog.cache_size())?;
        }

        let mut store = Store {
            key,
            mode: options.mode,
            catalog_segment,
            data,
            catalog,
        };
        if fresh {
            store.write_catalog()?;
        }
        drop(guard);

        info!(
            key = %key,
            path = %catalog_path.display(),
            size = store.catalog.cache_size(),
            page_size = store.catalog.page_size(),
            entries = store.catalog.len(),
            created,
            "attached to cache"
        );
        Ok(Self { lock, store })
    }

    pub fn key(&self) -> SegmentKey {
        self.store.key
    }

    pub fn mode(&self) -> CacheMode {
        self.store.mode
    }

    /// Total bytes of the data segment managed by the catalog.
    pub fn data_size(&self) -> u64 {
        self.store.catalog.cache_size()
    }

    pub fn page_size(&self) -> u32 {
        self.store.catalog.page_size()
    }

    pub fn offset_to_page(&self, offset: u64) -> u64 {
        offset / u64::from(self.page_size())
    }

    pub fn page_to_offset(&self, page: u64) -> u64 {
        page * u64::from(self.page_size())
    }

    /// Reserve room for up to `max_size` bytes under `key`.
    ///
    /// Idempotent for the same page count; an existing key with a different
    /// page count is a `SizeMismatch`.
    pub fn allocate_key(&mut self, key: &str, max_size: u64) -> Result<()> {
        let _guard = self.lock.exclusive()?;
        let store = &mut self.store;
        store.reload()?;

        if let Some(existing) = store.catalog.get(key) {
            let wanted = store.catalog.pages_for(max_size);
            if u64::from(existing.page_count) != wanted {
                return Err(ShmError::SizeMismatch {
                    what: "cache entry page count",
                    expected: wanted,
                    found: u64::from(existing.page_count),
                });
            }
            return Ok(());
        }

        let saved = store.catalog.clone();
        let entry = store.catalog.allocate(key, max_size)?;
        if let Err(e) = store.write_catalog() {
            store.catalog = saved;
            return Err(e);
        }
        debug!(key, pages = entry.page_count, offset = entry.dcache_offset, "reserved cache entry");
        Ok(())
    }

    /// Store `value` under `key`, reserving pages on first write.
    ///
    /// A value larger than the existing reservation is rejected and the old
    /// value stays readable.
    pub fn put_key(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let _guard = self.lock.exclusive()?;
        let store = &mut self.store;
        store.reload()?;

        let saved = store.catalog.clone();
        let len = value.len() as u64;
        let entry = match store.catalog.get(key) {
            Some(entry) => {
                let reserved = entry.capacity(store.catalog.page_size());
                if len > reserved {
                    return Err(ShmError::ValueTooLarge {
                        key: key.to_string(),
                        len: value.len(),
                        reserved: reserved as usize,
                    });
                }
                entry.clone()
            }
            None => store.catalog.allocate(key, len)?,
        };

        let result = store
            .data
            .write(entry.dcache_offset as usize, value)
            .and_then(|()| {
                if let Some(e) = store.catalog.get_mut(key) {
                    e.value_len = len;
                }
                store.write_catalog()
            });
        if result.is_err() {
            store.catalog = saved;
        }
        result
    }

    /// The value stored under `key`, exactly as long as it was written.
    pub fn read_key_value(&mut self, key: &str) -> Result<Vec<u8>> {
        let _guard = self.lock.shared()?;
        let store = &mut self.store;
        store.reload()?;

        let entry = store
            .catalog
            .get(key)
            .ok_or_else(|| ShmError::KeyNotFound(key.to_string()))?;
        Ok(store
            .data
            .read(entry.dcache_offset as usize, entry.value_len as usize)?
            .to_vec())
    }

    /// Drop `key` and free its pages.
    pub fn remove_key(&mut self, key: &str) -> Result<CacheEntry> {
        let _guard = self.lock.exclusive()?;
        let store = &mut self.store;
        store.reload()?;

        let saved = store.catalog.clone();
        let entry = store
            .catalog
            .release(key)?
            .ok_or_else(|| ShmError::KeyNotFound(key.to_string()))?;
        if let Err(e) = store.write_catalog() {
            store.catalog = saved;
            return Err(e);
        }
        Ok(entry)
    }

    pub fn contains_key(&mut self, key: &str) -> Result<bool> {
        Ok(self.entry(key)?.is_some())
    }

    pub fn entry(&mut self, key: &str) -> Result<Option<CacheEntry>> {
        let _guard = self.lock.shared()?;
        self.store.reload()?;
        Ok(self.store.catalog.get(key).cloned())
    }

    /// All keys, sorted.
    pub fn keys(&mut self) -> Result<Vec<String>> {
        let _guard = self.lock.shared()?;
        self.store.reload()?;
        Ok(self.store.catalog.keys().map(str::to_string).collect())
    }

    pub fn free_pages(&mut self) -> Result<usize> {
        let _guard = self.lock.shared()?;
        self.store.reload()?;
        Ok(self.store.catalog.free_pages())
    }

    /// Forget every key. With `zero_data` the data segment is also wiped.
    pub fn clear_the_cache(&mut self, zero_data: bool) -> Result<()> {
        let _guard = self.lock.exclusive()?;
        self.store.reload()?;
        self.store.clear(zero_data)
    }

    /// Wipe the cache and remove both segments.
    ///
    /// A catalog that is corrupt or already blanked does not stop the delete:
    /// there is nothing to clear, so the data is zeroed and both segments are
    /// removed anyway. Other processes still attached are not told; their next
    /// operation fails with `InvalidState`.
    pub fn delete_cache(self) -> Result<()> {
        let ShmPageCache { lock, mut store } = self;
        let _guard = lock.exclusive()?;
        match store.reload() {
            Ok(()) => store.clear(true)?,
            Err(e) if matches!(e.kind(), ErrorKind::Corrupt | ErrorKind::InvalidState) => {
                warn!(key = %store.key, error = %e, "catalog unreadable, deleting cache without clearing it");
                store.zero_data()?;
            }
            Err(e) => return Err(e),
        }

        let Store {
            key,
            mut catalog_segment,
            data,
            ..
        } = store;
        catalog_segment.fill(0, catalog_segment.len(), b' ')?;
        catalog_segment.remove()?;
        data.remove()?;
        info!(key = %key, "deleted cache");
        Ok(())
    }

    pub fn close(self) {
        debug!(key = %self.store.key, "detached from cache");
    }
}

fn check_geometry(catalog: &Catalog, size: Option<u64>, page_size: u32) -> Result<()> {
    if catalog.page_size() != page_size {
        return Err(ShmError::SizeMismatch {
            what: "cache page size",
            expected: u64::from(page_size),
            found: u64::from(catalog.page_size()),
        });
    }
    match size {
        Some(size) if size != catalog.cache_size() => Err(ShmError::SizeMismatch {
            what: "cache size",
            expected: size,
            found: catalog.cache_size(),
        }),
        _ => Ok(()),
    }
}

/// Reads the catalog, remapping first if another process grew the segment.
fn read_catalog(segment: &mut Segment) -> Result<Catalog> {
    segment.refresh()?;
    let body_len = codec::decode_segment_header(
        "cache catalog",
        CATALOG_MAGIC,
        segment.read(0, SEGMENT_HEADER_LEN)?,
    )?;
    if SEGMENT_HEADER_LEN + body_len > segment.len() {
        return Err(ShmError::corrupt(
            "cache catalog",
            format!(
                "body of {body_len} bytes overruns the {} byte segment",
                segment.len()
            ),
        ));
    }
    Catalog::decode(segment.read(SEGMENT_HEADER_LEN, body_len)?)
}

impl Store {
    /// Picks up whatever other processes have written since the last call.
    fn reload(&mut self) -> Result<()> {
        let catalog = match read_catalog(&mut self.catalog_segment) {
            Ok(catalog) => catalog,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ShmError::InvalidState("cache was deleted while attached"));
            }
            Err(e) => return Err(e),
        };
        check_geometry(&catalog, Some(self.catalog.cache_size()), self.catalog.page_size())?;
        self.catalog = catalog;
        Ok(())
    }

    fn write_catalog(&mut self) -> Result<()> {
        let bytes = self.catalog.encode()?;
        let needed = Catalog::segment_size_for(bytes.len());
        if (self.catalog_segment.len() as u64) < needed {
            debug!(key = %self.key, from = self.catalog_segment.len(), to = needed, "growing catalog segment");
            self.catalog_segment.grow(needed)?;
        }
        self.catalog_segment.write(0, &bytes)
    }

    fn clear(&mut self, zero_data: bool) -> Result<()> {
        let saved = self.catalog.clone();
        self.catalog.clear();
        if let Err(e) = self.write_catalog() {
            self.catalog = saved;
            return Err(e);
        }
        if zero_data {
            self.zero_data()?;
        }
        Ok(())
    }

    fn zero_data(&mut self) -> Result<()> {
        let total = self.catalog.cache_size() as usize;
        let mut offset = 0;
        while offset < total {
            let chunk = ZERO_CHUNK_SIZE.min(total - offset);
            self.data.fill(offset, chunk, 0)?;
            offset += chunk;
        }
        Ok(())
    }
}
