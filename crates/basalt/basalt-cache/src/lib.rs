mod cache;
mod catalog;

pub use cache::{CacheMode, CacheOptions, DATA_KEY_OFFSET, DEFAULT_PAGE_SIZE, ShmPageCache, ZERO_CHUNK_SIZE};
pub use catalog::{CATALOG_MAGIC, CATALOG_MIN_SIZE, CacheEntry, Catalog};
