mod config;

pub use config::{BasaltConfig, CacheConfig, ConfigError, QueueConfig};
