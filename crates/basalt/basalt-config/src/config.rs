use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct BasaltConfig {
    #[serde(default = "defaults::segment_dir")]
    pub segment_dir: String,
    #[serde(default = "defaults::lock_dir")]
    pub lock_dir: String,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct QueueConfig {
    #[serde(default = "defaults::queue_key")]
    pub key: u32,
    #[serde(default = "defaults::queue_depth")]
    pub depth: u32,
    /// The message arena is sized to hold `depth` messages of this size.
    #[serde(default = "defaults::max_msg_size")]
    pub max_msg_size: u32,
    #[serde(default = "defaults::locking")]
    pub locking: bool,
    #[serde(default = "defaults::full_backoff_ms")]
    pub full_backoff_ms: u64,
    #[serde(default = "defaults::recv_wait_ms")]
    pub recv_wait_ms: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "defaults::cache_key")]
    pub key: u32,
    /// Total size for a cache this process creates. Leave unset to attach to
    /// an existing cache and adopt its size.
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default = "defaults::page_size")]
    pub page_size: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

mod defaults {
    pub fn segment_dir() -> String {
        "/dev/shm".into()
    }

    pub fn lock_dir() -> String {
        "/tmp".into()
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn queue_key() -> u32 {
        1335
    }

    pub fn queue_depth() -> u32 {
        32
    }

    pub fn max_msg_size() -> u32 {
        1 << 16 // 65536
    }

    pub fn locking() -> bool {
        true
    }

    pub fn full_backoff_ms() -> u64 {
        100
    }

    pub fn recv_wait_ms() -> u64 {
        50
    }

    pub fn cache_key() -> u32 {
        2209
    }

    pub fn page_size() -> u32 {
        1024
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            key: defaults::queue_key(),
            depth: defaults::queue_depth(),
            max_msg_size: defaults::max_msg_size(),
            locking: defaults::locking(),
            full_backoff_ms: defaults::full_backoff_ms(),
            recv_wait_ms: defaults::recv_wait_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key: defaults::cache_key(),
            size: None,
            page_size: defaults::page_size(),
        }
    }
}

impl QueueConfig {
    /// `depth * max_msg_size`, or `None` if that overflows.
    pub fn arena_size(&self) -> Option<u32> {
        self.depth.checked_mul(self.max_msg_size)
    }

    pub fn full_backoff(&self) -> Duration {
        Duration::from_millis(self.full_backoff_ms)
    }

    pub fn recv_wait(&self) -> Duration {
        Duration::from_millis(self.recv_wait_ms)
    }
}

impl BasaltConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_to_str)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: BasaltConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.queue.depth < 2 {
            return invalid(format!("queue.depth must be at least 2, got {}", self.queue.depth));
        }
        if self.queue.max_msg_size == 0 {
            return invalid("queue.max_msg_size must be non-zero".into());
        }
        if self.queue.arena_size().is_none() {
            return invalid(format!(
                "queue.depth * queue.max_msg_size overflows ({} * {})",
                self.queue.depth, self.queue.max_msg_size
            ));
        }
        if self.cache.page_size == 0 {
            return invalid("cache.page_size must be non-zero".into());
        }
        if self.cache.size == Some(0) {
            return invalid("cache.size must be non-zero when set".into());
        }
        Ok(())
    }
}
