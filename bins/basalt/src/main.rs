use anyhow::{Context, Result, anyhow};
use basalt_cache::{CacheOptions, ShmPageCache};
use basalt_config::BasaltConfig;
use basalt_queue::{MsgChannel, PollBudget, QueueOptions, ShmRingQueue};
use basalt_segment::{SegmentKey, ShmNamespace};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "basalt")]
#[command(about = "Inspect and drive basalt shared-memory queues and caches")]
struct Args {
    /// Path to the TOML config file
    config: String,

    /// How long enqueue/dequeue may wait on a full or empty queue
    #[arg(long, default_value_t = 0)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append a message to the queue
    Enqueue { message: String },
    /// Take the oldest message off the queue
    Dequeue,
    /// Show queue occupancy and geometry
    QueueStatus,
    /// Reserve room for a cache key
    Reserve { key: String, bytes: u64 },
    /// Store a value under a cache key
    Put { key: String, value: String },
    /// Print the value stored under a cache key
    Get { key: String },
    /// List cache keys
    Keys,
    /// Drop a cache key and free its pages
    Remove { key: String },
    /// Forget every cache key
    Clear {
        /// Also overwrite the data segment with zeros
        #[arg(long)]
        zero: bool,
    },
    /// Wipe the cache and remove its segments
    DeleteCache,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = BasaltConfig::load(&args.config)
        .with_context(|| format!("loading config from '{}'", args.config))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let namespace = ShmNamespace::new(&config.segment_dir, &config.lock_dir);
    let budget = if args.timeout_ms == 0 {
        PollBudget::NoWait
    } else {
        PollBudget::timeout(Duration::from_millis(args.timeout_ms))
    };

    match args.command {
        Command::Enqueue { message } => {
            let mut channel = open_channel(&config, &namespace)?;
            channel.send(message.as_bytes(), budget).context("enqueue failed")?;
            tracing::info!(len = message.len(), "enqueued");
        }
        Command::Dequeue => {
            let mut channel = open_channel(&config, &namespace)?;
            let payload = channel.recv(budget).context("dequeue failed")?;
            println!("{}", String::from_utf8_lossy(&payload));
        }
        Command::QueueStatus => {
            let mut queue = open_queue(&config, &namespace)?;
            let geometry = queue.geometry();
            println!("path:     {}", queue.path().display());
            println!("depth:    {}", geometry.queue_depth());
            println!("arena:    {} bytes", geometry.arena_size());
            println!("segment:  {} bytes", geometry.shm_size());
            println!("messages: {}", queue.len()?);
            println!("full:     {}", queue.is_full()?);
        }
        Command::Reserve { key, bytes } => {
            open_cache(&config, &namespace)?
                .allocate_key(&key, bytes)
                .with_context(|| format!("reserving '{key}'"))?;
        }
        Command::Put { key, value } => {
            open_cache(&config, &namespace)?
                .put_key(&key, value.as_bytes())
                .with_context(|| format!("storing '{key}'"))?;
        }
        Command::Get { key } => {
            let value = open_cache(&config, &namespace)?
                .read_key_value(&key)
                .with_context(|| format!("reading '{key}'"))?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Command::Keys => {
            let mut cache = open_cache(&config, &namespace)?;
            for key in cache.keys()? {
                let entry = cache
                    .entry(&key)?
                    .ok_or_else(|| anyhow!("'{key}' vanished while listing"))?;
                println!(
                    "{key}\t{} bytes\t{} pages @ {}",
                    entry.value_len, entry.page_count, entry.dcache_offset
                );
            }
            println!("free pages: {}", cache.free_pages()?);
        }
        Command::Remove { key } => {
            open_cache(&config, &namespace)?
                .remove_key(&key)
                .with_context(|| format!("removing '{key}'"))?;
        }
        Command::Clear { zero } => {
            open_cache(&config, &namespace)?.clear_the_cache(zero)?;
        }
        Command::DeleteCache => {
            open_cache(&config, &namespace)?.delete_cache()?;
        }
    }
    Ok(())
}

fn open_queue(config: &BasaltConfig, namespace: &ShmNamespace) -> Result<ShmRingQueue> {
    let q = &config.queue;
    let arena = q
        .arena_size()
        .ok_or_else(|| anyhow!("queue arena size overflows"))?;
    let options = QueueOptions::new(q.depth, arena).with_locking(q.locking);
    ShmRingQueue::attach(namespace, SegmentKey(q.key), options)
        .with_context(|| format!("attaching to queue {}", q.key))
}

fn open_channel(config: &BasaltConfig, namespace: &ShmNamespace) -> Result<MsgChannel> {
    let queue = open_queue(config, namespace)?;
    Ok(MsgChannel::new(queue).with_intervals(config.queue.full_backoff(), config.queue.recv_wait()))
}

fn open_cache(config: &BasaltConfig, namespace: &ShmNamespace) -> Result<ShmPageCache> {
    let c = &config.cache;
    let options = CacheOptions::from_size(c.size, c.page_size);
    ShmPageCache::attach(namespace, SegmentKey(c.key), options)
        .with_context(|| format!("attaching to cache {}", c.key))
}
