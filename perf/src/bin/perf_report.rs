//! One-shot latency report for the queue, the cache and the page bitmap.
//!
//! ```bash
//! cargo run --release -p basalt-perf --bin perf_report
//! ```
//!
//! Prints one table per subsystem and writes the same numbers as JSON to
//! `perf/results/<unix seconds>_report.json`.

use basalt_bitmap::Bitmap;
use basalt_cache::{CacheOptions, ShmPageCache};
use basalt_perf::{Latency, Usage, payload, print_latency_header, remove_namespace, size_label, temp_namespace, time_rounds};
use basalt_queue::{QueueOptions, ShmRingQueue};
use basalt_segment::SegmentKey;
use std::hint::black_box;
use std::time::{SystemTime, UNIX_EPOCH};

const ROUNDS: usize = 200;

fn main() {
    let start = Usage::now();
    let mut report = Vec::new();

    println!("basalt perf report ({} cpus)", std::thread::available_parallelism().map_or(0, |n| n.get()));
    queue_round_trips(&mut report);
    cache_put_get(&mut report);
    bitmap_first_fit(&mut report);

    let usage = Usage::now().since(&start);
    println!("\n== resources");
    println!("  peak rss        {} KiB", usage.max_rss_kib);
    println!("  minor faults    {}", usage.minor_faults);
    println!("  vol. switches   {}", usage.voluntary_switches);
    println!("  cpu user/sys    {:.3}s / {:.3}s", usage.user_us as f64 / 1e6, usage.system_us as f64 / 1e6);

    save(&report, &usage);
}

fn record(report: &mut Vec<Latency>, latency: Option<Latency>) {
    if let Some(latency) = latency {
        latency.print_row();
        report.push(latency);
    }
}

fn queue_round_trips(report: &mut Vec<Latency>) {
    println!("\n== queue: enqueue + dequeue");
    print_latency_header();

    for (size, locking) in [(64, true), (1024, true), (16 * 1024, true), (1024, false)] {
        let ns = temp_namespace(&format!("q_{size}_{locking}"));
        let opts = QueueOptions::new(64, 64 * 16 * 1024).with_locking(locking);
        let mut queue = match ShmRingQueue::attach(&ns, SegmentKey(1), opts) {
            Ok(q) => q,
            Err(e) => {
                eprintln!("  skipping {size} byte queue: {e}");
                continue;
            }
        };
        let msg = payload(size);
        let name = format!("{} {}", size_label(size), if locking { "flock" } else { "unlocked" });

        record(
            report,
            time_rounds(&name, ROUNDS, 100, || {
                if queue.enqueue(black_box(&msg)).is_ok() {
                    black_box(queue.dequeue().ok());
                }
            }),
        );

        drop(queue);
        remove_namespace(&ns);
    }
}

/// Every cache mutation rewrites the whole catalog, so cost grows with the
/// number of keys.
fn cache_put_get(report: &mut Vec<Latency>) {
    println!("\n== cache: 1KiB put / get by catalog size");
    print_latency_header();

    for keys in [1usize, 100, 1000] {
        let ns = temp_namespace(&format!("cache_{keys}"));
        let mut cache = match ShmPageCache::attach(&ns, SegmentKey(1), CacheOptions::manual(8 << 20)) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("  skipping cache with {keys} keys: {e}");
                continue;
            }
        };
        let seeded = (0..keys).all(|i| cache.put_key(&format!("key-{i}"), b"seed").is_ok());
        if !seeded {
            eprintln!("  skipping cache with {keys} keys: seeding failed");
            remove_namespace(&ns);
            continue;
        }
        let value = payload(1024);

        record(
            report,
            time_rounds(&format!("put, {keys} keys"), ROUNDS / 4, 10, || {
                black_box(cache.put_key("key-0", &value).ok());
            }),
        );
        record(
            report,
            time_rounds(&format!("get, {keys} keys"), ROUNDS / 4, 10, || {
                black_box(cache.read_key_value("key-0").ok());
            }),
        );

        drop(cache);
        remove_namespace(&ns);
    }
}

fn bitmap_first_fit(report: &mut Vec<Latency>) {
    println!("\n== bitmap: get_range(4) + clear_range on 8192 pages");
    print_latency_header();

    for fill in [0usize, 50, 90] {
        let mut bitmap = Bitmap::new(8192);
        // whole words from the front, so the scan has full words to skip
        for _ in 0..(8192 * fill / 100) / 32 {
            let _ = bitmap.get_range(32);
        }

        record(
            report,
            time_rounds(&format!("{fill}% allocated"), ROUNDS, 100, || {
                if let Some(start) = bitmap.get_range(black_box(4)) {
                    let _ = bitmap.clear_range(start, 4);
                }
            }),
        );
    }
}

fn save(report: &[Latency], usage: &Usage) {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/results");
    let path = format!("{dir}/{stamp}_report.json");

    let json = serde_json::json!({
        "report": "basalt",
        "unix_time": stamp,
        "latency": report,
        "usage": usage,
    });
    let written = std::fs::create_dir_all(dir)
        .and_then(|()| serde_json::to_string_pretty(&json).map_err(std::io::Error::other))
        .and_then(|text| std::fs::write(&path, text));
    match written {
        Ok(()) => println!("\nsaved {path}"),
        Err(e) => eprintln!("\nfailed to save {path}: {e}"),
    }
}
