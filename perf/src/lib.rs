//! Helpers shared by the criterion benches and the `perf_report` binary.
//!
//! Benches run against throwaway namespaces under `/tmp`, one directory per
//! workload and process, so concurrent runs never share a segment.

use basalt_segment::ShmNamespace;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;

/// Per-operation cost of one workload, in nanoseconds.
#[derive(Debug, Clone, Serialize)]
pub struct Latency {
    pub name: String,
    pub rounds: usize,
    pub min_ns: u64,
    pub p50_ns: u64,
    pub p99_ns: u64,
    pub max_ns: u64,
    pub ops_per_sec: f64,
}

impl Latency {
    /// Summarizes per-op samples. `None` when there are no samples.
    pub fn from_samples(name: &str, samples: &mut [u64]) -> Option<Self> {
        samples.sort_unstable();
        let (&min_ns, &max_ns) = (samples.first()?, samples.last()?);
        let mean = samples.iter().sum::<u64>() as f64 / samples.len() as f64;
        Some(Self {
            name: name.to_string(),
            rounds: samples.len(),
            min_ns,
            p50_ns: nearest_rank(samples, 50),
            p99_ns: nearest_rank(samples, 99),
            max_ns,
            ops_per_sec: 1e9 / mean,
        })
    }

    pub fn print_row(&self) {
        println!(
            "  {:<36} {:>9} {:>9} {:>9} {:>9} {:>12.0}",
            self.name, self.min_ns, self.p50_ns, self.p99_ns, self.max_ns, self.ops_per_sec
        );
    }
}

pub fn print_latency_header() {
    println!(
        "  {:<36} {:>9} {:>9} {:>9} {:>9} {:>12}",
        "workload", "min ns", "p50 ns", "p99 ns", "max ns", "ops/s"
    );
    println!("  {}", "-".repeat(88));
}

/// Nearest-rank percentile of an already sorted, non-empty slice.
fn nearest_rank(sorted: &[u64], pct: u64) -> u64 {
    let rank = (sorted.len() as u64 * pct).div_ceil(100).max(1);
    sorted[(rank - 1) as usize]
}

/// Runs `op` for one warm-up round, then `rounds` timed rounds of
/// `per_round` calls each. Each sample is the mean cost of one call in its
/// round, so fast operations are not lost in timer resolution.
pub fn time_rounds<F: FnMut()>(name: &str, rounds: usize, per_round: usize, mut op: F) -> Option<Latency> {
    let per_round = per_round.max(1);
    for _ in 0..per_round {
        op();
    }

    let mut samples: Vec<u64> = (0..rounds)
        .map(|_| {
            let start = Instant::now();
            for _ in 0..per_round {
                op();
            }
            let per_op = start.elapsed().as_nanos() / per_round as u128;
            (per_op as u64).max(1)
        })
        .collect();
    Latency::from_samples(name, &mut samples)
}

/// Process resource counters from `getrusage(RUSAGE_SELF)`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub max_rss_kib: i64,
    pub minor_faults: i64,
    pub voluntary_switches: i64,
    pub user_us: i64,
    pub system_us: i64,
}

impl Usage {
    pub fn now() -> Self {
        // SAFETY: rusage is plain old data and getrusage only writes into it.
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut ru) } != 0 {
            return Self::default();
        }
        // macOS reports bytes, Linux KiB
        #[cfg(target_os = "macos")]
        let max_rss_kib = ru.ru_maxrss / 1024;
        #[cfg(not(target_os = "macos"))]
        let max_rss_kib = ru.ru_maxrss;
        Self {
            max_rss_kib,
            minor_faults: ru.ru_minflt,
            voluntary_switches: ru.ru_nvcsw,
            user_us: micros(ru.ru_utime),
            system_us: micros(ru.ru_stime),
        }
    }

    /// Counters accumulated since `earlier`. Peak RSS is not a counter and is
    /// taken as is.
    pub fn since(&self, earlier: &Usage) -> Usage {
        Usage {
            max_rss_kib: self.max_rss_kib,
            minor_faults: self.minor_faults - earlier.minor_faults,
            voluntary_switches: self.voluntary_switches - earlier.voluntary_switches,
            user_us: self.user_us - earlier.user_us,
            system_us: self.system_us - earlier.system_us,
        }
    }
}

fn micros(tv: libc::timeval) -> i64 {
    tv.tv_sec as i64 * 1_000_000 + tv.tv_usec as i64
}

/// A fresh per-process directory for benchmark segments and lock files.
pub fn temp_namespace(label: &str) -> ShmNamespace {
    let pid = std::process::id();
    let dir = PathBuf::from(format!("/tmp/basalt_bench_{label}_{pid}"));
    let _ = std::fs::remove_dir_all(&dir);
    ShmNamespace::in_dir(dir)
}

pub fn remove_namespace(ns: &ShmNamespace) {
    let _ = std::fs::remove_dir_all(ns.segment_dir());
    let _ = std::fs::remove_dir_all(ns.lock_dir());
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Message and value sizes as they appear in workload names.
pub fn size_label(len: usize) -> String {
    match len {
        n if n >= 1 << 20 && n % (1 << 20) == 0 => format!("{}MiB", n >> 20),
        n if n >= 1 << 10 && n % (1 << 10) == 0 => format!("{}KiB", n >> 10),
        n => format!("{n}B"),
    }
}
