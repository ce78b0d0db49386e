//! End-to-end two-process test for the shared-memory queue.
//!
//! The test executable re-runs itself twice with a role in the environment:
//! a producer that sends numbered messages and a consumer that receives them.
//! Both attach to the same key concurrently, so the lock file and generation
//! protocol are exercised across real process boundaries.
//!
//! ```text
//! [producer] --attach--[send 0..N, backing off while full]--------[done]
//!                 |              |    |    |
//!                 v              v    v    v
//!             [segment]      (interleaved under flock)
//!                 ^              ^    ^    ^
//!                 |              |    |    |
//! [consumer] --attach--------[recv, waiting while empty]----------[done]
//! ```
//!
//! ```bash
//! cargo test -p basalt-queue --test e2e_two_process -- --nocapture
//! ```

use basalt_queue::{MsgChannel, PollBudget, QueueOptions, ShmRingQueue};
use basalt_segment::{SegmentKey, ShmNamespace};
use std::env;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Writes to stderr with an immediate flush so output survives test capture.
macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

const ENV_ROLE: &str = "BASALT_E2E_ROLE";
const ENV_DIR: &str = "BASALT_E2E_DIR";
const ROLE_PRODUCER: &str = "producer";
const ROLE_CONSUMER: &str = "consumer";

const KEY: SegmentKey = SegmentKey(4242);
const MESSAGE_COUNT: u32 = 2_000;

/// Small on purpose so the producer regularly hits a full queue.
const QUEUE_DEPTH: u32 = 8;
const ARENA_SIZE: u32 = 256;

fn options() -> QueueOptions {
    QueueOptions::new(QUEUE_DEPTH, ARENA_SIZE)
}

fn channel(dir: &str) -> MsgChannel {
    let ns = ShmNamespace::in_dir(dir);
    let queue = ShmRingQueue::attach(&ns, KEY, options()).expect("attach failed");
    let tick = Duration::from_micros(200);
    MsgChannel::new(queue).with_intervals(tick, tick)
}

fn message(i: u32) -> Vec<u8> {
    // vary the length so the arena wraps at different offsets
    let pad = "x".repeat((i % 23) as usize);
    format!("msg-{i:05}-{pad}").into_bytes()
}

fn run_producer(dir: &str) {
    log!("[PRODUCER] attaching in {dir}");
    let mut ch = channel(dir);
    let start = Instant::now();

    for i in 0..MESSAGE_COUNT {
        ch.send(&message(i), PollBudget::timeout(Duration::from_secs(10)))
            .unwrap_or_else(|e| panic!("[PRODUCER] send {i} failed: {e}"));
    }

    log!("[PRODUCER] sent {MESSAGE_COUNT} messages in {:?}", start.elapsed());
}

fn run_consumer(dir: &str) {
    log!("[CONSUMER] attaching in {dir}");
    let mut ch = channel(dir);
    let start = Instant::now();

    for i in 0..MESSAGE_COUNT {
        let got = ch
            .recv(PollBudget::timeout(Duration::from_secs(10)))
            .unwrap_or_else(|e| panic!("[CONSUMER] recv {i} failed: {e}"));
        assert_eq!(got, message(i), "[CONSUMER] message {i} out of order or damaged");
    }

    assert!(ch.queue().is_empty().expect("status failed"));
    log!("[CONSUMER] received {MESSAGE_COUNT} messages in {:?}", start.elapsed());
}

#[test]
fn e2e_two_process_queue() {
    if let Ok(role) = env::var(ENV_ROLE) {
        let dir = env::var(ENV_DIR).expect("BASALT_E2E_DIR not set");
        match role.as_str() {
            ROLE_PRODUCER => run_producer(&dir),
            ROLE_CONSUMER => run_consumer(&dir),
            other => panic!("Unknown role: {other}"),
        }
        return;
    }

    let dir = format!("/tmp/basalt_e2e_queue_{}", std::process::id());
    let _ = std::fs::remove_dir_all(&dir);
    let exe = env::current_exe().expect("Failed to get current executable path");

    log!("[ORCHESTRATOR] queue dir: {dir}, messages: {MESSAGE_COUNT}");

    let spawn = |role: &str| {
        Command::new(&exe)
            .arg("--exact")
            .arg("e2e_two_process_queue")
            .env(ENV_ROLE, role)
            .env(ENV_DIR, &dir)
            .stderr(Stdio::inherit())
            .spawn()
            .unwrap_or_else(|e| panic!("Failed to spawn {role}: {e}"))
    };

    let mut consumer = spawn(ROLE_CONSUMER);
    let mut producer = spawn(ROLE_PRODUCER);

    let producer_status = producer.wait().expect("Failed to wait for producer");
    let consumer_status = consumer.wait().expect("Failed to wait for consumer");

    let _ = std::fs::remove_dir_all(&dir);

    assert!(producer_status.success(), "Producer failed: {producer_status}");
    assert!(consumer_status.success(), "Consumer failed: {consumer_status}");
    log!("[ORCHESTRATOR] passed");
}
