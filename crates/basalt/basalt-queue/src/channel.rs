//! Blocking send/receive on top of a `ShmRingQueue`.
//!
//! The queue itself never waits. A `MsgChannel` turns `QueueFull` and `Empty`
//! into sleep-and-retry loops, bounded by a `PollBudget` chosen per call.

use crate::queue::ShmRingQueue;
use basalt_core::{ErrorKind, Result, ShmError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Sleep between attempts while the queue is full.
pub const DEFAULT_FULL_BACKOFF: Duration = Duration::from_millis(100);

/// Sleep between attempts while the queue is empty.
pub const DEFAULT_RECV_WAIT: Duration = Duration::from_millis(50);

/// How long a blocking call may keep retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollBudget {
    /// One attempt.
    NoWait,
    /// The first attempt plus up to `n` retries.
    Retries(u32),
    /// Keep retrying until the deadline has passed.
    Until(Instant),
}

impl PollBudget {
    pub fn timeout(timeout: Duration) -> Self {
        PollBudget::Until(Instant::now() + timeout)
    }

    /// Whether another attempt is allowed after `attempts` failed ones.
    fn allows(&self, attempts: u32, interval: Duration) -> bool {
        match *self {
            PollBudget::NoWait => false,
            PollBudget::Retries(n) => attempts <= n,
            PollBudget::Until(deadline) => Instant::now() + interval <= deadline,
        }
    }
}

pub struct MsgChannel {
    queue: ShmRingQueue,
    full_backoff: Duration,
    recv_wait: Duration,
}

impl MsgChannel {
    pub fn new(queue: ShmRingQueue) -> Self {
        Self {
            queue,
            full_backoff: DEFAULT_FULL_BACKOFF,
            recv_wait: DEFAULT_RECV_WAIT,
        }
    }

    pub fn with_intervals(mut self, full_backoff: Duration, recv_wait: Duration) -> Self {
        self.full_backoff = full_backoff;
        self.recv_wait = recv_wait;
        self
    }

    pub fn queue(&mut self) -> &mut ShmRingQueue {
        &mut self.queue
    }

    pub fn into_inner(self) -> ShmRingQueue {
        self.queue
    }

    /// Enqueue `msg`, backing off while the queue is full.
    ///
    /// Returns the last `Full`-kind error once the budget runs out. Other
    /// errors are returned immediately.
    pub fn send(&mut self, msg: &[u8], budget: PollBudget) -> Result<()> {
        let interval = self.full_backoff;
        poll(budget, interval, ErrorKind::Full, "send", || self.queue.enqueue(msg))
    }

    /// Dequeue the next message, waiting while the queue is empty.
    pub fn recv(&mut self, budget: PollBudget) -> Result<Vec<u8>> {
        let interval = self.recv_wait;
        poll(budget, interval, ErrorKind::Empty, "recv", || {
            self.queue.dequeue().map(|entry| entry.payload)
        })
    }

    pub fn send_json<T: Serialize>(&mut self, value: &T, budget: PollBudget) -> Result<()> {
        let msg = serde_json::to_vec(value)
            .map_err(|e| ShmError::BadArgument(format!("message cannot be serialized: {e}")))?;
        self.send(&msg, budget)
    }

    /// Receive one message and decode it as JSON. A message that does not
    /// decode as `T` has already been consumed and is reported as `Corrupt`.
    pub fn recv_json<T: DeserializeOwned>(&mut self, budget: PollBudget) -> Result<T> {
        let msg = self.recv(budget)?;
        serde_json::from_slice(&msg).map_err(|e| ShmError::corrupt("json message", e.to_string()))
    }

    /// Send `request` on this channel, then wait for one reply on `replies`.
    pub fn send_recv<Req, Resp>(
        &mut self,
        replies: &mut MsgChannel,
        request: &Req,
        budget: PollBudget,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.send_json(request, budget)?;
        replies.recv_json(budget)
    }
}

fn poll<T>(
    budget: PollBudget,
    interval: Duration,
    retry_on: ErrorKind,
    op: &'static str,
    mut attempt: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut failures = 0u32;
    loop {
        match attempt() {
            Err(e) if e.kind() == retry_on => {
                failures = failures.saturating_add(1);
                if !budget.allows(failures, interval) {
                    debug!(op, attempts = failures, error = %e, "poll budget exhausted");
                    return Err(e);
                }
                thread::sleep(interval);
            }
            other => return other,
        }
    }
}
