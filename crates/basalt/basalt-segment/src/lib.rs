mod lock;
mod namespace;
mod segment;

pub use lock::{AdvisoryLock, LockGuard, LockMode};
pub use namespace::{SegmentKey, ShmNamespace};
pub use segment::{Opened, Segment};
