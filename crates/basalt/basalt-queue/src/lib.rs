mod channel;
mod entry;
mod header;
mod layout;
mod queue;
mod ring;

pub use channel::{DEFAULT_FULL_BACKOFF, DEFAULT_RECV_WAIT, MsgChannel, PollBudget};
pub use entry::QueueEntry;
pub use header::{QUEUE_VERSION, QueueHeader};
pub use layout::{DESCRIPTOR_SIZE, HEADER_REGION_SIZE, QueueGeometry};
pub use queue::{QueueOptions, ShmRingQueue};
