pub mod codec;
mod error;

pub use codec::{Checksummed, round_up};
pub use error::{ErrorKind, Result, ShmError};
