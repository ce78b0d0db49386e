use std::fmt;
use std::io;

/// Coarse classification of every failure the shared-memory layer reports.
///
/// Callers match on the kind to decide whether to retry (`Full`, `Empty`),
/// re-initialize (`NotFound`, `Corrupt`) or give up (`SizeMismatch`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Corrupt,
    Full,
    Empty,
    SizeMismatch,
    IoFailure,
    InvalidState,
    BadArgument,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::Full => "full",
            ErrorKind::Empty => "empty",
            ErrorKind::SizeMismatch => "size mismatch",
            ErrorKind::IoFailure => "i/o failure",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::BadArgument => "bad argument",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("key '{0}' not found")]
    KeyNotFound(String),

    #[error("{what} is corrupt: {detail}")]
    Corrupt { what: &'static str, detail: String },

    #[error("queue is full")]
    QueueFull,

    #[error("message arena cannot fit {requested} bytes")]
    ArenaFull { requested: usize },

    #[error("no run of {pages} free pages in the data segment")]
    NoSpace { pages: usize },

    #[error("value of {len} bytes does not fit the {reserved} bytes reserved for '{key}'")]
    ValueTooLarge {
        key: String,
        len: usize,
        reserved: usize,
    },

    #[error("queue is empty")]
    Empty,

    #[error("{what} mismatch: expected {expected}, found {found}")]
    SizeMismatch {
        what: &'static str,
        expected: u64,
        found: u64,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("bit {index} is out of range for a bitmap of {capacity} bits")]
    OutOfRange { index: usize, capacity: usize },

    #[error("access of {len} bytes at offset {offset} exceeds the {size} byte segment")]
    OutOfBounds { offset: usize, len: usize, size: usize },
}

impl ShmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShmError::NotFound { .. } | ShmError::KeyNotFound(_) => ErrorKind::NotFound,
            ShmError::Corrupt { .. } => ErrorKind::Corrupt,
            ShmError::QueueFull
            | ShmError::ArenaFull { .. }
            | ShmError::NoSpace { .. }
            | ShmError::ValueTooLarge { .. } => ErrorKind::Full,
            ShmError::Empty => ErrorKind::Empty,
            ShmError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            ShmError::Io { .. } => ErrorKind::IoFailure,
            ShmError::InvalidState(_) => ErrorKind::InvalidState,
            ShmError::BadArgument(_)
            | ShmError::OutOfRange { .. }
            | ShmError::OutOfBounds { .. } => ErrorKind::BadArgument,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ShmError::NotFound { what: what.into() }
    }

    pub fn corrupt(what: &'static str, detail: impl Into<String>) -> Self {
        ShmError::Corrupt {
            what,
            detail: detail.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ShmError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = ShmError> = std::result::Result<T, E>;
