//! Error types for `rawmem`.
//!
//! Every failure here signals a programming error rather than a transient
//! condition, so nothing is retried. Fallible operations return [`Result`];
//! most have an `Option`-returning `try_*` counterpart.

use std::fmt;
use std::panic::Location;

/// Errors reported by the ledger, the collections and the cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The address was never handed out by the ledger, or the size passed
    /// back does not match the recorded one.
    InvalidPointer {
        /// The offending address.
        addr: usize,
    },

    /// The address was allocated once but has already been disposed.
    UseAfterFree {
        /// The offending address.
        addr: usize,
        /// Where the block was allocated.
        allocated_at: &'static Location<'static>,
        /// Where the block was disposed.
        freed_at: &'static Location<'static>,
    },

    /// An index, offset or length fell outside the valid bounds.
    OutOfRange {
        /// The first index that was out of bounds.
        index: usize,
        /// The number of valid positions.
        len: usize,
    },

    /// A typed reference was requested at an offset not aligned for the type.
    Misaligned {
        /// The byte offset requested.
        offset: usize,
        /// The alignment the type requires.
        align: usize,
    },

    /// A strict lookup found no entry for the key.
    KeyNotFound,

    /// A search found no matching element or sub-sequence.
    ElementNotFound,

    /// A strict insertion found the key already present.
    DuplicateKey,

    /// A view token outlived a reallocation of its collection.
    StaleView {
        /// Generation recorded in the token.
        expected: u64,
        /// Generation of the collection now.
        actual: u64,
    },

    /// A leading or continuation byte did not fit the UTF-8 layout.
    MalformedEncoding {
        /// Position of the bad byte.
        offset: usize,
        /// The bad byte.
        byte: u8,
    },

    /// A read or advance went past the end of the valid data.
    UnexpectedEof {
        /// Cursor position at the time of the read.
        position: usize,
        /// Bytes the operation needed.
        needed: usize,
        /// Valid length of the buffer.
        len: usize,
    },

    /// Tracked allocations were still live at shutdown.
    LeakDetected {
        /// Number of leaked blocks.
        count: usize,
        /// Sum of their sizes in bytes.
        bytes: usize,
    },

    /// A collection was asked for a capacity it cannot represent.
    InvalidCapacity {
        /// The requested capacity.
        requested: usize,
    },

    /// Loading bytes from a stream failed.
    Io {
        /// Kind of the underlying I/O error.
        kind: std::io::ErrorKind,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidPointer { addr } => {
                write!(f, "Invalid pointer: {addr:#x} was never allocated")
            }
            Error::UseAfterFree {
                addr,
                allocated_at,
                freed_at,
            } => write!(
                f,
                "Use after free: {addr:#x} allocated at {allocated_at}, freed at {freed_at}"
            ),
            Error::OutOfRange { index, len } => {
                write!(f, "Index {index} out of range for length {len}")
            }
            Error::Misaligned { offset, align } => {
                write!(f, "Offset {offset} is not aligned to {align} bytes")
            }
            Error::KeyNotFound => write!(f, "Key not found"),
            Error::ElementNotFound => write!(f, "Element not found"),
            Error::DuplicateKey => write!(f, "Key already present"),
            Error::StaleView { expected, actual } => write!(
                f,
                "Stale view: taken at generation {expected}, collection is at {actual}"
            ),
            Error::MalformedEncoding { offset, byte } => {
                write!(f, "Malformed UTF-8: byte {byte:#04x} at offset {offset}")
            }
            Error::UnexpectedEof {
                position,
                needed,
                len,
            } => write!(
                f,
                "Past end of data: {needed} bytes at position {position}, length {len}"
            ),
            Error::LeakDetected { count, bytes } => {
                write!(f, "Leak detected: {count} allocations ({bytes} bytes) still live")
            }
            Error::InvalidCapacity { requested } => {
                write!(f, "Invalid capacity: {requested}")
            }
            Error::Io { kind } => write!(f, "I/O error: {kind}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io { kind: err.kind() }
    }
}

/// Result type for `rawmem` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns `Err(OutOfRange)` unless `index < len`.
#[inline]
pub(crate) fn check_index(index: usize, len: usize) -> Result<()> {
    if index < len {
        Ok(())
    } else {
        Err(Error::OutOfRange { index, len })
    }
}

/// Returns `Err(OutOfRange)` unless `start..start + count` lies within `len`.
#[inline]
pub(crate) fn check_range(start: usize, count: usize, len: usize) -> Result<()> {
    match start.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        Some(end) => Err(Error::OutOfRange {
            index: end.max(start),
            len,
        }),
        None => Err(Error::OutOfRange { index: usize::MAX, len }),
    }
}
