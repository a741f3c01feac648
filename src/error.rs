//! Error types.

use core::{error, fmt};

/// The result type used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// A generic error that can be produced.
#[derive(Debug)]
pub struct Error {
    /// The kind of the error.
    pub kind: ErrorKind,
}
impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}
impl error::Error for Error {}

/// Possible kinds of errors.
#[derive(Debug)]
pub enum ErrorKind {
    /// A block device operation failed.
    Io,
    /// A resource pool was exhausted.
    OutOfMemory,
}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Io => "I/O Error",
            Self::OutOfMemory => "Out of memory",
        })
    }
}

/// Marker error for recoverable exhaustion of the physical page pool.
///
/// Deliberately distinct from the buffer cache's fatal exhaustion policy:
/// memory pressure is expected, and callers decide whether to reclaim, retry,
/// or fail the requesting operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;
impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Out of memory")
    }
}
impl error::Error for OutOfMemory {}
impl From<OutOfMemory> for Error {
    fn from(_value: OutOfMemory) -> Self {
        ErrorKind::OutOfMemory.into()
    }
}
