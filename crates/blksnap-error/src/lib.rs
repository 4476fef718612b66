//! Shared error taxonomy for the snapshot engine.
//!
//! Every crate in the workspace returns this [`Error`] rather than defining
//! its own, the same way a disk-image crate centralizes its I/O error type
//! and lets dependents reuse it.

use std::fmt;

/// Error taxonomy from the engine's error-handling design.
///
/// Recovery semantics are documented per-variant; see the call sites for how
/// each one propagates (a chunk failure latches its diff area corrupted, a
/// bio never fails because of diff-area corruption, etc).
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Allocation failure. Propagate; caller may retry.
    #[error("out of memory")]
    NoMemory,

    /// A NOWAIT-marked path would have had to sleep.
    #[error("operation would block")]
    WouldBlock,

    /// Difference storage is exhausted.
    #[error("difference storage exhausted")]
    NoSpace,

    /// The diff area backing this read is corrupted.
    #[error("no data: diff area corrupted")]
    NoData,

    /// Out-of-range or otherwise malformed input.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Unknown uuid or device id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Forbidden by current state (e.g. remove while snapshot taken).
    #[error("busy: {0}")]
    Busy(String),

    /// Lower-level block I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    pub fn invalid(msg: impl fmt::Display) -> Self {
        Error::Invalid(msg.to_string())
    }

    pub fn not_found(msg: impl fmt::Display) -> Self {
        Error::NotFound(msg.to_string())
    }

    pub fn busy(msg: impl fmt::Display) -> Self {
        Error::Busy(msg.to_string())
    }

    pub fn io(msg: impl fmt::Display) -> Self {
        Error::Io(msg.to_string())
    }

    /// True for errors that latch the owning diff area as corrupted.
    pub fn is_corrupting(&self) -> bool {
        matches!(self, Error::Io(_) | Error::NoSpace)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupting_errors_are_io_and_no_space_only() {
        assert!(Error::Io("disk gone".into()).is_corrupting());
        assert!(Error::NoSpace.is_corrupting());
        assert!(!Error::WouldBlock.is_corrupting());
        assert!(!Error::Invalid("x".into()).is_corrupting());
    }
}
