//! Error types for the quadstore storage engine

use thiserror::Error;

/// Storage error type
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error from the backing files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation signalling corruption or a logic error
    #[error("bad state: {0}")]
    BadState(String),

    /// Entry larger than the maximum record size, or key space exhausted
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Cursor access past the lease boundary
    #[error("out of bounds: position {position} + {len} exceeds lease length {limit}")]
    OutOfBounds {
        /// Cursor position at the time of the access
        position: usize,
        /// Requested access length
        len: usize,
        /// Lease length
        limit: usize,
    },

    /// Write attempted through a read-only lease
    #[error("lease is not writable")]
    NotWritable,

    /// Lease refused because an overlapping span would violate writer exclusivity
    #[error("span [{offset}, +{length}) conflicts with an active lease")]
    LeaseConflict {
        /// Requested span offset within the block
        offset: usize,
        /// Requested span length
        length: usize,
    },
}

impl StoreError {
    pub(crate) fn bad_state(msg: impl Into<String>) -> Self {
        StoreError::BadState(msg.into())
    }

    pub(crate) fn capacity(msg: impl Into<String>) -> Self {
        StoreError::CapacityExceeded(msg.into())
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;
