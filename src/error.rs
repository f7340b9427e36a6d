//! Error types for the voxel-buffer cache

use thiserror::Error;

use crate::cache::Level;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while initializing or materializing image data
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Descriptor Errors
    // =========================================================================
    /// An extent (or the channel count, axis 4) is smaller than one
    #[error("invalid dimension[{axis}]: {extent}")]
    InvalidDimension { axis: usize, extent: usize },

    /// Rank outside of 1..=4
    #[error("invalid image rank {rank}, expected 1 to 4")]
    InvalidRank { rank: usize },

    /// Byte size of the image does not fit in the address space
    #[error("image byte size overflows addressable memory")]
    ImageTooLarge,

    /// Unrecognized pixel type name
    #[error("unknown pixel type: {0}")]
    UnknownPixelType(String),

    /// Operation needs an initialized image
    #[error("image is not initialized")]
    NotInitialized,

    // =========================================================================
    // Buffer Errors
    // =========================================================================
    /// Caller supplied fewer bytes than one unit of the target tier
    #[error("{level} buffer needs {expected} bytes, got {actual}")]
    BufferSizeMismatch {
        level: Level,
        expected: usize,
        actual: usize,
    },

    /// Allocator refused the request
    #[error("allocation failed for size {size}: {reason}")]
    AllocationFailed { size: usize, reason: String },

    /// View would reach past the end of its parent buffer
    #[error("view [{offset}, {offset}+{len}) exceeds parent of {parent_len} bytes")]
    ViewOutOfBounds {
        offset: usize,
        len: usize,
        parent_len: usize,
    },

    // =========================================================================
    // Producer Errors
    // =========================================================================
    /// Raised by a producer while filling a requested region
    #[error("producer update failed: {0}")]
    Producer(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary producer failure
    pub fn producer<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Producer(err.into())
    }
}
