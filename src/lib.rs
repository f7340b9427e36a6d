//! voxcache - Hierarchical Lazy Voxel-Buffer Cache
//!
//! In-memory pixel storage for multi-channel, multi-time-step images. Data is
//! kept at three granularities (2-D slices, 3-D volumes, whole channels) and
//! materialized on demand: derived from a complete coarser buffer,
//! consolidated from complete finer ones, pulled from an upstream producer,
//! or freshly allocated.
//!
//! # Example
//!
//! ```
//! use voxcache::{Coord, Image, PixelType, ScalarType};
//!
//! let image = Image::new();
//! image.initialize_with(&[10, 10, 4], PixelType::scalar(ScalarType::U8), 1)?;
//!
//! for s in 0..4 {
//!     image.set(Coord::slice(s, 0, 0), &[s as u8; 100])?;
//! }
//! assert!(image.is_set(Coord::volume(0, 0)));
//!
//! let volume = image.get(Coord::volume(0, 0))?.expect("volume in range");
//! assert_eq!(volume.len(), 400);
//! # Ok::<(), voxcache::Error>(())
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, buffer items, materialization and producer protocol
//! - [`error`] - Error types

pub mod cache;
pub mod error;

// Re-export commonly used types
pub use cache::{
    BufferBytes, BufferHandle, CacheConfig, ChangeEvent, ChangeObserver, Coord, Image,
    ImageDescriptor, ImageId, ImageRegistry, ImportBuffer, Level, PixelType, Producer, Region,
    ScalarType, SliceBacking, UpdateFlag,
};
pub use error::{Error, Result};
