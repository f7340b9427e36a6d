//! Hierarchical Voxel-Buffer Cache
//!
//! Lazily materialized pixel storage for one image at three granularities.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               Image                                       │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │   Region Lock (Mutex)            │   Pull Lock (ReentrantMutex)          │
//! │  ┌────────────────────────────┐  │  ┌─────────────────────────────────┐  │
//! │  │ Channel tier  [n]          │  │  │ Producer::update(&Image)        │  │
//! │  │ Volume tier   [n * t]      │◀─┼──│   writes back via set /         │  │
//! │  │ Slice tier    [n * t * z]  │  │  │   import_set                    │  │
//! │  └────────────────────────────┘  │  └─────────────────────────────────┘  │
//! │         │                        │                                        │
//! │   Buffer Items: owned / borrowed roots, views into coarser roots        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lookup Order
//!
//! 1. Complete entry at the requested tier
//! 2. View into a complete volume or channel
//! 3. Consolidation of complete finer entries into one contiguous buffer
//! 4. One pull from an idle producer, then steps 1-3 again
//! 5. Fresh zero-filled allocation
//!
//! Coordinates outside the image are answered with "not found", never an
//! error.

mod descriptor;
mod events;
mod image;
mod item;
mod metrics;
mod producer;
mod region;
mod registry;
mod state;
mod tier;

mod proptest;

pub use descriptor::{ImageDescriptor, OffsetTable, PixelType, ScalarType};
pub use events::{
    channel_observer, ChangeEvent, ChangeObserver, ChannelObserver, ObserverId, ObserverSet,
};
pub use image::{CacheConfig, Image, SliceBacking};
pub use item::{BufferBytes, BufferHandle, BufferItem, ImportBuffer, ImportMode};
pub use metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot, TierSnapshot};
pub use producer::{Producer, UpdateFlag, UpdateGuard};
pub use region::{Coord, Level, Region};
pub use registry::{ImageId, ImageRegistry};
pub use tier::TierIndex;

/// Spatio-temporal axes: x, y, slice, time
pub const MAX_RANK: usize = 4;

/// Entries in the offset table, one more than the rank
pub const OFFSET_TABLE_LEN: usize = MAX_RANK + 1;

// =============================================================================
// Tests
// =============================================================================
