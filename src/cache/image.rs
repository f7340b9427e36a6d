//! Image
//!
//! Owns the tier state behind the region lock and runs the read and write
//! paths: lookup, producer pull with a single re-check, fresh allocation,
//! first fills and mutating overwrites with change notification.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::descriptor::{ImageDescriptor, PixelType};
use super::events::{ChangeEvent, ChangeObserver, ObserverId, ObserverSet};
use super::item::{BufferHandle, ImportBuffer};
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use super::producer::Producer;
use super::region::{Coord, Region};
use super::registry::{ImageId, ImageRegistry};
use super::state::CacheState;
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Where a freshly written slice gets its memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceBacking {
    /// Each slice is its own allocation until its volume consolidates
    #[default]
    Independent,
    /// Slices are carved out of a volume buffer allocated with the first one
    Volume,
}

impl FromStr for SliceBacking {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "independent" => Ok(SliceBacking::Independent),
            "volume" => Ok(SliceBacking::Volume),
            other => Err(format!("unknown slice backing: {other}")),
        }
    }
}

impl fmt::Display for SliceBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SliceBacking::Independent => write!(f, "independent"),
            SliceBacking::Volume => write!(f, "volume"),
        }
    }
}

/// Image cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub slice_backing: SliceBacking,
    /// Deliver change events to observers; the modification counter advances either way
    pub notify_observers: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            slice_backing: SliceBacking::Independent,
            notify_observers: true,
        }
    }
}

// =============================================================================
// Image
// =============================================================================

/// Multi-channel, multi-time-step image backed by a lazy three-tier cache
pub struct Image {
    id: ImageId,
    config: CacheConfig,
    /// Region lock; `None` until initialized
    state: Mutex<Option<CacheState>>,
    /// Serializes producer pulls; re-entrant so a producer may call back in
    pull_lock: ReentrantMutex<()>,
    producer: RwLock<Option<Arc<dyn Producer>>>,
    observers: ObserverSet,
    metrics: Arc<CacheMetrics>,
    modifications: AtomicU64,
    registries: Mutex<Vec<Weak<ImageRegistry>>>,
}

impl Image {
    /// Uninitialized image with default configuration
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            id: ImageId::new(),
            config,
            state: Mutex::new(None),
            pull_lock: ReentrantMutex::new(()),
            producer: RwLock::new(None),
            observers: ObserverSet::new(),
            metrics: Arc::new(CacheMetrics::new()),
            modifications: AtomicU64::new(0),
            registries: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Replace the descriptor and drop every buffer item
    ///
    /// On failure the image is left uninitialized.
    #[instrument(skip(self, descriptor), fields(image = %self.id))]
    pub fn initialize(&self, descriptor: ImageDescriptor) -> Result<()> {
        let rank = descriptor.rank();
        let extents = descriptor.extents();
        let channels = descriptor.channel_count();

        let built = CacheState::new(
            self.id,
            descriptor,
            self.config.slice_backing,
            Arc::clone(&self.metrics),
        );

        let mut guard = self.state.lock();
        match built {
            Ok(state) => {
                *guard = Some(state);
                info!(rank, ?extents, channels, "Initialized image");
                Ok(())
            }
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    /// Initialize with `channels` channels of one pixel type
    pub fn initialize_with(
        &self,
        dimensions: &[usize],
        pixel_type: PixelType,
        channels: usize,
    ) -> Result<()> {
        match ImageDescriptor::new(dimensions, pixel_type, channels) {
            Ok(descriptor) => self.initialize(descriptor),
            Err(e) => {
                *self.state.lock() = None;
                Err(e)
            }
        }
    }

    /// Drop every buffer item but keep the descriptor
    pub fn reset(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(Error::NotInitialized)?;
        state.reset();
        info!(image = %self.id, "Reset image data");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn descriptor(&self) -> Option<ImageDescriptor> {
        self.state.lock().as_ref().map(|s| s.descriptor().clone())
    }

    /// Extent of `axis`, 1 beyond the rank
    pub fn dimension(&self, axis: usize) -> Option<usize> {
        self.state
            .lock()
            .as_ref()
            .map(|s| s.descriptor().dimension(axis))
    }

    pub fn pixel_type(&self, channel: usize) -> Option<PixelType> {
        self.state
            .lock()
            .as_ref()
            .and_then(|s| s.descriptor().pixel_type(channel))
    }

    /// Byte size of the unit at `coord`, if it exists
    pub fn unit_bytes(&self, coord: Coord) -> Option<usize> {
        self.state
            .lock()
            .as_ref()
            .filter(|s| s.contains(coord))
            .map(|s| s.unit_bytes(coord))
    }

    /// Cumulative extent products, `[1, x, x*y, x*y*z, x*y*z*t]`
    pub fn offset_table(&self) -> Option<[usize; super::OFFSET_TABLE_LEN]> {
        self.state.lock().as_ref().map(|s| s.offsets().as_array())
    }

    // =========================================================================
    // Regions
    // =========================================================================

    /// Region the last producer pull asked for
    pub fn requested_region(&self) -> Option<Region> {
        self.state.lock().as_ref().map(CacheState::requested_region)
    }

    pub fn largest_possible_region(&self) -> Option<Region> {
        self.state
            .lock()
            .as_ref()
            .map(|s| Region::largest_possible(s.descriptor()))
    }

    pub fn set_requested_region_to_largest_possible(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(Error::NotInitialized)?;
        let largest = Region::largest_possible(state.descriptor());
        state.set_requested_region(largest);
        Ok(())
    }

    // =========================================================================
    // Producer & Observers
    // =========================================================================

    /// Attach or detach the upstream producer
    pub fn set_producer(&self, producer: Option<Arc<dyn Producer>>) {
        *self.producer.write() = producer;
    }

    pub fn producer(&self) -> Option<Arc<dyn Producer>> {
        self.producer.read().clone()
    }

    fn idle_producer(&self) -> Option<Arc<dyn Producer>> {
        self.producer
            .read()
            .as_ref()
            .filter(|p| !p.is_updating())
            .cloned()
    }

    pub fn subscribe(&self, observer: Arc<dyn ChangeObserver>) -> ObserverId {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Number of mutating writes since creation
    pub fn modification_count(&self) -> u64 {
        self.modifications.load(Ordering::Acquire)
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Buffer for `coord`, materializing it if needed
    ///
    /// Returns `Ok(None)` for coordinates outside the image. A miss pulls
    /// once from an idle producer, then falls back to a zero-filled
    /// allocation. While the producer is busy the miss is allocated right
    /// away, without waiting for the running pull.
    #[instrument(level = "trace", skip(self), fields(image = %self.id))]
    pub fn get(&self, coord: Coord) -> Result<Option<BufferHandle>> {
        let tracker = LatencyTracker::start();
        let result = self.materialize(coord, None);
        self.metrics.record_get_latency(tracker.elapsed());
        result
    }

    /// Like [`get`](Self::get), but a fresh allocation is filled from `seed`
    pub fn get_or_init(&self, coord: Coord, seed: &[u8]) -> Result<Option<BufferHandle>> {
        let Some(expected) = self.unit_bytes(coord) else {
            self.metrics.record_invalid_probe();
            return Ok(None);
        };
        if seed.len() < expected {
            return Err(Error::BufferSizeMismatch {
                level: coord.level,
                expected,
                actual: seed.len(),
            });
        }
        self.materialize(coord, Some(ImportBuffer::Copy(&seed[..expected])))
    }

    /// Existing data for `coord`, without pulling or allocating
    pub fn peek(&self, coord: Coord) -> Result<Option<BufferHandle>> {
        let mut guard = self.state.lock();
        match guard.as_mut() {
            Some(state) if state.contains(coord) => state.lookup(coord),
            _ => {
                self.metrics.record_invalid_probe();
                Ok(None)
            }
        }
    }

    /// Whether `coord` is available without pulling or allocating
    pub fn is_set(&self, coord: Coord) -> bool {
        let guard = self.state.lock();
        match guard.as_ref() {
            Some(state) if state.contains(coord) => state.is_set(coord),
            _ => {
                self.metrics.record_invalid_probe();
                false
            }
        }
    }

    fn materialize(
        &self,
        coord: Coord,
        seed: Option<ImportBuffer<'_>>,
    ) -> Result<Option<BufferHandle>> {
        {
            let mut guard = self.state.lock();
            let Some(state) = self.resolvable(&mut guard, coord) else {
                return Ok(None);
            };
            if let Some(item) = state.lookup(coord)? {
                return Ok(Some(item));
            }
            // busy covers calls made from inside `update`, on any thread
            if self.idle_producer().is_none() {
                return state.install_fresh(coord, seed).map(Some);
            }
        }

        // Waits out a pull another thread started before the producer turned busy
        let _pull = self.pull_lock.lock();

        let producer = {
            let mut guard = self.state.lock();
            let Some(state) = self.resolvable(&mut guard, coord) else {
                return Ok(None);
            };
            if let Some(item) = state.lookup(coord)? {
                return Ok(Some(item));
            }
            match self.idle_producer() {
                Some(producer) => {
                    let region = Region::for_coord(coord, state.descriptor());
                    state.set_requested_region(region);
                    producer
                }
                None => return state.install_fresh(coord, seed).map(Some),
            }
        };

        self.metrics.record_producer_invocation();
        debug!(image = %self.id, %coord, "Pulling from producer");
        producer.update(self)?;

        let mut guard = self.state.lock();
        let Some(state) = self.resolvable(&mut guard, coord) else {
            return Ok(None);
        };
        if let Some(item) = state.lookup(coord)? {
            return Ok(Some(item));
        }

        warn!(image = %self.id, %coord, "Producer left requested region empty, allocating");
        self.metrics.record_producer_miss();
        state.install_fresh(coord, seed).map(Some)
    }

    fn resolvable<'g>(
        &self,
        guard: &'g mut Option<CacheState>,
        coord: Coord,
    ) -> Option<&'g mut CacheState> {
        match guard.as_mut() {
            Some(state) if state.contains(coord) => Some(state),
            _ => {
                self.metrics.record_invalid_probe();
                None
            }
        }
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Copy one unit of `data` into `coord`
    ///
    /// Returns `Ok(false)` for coordinates outside the image.
    pub fn set(&self, coord: Coord, data: &[u8]) -> Result<bool> {
        self.import_set(coord, ImportBuffer::Copy(data))
    }

    /// Write `data` into `coord` with the given ownership
    ///
    /// An empty slot takes the buffer as given (copied, adopted or borrowed)
    /// and no change event is sent. An occupied slot has one unit of bytes
    /// copied over it and observers are notified once. Extra bytes past one
    /// unit are ignored.
    #[instrument(skip(self, data), fields(image = %self.id, mode = ?data.mode(), size = data.len()))]
    pub fn import_set(&self, coord: Coord, data: ImportBuffer<'_>) -> Result<bool> {
        let event = {
            let mut guard = self.state.lock();
            let Some(state) = self.resolvable(&mut guard, coord) else {
                return Ok(false);
            };

            let expected = state.unit_bytes(coord);
            if data.len() < expected {
                return Err(Error::BufferSizeMismatch {
                    level: coord.level,
                    expected,
                    actual: data.len(),
                });
            }
            let data = data.truncated(expected);

            match state.lookup(coord)? {
                Some(item) => {
                    let generation = state.overwrite(&item, data.as_slice())?;
                    let modification = self.modifications.fetch_add(1, Ordering::AcqRel) + 1;
                    self.metrics.record_modification();
                    debug!(%coord, generation, modification, "Overwrote existing data");

                    ChangeEvent {
                        image: self.id,
                        coord,
                        modification,
                        generation,
                        timestamp: Utc::now(),
                    }
                }
                None => {
                    state.install_fresh(coord, Some(data))?;
                    self.metrics.record_first_fill();
                    return Ok(true);
                }
            }
        };

        if self.config.notify_observers {
            self.observers.notify(&event);
        }
        Ok(true)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Snapshot of cache metrics with current entry counts
    pub fn metrics(&self) -> MetricsSnapshot {
        let populated = self
            .state
            .lock()
            .as_ref()
            .map_or([0; 3], CacheState::populated);
        self.metrics.snapshot(populated)
    }

    /// Every populated tier slot, finest level first
    pub fn entries(&self) -> Vec<(Coord, BufferHandle)> {
        self.state
            .lock()
            .as_ref()
            .map_or_else(Vec::new, CacheState::entries)
    }

    /// Deep copy of descriptor and data
    ///
    /// Volumes and slices that are set are copied; producer and observers
    /// stay with the original.
    pub fn duplicate(&self) -> Result<Image> {
        let descriptor = self.descriptor().ok_or(Error::NotInitialized)?;
        let copy = Image::with_config(self.config.clone());
        copy.initialize(descriptor.clone())?;

        for channel in 0..descriptor.channel_count() {
            for time in 0..descriptor.time_steps() {
                let volume = Coord::volume(time, channel);
                if let Some(item) = self.peek(volume)? {
                    copy.import_set(volume, ImportBuffer::Adopt(item.to_vec()))?;
                    continue;
                }
                for slice in 0..descriptor.slice_count() {
                    let coord = Coord::slice(slice, time, channel);
                    if let Some(item) = self.peek(coord)? {
                        copy.import_set(coord, ImportBuffer::Adopt(item.to_vec()))?;
                    }
                }
            }
        }

        debug!(image = %self.id, copy = %copy.id, "Duplicated image");
        Ok(copy)
    }

    /// Same rank, extents, channel pixel types and slice bytes
    ///
    /// A slice counts as equal when it is unset in both images.
    pub fn contents_equal(&self, other: &Image) -> Result<bool> {
        if std::ptr::eq(self, other) {
            return Ok(true);
        }

        let descriptor = match (self.descriptor(), other.descriptor()) {
            (Some(a), Some(b)) if a == b => a,
            (None, None) => return Ok(true),
            _ => return Ok(false),
        };

        for channel in 0..descriptor.channel_count() {
            for time in 0..descriptor.time_steps() {
                for slice in 0..descriptor.slice_count() {
                    let coord = Coord::slice(slice, time, channel);
                    match (self.peek(coord)?, other.peek(coord)?) {
                        (None, None) => {}
                        (Some(a), Some(b)) => {
                            if *a.read() != *b.read() {
                                return Ok(false);
                            }
                        }
                        _ => return Ok(false),
                    }
                }
            }
        }
        Ok(true)
    }

    pub(crate) fn attach_registry(&self, registry: Weak<ImageRegistry>) {
        let mut registries = self.registries.lock();
        if !registries.iter().any(|known| known.ptr_eq(&registry)) {
            registries.push(registry);
        }
    }

    #[cfg(test)]
    pub(crate) fn registry_count(&self) -> usize {
        self.registries.lock().len()
    }
}

impl Default for Image {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        for registry in self.registries.get_mut().drain(..) {
            if let Some(registry) = registry.upgrade() {
                registry.remove(self.id);
            }
        }
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("initialized", &self.is_initialized())
            .field("observers", &self.observers.len())
            .field("modifications", &self.modification_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
