//! Materialization engine state
//!
//! Everything in here runs with the region lock already held by [`Image`].
//! The lookup order is: direct hit, view into a complete coarser unit,
//! consolidation of complete finer units. Fresh installs go through
//! [`CacheState::install_fresh`], which also keeps finer entries consistent
//! with the new coarser buffer.
//!
//! [`Image`]: super::image::Image

use std::sync::Arc;

use tracing::{debug, trace};

use super::descriptor::{ImageDescriptor, OffsetTable, PixelType};
use super::image::SliceBacking;
use super::item::{BufferHandle, BufferItem, ImportBuffer, ImportMode};
use super::metrics::CacheMetrics;
use super::region::{Coord, Level, Region};
use super::registry::ImageId;
use super::tier::TierIndex;
use crate::error::Result;

/// Tier index plus the layout it was built for
pub(crate) struct CacheState {
    image: ImageId,
    descriptor: ImageDescriptor,
    offsets: OffsetTable,
    strides: Vec<usize>,
    tiers: TierIndex,
    requested_region: Region,
    slice_backing: SliceBacking,
    metrics: Arc<CacheMetrics>,
}

impl CacheState {
    pub(crate) fn new(
        image: ImageId,
        descriptor: ImageDescriptor,
        slice_backing: SliceBacking,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Self> {
        let offsets = OffsetTable::new(&descriptor)?;
        let strides = descriptor
            .channel_types()
            .iter()
            .map(PixelType::stride)
            .collect();
        let tiers = TierIndex::new(&descriptor);
        let requested_region = Region::largest_possible(&descriptor);

        Ok(Self {
            image,
            descriptor,
            offsets,
            strides,
            tiers,
            requested_region,
            slice_backing,
            metrics,
        })
    }

    pub(crate) fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    pub(crate) fn offsets(&self) -> &OffsetTable {
        &self.offsets
    }

    pub(crate) fn requested_region(&self) -> Region {
        self.requested_region
    }

    pub(crate) fn set_requested_region(&mut self, region: Region) {
        self.requested_region = region;
    }

    /// Drop every item, keeping the layout
    pub(crate) fn reset(&mut self) {
        self.tiers.clear();
        self.requested_region = Region::largest_possible(&self.descriptor);
    }

    pub(crate) fn contains(&self, coord: Coord) -> bool {
        self.descriptor.contains(coord)
    }

    /// Byte size of the unit at `coord`
    pub(crate) fn unit_bytes(&self, coord: Coord) -> usize {
        self.offsets
            .unit_bytes(coord.level, self.strides[coord.channel])
    }

    fn relative_offset(&self, coord: Coord, within: Level) -> usize {
        self.offsets
            .relative_offset(coord, within, self.strides[coord.channel])
    }

    fn is_complete(&self, coord: Coord) -> bool {
        self.tiers.get(coord).map_or(false, |item| item.is_complete())
    }

    /// Whether `coord` is available without a producer pull or allocation
    pub(crate) fn is_set(&self, coord: Coord) -> bool {
        if self.is_complete(coord) {
            return true;
        }
        if coord
            .level
            .coarser()
            .iter()
            .any(|&level| self.is_complete(coord.enclosing(level)))
        {
            return true;
        }
        match coord.level {
            Level::Slice => false,
            Level::Volume => self
                .tiers
                .slices_of(coord.time, coord.channel)
                .all(|slice| self.is_complete(slice)),
            Level::Channel => self
                .tiers
                .volumes_of(coord.channel)
                .all(|volume| self.is_set(volume)),
        }
    }

    /// Existing data for `coord`, deriving or consolidating when possible
    pub(crate) fn lookup(&mut self, coord: Coord) -> Result<Option<BufferHandle>> {
        if let Some(item) = self.tiers.get(coord).filter(|item| item.is_complete()) {
            trace!(image = %self.image, %coord, "Tier hit");
            self.metrics.record_hit(coord.level);
            return Ok(Some(Arc::clone(item)));
        }

        for &level in coord.level.coarser() {
            let outer = coord.enclosing(level);
            if let Some(parent) = self.tiers.get(outer).filter(|p| p.is_complete()).cloned() {
                return self.derive(coord, &parent).map(Some);
            }
        }

        match coord.level {
            Level::Slice => Ok(None),
            Level::Volume => self.consolidate_volume(coord),
            Level::Channel => self.consolidate_channel(coord),
        }
    }

    fn derive(&mut self, coord: Coord, parent: &BufferHandle) -> Result<BufferHandle> {
        let offset = self.relative_offset(coord, parent.level());
        let len = self.unit_bytes(coord);
        let view = BufferItem::view(parent, offset, coord.level, len)?;
        view.mark_complete();
        self.tiers.insert(coord, Arc::clone(&view));
        self.metrics.record_derived(coord.level);

        debug!(
            image = %self.image,
            %coord,
            from = %parent.level(),
            offset,
            bytes = len,
            "Derived view from complete coarser buffer"
        );
        Ok(view)
    }

    fn consolidate_volume(&mut self, coord: Coord) -> Result<Option<BufferHandle>> {
        let mut slices = Vec::with_capacity(self.descriptor.slice_count());
        for slice in self.tiers.slices_of(coord.time, coord.channel) {
            match self.tiers.get(slice).filter(|item| item.is_complete()) {
                Some(item) => slices.push(Arc::clone(item)),
                None => return Ok(None),
            }
        }

        let target = match self.tiers.get(coord).cloned() {
            Some(backing) => backing,
            None if slices.len() == 1 => slices[0].relabel(Level::Volume),
            None => self.allocate(coord)?,
        };
        self.finish_consolidation(coord, target).map(Some)
    }

    fn consolidate_channel(&mut self, coord: Coord) -> Result<Option<BufferHandle>> {
        let volumes: Vec<Coord> = self.tiers.volumes_of(coord.channel).collect();
        if !volumes.iter().all(|&volume| self.is_set(volume)) {
            return Ok(None);
        }

        let mut parts = Vec::with_capacity(volumes.len());
        for volume in volumes {
            match self.lookup(volume)? {
                Some(item) => parts.push(item),
                None => return Ok(None),
            }
        }

        let target = if parts.len() == 1 {
            parts[0].relabel(Level::Channel)
        } else {
            self.allocate(coord)?
        };
        self.finish_consolidation(coord, target).map(Some)
    }

    fn finish_consolidation(&mut self, coord: Coord, target: BufferHandle) -> Result<BufferHandle> {
        self.absorb_finer(coord, &target, true)?;
        target.mark_complete();
        self.tiers.insert(coord, Arc::clone(&target));
        self.metrics.record_consolidation(coord.level);

        debug!(
            image = %self.image,
            %coord,
            bytes = target.len(),
            "Consolidated finer buffers"
        );
        Ok(target)
    }

    fn allocate(&self, coord: Coord) -> Result<BufferHandle> {
        let len = self.unit_bytes(coord);
        let item = BufferItem::allocate(coord.level, len)?;
        self.metrics.record_allocation(len);
        debug!(image = %self.image, %coord, bytes = len, "Allocated fresh buffer");
        Ok(item)
    }

    fn write_into(&self, item: &BufferItem, data: &[u8]) -> Result<()> {
        if item.write(data)? {
            self.metrics.record_detach();
            debug!(
                image = %self.image,
                level = %item.level(),
                "Detached borrowed memory before write"
            );
        }
        Ok(())
    }

    /// Point every present finer entry under `coord` at `target`
    ///
    /// Entries already viewing the right bytes of `target` are left alone.
    /// The rest are copied in first when `copy` is set, then replaced with
    /// complete views. Volumes go before slices so independent slices win
    /// over stale volume bytes.
    fn absorb_finer(&mut self, coord: Coord, target: &BufferHandle, copy: bool) -> Result<()> {
        let finer: Vec<Coord> = match coord.level {
            Level::Slice => return Ok(()),
            Level::Volume => self.tiers.slices_of(coord.time, coord.channel).collect(),
            Level::Channel => {
                let volumes = self.tiers.volumes_of(coord.channel);
                let slices = (0..self.descriptor.time_steps())
                    .flat_map(|t| self.tiers.slices_of(t, coord.channel));
                volumes.chain(slices).collect()
            }
        };

        for child in finer {
            let Some(item) = self.tiers.get(child).cloned() else {
                continue;
            };

            let offset = self.relative_offset(child, coord.level);
            let in_place = item.same_memory(target) && item.offset() == target.offset() + offset;
            if in_place {
                continue;
            }

            if copy && target.copy_from(offset, &item)? {
                self.metrics.record_detach();
            }

            let view = BufferItem::view(target, offset, child.level, item.len())?;
            view.mark_complete();
            self.tiers.insert(child, view);
        }
        Ok(())
    }

    /// Incomplete coarser buffer a new unit at `coord` should live inside
    fn backing_for(&self, coord: Coord) -> Option<BufferHandle> {
        coord.level.coarser().iter().find_map(|&level| {
            self.tiers
                .get(coord.enclosing(level))
                .filter(|item| !item.is_complete())
                .cloned()
        })
    }

    /// Install a new complete unit at `coord`
    ///
    /// Called only after `lookup` came back empty. Without a seed the unit is
    /// zero-filled and keeps whatever finer data already exists; with a seed
    /// the caller's bytes supersede finer data.
    pub(crate) fn install_fresh(
        &mut self,
        coord: Coord,
        seed: Option<ImportBuffer<'_>>,
    ) -> Result<BufferHandle> {
        let len = self.unit_bytes(coord);
        let copyable = seed
            .as_ref()
            .map_or(true, |data| data.mode() == ImportMode::Copy);
        let keep_finer = seed.is_none();

        let item = if let Some(parent) = self.backing_for(coord).filter(|_| copyable) {
            let offset = self.relative_offset(coord, parent.level());
            let view = BufferItem::view(&parent, offset, coord.level, len)?;
            if let Some(data) = &seed {
                self.write_into(&view, data.as_slice())?;
            }
            view
        } else if let Some(existing) = self.tiers.get(coord).cloned().filter(|_| copyable) {
            if let Some(data) = &seed {
                self.write_into(&existing, data.as_slice())?;
            }
            existing
        } else if copyable
            && coord.level == Level::Slice
            && self.slice_backing == SliceBacking::Volume
        {
            let volume = coord.enclosing(Level::Volume);
            let backing = self.allocate(volume)?;
            self.absorb_finer(volume, &backing, true)?;
            self.tiers.insert(volume, Arc::clone(&backing));

            let offset = self.relative_offset(coord, Level::Volume);
            let view = BufferItem::view(&backing, offset, coord.level, len)?;
            if let Some(data) = &seed {
                self.write_into(&view, data.as_slice())?;
            }
            view
        } else {
            match seed {
                None => self.allocate(coord)?,
                Some(data) => {
                    if data.mode() == ImportMode::Copy {
                        self.metrics.record_allocation(len);
                    }
                    BufferItem::from_import(coord.level, data)?
                }
            }
        };

        item.mark_complete();
        self.tiers.insert(coord, Arc::clone(&item));
        self.absorb_finer(coord, &item, keep_finer)?;

        debug!(
            image = %self.image,
            %coord,
            bytes = len,
            view = item.is_view(),
            "Installed new buffer"
        );
        Ok(item)
    }

    /// Copy one unit of `data` over an existing entry; returns its new generation
    pub(crate) fn overwrite(&self, item: &BufferItem, data: &[u8]) -> Result<u64> {
        self.write_into(item, data)?;
        item.mark_complete();
        Ok(item.touch())
    }

    pub(crate) fn entries(&self) -> Vec<(Coord, BufferHandle)> {
        self.tiers.entries()
    }

    pub(crate) fn populated(&self) -> [usize; 3] {
        self.tiers.populated_all()
    }
}

// =============================================================================
// Tests
// =============================================================================
