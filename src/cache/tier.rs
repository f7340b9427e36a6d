//! Tier Index
//!
//! Three slot arrays, one per level, addressed through [`Coord`]. The index
//! only holds handles; memory belongs to the items.

use super::descriptor::ImageDescriptor;
use super::item::BufferHandle;
use super::region::{Coord, Level};

/// Slot arrays for slices, volumes and channels
#[derive(Debug, Default)]
pub struct TierIndex {
    slots: [Vec<Option<BufferHandle>>; 3],
    slice_count: usize,
    time_steps: usize,
    channels: usize,
}

impl TierIndex {
    /// Empty index sized for `descriptor`
    pub fn new(descriptor: &ImageDescriptor) -> Self {
        let slice_count = descriptor.slice_count();
        let time_steps = descriptor.time_steps();
        let channels = descriptor.channel_count();

        Self {
            slots: [
                vec![None; channels * time_steps * slice_count],
                vec![None; channels * time_steps],
                vec![None; channels],
            ],
            slice_count,
            time_steps,
            channels,
        }
    }

    #[inline]
    fn key(&self, coord: Coord) -> usize {
        coord.flat_index(self.slice_count, self.time_steps)
    }

    pub fn get(&self, coord: Coord) -> Option<&BufferHandle> {
        let key = self.key(coord);
        self.slots[coord.level.index()]
            .get(key)
            .and_then(Option::as_ref)
    }

    /// Install `item` at `coord`, returning the previous occupant
    pub fn insert(&mut self, coord: Coord, item: BufferHandle) -> Option<BufferHandle> {
        let key = self.key(coord);
        self.slots[coord.level.index()]
            .get_mut(key)
            .and_then(|slot| slot.replace(item))
    }

    pub fn remove(&mut self, coord: Coord) -> Option<BufferHandle> {
        let key = self.key(coord);
        self.slots[coord.level.index()]
            .get_mut(key)
            .and_then(Option::take)
    }

    /// Drop every entry, keeping the slot layout
    pub fn clear(&mut self) {
        for tier in &mut self.slots {
            tier.iter_mut().for_each(|slot| *slot = None);
        }
    }

    /// Number of occupied slots at `level`
    pub fn populated(&self, level: Level) -> usize {
        self.slots[level.index()].iter().filter(|s| s.is_some()).count()
    }

    /// Occupied slot counts for slice, volume and channel
    pub fn populated_all(&self) -> [usize; 3] {
        Level::ALL.map(|level| self.populated(level))
    }

    /// Slice coordinates of one volume
    pub fn slices_of(&self, time: usize, channel: usize) -> impl Iterator<Item = Coord> {
        (0..self.slice_count).map(move |s| Coord::slice(s, time, channel))
    }

    /// Volume coordinates of one channel
    pub fn volumes_of(&self, channel: usize) -> impl Iterator<Item = Coord> {
        (0..self.time_steps).map(move |t| Coord::volume(t, channel))
    }

    /// Every populated slot, finest level first
    pub fn entries(&self) -> Vec<(Coord, BufferHandle)> {
        let mut out = Vec::new();
        for n in 0..self.channels {
            for t in 0..self.time_steps {
                for coord in self.slices_of(t, n) {
                    if let Some(item) = self.get(coord) {
                        out.push((coord, item.clone()));
                    }
                }
            }
        }
        for n in 0..self.channels {
            for coord in self.volumes_of(n) {
                if let Some(item) = self.get(coord) {
                    out.push((coord, item.clone()));
                }
            }
        }
        for n in 0..self.channels {
            let coord = Coord::channel(n);
            if let Some(item) = self.get(coord) {
                out.push((coord, item.clone()));
            }
        }
        out
    }
}
