//! Tier levels, coordinates and requested regions

use std::fmt;

use serde::Serialize;

use super::descriptor::ImageDescriptor;
use super::OFFSET_TABLE_LEN;

/// Granularity at which pixel data is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// 2-D plane of one time step
    Slice,
    /// 3-D stack of slices for one time step
    Volume,
    /// Every time step of one channel
    Channel,
}

impl Level {
    /// All levels, finest first
    pub const ALL: [Level; 3] = [Level::Slice, Level::Volume, Level::Channel];

    /// Offset table index holding the element count of one unit
    #[inline]
    pub const fn axis(self) -> usize {
        match self {
            Level::Slice => 2,
            Level::Volume => 3,
            Level::Channel => 4,
        }
    }

    /// Strictly coarser levels, nearest first
    pub fn coarser(self) -> &'static [Level] {
        match self {
            Level::Slice => &[Level::Volume, Level::Channel],
            Level::Volume => &[Level::Channel],
            Level::Channel => &[],
        }
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        match self {
            Level::Slice => 0,
            Level::Volume => 1,
            Level::Channel => 2,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Slice => write!(f, "slice"),
            Level::Volume => write!(f, "volume"),
            Level::Channel => write!(f, "channel"),
        }
    }
}

/// Logical address of one tier slot
///
/// Fields that do not apply to `level` are kept at zero by the constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Coord {
    pub level: Level,
    pub channel: usize,
    pub time: usize,
    pub slice: usize,
}

impl Coord {
    pub const fn slice(slice: usize, time: usize, channel: usize) -> Self {
        Self {
            level: Level::Slice,
            channel,
            time,
            slice,
        }
    }

    pub const fn volume(time: usize, channel: usize) -> Self {
        Self {
            level: Level::Volume,
            channel,
            time,
            slice: 0,
        }
    }

    pub const fn channel(channel: usize) -> Self {
        Self {
            level: Level::Channel,
            channel,
            time: 0,
            slice: 0,
        }
    }

    /// The unit at `level` that contains this one (itself if `level` is not coarser)
    pub fn enclosing(&self, level: Level) -> Coord {
        if level <= self.level {
            return *self;
        }
        match level {
            Level::Volume => Coord::volume(self.time, self.channel),
            Level::Channel => Coord::channel(self.channel),
            Level::Slice => *self,
        }
    }

    /// Row-major slot index inside the tier array for `level`
    #[inline]
    pub fn flat_index(&self, slice_count: usize, time_steps: usize) -> usize {
        match self.level {
            Level::Slice => {
                self.slice + self.time * slice_count + self.channel * slice_count * time_steps
            }
            Level::Volume => self.time + self.channel * time_steps,
            Level::Channel => self.channel,
        }
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            Level::Slice => write!(
                f,
                "slice(s={}, t={}, n={})",
                self.slice, self.time, self.channel
            ),
            Level::Volume => write!(f, "volume(t={}, n={})", self.time, self.channel),
            Level::Channel => write!(f, "channel(n={})", self.channel),
        }
    }
}

/// Bounding box in (x, y, slice, time, channel) space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Region {
    pub origin: [usize; OFFSET_TABLE_LEN],
    pub size: [usize; OFFSET_TABLE_LEN],
}

impl Region {
    /// Whole image, all channels
    pub fn largest_possible(descriptor: &ImageDescriptor) -> Self {
        let [x, y, z, t] = descriptor.extents();
        Self {
            origin: [0; OFFSET_TABLE_LEN],
            size: [x, y, z, t, descriptor.channel_count()],
        }
    }

    /// Minimal box covering the unit addressed by `coord`
    pub fn for_coord(coord: Coord, descriptor: &ImageDescriptor) -> Self {
        let [x, y, z, t] = descriptor.extents();
        match coord.level {
            Level::Slice => Self {
                origin: [0, 0, coord.slice, coord.time, coord.channel],
                size: [x, y, 1, 1, 1],
            },
            Level::Volume => Self {
                origin: [0, 0, 0, coord.time, coord.channel],
                size: [x, y, z, 1, 1],
            },
            Level::Channel => Self {
                origin: [0, 0, 0, 0, coord.channel],
                size: [x, y, z, t, 1],
            },
        }
    }

    pub fn number_of_pixels(&self) -> usize {
        self.size.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.number_of_pixels() == 0
    }

    /// Whether every element of `coord`'s unit lies inside this region
    pub fn covers(&self, coord: Coord, descriptor: &ImageDescriptor) -> bool {
        let unit = Region::for_coord(coord, descriptor);
        (0..OFFSET_TABLE_LEN).all(|axis| {
            unit.origin[axis] >= self.origin[axis]
                && unit.origin[axis] + unit.size[axis] <= self.origin[axis] + self.size[axis]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{PixelType, ScalarType};

    fn desc() -> ImageDescriptor {
        ImageDescriptor::new(&[8, 6, 4, 3], PixelType::scalar(ScalarType::U8), 2).unwrap()
    }

    #[test]
    fn test_flat_index() {
        // 4 slices, 3 time steps
        assert_eq!(Coord::slice(0, 0, 0).flat_index(4, 3), 0);
        assert_eq!(Coord::slice(3, 0, 0).flat_index(4, 3), 3);
        assert_eq!(Coord::slice(1, 2, 0).flat_index(4, 3), 9);
        assert_eq!(Coord::slice(1, 2, 1).flat_index(4, 3), 21);
        assert_eq!(Coord::volume(2, 1).flat_index(4, 3), 5);
        assert_eq!(Coord::channel(1).flat_index(4, 3), 1);
    }

    #[test]
    fn test_enclosing() {
        let slice = Coord::slice(3, 2, 1);
        assert_eq!(slice.enclosing(Level::Volume), Coord::volume(2, 1));
        assert_eq!(slice.enclosing(Level::Channel), Coord::channel(1));
        assert_eq!(slice.enclosing(Level::Slice), slice);

        let volume = Coord::volume(2, 1);
        assert_eq!(volume.enclosing(Level::Slice), volume);
    }

    #[test]
    fn test_requested_region_per_level() {
        let desc = desc();

        let region = Region::for_coord(Coord::slice(2, 1, 1), &desc);
        assert_eq!(region.origin, [0, 0, 2, 1, 1]);
        assert_eq!(region.size, [8, 6, 1, 1, 1]);

        let region = Region::for_coord(Coord::volume(1, 0), &desc);
        assert_eq!(region.origin, [0, 0, 0, 1, 0]);
        assert_eq!(region.size, [8, 6, 4, 1, 1]);

        let region = Region::for_coord(Coord::channel(1), &desc);
        assert_eq!(region.size, [8, 6, 4, 3, 1]);
        assert_eq!(region.number_of_pixels(), 8 * 6 * 4 * 3);
    }

    #[test]
    fn test_region_covers() {
        let desc = desc();
        let largest = Region::largest_possible(&desc);
        assert!(largest.covers(Coord::channel(1), &desc));

        let volume = Region::for_coord(Coord::volume(1, 0), &desc);
        assert!(volume.covers(Coord::slice(3, 1, 0), &desc));
        assert!(!volume.covers(Coord::slice(0, 2, 0), &desc));
        assert!(!volume.covers(Coord::channel(0), &desc));
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Slice < Level::Volume);
        assert_eq!(Level::Slice.coarser(), &[Level::Volume, Level::Channel]);
        assert!(Level::Channel.coarser().is_empty());
        assert_eq!(Level::Volume.to_string(), "volume");
    }
}
