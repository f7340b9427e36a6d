//! Dimension Descriptor and Offset Table
//!
//! The descriptor fixes the extents of the x, y, slice and time axes plus one
//! pixel type per channel. The offset table holds the cumulative products of
//! those extents and is what every tier uses for byte arithmetic.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use super::region::{Coord, Level};
use super::{MAX_RANK, OFFSET_TABLE_LEN};
use crate::error::{Error, Result};

/// Scalar component of a pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl ScalarType {
    /// Width of one component in bytes
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            ScalarType::U8 | ScalarType::I8 => 1,
            ScalarType::U16 | ScalarType::I16 => 2,
            ScalarType::U32 | ScalarType::I32 | ScalarType::F32 => 4,
            ScalarType::U64 | ScalarType::I64 | ScalarType::F64 => 8,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ScalarType::U8 => "u8",
            ScalarType::I8 => "i8",
            ScalarType::U16 => "u16",
            ScalarType::I16 => "i16",
            ScalarType::U32 => "u32",
            ScalarType::I32 => "i32",
            ScalarType::U64 => "u64",
            ScalarType::I64 => "i64",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScalarType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "u8" | "uchar" => Ok(ScalarType::U8),
            "i8" | "char" => Ok(ScalarType::I8),
            "u16" | "ushort" => Ok(ScalarType::U16),
            "i16" | "short" => Ok(ScalarType::I16),
            "u32" | "uint" => Ok(ScalarType::U32),
            "i32" | "int" => Ok(ScalarType::I32),
            "u64" => Ok(ScalarType::U64),
            "i64" => Ok(ScalarType::I64),
            "f32" | "float" => Ok(ScalarType::F32),
            "f64" | "double" => Ok(ScalarType::F64),
            _ => Err(Error::UnknownPixelType(s.to_string())),
        }
    }
}

/// Pixel type of a channel: a scalar repeated `components` times
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PixelType {
    scalar: ScalarType,
    components: u8,
}

impl PixelType {
    /// Single-component pixel
    pub const fn scalar(scalar: ScalarType) -> Self {
        Self {
            scalar,
            components: 1,
        }
    }

    /// Three-component (RGB) pixel
    pub const fn rgb(scalar: ScalarType) -> Self {
        Self {
            scalar,
            components: 3,
        }
    }

    /// Pixel with an arbitrary component count (at least one)
    pub fn vector(scalar: ScalarType, components: u8) -> Self {
        Self {
            scalar,
            components: components.max(1),
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.scalar
    }

    pub fn components(&self) -> u8 {
        self.components
    }

    /// Byte size of one pixel element
    #[inline]
    pub fn stride(&self) -> usize {
        self.scalar.size() * self.components as usize
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.components {
            1 => write!(f, "{}", self.scalar),
            3 => write!(f, "rgb<{}>", self.scalar),
            n => write!(f, "vec{}<{}>", n, self.scalar),
        }
    }
}

impl FromStr for PixelType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        if let Some(inner) = lower.strip_prefix("rgb<").and_then(|r| r.strip_suffix('>')) {
            return Ok(PixelType::rgb(inner.parse()?));
        }
        Ok(PixelType::scalar(lower.parse()?))
    }
}

/// Immutable description of an image's extents and channel pixel types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    rank: usize,
    /// x, y, slice, time; axes beyond `rank` are held at 1
    extents: [usize; MAX_RANK],
    channels: Vec<PixelType>,
}

impl ImageDescriptor {
    /// Create a descriptor whose channels all share one pixel type
    pub fn new(dimensions: &[usize], pixel_type: PixelType, channels: usize) -> Result<Self> {
        Self::with_channel_types(dimensions, vec![pixel_type; channels])
    }

    /// Create a descriptor with one pixel type per channel
    pub fn with_channel_types(dimensions: &[usize], channels: Vec<PixelType>) -> Result<Self> {
        let rank = dimensions.len();
        if rank == 0 || rank > MAX_RANK {
            return Err(Error::InvalidRank { rank });
        }

        let mut extents = [1usize; MAX_RANK];
        for (axis, &extent) in dimensions.iter().enumerate() {
            if extent < 1 {
                return Err(Error::InvalidDimension { axis, extent });
            }
            extents[axis] = extent;
        }

        if channels.is_empty() {
            return Err(Error::InvalidDimension {
                axis: MAX_RANK,
                extent: 0,
            });
        }

        Ok(Self {
            rank,
            extents,
            channels,
        })
    }

    /// Number of declared axes (1..=4)
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Extent of an axis; 1 for anything past the declared rank
    pub fn dimension(&self, axis: usize) -> usize {
        if axis < self.rank {
            self.extents[axis]
        } else {
            1
        }
    }

    /// The four spatio-temporal extents (x, y, slice, time)
    pub fn extents(&self) -> [usize; MAX_RANK] {
        self.extents
    }

    pub fn slice_count(&self) -> usize {
        self.extents[2]
    }

    pub fn time_steps(&self) -> usize {
        self.extents[3]
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn pixel_type(&self, channel: usize) -> Option<PixelType> {
        self.channels.get(channel).copied()
    }

    pub fn channel_types(&self) -> &[PixelType] {
        &self.channels
    }

    /// Whether `coord` addresses an existing slice, volume or channel
    pub fn contains(&self, coord: Coord) -> bool {
        if coord.channel >= self.channel_count() {
            return false;
        }
        match coord.level {
            Level::Channel => true,
            Level::Volume => coord.time < self.time_steps(),
            Level::Slice => coord.time < self.time_steps() && coord.slice < self.slice_count(),
        }
    }
}

/// Cumulative-product table over the descriptor's extents
///
/// `offset[0] = 1`, `offset[i + 1] = offset[i] * extent[i]`. Entry 2 is the
/// element count of a slice, 3 of a volume and 4 of a whole channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OffsetTable {
    offsets: [usize; OFFSET_TABLE_LEN],
}

impl OffsetTable {
    /// Build the table, refusing descriptors whose largest channel would
    /// overflow `usize` bytes
    pub fn new(descriptor: &ImageDescriptor) -> Result<Self> {
        let mut offsets = [1usize; OFFSET_TABLE_LEN];
        let mut num = 1usize;
        for axis in 0..MAX_RANK {
            num = num
                .checked_mul(descriptor.dimension(axis))
                .ok_or(Error::ImageTooLarge)?;
            offsets[axis + 1] = num;
        }

        let widest = descriptor
            .channel_types()
            .iter()
            .map(PixelType::stride)
            .max()
            .unwrap_or(1);
        num.checked_mul(widest).ok_or(Error::ImageTooLarge)?;

        Ok(Self { offsets })
    }

    /// Raw table entry
    #[inline]
    pub fn get(&self, index: usize) -> usize {
        self.offsets[index]
    }

    pub fn as_array(&self) -> [usize; OFFSET_TABLE_LEN] {
        self.offsets
    }

    /// Element count of one unit at `level`; also the stride, in elements,
    /// for moving one unit along the axis that defines `level`
    #[inline]
    pub fn elements(&self, level: Level) -> usize {
        self.offsets[level.axis()]
    }

    /// Byte size of one unit at `level`
    #[inline]
    pub fn unit_bytes(&self, level: Level, stride: usize) -> usize {
        self.elements(level) * stride
    }

    /// Byte offset of `coord` from the start of its channel buffer
    pub fn channel_offset(&self, coord: Coord, stride: usize) -> usize {
        let elements = match coord.level {
            Level::Slice => coord.slice * self.offsets[2] + coord.time * self.offsets[3],
            Level::Volume => coord.time * self.offsets[3],
            Level::Channel => 0,
        };
        elements * stride
    }

    /// Byte offset of `coord` inside the enclosing unit at `within`
    pub fn relative_offset(&self, coord: Coord, within: Level, stride: usize) -> usize {
        self.channel_offset(coord, stride) - self.channel_offset(coord.enclosing(within), stride)
    }
}
