//! Property-Based Tests for the Voxel-Buffer Cache
//!
//! Uses proptest to drive images through random write/read sequences and
//! check the cache's structural guarantees.
//!
//! # Test Properties
//!
//! 1. **Offset Table**: `offset[0] = 1`, `offset[i + 1] = offset[i] * extent[i]`
//! 2. **Monotonic Completeness**: once set, a coordinate stays set
//! 3. **Consolidation**: a volume built slice by slice equals their concatenation
//! 4. **Notification**: one event per overwrite, none per first fill
//! 5. **View Containment**: every view lies inside its parent
//! 6. **Detach**: overwriting a borrowed region leaves the rest untouched
//! 7. **Single Pull**: an unhelpful producer is invoked exactly once

#![cfg(test)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;

use super::descriptor::{ImageDescriptor, OffsetTable, PixelType, ScalarType};
use super::events::channel_observer;
use super::image::{CacheConfig, Image, SliceBacking};
use super::item::ImportBuffer;
use super::producer::{Producer, UpdateFlag};
use super::region::{Coord, Level};
use crate::error::Result;

// Shared layout for sequence tests: 2x2 pixels, 3 slices, 2 time steps, u8
const DIMS: [usize; 4] = [2, 2, 3, 2];
const SLICES: usize = 3;
const TIMES: usize = 2;
const CHANNEL_BYTES: usize = 2 * 2 * 3 * 2;

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Set(Coord, u8),
    Get(Coord),
}

/// Strategy for any coordinate of the shared layout
fn coord_strategy() -> impl Strategy<Value = Coord> {
    prop_oneof![
        4 => (0..SLICES, 0..TIMES).prop_map(|(s, t)| Coord::slice(s, t, 0)),
        2 => (0..TIMES).prop_map(|t| Coord::volume(t, 0)),
        1 => Just(Coord::channel(0)),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (coord_strategy(), any::<u8>()).prop_map(|(c, v)| Op::Set(c, v)),
        2 => coord_strategy().prop_map(Op::Get),
    ]
}

fn backing_strategy() -> impl Strategy<Value = SliceBacking> {
    prop_oneof![Just(SliceBacking::Independent), Just(SliceBacking::Volume)]
}

/// Strategy for descriptors of rank 1 to 4 with small extents
fn descriptor_strategy() -> impl Strategy<Value = ImageDescriptor> {
    (prop::collection::vec(1usize..=7, 1..=4), 1usize..=3).prop_map(|(dims, channels)| {
        ImageDescriptor::new(&dims, PixelType::scalar(ScalarType::U16), channels).unwrap()
    })
}

// =============================================================================
// Helpers
// =============================================================================

fn shared_image(backing: SliceBacking) -> Image {
    let image = Image::with_config(CacheConfig {
        slice_backing: backing,
        ..CacheConfig::default()
    });
    image
        .initialize_with(&DIMS, PixelType::scalar(ScalarType::U8), 1)
        .unwrap();
    image
}

fn all_coords() -> Vec<Coord> {
    let mut coords = Vec::new();
    for t in 0..TIMES {
        for s in 0..SLICES {
            coords.push(Coord::slice(s, t, 0));
        }
        coords.push(Coord::volume(t, 0));
    }
    coords.push(Coord::channel(0));
    coords
}

/// Byte range of `coord` inside the channel
fn channel_range(image: &Image, coord: Coord) -> std::ops::Range<usize> {
    let offsets = OffsetTable::new(&image.descriptor().unwrap()).unwrap();
    let start = offsets.channel_offset(coord, 1);
    start..start + image.unit_bytes(coord).unwrap()
}

/// Byte-level model of channel 0: `None` where nothing is set yet
struct Model {
    bytes: Vec<Option<u8>>,
}

impl Model {
    fn new() -> Self {
        Self {
            bytes: vec![None; CHANNEL_BYTES],
        }
    }

    fn write(&mut self, range: std::ops::Range<usize>, value: u8) {
        self.bytes[range].iter_mut().for_each(|b| *b = Some(value));
    }

    /// Check `actual` against known bytes, then treat the range as known
    fn read(&mut self, range: std::ops::Range<usize>, actual: &[u8]) -> bool {
        let ok = self.bytes[range.clone()]
            .iter()
            .zip(actual)
            .all(|(expected, got)| expected.map_or(*got == 0, |e| e == *got));
        for (slot, got) in self.bytes[range].iter_mut().zip(actual) {
            *slot = Some(*got);
        }
        ok
    }
}

struct IdleProducer {
    calls: AtomicUsize,
    flag: UpdateFlag,
}

impl Producer for IdleProducer {
    fn is_updating(&self) -> bool {
        self.flag.is_set()
    }

    fn update(&self, _image: &Image) -> Result<()> {
        let _guard = self.flag.raise();
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Offset Table Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: cumulative products over the extents, flat past the rank
    #[test]
    fn prop_offset_table_products(descriptor in descriptor_strategy()) {
        let table = OffsetTable::new(&descriptor).unwrap();

        prop_assert_eq!(table.get(0), 1);
        for axis in 0..4 {
            prop_assert_eq!(table.get(axis + 1), table.get(axis) * descriptor.dimension(axis));
        }
        for axis in descriptor.rank()..4 {
            prop_assert_eq!(table.get(axis + 1), table.get(axis));
        }
    }
}

// =============================================================================
// Sequence Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: set-ness never regresses, and reads match what was written
    #[test]
    fn prop_completeness_is_monotonic(
        backing in backing_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..40),
    ) {
        let image = shared_image(backing);
        let coords = all_coords();
        let mut model = Model::new();
        let mut was_set = vec![false; coords.len()];

        for op in ops {
            match op {
                Op::Set(coord, value) => {
                    let len = image.unit_bytes(coord).unwrap();
                    prop_assert!(image.set(coord, &vec![value; len]).unwrap());
                    model.write(channel_range(&image, coord), value);
                }
                Op::Get(coord) => {
                    let item = image.get(coord).unwrap().unwrap();
                    prop_assert_eq!(item.level(), coord.level);
                    let bytes = item.to_vec();
                    prop_assert!(model.read(channel_range(&image, coord), &bytes), "{} mismatch", coord);
                }
            }

            for (i, &coord) in coords.iter().enumerate() {
                let now = image.is_set(coord);
                prop_assert!(!was_set[i] || now, "{} became unset", coord);
                was_set[i] = now;
            }
        }
    }

    /// Property: events are emitted exactly for writes onto set coordinates
    #[test]
    fn prop_notifications_only_on_overwrite(
        backing in backing_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..40),
    ) {
        let image = shared_image(backing);
        let (observer, rx) = channel_observer();
        image.subscribe(observer);
        let mut expected = 0usize;

        for op in ops {
            match op {
                Op::Set(coord, value) => {
                    let overwrite = image.is_set(coord);
                    let len = image.unit_bytes(coord).unwrap();
                    image.set(coord, &vec![value; len]).unwrap();
                    if overwrite {
                        expected += 1;
                    }
                    prop_assert_eq!(rx.try_iter().count(), usize::from(overwrite));
                }
                Op::Get(coord) => {
                    image.get(coord).unwrap();
                    prop_assert_eq!(rx.try_iter().count(), 0);
                }
            }
        }
        prop_assert_eq!(image.modification_count(), expected as u64);
    }

    /// Property: every view lies within its root
    #[test]
    fn prop_views_are_contained(
        backing in backing_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..40),
    ) {
        let image = shared_image(backing);
        for op in ops {
            match op {
                Op::Set(coord, value) => {
                    let len = image.unit_bytes(coord).unwrap();
                    image.set(coord, &vec![value; len]).unwrap();
                }
                Op::Get(coord) => {
                    image.get(coord).unwrap();
                }
            }
        }

        for (coord, item) in image.entries() {
            prop_assert_eq!(item.len(), image.unit_bytes(coord).unwrap());
            if let Some(parent) = item.parent() {
                prop_assert!(!parent.is_view());
                prop_assert!(item.offset() + item.len() <= parent.len(), "{} escapes parent", coord);
            }
        }
    }
}

// =============================================================================
// Consolidation & Detach Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: slices written in any order consolidate into their concatenation
    #[test]
    fn prop_consolidation_equivalence(
        backing in backing_strategy(),
        (slices, order) in (1usize..=6).prop_flat_map(|n| {
            (
                prop::collection::vec(prop::collection::vec(any::<u8>(), 6), n),
                Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
            )
        }),
    ) {
        let image = Image::with_config(CacheConfig { slice_backing: backing, ..CacheConfig::default() });
        image
            .initialize_with(&[3, 2, slices.len()], PixelType::scalar(ScalarType::U8), 1)
            .unwrap();

        for &s in &order {
            prop_assert!(!image.is_set(Coord::volume(0, 0)));
            image.set(Coord::slice(s, 0, 0), &slices[s]).unwrap();
        }
        prop_assert!(image.is_set(Coord::volume(0, 0)));

        let volume = image.get(Coord::volume(0, 0)).unwrap().unwrap();
        prop_assert_eq!(volume.to_vec(), slices.concat());

        for (s, expected) in slices.iter().enumerate() {
            let slice = image.get(Coord::slice(s, 0, 0)).unwrap().unwrap();
            prop_assert!(slice.same_memory(&volume));
            prop_assert_eq!(&slice.to_vec(), expected);
        }
        prop_assert_eq!(image.metrics().producer_invocations, 0);
    }

    /// Property: overwriting one slice of a borrowed volume changes only that slice
    #[test]
    fn prop_detach_preserves_neighbours(
        original in prop::collection::vec(any::<u8>(), 4 * 5),
        slice in 0usize..5,
        fill in any::<u8>(),
    ) {
        let image = Image::new();
        image
            .initialize_with(&[2, 2, 5], PixelType::scalar(ScalarType::U8), 1)
            .unwrap();
        let shared = Bytes::from(original.clone());
        image
            .import_set(Coord::volume(0, 0), ImportBuffer::Borrow(shared.clone()))
            .unwrap();

        image.set(Coord::slice(slice, 0, 0), &[fill; 4]).unwrap();

        prop_assert_eq!(&shared[..], &original[..]);
        let volume = image.get(Coord::volume(0, 0)).unwrap().unwrap().to_vec();
        for (i, byte) in volume.iter().enumerate() {
            if i / 4 == slice {
                prop_assert_eq!(*byte, fill);
            } else {
                prop_assert_eq!(*byte, original[i]);
            }
        }
        prop_assert_eq!(image.metrics().detaches, 1);
    }
}

// =============================================================================
// Producer Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Property: a producer that never fills the region is called once per miss
    #[test]
    fn prop_single_producer_pull(coord in coord_strategy()) {
        let image = shared_image(SliceBacking::Independent);
        let producer = Arc::new(IdleProducer { calls: AtomicUsize::new(0), flag: UpdateFlag::new() });
        image.set_producer(Some(producer.clone()));

        let item = image.get(coord).unwrap().unwrap();
        prop_assert_eq!(producer.calls.load(Ordering::SeqCst), 1);
        prop_assert!(item.read().iter().all(|&b| b == 0));

        let metrics = image.metrics();
        prop_assert_eq!(metrics.producer_invocations, 1);
        prop_assert_eq!(metrics.producer_misses, 1);
        prop_assert_eq!(metrics.tier(Level::Slice).hits, 0);

        // now materialized; no further pull
        image.get(coord).unwrap().unwrap();
        prop_assert_eq!(producer.calls.load(Ordering::SeqCst), 1);
    }
}
