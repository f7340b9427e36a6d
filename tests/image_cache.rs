//! Voxel-Buffer Cache Integration Tests
//!
//! Tests against the public API:
//! - Slice-by-slice fill and volume consolidation
//! - Producer pull, single retry, re-entry and worker threads
//! - Change notification
//! - Concurrent readers and writers
//! - Image registry

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;

use voxcache::cache::{channel_observer, ImportMode};
use voxcache::{
    CacheConfig, Coord, Error, Image, ImageRegistry, ImportBuffer, Level, PixelType, Producer,
    Result, ScalarType, SliceBacking, UpdateFlag,
};

fn u8_image(dims: &[usize], channels: usize) -> Image {
    let image = Image::new();
    image
        .initialize_with(dims, PixelType::scalar(ScalarType::U8), channels)
        .unwrap();
    image
}

// =============================================================================
// Consolidation
// =============================================================================

mod consolidation_tests {
    use super::*;

    #[test]
    fn test_four_slices_consolidate_into_volume() {
        // 10x10 pixels, 4 slices, 1 time step, 2 channels, 1-byte pixels
        let image = u8_image(&[10, 10, 4, 1], 2);

        let patterns: Vec<Vec<u8>> = (0..4u8).map(|s| vec![0xA0 + s; 100]).collect();
        for (s, pattern) in patterns.iter().enumerate() {
            assert!(!image.is_set(Coord::volume(0, 0)));
            assert!(image.set(Coord::slice(s, 0, 0), pattern).unwrap());
        }

        assert!(image.is_set(Coord::volume(0, 0)));
        assert!(!image.is_set(Coord::volume(0, 1)));

        let volume = image.get(Coord::volume(0, 0)).unwrap().unwrap();
        assert_eq!(volume.len(), 400);
        assert_eq!(volume.to_vec(), patterns.concat());

        for (s, pattern) in patterns.iter().enumerate() {
            let slice = image.get(Coord::slice(s, 0, 0)).unwrap().unwrap();
            assert!(slice.is_view());
            assert!(slice.same_memory(&volume));
            assert_eq!(&slice.to_vec(), pattern);
        }

        let metrics = image.metrics();
        assert_eq!(metrics.volume.consolidations, 1);
        assert_eq!(metrics.producer_invocations, 0);
    }

    #[test]
    fn test_channel_spans_time_steps() {
        let image = u8_image(&[2, 2, 1, 3], 1);
        for t in 0..3 {
            image.set(Coord::volume(t, 0), &[t as u8 + 1; 4]).unwrap();
        }
        assert!(image.is_set(Coord::channel(0)));

        let channel = image.get(Coord::channel(0)).unwrap().unwrap();
        assert_eq!(channel.to_vec(), vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
        assert_eq!(channel.level(), Level::Channel);

        // slices of a complete channel are derived lazily
        let slice = image.get(Coord::slice(0, 2, 0)).unwrap().unwrap();
        assert_eq!(slice.to_vec(), vec![3; 4]);
        assert!(slice.same_memory(&channel));
    }

    #[test]
    fn test_volume_backed_slices_need_no_copy() {
        let image = Image::with_config(CacheConfig {
            slice_backing: SliceBacking::Volume,
            ..CacheConfig::default()
        });
        image
            .initialize_with(&[4, 4, 8], PixelType::scalar(ScalarType::U8), 1)
            .unwrap();

        for s in 0..8 {
            image.set(Coord::slice(s, 0, 0), &[s as u8; 16]).unwrap();
        }
        let volume = image.get(Coord::volume(0, 0)).unwrap().unwrap();
        assert_eq!(volume.to_vec()[16 * 7], 7);

        let metrics = image.metrics();
        assert_eq!(metrics.fresh_allocations, 1);
        assert_eq!(metrics.bytes_allocated, 128);
    }

    #[test]
    fn test_multi_component_pixels() {
        let image = Image::new();
        image
            .initialize_with(&[2, 2, 2], PixelType::rgb(ScalarType::U16), 1)
            .unwrap();
        assert_eq!(image.unit_bytes(Coord::slice(0, 0, 0)), Some(24));

        image.set(Coord::slice(0, 0, 0), &[1; 24]).unwrap();
        image.set(Coord::slice(1, 0, 0), &[2; 24]).unwrap();
        let volume = image.get(Coord::volume(0, 0)).unwrap().unwrap();
        assert_eq!(volume.len(), 48);
        assert_eq!(volume.to_vec()[24], 2);
    }
}

// =============================================================================
// Producer Protocol
// =============================================================================

mod producer_tests {
    use super::*;

    /// Fills the requested channel with ones by adopting a fresh buffer
    struct OnesProducer {
        calls: AtomicUsize,
        flag: UpdateFlag,
    }

    impl OnesProducer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                flag: UpdateFlag::new(),
            })
        }
    }

    impl Producer for OnesProducer {
        fn is_updating(&self) -> bool {
            self.flag.is_set()
        }

        fn update(&self, image: &Image) -> Result<()> {
            let _guard = self.flag.raise();
            self.calls.fetch_add(1, Ordering::SeqCst);

            let region = image.requested_region().ok_or(Error::NotInitialized)?;
            let channel = Coord::channel(region.origin[4]);
            let len = image.unit_bytes(channel).ok_or(Error::NotInitialized)?;
            image.import_set(channel, ImportBuffer::Adopt(vec![1u8; len]))?;
            Ok(())
        }
    }

    struct FailingProducer;

    impl Producer for FailingProducer {
        fn is_updating(&self) -> bool {
            false
        }

        fn update(&self, _image: &Image) -> Result<()> {
            Err(Error::producer("upstream reader offline"))
        }
    }

    #[test]
    fn test_slice_pull_fills_whole_channel() {
        let image = u8_image(&[10, 10, 4, 1], 2);
        let producer = OnesProducer::new();
        image.set_producer(Some(producer.clone()));

        let slice = image.get(Coord::slice(2, 0, 0)).unwrap().unwrap();
        assert_eq!(producer.calls.load(Ordering::SeqCst), 1);
        assert!(slice.is_view());
        assert_eq!(slice.len(), 100);
        assert!(slice.read().iter().all(|&b| b == 1));

        let region = image.requested_region().unwrap();
        assert_eq!(region.origin, [0, 0, 2, 0, 0]);
        assert_eq!(region.size, [10, 10, 1, 1, 1]);

        // the rest of the channel is already there
        image.get(Coord::slice(0, 0, 0)).unwrap().unwrap();
        image.get(Coord::volume(0, 0)).unwrap().unwrap();
        assert_eq!(producer.calls.load(Ordering::SeqCst), 1);
        assert!(!image.is_set(Coord::channel(1)));
    }

    #[test]
    fn test_producer_fill_is_not_a_modification() {
        let image = u8_image(&[4, 4, 2], 1);
        let (observer, rx) = channel_observer();
        image.subscribe(observer);
        image.set_producer(Some(OnesProducer::new()));

        image.get(Coord::volume(0, 0)).unwrap().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(image.metrics().first_fills, 1);
    }

    #[test]
    fn test_producer_error_propagates() {
        let image = u8_image(&[4, 4], 1);
        image.set_producer(Some(Arc::new(FailingProducer)));

        let err = image.get(Coord::slice(0, 0, 0)).unwrap_err();
        assert_matches!(err, Error::Producer(_));
        assert!(!image.is_set(Coord::slice(0, 0, 0)));
        assert!(image.entries().is_empty());
    }

    #[test]
    fn test_set_never_pulls() {
        let image = u8_image(&[4, 4], 1);
        let producer = OnesProducer::new();
        image.set_producer(Some(producer.clone()));

        image.set(Coord::slice(0, 0, 0), &[5; 16]).unwrap();
        assert!(image.is_set(Coord::slice(0, 0, 0)));
        assert_eq!(producer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_busy_producer_is_skipped() {
        let image = u8_image(&[4, 4], 1);
        let producer = OnesProducer::new();
        image.set_producer(Some(producer.clone()));

        let _busy = producer.flag.raise();
        let slice = image.get(Coord::slice(0, 0, 0)).unwrap().unwrap();
        assert_eq!(producer.calls.load(Ordering::SeqCst), 0);
        assert!(slice.read().iter().all(|&b| b == 0));
    }

    /// Reads its own image while filling it
    struct ReentrantProducer {
        flag: UpdateFlag,
    }

    impl Producer for ReentrantProducer {
        fn is_updating(&self) -> bool {
            self.flag.is_set()
        }

        fn update(&self, image: &Image) -> Result<()> {
            let _guard = self.flag.raise();
            for s in 0..2 {
                let coord = Coord::slice(s, 0, 0);
                image.set(coord, &[s as u8 + 7; 9])?;
                // observed through the normal read path
                let back = image.get(coord)?.ok_or(Error::NotInitialized)?;
                assert_eq!(back.to_vec(), vec![s as u8 + 7; 9]);
            }
            Ok(())
        }
    }

    #[test]
    fn test_producer_may_call_back_into_image() {
        let image = u8_image(&[3, 3, 2], 1);
        image.set_producer(Some(Arc::new(ReentrantProducer {
            flag: UpdateFlag::new(),
        })));

        let volume = image.get(Coord::volume(0, 0)).unwrap().unwrap();
        let mut expected = vec![7u8; 9];
        expected.extend_from_slice(&[8; 9]);
        assert_eq!(volume.to_vec(), expected);
        assert_eq!(image.metrics().producer_misses, 0);
    }

    /// Hands the fill to a worker thread and waits for it
    struct WorkerProducer {
        calls: AtomicUsize,
        flag: UpdateFlag,
    }

    impl Producer for WorkerProducer {
        fn is_updating(&self) -> bool {
            self.flag.is_set()
        }

        fn update(&self, image: &Image) -> Result<()> {
            let _guard = self.flag.raise();
            self.calls.fetch_add(1, Ordering::SeqCst);
            let region = image.requested_region().ok_or(Error::NotInitialized)?;
            let volume = Coord::volume(region.origin[3], region.origin[4]);

            thread::scope(|scope| {
                let worker = scope.spawn(|| -> Result<Vec<u8>> {
                    let first = Coord::slice(0, volume.time, volume.channel);
                    let before = image.get(first)?.ok_or(Error::NotInitialized)?;
                    image.set(volume, &[6; 18])?;
                    Ok(before.to_vec())
                });
                worker
                    .join()
                    .map_err(|_| Error::producer("worker panicked"))?
            })
            .map(|before| assert_eq!(before, vec![0; 9]))
        }
    }

    #[test]
    fn test_producer_worker_thread_reads_image() {
        let image = u8_image(&[3, 3, 2], 1);
        let producer = Arc::new(WorkerProducer {
            calls: AtomicUsize::new(0),
            flag: UpdateFlag::new(),
        });
        image.set_producer(Some(producer.clone()));

        let volume = image.get(Coord::volume(0, 0)).unwrap().unwrap();
        assert_eq!(volume.to_vec(), vec![6; 18]);
        assert_eq!(producer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(image.metrics().producer_misses, 0);

        let slice = image.get(Coord::slice(0, 0, 0)).unwrap().unwrap();
        assert!(slice.same_memory(&volume));
        assert_eq!(slice.to_vec(), vec![6; 9]);
    }
}

// =============================================================================
// Ownership & Notification
// =============================================================================

mod write_path_tests {
    use super::*;

    #[test]
    fn test_import_modes() {
        let image = u8_image(&[2, 2, 3], 1);
        let borrowed = Bytes::from(vec![3u8; 4]);

        image
            .import_set(Coord::slice(0, 0, 0), ImportBuffer::Copy(&[1; 4]))
            .unwrap();
        image
            .import_set(Coord::slice(1, 0, 0), ImportBuffer::Adopt(vec![2; 4]))
            .unwrap();
        image
            .import_set(Coord::slice(2, 0, 0), borrowed.clone().into())
            .unwrap();
        assert_eq!(ImportBuffer::from(borrowed.clone()).mode(), ImportMode::Borrow);

        let zero_copy = image.get(Coord::slice(2, 0, 0)).unwrap().unwrap();
        assert!(!zero_copy.manages_memory());

        let volume = image.get(Coord::volume(0, 0)).unwrap().unwrap();
        assert_eq!(volume.to_vec(), vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
        assert!(volume.manages_memory());
    }

    #[test]
    fn test_overwrite_through_view_updates_volume() {
        let image = u8_image(&[2, 2, 2], 1);
        let (observer, rx) = channel_observer();
        image.subscribe(observer);

        image.set(Coord::volume(0, 0), &[0; 8]).unwrap();
        assert!(rx.try_recv().is_err());

        image.set(Coord::slice(1, 0, 0), &[6; 4]).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.coord, Coord::slice(1, 0, 0));
        assert_eq!(event.modification, 1);

        let volume = image.get(Coord::volume(0, 0)).unwrap().unwrap();
        assert_eq!(volume.to_vec(), vec![0, 0, 0, 0, 6, 6, 6, 6]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_handles_outlive_reset() {
        let image = u8_image(&[2, 2], 1);
        image.set(Coord::slice(0, 0, 0), &[4; 4]).unwrap();
        let handle = image.get(Coord::slice(0, 0, 0)).unwrap().unwrap();

        image.reset().unwrap();
        assert!(!image.is_set(Coord::slice(0, 0, 0)));
        assert_eq!(handle.to_vec(), vec![4; 4]);
    }

    #[test]
    fn test_reinitialize_replaces_layout() {
        let image = u8_image(&[2, 2], 1);
        image.set(Coord::slice(0, 0, 0), &[4; 4]).unwrap();

        image
            .initialize_with(&[3, 3, 2], PixelType::scalar(ScalarType::F32), 1)
            .unwrap();
        assert!(!image.is_set(Coord::slice(0, 0, 0)));
        assert_eq!(image.unit_bytes(Coord::slice(0, 0, 0)), Some(36));

        let err = image.set(Coord::slice(0, 0, 0), &[0; 9]).unwrap_err();
        assert_matches!(err, Error::BufferSizeMismatch { expected: 36, actual: 9, .. });
    }

    #[test]
    fn test_metrics_snapshot_json() {
        let image = u8_image(&[2, 2, 2], 1);
        image.set(Coord::slice(0, 0, 0), &[1; 4]).unwrap();
        image.set(Coord::slice(1, 0, 0), &[1; 4]).unwrap();
        image.get(Coord::volume(0, 0)).unwrap();

        let json = serde_json::to_value(image.metrics()).unwrap();
        assert_eq!(json["first_fills"], 2);
        assert_eq!(json["volume"]["consolidations"], 1);
        assert_eq!(json["volume"]["entries"], 1);
        assert_eq!(json["slice"]["entries"], 2);
    }
}

// =============================================================================
// Concurrency
// =============================================================================

mod concurrency_tests {
    use super::*;

    #[test]
    fn test_concurrent_slice_writers_consolidate() {
        let image = u8_image(&[8, 8, 16], 1);

        thread::scope(|scope| {
            for s in 0..16 {
                let image = &image;
                scope.spawn(move || {
                    image.set(Coord::slice(s, 0, 0), &[s as u8; 64]).unwrap();
                });
            }
        });

        let volume = image.get(Coord::volume(0, 0)).unwrap().unwrap();
        for s in 0..16 {
            assert!(volume.read()[s * 64..(s + 1) * 64]
                .iter()
                .all(|&b| b == s as u8));
        }
    }

    /// Counts pulls, filling the requested volume
    struct CountingProducer {
        calls: AtomicUsize,
        flag: UpdateFlag,
    }

    impl Producer for CountingProducer {
        fn is_updating(&self) -> bool {
            self.flag.is_set()
        }

        fn update(&self, image: &Image) -> Result<()> {
            let _guard = self.flag.raise();
            self.calls.fetch_add(1, Ordering::SeqCst);
            let region = image.requested_region().ok_or(Error::NotInitialized)?;
            let volume = Coord::volume(region.origin[3], region.origin[4]);
            image.set(volume, &[9; 32])?;
            Ok(())
        }
    }

    #[test]
    fn test_concurrent_readers_pull_once() {
        let image = u8_image(&[4, 4, 2], 1);
        let producer = Arc::new(CountingProducer {
            calls: AtomicUsize::new(0),
            flag: UpdateFlag::new(),
        });
        image.set_producer(Some(producer.clone()));

        thread::scope(|scope| {
            for _ in 0..8 {
                let image = &image;
                scope.spawn(move || {
                    let slice = image.get(Coord::slice(1, 0, 0)).unwrap().unwrap();
                    // readers arriving mid-pull get a fresh unit instead of waiting
                    let bytes = slice.read();
                    assert!(bytes.iter().all(|&b| b == 9) || bytes.iter().all(|&b| b == 0));
                });
            }
        });

        assert_eq!(producer.calls.load(Ordering::SeqCst), 1);
        let slice = image.get(Coord::slice(1, 0, 0)).unwrap().unwrap();
        assert_eq!(slice.to_vec(), vec![9; 16]);
    }

    fn consolidated_pair() -> Image {
        let image = u8_image(&[4, 4, 2], 1);
        image.set(Coord::slice(0, 0, 0), &[1; 16]).unwrap();
        image.set(Coord::slice(1, 0, 0), &[2; 16]).unwrap();
        assert!(image.get(Coord::volume(0, 0)).unwrap().is_some());
        image
    }

    #[test]
    fn test_held_bytes_do_not_block_writers() {
        let image = consolidated_pair();
        let (held_tx, held_rx) = crossbeam::channel::bounded(0);
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);

        thread::scope(|scope| {
            let image = &image;
            scope.spawn(move || {
                let first = image.get(Coord::slice(0, 0, 0)).unwrap().unwrap();
                let held = first.read();
                held_tx.send(()).unwrap();
                done_rx
                    .recv_timeout(Duration::from_secs(5))
                    .expect("writer finished while bytes were held");

                // a neighbouring slice of the same volume, through both paths
                let second = image.get(Coord::slice(1, 0, 0)).unwrap().unwrap();
                assert_eq!(&*second.read(), &[2; 16]);
                assert!(image.is_set(Coord::volume(0, 0)));
                assert_eq!(&*held, &[1; 16]);
            });
            scope.spawn(move || {
                held_rx.recv().unwrap();
                image.set(Coord::slice(0, 0, 0), &[3; 16]).unwrap();
                done_tx.send(()).unwrap();
            });
        });

        let volume = image.get(Coord::volume(0, 0)).unwrap().unwrap();
        assert_eq!(&volume.to_vec()[..16], &[3; 16]);
        assert_eq!(&volume.to_vec()[16..], &[2; 16]);
    }

    #[test]
    fn test_image_calls_while_holding_bytes() {
        let image = consolidated_pair();

        thread::scope(|scope| {
            let image = &image;
            scope.spawn(move || {
                for round in 0..200u8 {
                    image.set(Coord::slice(0, 0, 0), &[round; 16]).unwrap();
                }
            });
            scope.spawn(move || {
                let first = image.get(Coord::slice(0, 0, 0)).unwrap().unwrap();
                let held = first.read();
                let expected = held.to_vec();
                for round in 0..200u8 {
                    image.set(Coord::slice(1, 0, 0), &[round; 16]).unwrap();
                    let second = image.get(Coord::slice(1, 0, 0)).unwrap().unwrap();
                    assert_eq!(&*second.read(), &[round; 16]);
                }
                assert_eq!(held.to_vec(), expected);
            });
        });

        let volume = image.get(Coord::volume(0, 0)).unwrap().unwrap();
        assert_eq!(&volume.to_vec()[..16], &[199; 16]);
        assert_eq!(&volume.to_vec()[16..], &[199; 16]);
    }
}

// =============================================================================
// Registry
// =============================================================================

mod registry_tests {
    use super::*;

    #[test]
    fn test_registry_tracks_live_images() {
        let registry = ImageRegistry::new();
        let image = Arc::new(u8_image(&[2, 2], 1));
        let id = registry.register(&image);

        let found = registry.get(id).unwrap();
        found.set(Coord::slice(0, 0, 0), &[1; 4]).unwrap();
        assert!(image.is_set(Coord::slice(0, 0, 0)));
        drop(found);

        drop(image);
        assert!(registry.get(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_is_independent() {
        let image = u8_image(&[2, 2, 2], 1);
        image.set(Coord::volume(0, 0), &[3; 8]).unwrap();

        let copy = image.duplicate().unwrap();
        assert!(copy.contents_equal(&image).unwrap());

        copy.set(Coord::slice(0, 0, 0), &[0; 4]).unwrap();
        assert!(!copy.contents_equal(&image).unwrap());
        assert_eq!(image.get(Coord::slice(0, 0, 0)).unwrap().unwrap().to_vec(), vec![3; 4]);
    }
}
