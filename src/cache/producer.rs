//! Producer pull protocol
//!
//! A producer is the upstream node that can compute missing pixel data. When
//! a lookup misses, the image records the requested region and calls
//! [`Producer::update`] once; the producer writes its results back through
//! `set` or `import_set` on the same image.

use std::sync::atomic::{AtomicBool, Ordering};

use super::image::Image;
use crate::error::Result;

/// Pull-based source of pixel data
pub trait Producer: Send + Sync {
    /// True while `update` is running
    ///
    /// The image never pulls from a busy producer and never waits for one:
    /// a miss seen while this is true is allocated fresh. Implementations
    /// that call back into the image from worker threads must report busy
    /// for the whole of `update`, or those workers block on the pull.
    fn is_updating(&self) -> bool;

    /// Fill `image.requested_region()`, synchronously
    ///
    /// Runs without the region lock held. `get`, `set` and `import_set` of
    /// the same image may be called from this thread or from threads it
    /// waits on.
    fn update(&self, image: &Image) -> Result<()>;
}

/// Busy flag for producer implementations
#[derive(Debug, Default)]
pub struct UpdateFlag {
    updating: AtomicBool,
}

impl UpdateFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.updating.load(Ordering::Acquire)
    }

    /// Raise the flag until the guard is dropped
    pub fn raise(&self) -> UpdateGuard<'_> {
        self.updating.store(true, Ordering::Release);
        UpdateGuard { flag: self }
    }
}

/// Lowers its [`UpdateFlag`] on drop, including on early return
#[must_use = "the flag is lowered as soon as the guard is dropped"]
pub struct UpdateGuard<'a> {
    flag: &'a UpdateFlag,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.flag.updating.store(false, Ordering::Release);
    }
}
