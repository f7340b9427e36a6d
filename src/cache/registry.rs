//! Image Registry
//!
//! Process-wide lookup from an opaque image id to a live image. The registry
//! holds weak references only; an image unregisters itself when dropped.

use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::image::Image;

/// Opaque identity of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ImageId(Uuid);

impl ImageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ImageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Weak map of registered images
#[derive(Debug, Default)]
pub struct ImageRegistry {
    images: DashMap<ImageId, Weak<Image>>,
}

impl ImageRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `image`; it is removed again when the image is dropped
    pub fn register(self: &Arc<Self>, image: &Arc<Image>) -> ImageId {
        let id = image.id();
        self.images.insert(id, Arc::downgrade(image));
        image.attach_registry(Arc::downgrade(self));
        debug!(image = %id, "Registered image");
        id
    }

    /// Live image for `id`, if any
    pub fn get(&self, id: ImageId) -> Option<Arc<Image>> {
        self.images.get(&id).and_then(|entry| entry.upgrade())
    }

    pub fn contains(&self, id: ImageId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&self, id: ImageId) -> bool {
        self.images.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Drop entries whose image is gone; returns how many were removed
    pub fn purge(&self) -> usize {
        let before = self.images.len();
        self.images.retain(|_, image| image.strong_count() > 0);
        before - self.images.len()
    }

    pub fn ids(&self) -> Vec<ImageId> {
        self.images.iter().map(|entry| *entry.key()).collect()
    }
}
