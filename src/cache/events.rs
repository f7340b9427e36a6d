//! Change Notification
//!
//! A change event is emitted once for every write that overwrites data the
//! image already held. Filling an empty slot is initialization and emits
//! nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::RwLock;
use serde::Serialize;

use super::region::Coord;
use super::registry::ImageId;

/// Record of one mutating write
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub image: ImageId,
    pub coord: Coord,
    /// Image modification counter after this write
    pub modification: u64,
    /// Generation of the overwritten item after this write
    pub generation: u64,
    pub timestamp: DateTime<Utc>,
}

/// Receives change events
///
/// Called after the region lock is released, so observers may read the image.
pub trait ChangeObserver: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

impl<F> ChangeObserver for F
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) {
        self(event)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Registered observers of one image
#[derive(Default)]
pub struct ObserverSet {
    observers: RwLock<Vec<(ObserverId, Arc<dyn ChangeObserver>)>>,
    next_id: AtomicU64,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn ChangeObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.observers.write().push((id, observer));
        id
    }

    /// Returns false if `id` was not subscribed
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every observer
    pub fn notify(&self, event: &ChangeEvent) {
        // Snapshot so observers may subscribe or unsubscribe re-entrantly
        let observers: Vec<_> = self
            .observers
            .read()
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();

        for observer in observers {
            observer.on_change(event);
        }
    }
}

/// Observer that forwards events into a crossbeam channel
pub struct ChannelObserver {
    sender: Sender<ChangeEvent>,
}

impl ChangeObserver for ChannelObserver {
    fn on_change(&self, event: &ChangeEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.sender.send(event.clone());
    }
}

/// Create a channel-backed observer and its receiving end
pub fn channel_observer() -> (Arc<ChannelObserver>, Receiver<ChangeEvent>) {
    let (sender, receiver) = channel::unbounded();
    (Arc::new(ChannelObserver { sender }), receiver)
}

// =============================================================================
// Tests
// =============================================================================
