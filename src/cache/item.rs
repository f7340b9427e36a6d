//! Buffer Items
//!
//! A buffer item is either the root of a memory block (owned, or borrowed
//! zero-copy from the caller) or a view into a coarser root at a byte offset.
//! Views are always flattened onto the root, so a view's parent never is a
//! view itself and its byte range lies inside the parent's.
//!
//! Reads hand out [`BufferBytes`] snapshots that hold no lock. A write that
//! finds a snapshot still alive copies the block first, so writers never wait
//! on readers and readers never see a partial write.

use std::fmt;
use std::ops::{Deref, Range};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::region::Level;
use crate::error::{Error, Result};

/// Shared handle to a buffer item, as handed out to consumers
pub type BufferHandle = Arc<BufferItem>;

/// How `import_set` takes hold of caller data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Copy the bytes into a cache-owned allocation
    Copy,
    /// Take ownership of the caller's allocation
    Adopt,
    /// Reference the caller's shared bytes without copying
    Borrow,
}

/// Caller data together with its ownership mode
#[derive(Debug, Clone)]
pub enum ImportBuffer<'a> {
    Copy(&'a [u8]),
    Adopt(Vec<u8>),
    Borrow(Bytes),
}

impl<'a> ImportBuffer<'a> {
    pub fn mode(&self) -> ImportMode {
        match self {
            ImportBuffer::Copy(_) => ImportMode::Copy,
            ImportBuffer::Adopt(_) => ImportMode::Adopt,
            ImportBuffer::Borrow(_) => ImportMode::Borrow,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            ImportBuffer::Copy(data) => data,
            ImportBuffer::Adopt(data) => data,
            ImportBuffer::Borrow(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep only the first `len` bytes
    pub(crate) fn truncated(self, len: usize) -> Self {
        match self {
            ImportBuffer::Copy(data) => ImportBuffer::Copy(&data[..len.min(data.len())]),
            ImportBuffer::Adopt(mut data) => {
                data.truncate(len);
                ImportBuffer::Adopt(data)
            }
            ImportBuffer::Borrow(data) => ImportBuffer::Borrow(data.slice(..len.min(data.len()))),
        }
    }
}

impl<'a> From<&'a [u8]> for ImportBuffer<'a> {
    fn from(data: &'a [u8]) -> Self {
        ImportBuffer::Copy(data)
    }
}

impl From<Vec<u8>> for ImportBuffer<'static> {
    fn from(data: Vec<u8>) -> Self {
        ImportBuffer::Adopt(data)
    }
}

impl From<Bytes> for ImportBuffer<'static> {
    fn from(data: Bytes) -> Self {
        ImportBuffer::Borrow(data)
    }
}

/// Zero-filled allocation that reports allocator failure instead of aborting
pub(crate) fn allocate_zeroed(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| Error::AllocationFailed {
            size: len,
            reason: e.to_string(),
        })?;
    buf.resize(len, 0);
    Ok(buf)
}

fn copy_to_owned(src: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(src.len())
        .map_err(|e| Error::AllocationFailed {
            size: src.len(),
            reason: e.to_string(),
        })?;
    buf.extend_from_slice(src);
    Ok(buf)
}

/// Raw bytes behind a root item
#[derive(Debug, Clone)]
enum Storage {
    Owned(Arc<Vec<u8>>),
    Borrowed(Bytes),
}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(buf) => buf,
            Storage::Borrowed(buf) => buf,
        }
    }

    fn is_owned(&self) -> bool {
        matches!(self, Storage::Owned(_))
    }

    /// Make the bytes cache-owned and unshared
    ///
    /// Borrowed bytes are copied (the detach) and reported with `true`. Owned
    /// bytes still referenced by a snapshot are copied silently.
    fn unshare(&mut self) -> Result<bool> {
        match self {
            Storage::Owned(buf) => {
                if Arc::get_mut(buf).is_none() {
                    let copy = copy_to_owned(buf.as_slice())?;
                    *buf = Arc::new(copy);
                }
                Ok(false)
            }
            Storage::Borrowed(bytes) => {
                let owned = copy_to_owned(bytes)?;
                *self = Storage::Owned(Arc::new(owned));
                Ok(true)
            }
        }
    }

    /// Unshare, then run `f` on the writable bytes. Returns true if it detached.
    fn modify(&mut self, f: impl FnOnce(&mut [u8])) -> Result<bool> {
        let detached = self.unshare()?;
        if let Storage::Owned(buf) = self {
            if let Some(buf) = Arc::get_mut(buf) {
                f(buf.as_mut_slice());
            }
        }
        Ok(detached)
    }
}

/// Memory block shared by a root and its views
///
/// The mutex is only held for pointer swaps and copies, never while a caller
/// holds bytes.
type Memory = Arc<Mutex<Storage>>;

/// Lock-free snapshot of an item's bytes
///
/// Later writes to the item are not visible through an existing snapshot.
#[derive(Clone)]
pub struct BufferBytes {
    storage: Storage,
    range: Range<usize>,
}

impl Deref for BufferBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.storage.as_slice()[self.range.clone()]
    }
}

impl AsRef<[u8]> for BufferBytes {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl fmt::Debug for BufferBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferBytes")
            .field("len", &self.range.len())
            .finish()
    }
}

enum Backing {
    Root(Memory),
    View { parent: BufferHandle, offset: usize },
}

/// Unit of storage for one slice, volume or channel
pub struct BufferItem {
    level: Level,
    len: usize,
    backing: Backing,
    complete: AtomicBool,
    generation: AtomicU64,
}

impl BufferItem {
    fn root(level: Level, storage: Storage) -> BufferHandle {
        Arc::new(Self {
            level,
            len: storage.as_slice().len(),
            backing: Backing::Root(Arc::new(Mutex::new(storage))),
            complete: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        })
    }

    /// Independent, zero-initialized allocation
    pub fn allocate(level: Level, len: usize) -> Result<BufferHandle> {
        Ok(Self::root(
            level,
            Storage::Owned(Arc::new(allocate_zeroed(len)?)),
        ))
    }

    /// Independent item built from caller data
    pub fn from_import(level: Level, data: ImportBuffer<'_>) -> Result<BufferHandle> {
        let storage = match data {
            ImportBuffer::Copy(bytes) => Storage::Owned(Arc::new(copy_to_owned(bytes)?)),
            ImportBuffer::Adopt(vec) => Storage::Owned(Arc::new(vec)),
            ImportBuffer::Borrow(bytes) => Storage::Borrowed(bytes),
        };
        Ok(Self::root(level, storage))
    }

    /// Non-owning view of `len` bytes at `offset` inside `parent`
    pub fn view(
        parent: &BufferHandle,
        offset: usize,
        level: Level,
        len: usize,
    ) -> Result<BufferHandle> {
        if offset.checked_add(len).map_or(true, |end| end > parent.len) {
            return Err(Error::ViewOutOfBounds {
                offset,
                len,
                parent_len: parent.len,
            });
        }

        let (root, base) = match &parent.backing {
            Backing::Root(_) => (Arc::clone(parent), 0),
            Backing::View { parent: root, offset } => (Arc::clone(root), *offset),
        };

        Ok(Arc::new(Self {
            level,
            len,
            backing: Backing::View {
                parent: root,
                offset: base + offset,
            },
            complete: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }))
    }

    /// Same bytes presented at another level
    pub(crate) fn relabel(&self, level: Level) -> BufferHandle {
        let backing = match &self.backing {
            Backing::Root(memory) => Backing::Root(Arc::clone(memory)),
            Backing::View { parent, offset } => Backing::View {
                parent: Arc::clone(parent),
                offset: *offset,
            },
        };
        Arc::new(Self {
            level,
            len: self.len,
            backing,
            complete: AtomicBool::new(self.is_complete()),
            generation: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn level(&self) -> Level {
        self.level
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte offset inside the parent; zero for roots
    pub fn offset(&self) -> usize {
        match &self.backing {
            Backing::Root(_) => 0,
            Backing::View { offset, .. } => *offset,
        }
    }

    /// The root this item is a view into
    pub fn parent(&self) -> Option<&BufferHandle> {
        match &self.backing {
            Backing::Root(_) => None,
            Backing::View { parent, .. } => Some(parent),
        }
    }

    pub fn is_view(&self) -> bool {
        matches!(self.backing, Backing::View { .. })
    }

    /// True for independent items whose bytes are cache-owned
    pub fn manages_memory(&self) -> bool {
        match &self.backing {
            Backing::Root(memory) => memory.lock().is_owned(),
            Backing::View { .. } => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub(crate) fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    /// Number of overwrites this item has seen
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether both items are backed by the same memory block
    pub fn same_memory(&self, other: &BufferItem) -> bool {
        Arc::ptr_eq(self.memory(), other.memory())
    }

    /// Snapshot of this item's bytes
    ///
    /// Holding it blocks nothing; calling back into the image while it is
    /// alive is fine.
    pub fn read(&self) -> BufferBytes {
        BufferBytes {
            storage: self.memory().lock().clone(),
            range: self.range(),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.read().to_vec()
    }

    fn memory(&self) -> &Memory {
        match &self.backing {
            Backing::Root(memory) => memory,
            Backing::View { parent, .. } => parent.memory(),
        }
    }

    fn range(&self) -> Range<usize> {
        let start = self.offset();
        start..start + self.len
    }

    /// Copy exactly `len()` bytes from `data` into this item, detaching the
    /// backing memory first if it is borrowed. Returns true if it detached.
    pub(crate) fn write(&self, data: &[u8]) -> Result<bool> {
        if data.len() < self.len {
            return Err(Error::BufferSizeMismatch {
                level: self.level,
                expected: self.len,
                actual: data.len(),
            });
        }

        let range = self.range();
        let data = &data[..self.len];
        self.memory()
            .lock()
            .modify(|buf| buf[range].copy_from_slice(data))
    }

    /// Copy all of `src` to `dst_offset` inside this item
    pub(crate) fn copy_from(&self, dst_offset: usize, src: &BufferItem) -> Result<bool> {
        if dst_offset
            .checked_add(src.len)
            .map_or(true, |end| end > self.len)
        {
            return Err(Error::ViewOutOfBounds {
                offset: dst_offset,
                len: src.len,
                parent_len: self.len,
            });
        }

        let dst_start = self.offset() + dst_offset;

        if self.same_memory(src) {
            let src_range = src.range();
            return self
                .memory()
                .lock()
                .modify(|buf| buf.copy_within(src_range, dst_start));
        }

        // snapshot first so the two memory locks are never held together
        let source = src.read();
        self.memory()
            .lock()
            .modify(|buf| buf[dst_start..dst_start + source.len()].copy_from_slice(&source))
    }
}

impl fmt::Debug for BufferItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferItem")
            .field("level", &self.level)
            .field("len", &self.len)
            .field("view", &self.is_view())
            .field("offset", &self.offset())
            .field("complete", &self.is_complete())
            .field("generation", &self.generation())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
