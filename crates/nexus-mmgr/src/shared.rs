//! Arena shared between threads.
//!
//! An [`AllocSet`] has no internal locking. `SharedAllocSet` wraps one in a
//! mutex so that several threads can allocate from the same arena; every
//! call holds the lock for its whole duration.

use std::sync::Arc;

use nexus_common::config::AllocSetConfig;
use nexus_common::NexusResult;
use parking_lot::{Mutex, MutexGuard};

use crate::aset::AllocSet;
use crate::chunk::ChunkPtr;
use crate::context::MemoryContextStats;

/// A cloneable, lock-protected handle to one arena.
///
/// # Example
///
/// ```rust
/// use nexus_common::config::AllocSetConfig;
/// use nexus_mmgr::SharedAllocSet;
///
/// let shared = SharedAllocSet::new("shared", &AllocSetConfig::small()).unwrap();
/// let other = shared.clone();
///
/// let ptr = other.alloc(16).unwrap();
/// shared.with_data_mut(ptr, |bytes| bytes.fill(1)).unwrap();
/// assert_eq!(other.with_data(ptr, |bytes| bytes[0]).unwrap(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct SharedAllocSet {
    inner: Arc<Mutex<AllocSet>>,
}

impl SharedAllocSet {
    /// Creates a shared arena over the system allocator.
    pub fn new(name: impl Into<String>, config: &AllocSetConfig) -> NexusResult<Self> {
        Ok(Self::from_set(AllocSet::new(name, config)?))
    }

    /// Wraps an existing arena.
    #[must_use]
    pub fn from_set(set: AllocSet) -> Self {
        Self {
            inner: Arc::new(Mutex::new(set)),
        }
    }

    /// Allocates `size` zeroed bytes.
    pub fn alloc(&self, size: usize) -> NexusResult<ChunkPtr> {
        self.inner.lock().alloc(size)
    }

    /// Frees a chunk.
    pub fn free(&self, ptr: ChunkPtr) -> NexusResult<()> {
        self.inner.lock().free(ptr)
    }

    /// Resizes a chunk.
    pub fn realloc(&self, ptr: ChunkPtr, new_size: usize) -> NexusResult<ChunkPtr> {
        self.inner.lock().realloc(ptr, new_size)
    }

    /// Runs `f` over the bytes of a chunk while holding the lock.
    pub fn with_data<R>(&self, ptr: ChunkPtr, f: impl FnOnce(&[u8]) -> R) -> NexusResult<R> {
        let set = self.inner.lock();
        Ok(f(set.data(ptr)?))
    }

    /// Runs `f` over the bytes of a chunk, mutably, while holding the lock.
    pub fn with_data_mut<R>(
        &self,
        ptr: ChunkPtr,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> NexusResult<R> {
        let mut set = self.inner.lock();
        Ok(f(set.data_mut(ptr)?))
    }

    /// Resets the arena.
    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    /// Checks the arena.
    pub fn check(&self) -> usize {
        self.inner.lock().check()
    }

    /// Reports statistics of the arena.
    pub fn stats(&self) -> MemoryContextStats {
        self.inner.lock().stats()
    }

    /// Locks the arena for a sequence of operations.
    pub fn lock(&self) -> MutexGuard<'_, AllocSet> {
        self.inner.lock()
    }
}
