//! Raw backing allocator.
//!
//! Arenas never talk to the system allocator directly. Every block they own
//! is obtained through a [`BackingAllocator`], which hands out contiguous,
//! maximally aligned byte ranges and takes them back whole.
//!
//! The default implementation, [`SystemAllocator`], wraps `std::alloc` and
//! keeps byte accounting so that callers can observe how much memory the
//! context hierarchy is holding. An optional byte budget turns it into a
//! bounded allocator, which is how exhaustion is exercised in tests.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nexus_common::MAXIMUM_ALIGNOF;

/// Rounds `size` up to the next multiple of [`MAXIMUM_ALIGNOF`].
///
/// Overflows for sizes within `MAXIMUM_ALIGNOF` of `usize::MAX`; sizes that
/// come from callers go through [`checked_max_align`].
///
/// # Example
///
/// ```rust
/// use nexus_mmgr::max_align;
///
/// assert_eq!(max_align(1), 16);
/// assert_eq!(max_align(16), 16);
/// assert_eq!(max_align(9000), 9008);
/// ```
#[inline]
#[must_use]
pub const fn max_align(size: usize) -> usize {
    (size + MAXIMUM_ALIGNOF - 1) & !(MAXIMUM_ALIGNOF - 1)
}

/// Rounds `size` up like [`max_align`], or returns `None` if the result
/// does not fit in a `usize`.
///
/// # Example
///
/// ```rust
/// use nexus_mmgr::checked_max_align;
///
/// assert_eq!(checked_max_align(9000), Some(9008));
/// assert_eq!(checked_max_align(usize::MAX - 8), None);
/// ```
#[inline]
#[must_use]
pub const fn checked_max_align(size: usize) -> Option<usize> {
    match size.checked_add(MAXIMUM_ALIGNOF - 1) {
        Some(padded) => Some(padded & !(MAXIMUM_ALIGNOF - 1)),
        None => None,
    }
}

/// A contiguous byte range obtained from a [`BackingAllocator`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawRegion {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: a region is a plain description of memory; ownership rules are
// enforced by whoever holds it.
unsafe impl Send for RawRegion {}
unsafe impl Sync for RawRegion {}

impl RawRegion {
    /// Creates a region description.
    #[inline]
    #[must_use]
    pub const fn new(ptr: NonNull<u8>, size: usize) -> Self {
        Self { ptr, size }
    }

    /// Returns the start of the region.
    #[inline]
    #[must_use]
    pub const fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the start of the region as a raw pointer.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the size of the region in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Debug for RawRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRegion")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}

/// Supplier of the large byte ranges arenas carve into chunks.
///
/// Implementations must return regions aligned to [`MAXIMUM_ALIGNOF`].
/// Failure is reported as `None`; the arena turns it into
/// `NexusError::OutOfMemory` for its caller.
pub trait BackingAllocator: Send + Sync {
    /// Obtains a region of exactly `size` bytes.
    fn acquire(&self, size: usize) -> Option<RawRegion>;

    /// Returns a region to the allocator.
    ///
    /// # Safety
    ///
    /// `region` must have been produced by `acquire` or `extend` on this
    /// allocator and must not have been released since.
    unsafe fn release(&self, region: RawRegion);

    /// Resizes a region, moving it if needed. The first
    /// `min(region.size(), new_size)` bytes are preserved.
    ///
    /// On failure the input region is left untouched and still owned by
    /// the caller.
    ///
    /// # Safety
    ///
    /// Same contract as [`BackingAllocator::release`]. On success the old
    /// region must no longer be used.
    unsafe fn extend(&self, region: RawRegion, new_size: usize) -> Option<RawRegion>;
}

/// Backing allocator over the global Rust allocator.
///
/// Regions are zero-filled on acquisition, including the grown tail of an
/// extended region.
///
/// # Example
///
/// ```rust
/// use nexus_mmgr::{BackingAllocator, SystemAllocator};
///
/// let system = SystemAllocator::with_limit(4096);
/// let region = system.acquire(1024).expect("within budget");
/// assert_eq!(system.bytes_allocated(), 1024);
/// assert!(system.acquire(8192).is_none());
///
/// // SAFETY: region came from this allocator
/// unsafe { system.release(region) };
/// assert_eq!(system.bytes_allocated(), 0);
/// ```
pub struct SystemAllocator {
    /// Byte budget, if any.
    limit: Option<usize>,
    /// Bytes currently held by callers.
    allocated: AtomicUsize,
    /// High-water mark of `allocated`.
    peak: AtomicUsize,
    /// Number of live regions.
    regions: AtomicUsize,
}

impl SystemAllocator {
    /// Creates an unbounded system allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            limit: None,
            allocated: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            regions: AtomicUsize::new(0),
        }
    }

    /// Creates a system allocator that refuses to hold more than `limit` bytes.
    #[must_use]
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            allocated: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            regions: AtomicUsize::new(0),
        }
    }

    /// Creates a shared handle suitable for handing to arenas.
    #[must_use]
    pub fn shared(limit: Option<usize>) -> Arc<Self> {
        Arc::new(match limit {
            Some(limit) => Self::with_limit(limit),
            None => Self::new(),
        })
    }

    /// Returns the byte budget, if any.
    #[inline]
    #[must_use]
    pub const fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Returns the bytes currently held by callers.
    #[inline]
    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Returns the largest value `bytes_allocated` has reached.
    #[inline]
    #[must_use]
    pub fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Returns the number of live regions.
    #[inline]
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.load(Ordering::Relaxed)
    }

    /// Accounts for `bytes` more, failing if that would exceed the budget.
    fn reserve(&self, bytes: usize) -> bool {
        let mut current = self.allocated.load(Ordering::Relaxed);
        loop {
            let Some(next) = current.checked_add(bytes) else {
                return false;
            };
            if self.limit.is_some_and(|limit| next > limit) {
                return false;
            }
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::Relaxed);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn unreserve(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size, MAXIMUM_ALIGNOF).ok()
    }
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemAllocator")
            .field("limit", &self.limit)
            .field("bytes_allocated", &self.bytes_allocated())
            .field("peak_bytes", &self.peak_bytes())
            .field("regions", &self.region_count())
            .finish()
    }
}

impl BackingAllocator for SystemAllocator {
    fn acquire(&self, size: usize) -> Option<RawRegion> {
        if size == 0 {
            return None;
        }

        let layout = Self::layout(size)?;
        if !self.reserve(size) {
            return None;
        }

        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            self.unreserve(size);
            return None;
        };

        self.regions.fetch_add(1, Ordering::Relaxed);
        Some(RawRegion::new(ptr, size))
    }

    unsafe fn release(&self, region: RawRegion) {
        let Some(layout) = Self::layout(region.size) else {
            return;
        };

        // SAFETY: caller guarantees the region came from acquire/extend,
        // which allocated it with this exact layout
        unsafe { alloc::dealloc(region.as_ptr(), layout) };

        self.unreserve(region.size);
        self.regions.fetch_sub(1, Ordering::Relaxed);
    }

    unsafe fn extend(&self, region: RawRegion, new_size: usize) -> Option<RawRegion> {
        if new_size == 0 {
            return None;
        }

        let old_layout = Self::layout(region.size)?;
        Self::layout(new_size)?;

        let grown = new_size.saturating_sub(region.size);
        if grown > 0 && !self.reserve(grown) {
            return None;
        }

        // SAFETY: caller guarantees the region came from this allocator with
        // old_layout; new_size is non-zero and forms a valid layout
        let ptr = unsafe { alloc::realloc(region.as_ptr(), old_layout, new_size) };
        let Some(ptr) = NonNull::new(ptr) else {
            self.unreserve(grown);
            return None;
        };

        if grown > 0 {
            // SAFETY: the tail [old size, new size) belongs to the new allocation
            unsafe { std::ptr::write_bytes(ptr.as_ptr().add(region.size), 0, grown) };
        } else {
            self.unreserve(region.size - new_size);
        }

        Some(RawRegion::new(ptr, new_size))
    }
}

/// Returns the default backing allocator: an unbounded [`SystemAllocator`].
#[must_use]
pub fn system_backing() -> Arc<dyn BackingAllocator> {
    Arc::new(SystemAllocator::new())
}
