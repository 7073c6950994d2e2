//! # Distributed Resource
//!
//! A resource that forwards every allocation to one of several upstream
//! resources. The upstreams are tried in order; the index of the one that
//! satisfied a request is written behind the returned block so deallocation
//! can route the memory back to its origin.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use kernel_resource::{BadAlloc, Resource};

/// A fan-out resource over several upstream resources.
///
/// Every allocated block has the layout
///
/// ```text
/// +----------------+---------+----------------+
/// | payload (bytes)| padding | upstream index |
/// +----------------+---------+----------------+
/// ^ returned ptr             ^ bytes + padding
/// ```
///
/// where the padding rounds the payload up to `usize` alignment and the
/// trailing `usize` is the index of the upstream the block came from. The
/// index slot is read and written unaligned; the payload pointer itself can
/// carry any alignment the upstream granted.
pub struct DistributedResource<R: Resource> {
    /// Pointer array, stored in memory from the first living upstream.
    upstreams: NonNull<NonNull<R>>,
    len: usize,
}

impl<R: Resource> DistributedResource<R> {
    /// Construct a distributed resource over `upstreams`.
    ///
    /// The container for the upstream pointers is allocated through the
    /// upstreams themselves: each is tried in turn, the first that can hold
    /// the pointer array wins. Fails with [`BadAlloc`] when none can.
    ///
    /// # Safety
    ///
    /// Every pointer yielded by `upstreams` must refer to a live resource
    /// that outlives the constructed object, and the referenced resources
    /// must not be mutated through other pointers while it exists.
    pub unsafe fn new<I>(upstreams: I) -> Result<Self, BadAlloc>
    where
        I: Iterator<Item = NonNull<R>> + ExactSizeIterator + Clone,
    {
        let len = upstreams.len();
        let bytes = len.checked_mul(size_of::<NonNull<R>>()).ok_or(BadAlloc)?;

        for candidate in upstreams.clone() {
            let resource = unsafe { candidate.as_ref() };
            let Ok(storage) = resource.allocate(bytes, align_of::<NonNull<R>>()) else {
                continue;
            };
            let array = storage.cast::<NonNull<R>>();
            for (index, upstream) in upstreams.enumerate() {
                unsafe { array.add(index).write(upstream) };
            }
            return Ok(Self {
                upstreams: array,
                len,
            });
        }

        Err(BadAlloc)
    }

    /// Number of upstream resources.
    #[inline]
    #[must_use]
    pub const fn upstream_count(&self) -> usize {
        self.len
    }

    #[inline]
    fn upstream(&self, index: usize) -> &R {
        debug_assert!(index < self.len);
        unsafe { self.upstreams.add(index).read().as_ref() }
    }

    /// Payload size rounded up to `usize` alignment, or `None` when the
    /// block including its trailing index would not fit the address space.
    #[inline]
    fn padded_size(bytes: usize) -> Option<usize> {
        let padded = bytes.checked_next_multiple_of(align_of::<usize>())?;
        padded.checked_add(size_of::<usize>()).map(|_| padded)
    }
}

impl<R: Resource> Resource for DistributedResource<R> {
    fn allocate(&self, bytes: usize, align: usize) -> Result<NonNull<u8>, BadAlloc> {
        let padded = Self::padded_size(bytes).ok_or(BadAlloc)?;
        let actual_size = padded + size_of::<usize>();

        for index in 0..self.len {
            let Ok(ptr) = self.upstream(index).allocate(actual_size, align) else {
                continue;
            };
            unsafe {
                ptr.as_ptr().add(padded).cast::<usize>().write_unaligned(index);
            }
            return Ok(ptr);
        }

        Err(BadAlloc)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        // Deallocation of a block this resource handed out; the padded size
        // cannot overflow if the allocation succeeded.
        let Some(padded) = Self::padded_size(bytes) else {
            debug_assert!(false, "deallocated block was never allocated here");
            return;
        };
        let index = unsafe { ptr.as_ptr().add(padded).cast::<usize>().read_unaligned() };
        debug_assert!(index < self.len, "corrupt upstream index");
        unsafe {
            self.upstream(index)
                .deallocate(ptr, padded + size_of::<usize>(), align);
        }
    }
}
