//! # Buddy Resource
//!
//! A power-of-two block allocator with split and combine, parameterised at
//! runtime over its minimum and maximum block sizes and layered over any
//! upstream [`Resource`].
//!
//! Every block starts with a [`BlockHeader`] followed by padding so that the
//! payload is aligned to [`MAX_ALIGN`]:
//!
//! ```text
//! +-------------+---------+----------------------------------+
//! | BlockHeader | padding |             payload              |
//! +-------------+---------+----------------------------------+
//! ^ block start           ^ block start + HEADER_FOOTPRINT
//! ```
//!
//! The header's `flags` word carries the block's whole genealogy: the most
//! significant bit says whether the block is free, and bit `L` records, for
//! every level `L` at or below the block's own level, whether the block is
//! the first (lower) or second (upper) half of its level-`L + 1` parent.
//! That makes buddy lookup pure address arithmetic, with no per-level
//! tables. The encoding caps the number of levels at one below the word
//! width.
//!
//! Free blocks of each level sit on a doubly-linked list threaded through
//! the headers themselves. The list array is bootstrapped through a scratch
//! array on the stack and then moved into the resource's own first
//! allocation. Because freed blocks coalesce eagerly, no two free buddies
//! ever coexist on a list.
//!
//! The resource holds on to every top-level block it ever acquired until it
//! is dropped; only destruction returns memory to the upstream.

use core::mem::{ManuallyDrop, align_of, size_of};
use core::ptr::NonNull;

use kernel_info::memory::MAX_ALIGN;
use kernel_resource::{BadAlloc, Resource};

/// Per-block bookkeeping, embedded at the start of each block.
#[repr(C)]
struct BlockHeader {
    /// Free bit (MSB) and which-half-at-level bits (bits `0..=level`).
    flags: usize,
    prev: Option<NonNull<BlockHeader>>,
    next: Option<NonNull<BlockHeader>>,
}

const FREE_BIT: usize = 1 << (usize::BITS - 1);

/// Padding between the header and the [`MAX_ALIGN`]-aligned payload.
const HEADER_PADDING: usize = (MAX_ALIGN - size_of::<BlockHeader>() % MAX_ALIGN) % MAX_ALIGN;

/// Bytes from the start of a block to its payload.
pub const HEADER_FOOTPRINT: usize = size_of::<BlockHeader>() + HEADER_PADDING;

/// The smallest minimum block size any buddy resource supports.
pub const MIN_ALLOWED_BLOCK_SIZE: usize = 2 * HEADER_FOOTPRINT;

/// The largest number of block levels any buddy resource supports.
pub const MAX_ALLOWED_BLOCK_LEVELS: usize = (usize::BITS - 1) as usize;

const _: () = {
    assert!(MIN_ALLOWED_BLOCK_SIZE.is_power_of_two());
    assert!(align_of::<BlockHeader>() <= MAX_ALIGN);
};

impl BlockHeader {
    fn is_free(&self) -> bool {
        self.flags & FREE_BIT != 0
    }

    fn is_occupied(&self) -> bool {
        !self.is_free()
    }

    fn set_free(&mut self) {
        self.flags |= FREE_BIT;
    }

    fn set_occupied(&mut self) {
        self.flags &= !FREE_BIT;
    }

    /// Whether this block is the first (lower) half of its level-`level + 1`
    /// parent.
    fn is_first(&self, level: usize) -> bool {
        self.flags & (1 << level) != 0
    }

    fn set_first(&mut self, level: usize) {
        self.flags |= 1 << level;
    }

    fn set_second(&mut self, level: usize) {
        self.flags &= !(1 << level);
    }
}

/// The head of one level's free list.
type FreeListHead = Option<NonNull<BlockHeader>>;

/// The buddy resource's construction parameters are unsupported, or the
/// bootstrap allocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BuddyError {
    /// The parameters violate the construction contract.
    #[error("invalid buddy configuration: {0}")]
    InvalidArgument(&'static str),
    /// The upstream could not satisfy the bootstrap allocation.
    #[error(transparent)]
    BadAlloc(#[from] BadAlloc),
}

/// A buddy-method allocator over an upstream resource.
///
/// Allocations are served from blocks whose sizes are powers of two between
/// `min_block` and `max_block`. A request is rounded up to the smallest
/// level whose block holds the payload plus header; missing blocks are made
/// by splitting a block one level up, and freed blocks eagerly recombine
/// with their buddy whenever that buddy is free. Top-level blocks come from
/// the upstream, aligned to `top_level_alignment`, and are only handed back
/// on drop.
///
/// Payloads are always aligned to [`MAX_ALIGN`]; requests for stricter
/// alignment fail with [`BadAlloc`].
pub struct BuddyResource<R: Resource> {
    min_block: usize,
    max_block: usize,
    min_msb: u32,
    max_level: usize,
    levels: usize,
    top_level_alignment: usize,
    /// `levels` heads, stored in this resource's own first allocation.
    free_lists: NonNull<FreeListHead>,
    upstream: R,
}

impl<R: Resource> BuddyResource<R> {
    /// Construct a buddy resource.
    ///
    /// `min_block` and `max_block` must be powers of two with
    /// `min_block <= max_block`; `min_block` must exceed
    /// [`HEADER_FOOTPRINT`]; `top_level_alignment` must be a power of two;
    /// and the resulting number of levels must not exceed
    /// [`MAX_ALLOWED_BLOCK_LEVELS`]. Violations fail with
    /// [`BuddyError::InvalidArgument`].
    ///
    /// Construction performs one allocation on the resource itself (for the
    /// free-list heads), so the upstream sees one top-level request.
    pub fn new(
        min_block: usize,
        max_block: usize,
        top_level_alignment: usize,
        upstream: R,
    ) -> Result<Self, BuddyError> {
        if !min_block.is_power_of_two() {
            return Err(BuddyError::InvalidArgument(
                "the minimum block size has to be a power of two",
            ));
        }
        if !max_block.is_power_of_two() {
            return Err(BuddyError::InvalidArgument(
                "the maximum block size has to be a power of two",
            ));
        }
        if min_block > max_block {
            return Err(BuddyError::InvalidArgument(
                "the minimum block size has to be less than or equal to the maximum block size",
            ));
        }
        if min_block <= HEADER_FOOTPRINT {
            return Err(BuddyError::InvalidArgument(
                "the minimum block size has to be larger than the per-block bookkeeping",
            ));
        }
        if !top_level_alignment.is_power_of_two() {
            return Err(BuddyError::InvalidArgument(
                "the top-level block alignment has to be a power of two",
            ));
        }

        let min_msb = min_block.ilog2();
        let max_msb = max_block.ilog2();
        let max_level = (max_msb - min_msb) as usize;
        let levels = max_level + 1;
        if levels > MAX_ALLOWED_BLOCK_LEVELS {
            return Err(BuddyError::InvalidArgument("too many block levels"));
        }

        // Bootstrap: run the free lists out of a stack scratch array until
        // the resource has allocated the real storage from itself.
        let mut scratch: [FreeListHead; MAX_ALLOWED_BLOCK_LEVELS] =
            [None; MAX_ALLOWED_BLOCK_LEVELS];
        let scratch_lists = NonNull::from(&mut scratch).cast::<FreeListHead>();

        let this = ManuallyDrop::new(Self {
            min_block,
            max_block,
            min_msb,
            max_level,
            levels,
            top_level_alignment: top_level_alignment.max(MAX_ALIGN),
            free_lists: scratch_lists,
            upstream,
        });

        let lists_bytes = levels * size_of::<FreeListHead>();
        match this.allocate(lists_bytes, align_of::<FreeListHead>()) {
            Ok(storage) => {
                let lists = storage.cast::<FreeListHead>();
                unsafe {
                    core::ptr::copy_nonoverlapping(scratch.as_ptr(), lists.as_ptr(), levels);
                }
                let mut this = ManuallyDrop::into_inner(this);
                this.free_lists = lists;
                Ok(this)
            }
            // A failed bootstrap acquired nothing from the upstream, so the
            // partial resource must not run its destructor against the
            // scratch array. The upstream is moved back out and dropped
            // normally.
            Err(error) => {
                // SAFETY: `this` is never touched again and its destructor
                // never runs, so the upstream has a single owner.
                let _upstream = unsafe { core::ptr::read(&this.upstream) };
                Err(error.into())
            }
        }
    }

    /// The upstream resource.
    #[inline]
    pub fn upstream(&self) -> &R {
        &self.upstream
    }

    /// The smallest block size this resource manages.
    #[inline]
    #[must_use]
    pub const fn min_block_size(&self) -> usize {
        self.min_block
    }

    /// The top-level block size requested from the upstream.
    #[inline]
    #[must_use]
    pub const fn max_block_size(&self) -> usize {
        self.max_block
    }

    /// Useful block size of `level`.
    #[inline]
    fn block_size(&self, level: usize) -> usize {
        1 << (self.min_msb as usize + level)
    }

    /// The level whose blocks hold `bytes` payload bytes plus the header,
    /// or `None` when the required size overflows.
    fn level_for_request(&self, bytes: usize) -> Option<usize> {
        let required = bytes.checked_add(HEADER_FOOTPRINT)?;
        let mut msb = required.ilog2();
        if !required.is_power_of_two() {
            msb += 1;
        }
        Some((msb.saturating_sub(self.min_msb)) as usize)
    }

    #[inline]
    fn head(&self, level: usize) -> FreeListHead {
        debug_assert!(level < self.levels);
        unsafe { self.free_lists.add(level).read() }
    }

    #[inline]
    fn set_head(&self, level: usize, head: FreeListHead) {
        debug_assert!(level < self.levels);
        unsafe { self.free_lists.add(level).write(head) }
    }

    /// Push `block` onto the head of `level`'s free list and mark it free.
    fn push_free(&self, block: NonNull<BlockHeader>, level: usize) {
        let old_head = self.head(level);
        unsafe {
            (*block.as_ptr()).prev = None;
            (*block.as_ptr()).next = old_head;
            (*block.as_ptr()).set_free();
            if let Some(old) = old_head {
                (*old.as_ptr()).prev = Some(block);
            }
        }
        self.set_head(level, Some(block));
    }

    /// Unlink `block` from `level`'s free list.
    fn unlink(&self, block: NonNull<BlockHeader>, level: usize) {
        let (prev, next) = unsafe { ((*block.as_ptr()).prev, (*block.as_ptr()).next) };
        match prev {
            Some(prev) => unsafe { (*prev.as_ptr()).next = next },
            None => self.set_head(level, next),
        }
        if let Some(next) = next {
            unsafe { (*next.as_ptr()).prev = prev };
        }
    }

    /// The buddy of a level-`level` block: the other half of its parent,
    /// one block size away in the direction the half bit dictates.
    fn buddy_of(&self, block: NonNull<BlockHeader>, level: usize) -> NonNull<BlockHeader> {
        let size = self.block_size(level);
        let addr = block.as_ptr() as usize;
        let buddy = if unsafe { (*block.as_ptr()).is_first(level) } {
            addr + size
        } else {
            addr - size
        };
        // Derived from a live block of the same top-level allocation.
        unsafe { NonNull::new_unchecked(buddy as *mut BlockHeader) }
    }

    /// Allocate an occupied block of exactly `level`.
    fn allocate_block(&self, level: usize) -> Result<NonNull<BlockHeader>, BadAlloc> {
        debug_assert!(level <= self.max_level);

        if let Some(head) = self.head(level) {
            self.unlink(head, level);
            unsafe { (*head.as_ptr()).set_occupied() };
            return Ok(head);
        }

        if level != self.max_level {
            let parent = self.allocate_block(level + 1)?;
            let (first, second) = self.split_block(parent, level + 1);
            self.push_free(first, level);
            unsafe { (*second.as_ptr()).set_occupied() };
            return Ok(second);
        }

        // Top level: one fresh block from the upstream.
        let size = self.block_size(self.max_level);
        let memory = self.upstream.allocate(size, self.top_level_alignment)?;
        if memory.as_ptr() as usize % self.top_level_alignment != 0 {
            unsafe {
                self.upstream.deallocate(memory, size, self.top_level_alignment);
            }
            return Err(BadAlloc);
        }

        let block = memory.cast::<BlockHeader>();
        unsafe {
            block.as_ptr().write(BlockHeader {
                flags: 0,
                prev: None,
                next: None,
            });
        }
        Ok(block)
    }

    /// Split an occupied `level` block into its two occupied halves.
    ///
    /// `level` must be above zero and `block` must really be of that level.
    fn split_block(
        &self,
        block: NonNull<BlockHeader>,
        level: usize,
    ) -> (NonNull<BlockHeader>, NonNull<BlockHeader>) {
        debug_assert!(level > 0, "cannot split a level-0 block");
        debug_assert!(level <= self.max_level);

        let half = self.block_size(level - 1);
        let addr = block.as_ptr() as usize;
        let second = (addr + half) as *mut BlockHeader;

        unsafe {
            // The second half inherits the genealogy bits above the split.
            second.write(BlockHeader {
                flags: (*block.as_ptr()).flags,
                prev: None,
                next: None,
            });
            (*block.as_ptr()).set_first(level - 1);
            (*second).set_second(level - 1);
            (block, NonNull::new_unchecked(second))
        }
    }

    /// Free an occupied `level` block, eagerly recombining with free
    /// buddies all the way up.
    fn deallocate_block(&self, block: NonNull<BlockHeader>, level: usize) {
        debug_assert!(level <= self.max_level);

        let mut block = block;
        let mut level = level;
        loop {
            if level == self.max_level {
                self.push_free(block, level);
                return;
            }

            let buddy = self.buddy_of(block, level);
            if unsafe { (*buddy.as_ptr()).is_occupied() } {
                self.push_free(block, level);
                return;
            }

            self.unlink(buddy, level);
            unsafe { (*buddy.as_ptr()).set_occupied() };

            // The combined block is whichever half is the lower one.
            block = if unsafe { (*block.as_ptr()).is_first(level) } {
                block
            } else {
                buddy
            };
            level += 1;
        }
    }
}

impl<R: Resource> Resource for BuddyResource<R> {
    fn allocate(&self, bytes: usize, align: usize) -> Result<NonNull<u8>, BadAlloc> {
        if bytes == 0 || align > MAX_ALIGN {
            return Err(BadAlloc);
        }
        let level = self.level_for_request(bytes).ok_or(BadAlloc)?;
        if level > self.max_level {
            return Err(BadAlloc);
        }

        let block = self.allocate_block(level)?;
        let payload = (block.as_ptr() as usize + HEADER_FOOTPRINT) as *mut u8;
        // Never null: the header it follows is not at the top of memory.
        NonNull::new(payload).ok_or(BadAlloc)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, _align: usize) {
        if bytes == 0 {
            return;
        }
        let Some(level) = self.level_for_request(bytes) else {
            debug_assert!(false, "deallocated block was never allocated here");
            return;
        };
        debug_assert!(level <= self.max_level);

        let header = (ptr.as_ptr() as usize - HEADER_FOOTPRINT) as *mut BlockHeader;
        // Valid by the deallocate contract: `ptr` came out of `allocate`.
        let block = unsafe { NonNull::new_unchecked(header) };
        self.deallocate_block(block, level);
    }
}

impl<R: Resource> Drop for BuddyResource<R> {
    /// Return every top-level block to the upstream.
    ///
    /// The free-list storage lives in a block of this resource, so the
    /// heads are first moved back onto a stack scratch array and the
    /// storage block is freed like any other; eager coalescing then leaves
    /// exactly the reassembled top-level blocks on the highest list.
    /// Lower-level blocks that remain have outstanding allocations in their
    /// parents and cannot be returned.
    fn drop(&mut self) {
        let mut scratch: [FreeListHead; MAX_ALLOWED_BLOCK_LEVELS] =
            [None; MAX_ALLOWED_BLOCK_LEVELS];
        let storage = self.free_lists;
        unsafe {
            core::ptr::copy_nonoverlapping(storage.as_ptr(), scratch.as_mut_ptr(), self.levels);
        }
        self.free_lists = NonNull::from(&mut scratch).cast::<FreeListHead>();

        let lists_bytes = self.levels * size_of::<FreeListHead>();
        unsafe {
            self.deallocate(storage.cast::<u8>(), lists_bytes, align_of::<FreeListHead>());
        }

        let mut current = self.head(self.max_level);
        while let Some(block) = current {
            current = unsafe { (*block.as_ptr()).next };
            unsafe {
                self.upstream.deallocate(
                    block.cast::<u8>(),
                    self.block_size(self.max_level),
                    self.top_level_alignment,
                );
            }
        }
    }
}
