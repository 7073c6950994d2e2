//! # Allocation Configuration
//!
//! Derived constants for the general-purpose allocator built during
//! bootstrap.

use kernel_info::memory::{KERNEL_PAGESIZE, PAGESIZE_MSB};

use crate::buddy::MIN_ALLOWED_BLOCK_SIZE;

/// `log2` of the smallest block size any buddy resource supports.
const MIN_CHUNK_MSB: u32 = MIN_ALLOWED_BLOCK_SIZE.ilog2();

/// Upper bound on the number of sub-page chunk levels.
pub const MAX_MEM_CHUNK_LEVELS: u32 = 10;

/// Number of sub-page chunk levels of the general-purpose allocator.
pub const MEM_CHUNK_LEVELS: u32 = {
    let natural = PAGESIZE_MSB - MIN_CHUNK_MSB;
    if natural < MAX_MEM_CHUNK_LEVELS {
        natural
    } else {
        MAX_MEM_CHUNK_LEVELS
    }
};

/// The smallest chunk the predefined allocation facilities hand out.
/// Non-zero and a power of two.
pub const SMALLEST_MEMORY_CHUNK: usize = KERNEL_PAGESIZE >> MEM_CHUNK_LEVELS;

const _: () = {
    assert!(
        PAGESIZE_MSB >= MIN_CHUNK_MSB,
        "the pagesize is too small to support meaningful allocations"
    );
    assert!(SMALLEST_MEMORY_CHUNK.is_power_of_two());
    assert!(SMALLEST_MEMORY_CHUNK >= MIN_ALLOWED_BLOCK_SIZE);
};
