//! # Memory Configuration
//!
//! Target constants the memory subsystem is parameterised on.

/// The pagesize used by the kernel. Power of two.
pub const KERNEL_PAGESIZE: usize = 1 << 12;

/// `log2` of the kernel pagesize.
pub const PAGESIZE_MSB: u32 = KERNEL_PAGESIZE.ilog2();

/// The largest alignment any fundamental type requires on this platform.
///
/// Allocators that do not honour per-request alignments align to this.
pub const MAX_ALIGN: usize = 16;

/// The smallest kernel stack the bootstrap accepts.
pub const MIN_KERNEL_STACK_SIZE: usize = 1 << 23;

const _: () = {
    assert!(KERNEL_PAGESIZE != 0, "pagesize must not be zero");
    assert!(
        KERNEL_PAGESIZE.is_power_of_two(),
        "pagesize must be a power of two"
    );
    assert!(MAX_ALIGN.is_power_of_two(), "max_align must be a power of two");
    assert!(MIN_KERNEL_STACK_SIZE.is_multiple_of(KERNEL_PAGESIZE));
};
