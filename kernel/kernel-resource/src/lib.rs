//! # Memory Resources
//!
//! The allocation seam of the memory bootstrap: a small [`Resource`] trait
//! that composable allocators implement, the [`MonotonicBuffer`] bump
//! resource that everything bottoms out in, and [`DynArray`], an owned
//! fixed-length array placed in memory obtained from a resource.
//!
//! Resources here are strictly single-threaded. They take `&self` and use
//! interior mutability so that several collections can share one resource by
//! reference during bootstrap; none of them is `Sync`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]
#![deny(unsafe_op_in_unsafe_fn)]

mod dynarray;
mod monotonic;

pub use dynarray::{DynArray, DynArrayBuilder};
pub use monotonic::MonotonicBuffer;

use core::ptr::NonNull;

/// A resource cannot satisfy an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("allocation failed")]
pub struct BadAlloc;

/// A source of raw memory.
///
/// Implementations hand out blocks of at least `bytes` bytes aligned to
/// `align` and take them back through [`deallocate`](Resource::deallocate).
/// Resource identity is object identity; two resources compare equal exactly
/// when they are the same object.
pub trait Resource {
    /// Allocate `bytes` bytes aligned to `align`.
    ///
    /// `align` must be a power of two.
    fn allocate(&self, bytes: usize, align: usize) -> Result<NonNull<u8>, BadAlloc>;

    /// Return a block to the resource.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a call to [`allocate`](Resource::allocate)
    /// on this same resource with the same `bytes` and `align`, and must not
    /// have been deallocated already.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, align: usize);

    /// Whether `other` is the same resource object.
    #[inline]
    fn is_equal(&self, other: &Self) -> bool
    where
        Self: Sized,
    {
        core::ptr::eq(self, other)
    }
}

impl<R: Resource + ?Sized> Resource for &R {
    #[inline]
    fn allocate(&self, bytes: usize, align: usize) -> Result<NonNull<u8>, BadAlloc> {
        (**self).allocate(bytes, align)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        unsafe { (**self).deallocate(ptr, bytes, align) }
    }

    #[inline]
    fn is_equal(&self, other: &Self) -> bool {
        core::ptr::eq(*self, *other)
    }
}
