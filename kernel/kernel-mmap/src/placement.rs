//! # Region Placement
//!
//! Finding an aligned free sub-region for a size-plus-alignment request,
//! given the kernel memory map and the regions already in use. This runs
//! repeatedly during bootstrap, each placement seeing the previous ones as
//! occupied.

use kernel_memory_regions::{MemoryRegion, MemoryRequest, align_up};

use crate::memory_map::KernelMemoryMap;

/// No free sub-region satisfies the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot meet memory request")]
pub struct CannotMeetRequest;

/// A sorted view of the occupied regions.
///
/// The bootstrap extends the caller's occupied list with the regions it
/// carves for itself, but it cannot allocate a combined list — no allocator
/// exists yet. The view therefore merges two individually sorted slices on
/// the fly: the caller's list and the carved additions.
#[derive(Clone, Copy)]
pub struct OccupiedView<'a> {
    first: &'a [MemoryRegion],
    second: &'a [MemoryRegion],
}

impl<'a> OccupiedView<'a> {
    /// A view over two sorted slices.
    #[must_use]
    pub fn new(first: &'a [MemoryRegion], second: &'a [MemoryRegion]) -> Self {
        debug_assert!(is_sorted(first), "occupied regions must be sorted");
        debug_assert!(is_sorted(second), "carved regions must be sorted");
        Self { first, second }
    }

    /// A view over a single sorted slice.
    #[must_use]
    pub fn of(regions: &'a [MemoryRegion]) -> Self {
        Self::new(regions, &[])
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.first.is_empty() && self.second.is_empty()
    }

    /// Iterate over all regions in ascending start order.
    #[must_use]
    pub fn iter(&self) -> OccupiedIter<'a> {
        OccupiedIter {
            first: self.first,
            second: self.second,
        }
    }
}

/// Whether `regions` is sorted ascending by start address.
#[must_use]
pub fn is_sorted(regions: &[MemoryRegion]) -> bool {
    regions.windows(2).all(|w| w[0].base() <= w[1].base())
}

/// Merging iterator over an [`OccupiedView`], ascending by start address.
#[derive(Clone)]
pub struct OccupiedIter<'a> {
    first: &'a [MemoryRegion],
    second: &'a [MemoryRegion],
}

impl Iterator for OccupiedIter<'_> {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<MemoryRegion> {
        let take_first = match (self.first.first(), self.second.first()) {
            (Some(a), Some(b)) => a.base() <= b.base(),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return None,
        };
        let (head, rest) = if take_first {
            (self.first[0], &self.first[1..])
        } else {
            (self.second[0], &self.second[1..])
        };
        if take_first {
            self.first = rest;
        } else {
            self.second = rest;
        }
        Some(head)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.first.len() + self.second.len();
        (len, Some(len))
    }
}

impl ExactSizeIterator for OccupiedIter<'_> {}

/// Find a free region of exactly `request.size` bytes, based at a multiple
/// of the request's alignment, fully inside some general-purpose descriptor
/// and disjoint from every occupied region.
///
/// The search is first-fit by descriptor in virtual-start order and lowest
/// address within each descriptor: the candidate starts at the descriptor's
/// aligned base and, on every collision, restarts at the colliding region's
/// top, re-aligned. The occupied view is sorted, so each descriptor scans it
/// at most once; a collision can only move the candidate rightwards, past
/// everything already inspected. An alignment step that would overflow the
/// address space abandons the current descriptor.
pub fn meet_request<const ALIGN: usize>(
    map: &KernelMemoryMap<'_>,
    occupied: &OccupiedView<'_>,
    request: &MemoryRequest<ALIGN>,
) -> Result<MemoryRegion, CannotMeetRequest> {
    for desc in map.iter().filter(|d| d.is_general_purpose()) {
        // Valid descriptors never exceed the address space.
        let desc_start = desc.virtual_start as usize;
        let desc_end = desc.virtual_end() as usize;

        let Some(mut start) = align_up(desc_start, ALIGN) else {
            continue;
        };
        let Some(mut end) = start.checked_add(request.size) else {
            continue;
        };
        if end > desc_end {
            continue;
        }

        let mut fits = true;
        for busy in occupied.iter() {
            if busy.top() <= start {
                continue;
            }
            if busy.base() >= end {
                break;
            }
            // Collision: restart just past it, re-aligned.
            let moved = align_up(busy.top(), ALIGN)
                .and_then(|s| s.checked_add(request.size).map(|e| (s, e)));
            match moved {
                Some((s, e)) if e <= desc_end => {
                    start = s;
                    end = e;
                }
                _ => {
                    fits = false;
                    break;
                }
            }
        }

        if fits {
            return Ok(MemoryRegion::new(start, request.size));
        }
    }

    Err(CannotMeetRequest)
}
