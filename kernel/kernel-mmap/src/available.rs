//! # Available-Memory Enumeration
//!
//! Derives, on demand, what is left of the general-purpose descriptors once
//! the occupied regions are subtracted: every maximal free subrange is
//! reported exactly once, in ascending address order. The bootstrap uses
//! this twice — first to bound the array that will hold the fragments, then
//! to fill it.

use kernel_memory_regions::MemoryRegion;

use crate::memory_map::KernelMemoryMap;
use crate::placement::OccupiedView;

/// Invoke `visit` with every maximal subrange of a general-purpose
/// descriptor that is disjoint from the occupied view.
///
/// Zero-sized residuals are skipped. Occupied regions may extend beyond the
/// descriptor they overlap; only the part inside the descriptor matters.
pub fn for_each_fragment<F>(map: &KernelMemoryMap<'_>, occupied: &OccupiedView<'_>, mut visit: F)
where
    F: FnMut(MemoryRegion),
{
    for desc in map.iter().filter(|d| d.is_general_purpose()) {
        let desc_end = desc.virtual_end() as usize;
        let mut cursor = desc.virtual_start as usize;

        for busy in occupied.iter() {
            if busy.top() <= cursor {
                continue;
            }
            if busy.base() >= desc_end {
                break;
            }
            if busy.base() > cursor {
                visit(MemoryRegion::new(cursor, busy.base() - cursor));
            }
            cursor = cursor.max(busy.top());
            if cursor >= desc_end {
                break;
            }
        }

        if cursor < desc_end {
            visit(MemoryRegion::new(cursor, desc_end - cursor));
        }
    }
}

/// Number of fragments [`for_each_fragment`] would visit.
#[must_use]
pub fn count_fragments(map: &KernelMemoryMap<'_>, occupied: &OccupiedView<'_>) -> usize {
    let mut count = 0;
    for_each_fragment(map, occupied, |_| count += 1);
    count
}
