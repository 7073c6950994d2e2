//! # Memory Manager Bootstrap
//!
//! Builds the unsynchronised memory manager out of a sanitised memory map
//! and the regions already in use. The difficulty is sequencing: the
//! manager's own bookkeeping needs memory, and there is no allocator yet.
//! So the bootstrap carves a region out of free memory for every piece of
//! bookkeeping — each placement treating the previous carvings as occupied
//! — and only then constructs the collections into the carved space.

use core::mem::size_of;
use core::ptr::NonNull;

use log::{debug, info};

use kernel_info::memory::KERNEL_PAGESIZE;
use kernel_memory_regions::{MemoryRegion, MemoryRequest};
use kernel_mmap::available::{count_fragments, for_each_fragment};
use kernel_mmap::memory_map::KernelMemoryMap;
use kernel_mmap::placement::{CannotMeetRequest, OccupiedView, is_sorted, meet_request};
use kernel_resource::{BadAlloc, DynArray, DynArrayBuilder, MonotonicBuffer, Resource};

use crate::buddy::{BuddyError, BuddyResource};
use crate::config::SMALLEST_MEMORY_CHUNK;
use crate::distributed::DistributedResource;

/// The allocator composition the manager exposes.
pub type GeneralResource = BuddyResource<DistributedResource<MonotonicBuffer>>;

/// Number of internal bookkeeping resources (map, occupied list, fragments).
const RESOURCE_COUNT: usize = 3;

/// Number of regions the bootstrap carves for itself.
const CARVE_COUNT: usize = 4;

/// The memory manager cannot be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// The occupied list is not sorted ascending by start address.
    #[error("occupied regions are not sorted")]
    UnsortedOccupied,
    /// An occupied region is not contained in any descriptor.
    #[error("occupied memory not contained in memory map")]
    OccupiedOutsideMap,
    /// Free memory is too fragmented or too small for the bookkeeping.
    #[error(transparent)]
    CannotMeetRequest(#[from] CannotMeetRequest),
    /// An internal allocation failed.
    #[error(transparent)]
    BadAlloc(#[from] BadAlloc),
    /// The general-purpose allocator could not be composed.
    #[error(transparent)]
    Buddy(#[from] BuddyError),
}

/// The memory managing object of the pre-scheduler boot phase.
///
/// Owns a sanitised copy of the memory map, the final occupied list
/// (including the regions carved for its own bookkeeping), one monotonic
/// buffer per residual free fragment, and the general-purpose allocator
/// composed over those fragments.
///
/// The manager is move-only and strictly single-threaded. All of its
/// collections live in carved memory at stable addresses, so moving the
/// manager by value is safe.
pub struct MemoryManager {
    /// The bookkeeping resources, placement-constructed into carved memory.
    resources: NonNull<MonotonicBuffer>,
    memmap: KernelMemoryMap<'static>,
    occupied: DynArray<'static, MemoryRegion>,
    fragments: DynArray<'static, MonotonicBuffer>,
    general: GeneralResource,
}

impl MemoryManager {
    /// Build the manager from a memory map and a sorted occupied list.
    ///
    /// Every occupied region must be contained in some descriptor of the
    /// map. The map and the occupied list are copied into carved memory;
    /// the inputs only need to live for the duration of the call.
    pub fn build(
        memmap: &KernelMemoryMap<'_>,
        occupied: &[MemoryRegion],
    ) -> Result<Self, BuildError> {
        if !is_sorted(occupied) {
            return Err(BuildError::UnsortedOccupied);
        }
        for region in occupied {
            if !memmap.iter().any(|desc| desc.contains_region(region)) {
                return Err(BuildError::OccupiedOutsideMap);
            }
        }

        let mut carved = [MemoryRegion::new(0, 0); CARVE_COUNT];
        let mut carve_count = 0;

        // Carve a region for the memory map copy.
        let memmap_request = memmap.max_copy_request();
        let memmap_omd = meet_request(
            memmap,
            &OccupiedView::new(occupied, &carved[..carve_count]),
            &memmap_request,
        )?;
        insert_sorted(&mut carved, &mut carve_count, memmap_omd);
        debug!("memory manager: map copy at {memmap_omd}");

        // Carve a region for the occupied list copy. Every carve adds one
        // region, so the final list holds the caller's entries plus
        // CARVE_COUNT more.
        let omd_request = MemoryRequest::<{ align_of::<MemoryRegion>() }>::new(
            (occupied.len() + CARVE_COUNT) * size_of::<MemoryRegion>(),
        );
        let omd_omd = meet_request(
            memmap,
            &OccupiedView::new(occupied, &carved[..carve_count]),
            &omd_request,
        )?;
        insert_sorted(&mut carved, &mut carve_count, omd_omd);
        debug!("memory manager: occupied list at {omd_omd}");

        // Carve a region for the internal resource objects themselves.
        let resources_request = MemoryRequest::<{ align_of::<MonotonicBuffer>() }>::new(
            RESOURCE_COUNT * size_of::<MonotonicBuffer>(),
        );
        let resources_omd = meet_request(
            memmap,
            &OccupiedView::new(occupied, &carved[..carve_count]),
            &resources_request,
        )?;
        insert_sorted(&mut carved, &mut carve_count, resources_omd);
        debug!("memory manager: internal resources at {resources_omd}");

        // Carve a region for the fragment array. Carving it can split one
        // more fragment in two, hence the one-element slack.
        let max_fragments = 1 + count_fragments(
            memmap,
            &OccupiedView::new(occupied, &carved[..carve_count]),
        );
        let avm_request = MemoryRequest::<{ align_of::<MonotonicBuffer>() }>::new(
            max_fragments * size_of::<MonotonicBuffer>(),
        );
        let avm_omd = meet_request(
            memmap,
            &OccupiedView::new(occupied, &carved[..carve_count]),
            &avm_request,
        )?;
        insert_sorted(&mut carved, &mut carve_count, avm_omd);
        debug!("memory manager: fragment array at {avm_omd}");

        // All carvings are in place; construct the three bookkeeping
        // resources into their region.
        //
        // SAFETY: `resources_omd` was just carved out of free, writable
        // memory disjoint from everything else, properly aligned and sized
        // for RESOURCE_COUNT buffers, and each buffer receives a freshly
        // carved region of its own. The fabricated `'static` lifetimes are
        // bounded in practice by the manager, which owns the carved regions
        // and is the only way to reach these objects.
        let resources =
            NonNull::new(resources_omd.base_ptr().cast::<MonotonicBuffer>()).ok_or(BadAlloc)?;
        let (memmap_resource, omd_resource, avm_resource) = unsafe {
            resources.write(MonotonicBuffer::new(memmap_omd));
            resources.add(1).write(MonotonicBuffer::new(omd_omd));
            resources.add(2).write(MonotonicBuffer::new(avm_omd));
            (
                resources.as_ref(),
                resources.add(1).as_ref(),
                resources.add(2).as_ref(),
            )
        };

        // Rebuild the collections in their dedicated resources.
        let memmap = memmap.clone_into(memmap_resource)?;
        let final_view = OccupiedView::new(occupied, &carved);
        let occupied = DynArray::from_iter(final_view.iter(), omd_resource)?;

        let fragment_count = count_fragments(&memmap, &final_view);
        debug_assert!(fragment_count <= max_fragments);
        let mut builder = DynArrayBuilder::new(fragment_count, avm_resource)?;
        let mut push_failed = false;
        for_each_fragment(&memmap, &final_view, |fragment| {
            // SAFETY: fragments are maximal free subranges of the map,
            // disjoint from every occupied region including all carvings.
            let buffer = unsafe { MonotonicBuffer::new(fragment) };
            push_failed |= builder.push(buffer).is_err();
        });
        if push_failed {
            return Err(BadAlloc.into());
        }
        let fragments = builder.finish();

        // Compose the allocator stack over the fragments.
        //
        // SAFETY: the fragment buffers live in carved memory at stable
        // addresses for the manager's whole lifetime and are not accessed
        // through any other path.
        let distributed =
            unsafe { DistributedResource::new(fragments.iter().map(NonNull::from)) }?;
        let general = BuddyResource::new(
            SMALLEST_MEMORY_CHUNK,
            KERNEL_PAGESIZE,
            KERNEL_PAGESIZE,
            distributed,
        )?;

        info!(
            "memory manager ready: {} descriptors, {} occupied regions, {} fragments",
            memmap.len(),
            occupied.len(),
            fragments.len()
        );

        Ok(Self {
            resources,
            memmap,
            occupied,
            fragments,
            general,
        })
    }

    /// The general-purpose allocator.
    #[inline]
    #[must_use]
    pub fn general_resource(&self) -> &GeneralResource {
        &self.general
    }

    /// The manager's sanitised memory map.
    #[inline]
    #[must_use]
    pub fn memory_map(&self) -> &KernelMemoryMap<'static> {
        &self.memmap
    }

    /// All regions considered occupied, including the manager's own
    /// bookkeeping, sorted ascending.
    #[inline]
    #[must_use]
    pub fn occupied_regions(&self) -> &[MemoryRegion] {
        &self.occupied
    }

    /// Number of free fragments backing the general-purpose allocator.
    #[inline]
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    fn internal_resources(&self) -> &[MonotonicBuffer] {
        unsafe { core::slice::from_raw_parts(self.resources.as_ptr(), RESOURCE_COUNT) }
    }
}

impl core::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("descriptors", &self.memmap.len())
            .field("occupied", &self.occupied.len())
            .field("fragments", &self.fragments.len())
            .field("resources", &self.internal_resources())
            .finish_non_exhaustive()
    }
}

/// Insert `region` into the sorted prefix `carved[..len]`, stable.
fn insert_sorted(carved: &mut [MemoryRegion; CARVE_COUNT], len: &mut usize, region: MemoryRegion) {
    debug_assert!(*len < CARVE_COUNT);
    let mut index = *len;
    while index > 0 && carved[index - 1].base() > region.base() {
        carved[index] = carved[index - 1];
        index -= 1;
    }
    carved[index] = region;
    *len += 1;
}
