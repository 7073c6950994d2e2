//! End-to-end bootstrap scenarios: building a working general-purpose
//! allocator out of nothing but a memory map describing a real arena.

use core::ptr::NonNull;

use kernel_alloc::{BuildError, MemoryManager};
use kernel_info::memory::KERNEL_PAGESIZE;
use kernel_memory_regions::MemoryRegion;
use kernel_mmap::memory_map::{KernelDescriptor, KernelMemoryMap, KernelMemoryType};
use kernel_resource::{MonotonicBuffer, Resource};

const KP: usize = KERNEL_PAGESIZE;

/// A page-aligned span of real, writable host memory the scenarios describe
/// through their memory maps.
struct Arena {
    _storage: Vec<u8>,
    base: usize,
    pages: usize,
}

impl Arena {
    fn with_pages(pages: usize) -> Self {
        let mut storage = vec![0u8; (pages + 2) * KP];
        let base = (storage.as_mut_ptr() as usize + KP - 1) & !(KP - 1);
        Self {
            _storage: storage,
            base,
            pages,
        }
    }

    fn span(&self) -> MemoryRegion {
        MemoryRegion::new(self.base, self.pages * KP)
    }

    fn contains_ptr(&self, ptr: NonNull<u8>, bytes: usize) -> bool {
        self.span().contains(&MemoryRegion::new(ptr.as_ptr() as usize, bytes))
    }
}

fn descriptor(ty: KernelMemoryType, base: usize, pages: usize) -> KernelDescriptor {
    KernelDescriptor {
        ty,
        physical_start: base as u64,
        virtual_start: base as u64,
        number_of_pages: pages as u64,
    }
}

/// Build a kernel map over `descs`; the returned storage must outlive the
/// map.
fn build_map(descs: &[KernelDescriptor]) -> (Vec<u8>, KernelMemoryMap<'static>) {
    let mut storage = vec![0u8; descs.len() * size_of::<KernelDescriptor>() + 64];
    let region = MemoryRegion::new(storage.as_mut_ptr() as usize, storage.len());
    let resource = Box::leak(Box::new(unsafe { MonotonicBuffer::new(region) }));
    let map = KernelMemoryMap::from_descriptors(descs, resource).unwrap();
    (storage, map)
}

#[test]
fn single_descriptor_bootstrap() {
    let arena = Arena::with_pages(1024);
    let (_storage, map) = build_map(&[descriptor(
        KernelMemoryType::GeneralPurpose,
        arena.base,
        arena.pages,
    )]);

    let manager = MemoryManager::build(&map, &[]).unwrap();
    assert_eq!(manager.memory_map().len(), 1);

    let general = manager.general_resource();
    let ptr = general.allocate(16, 16).unwrap();
    assert!(arena.contains_ptr(ptr, 16));

    // Freeing and reallocating the same size hands back the same block.
    unsafe { general.deallocate(ptr, 16, 16) };
    let again = general.allocate(16, 16).unwrap();
    assert_eq!(ptr, again);
}

#[test]
fn manager_is_movable_after_construction() {
    fn build_elsewhere(arena: &Arena) -> (Vec<u8>, MemoryManager) {
        let (storage, map) = build_map(&[descriptor(
            KernelMemoryType::GeneralPurpose,
            arena.base,
            arena.pages,
        )]);
        (storage, MemoryManager::build(&map, &[]).unwrap())
    }

    let arena = Arena::with_pages(1024);
    let (_storage, manager) = build_elsewhere(&arena);
    // Moved by return; the allocator must still be wired to the fragments.
    let moved = manager;
    let ptr = moved.general_resource().allocate(256, 8).unwrap();
    assert!(arena.contains_ptr(ptr, 256));
}

#[test]
fn full_manager_avoids_kernel_and_bookkeeping_regions() {
    // An unusable head, a general-purpose body, and kernel image and stack
    // regions occupied inside the body.
    let arena = Arena::with_pages(4096);
    let body_base = arena.base + 2 * KP;
    let body_pages = arena.pages - 2;
    let (_storage, map) = build_map(&[
        descriptor(KernelMemoryType::Unusable, arena.base, 2),
        descriptor(KernelMemoryType::GeneralPurpose, body_base, body_pages),
    ]);

    let image = MemoryRegion::new(body_base + 256 * KP, 256 * KP);
    let stack = MemoryRegion::new(body_base + 2048 * KP, 512 * KP);
    let occupied = [image, stack];

    let manager = MemoryManager::build(&map, &occupied).unwrap();

    // The caller's regions plus one carving per bookkeeping purpose.
    assert_eq!(manager.occupied_regions().len(), occupied.len() + 4);
    assert!(manager.occupied_regions().contains(&image));
    assert!(manager.occupied_regions().contains(&stack));
    // The occupied list is sorted and pairwise disjoint.
    let regions = manager.occupied_regions();
    for pair in regions.windows(2) {
        assert!(pair[0].base() <= pair[1].base());
        assert!(!pair[0].intersects(&pair[1]));
    }

    // A fresh allocation lands in free memory: inside the arena, outside
    // the kernel regions and outside every bookkeeping carving.
    let ptr = manager.general_resource().allocate(1024, 16).unwrap();
    assert!(arena.contains_ptr(ptr, 1024));
    let block = MemoryRegion::new(ptr.as_ptr() as usize, 1024);
    for region in manager.occupied_regions() {
        assert!(!block.intersects(region));
    }
}

#[test]
fn occupied_list_must_be_sorted() {
    let arena = Arena::with_pages(1024);
    let (_storage, map) = build_map(&[descriptor(
        KernelMemoryType::GeneralPurpose,
        arena.base,
        arena.pages,
    )]);

    let occupied = [
        MemoryRegion::new(arena.base + 512 * KP, KP),
        MemoryRegion::new(arena.base, KP),
    ];
    let err = MemoryManager::build(&map, &occupied).unwrap_err();
    assert_eq!(err, BuildError::UnsortedOccupied);
}

#[test]
fn occupied_memory_must_be_mapped() {
    let arena = Arena::with_pages(1024);
    let (_storage, map) = build_map(&[descriptor(
        KernelMemoryType::GeneralPurpose,
        arena.base,
        arena.pages,
    )]);

    // A region sticking out past the descriptor.
    let occupied = [MemoryRegion::new(arena.base + (arena.pages - 1) * KP, 2 * KP)];
    let err = MemoryManager::build(&map, &occupied).unwrap_err();
    assert_eq!(err, BuildError::OccupiedOutsideMap);
}

#[test]
fn exhausted_map_cannot_build() {
    let arena = Arena::with_pages(8);
    let (_storage, map) = build_map(&[descriptor(
        KernelMemoryType::GeneralPurpose,
        arena.base,
        arena.pages,
    )]);

    // Everything is already occupied; no carving can be placed.
    let occupied = [arena.span()];
    let err = MemoryManager::build(&map, &occupied).unwrap_err();
    assert_eq!(err, BuildError::CannotMeetRequest(kernel_mmap::CannotMeetRequest));
}

#[test]
fn allocations_twice_the_page_size_are_rejected() {
    // The buddy tops out at the kernel pagesize.
    let arena = Arena::with_pages(1024);
    let (_storage, map) = build_map(&[descriptor(
        KernelMemoryType::GeneralPurpose,
        arena.base,
        arena.pages,
    )]);

    let manager = MemoryManager::build(&map, &[]).unwrap();
    assert!(manager.general_resource().allocate(2 * KP, 16).is_err());
    assert!(manager.general_resource().allocate(KP / 2, 16).is_ok());
}

#[test]
fn distinct_allocations_do_not_overlap() {
    let arena = Arena::with_pages(1024);
    let (_storage, map) = build_map(&[descriptor(
        KernelMemoryType::GeneralPurpose,
        arena.base,
        arena.pages,
    )]);

    let manager = MemoryManager::build(&map, &[]).unwrap();
    let general = manager.general_resource();

    let sizes = [16usize, 24, 64, 200, 1000, 48, 16, 512];
    let blocks: Vec<MemoryRegion> = sizes
        .iter()
        .map(|&size| {
            let ptr = general.allocate(size, 8).unwrap();
            MemoryRegion::new(ptr.as_ptr() as usize, size)
        })
        .collect();

    for (i, a) in blocks.iter().enumerate() {
        for b in &blocks[i + 1..] {
            assert!(!a.intersects(b), "{a} overlaps {b}");
        }
    }
}
