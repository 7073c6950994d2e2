//! # Kernel Boot Code
//!
//! The code that runs between the bootloader's jump and the scheduler
//! handoff: validate the environment, convert the firmware memory map
//! through a scratch buffer on the boot stack, build the unsynchronised
//! memory manager, and morph into the scheduler.
//!
//! The entry binary (stack setup, linker script, target glue) lives with
//! the bootloader; it calls [`kernel_main`] with the environment pointer.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]
#![deny(unsafe_op_in_unsafe_fn)]

use core::mem::MaybeUninit;

use log::{LevelFilter, error, info};

use kernel_alloc::{BuildError, MemoryManager};
use kernel_info::boot::{ENVIRONMENT_LEAST_COMPATIBLE, Environment, EnvironmentV1};
use kernel_info::memory::MIN_KERNEL_STACK_SIZE;
use kernel_memory_regions::MemoryRegion;
use kernel_mmap::{FirmwareMapError, FirmwareMapView, KernelMemoryMap};
use kernel_qemu::QemuLogger;
use kernel_resource::{BadAlloc, MonotonicBuffer};

/// Capacity of the boot-stack scratch buffer the firmware map is converted
/// through. Bounds the number of firmware descriptors the kernel accepts.
const BOOT_SCRATCH_SIZE: usize = 64 * 1024;

/// Page-aligned scratch storage on the boot stack.
#[repr(align(4096))]
struct BootScratch([MaybeUninit<u8>; BOOT_SCRATCH_SIZE]);

/// Halt the boot processor.
pub fn trap() -> ! {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("ud2", options(noreturn))
    }
    #[cfg(not(target_arch = "x86_64"))]
    loop {
        core::hint::spin_loop();
    }
}

/// Memory management could not be brought up.
#[derive(Debug, thiserror::Error)]
enum SetupError {
    #[error(transparent)]
    FirmwareMap(#[from] FirmwareMapError),
    #[error("firmware memory map too large for the boot scratch buffer")]
    ScratchTooSmall,
    #[error(transparent)]
    Convert(#[from] BadAlloc),
    #[error(transparent)]
    Build(#[from] BuildError),
}

/// The kernel's Rust entry point.
///
/// # Safety
///
/// `env` must come from a bootloader honouring the environment ABI: when
/// the least compatible version is 1, `env.data` must reference a live
/// [`EnvironmentV1`] whose firmware map buffer is readable.
pub unsafe fn kernel_main(env: &Environment) -> ! {
    let _ = QemuLogger::new(LevelFilter::Info).init();

    if env.least_compatible_version != ENVIRONMENT_LEAST_COMPATIBLE {
        error!(
            "environment has incompatible version {}",
            env.least_compatible_version
        );
        trap();
    }
    // SAFETY: the version was just checked; the bootloader vouches for the
    // payload behind `data`.
    let env = unsafe { &*env.data.cast::<EnvironmentV1>() };

    if env.kernel_stack_region.size < MIN_KERNEL_STACK_SIZE {
        error!(
            "kernel stack too small: {} bytes",
            env.kernel_stack_region.size
        );
        trap();
    }

    // SAFETY: forwarded from our own caller contract.
    let manager = match unsafe { setup_memory_manager(env) } {
        Ok(manager) => manager,
        Err(err) => {
            error!("cannot set up memory management: {err}");
            trap();
        }
    };

    morph_into_scheduler(manager)
}

/// From the memory data in `env`, create the unsynchronised memory manager.
///
/// The firmware map is converted into kernel form through a scratch buffer
/// on the boot stack; the manager then rebuilds everything it keeps into
/// memory it carves for itself, so nothing outlives this frame but the
/// manager.
///
/// # Safety
///
/// The firmware map buffer described by `env.memmap` must be readable.
unsafe fn setup_memory_manager(env: &EnvironmentV1) -> Result<MemoryManager, SetupError> {
    // SAFETY: forwarded from the caller.
    let view = unsafe { FirmwareMapView::new(&env.memmap) }?;

    let conversion = KernelMemoryMap::max_conversion_request(&view);
    if conversion.size > BOOT_SCRATCH_SIZE {
        return Err(SetupError::ScratchTooSmall);
    }

    let mut scratch = BootScratch([MaybeUninit::uninit(); BOOT_SCRATCH_SIZE]);
    // SAFETY: the scratch array is exclusively ours and outlives the map
    // built from it.
    let scratch_resource = unsafe {
        MonotonicBuffer::new(MemoryRegion::new(
            scratch.0.as_mut_ptr() as usize,
            BOOT_SCRATCH_SIZE,
        ))
    };
    let memmap = KernelMemoryMap::from_firmware(&view, &scratch_resource)?;
    info!(
        "memory map: {} descriptors from {} firmware entries",
        memmap.len(),
        view.len()
    );

    let mut occupied = env.occupied_memory();
    occupied.sort_unstable_by_key(|region| region.base());

    Ok(MemoryManager::build(&memmap, &occupied)?)
}

/// Hand the boot context over to the scheduler, taking the memory manager
/// along.
///
/// The scheduler is not part of this repository; until it exists, the boot
/// processor parks here with memory management live.
fn morph_into_scheduler(manager: MemoryManager) -> ! {
    info!("memory management up: {manager:?}");
    loop {
        core::hint::spin_loop();
    }
}
