//! # Firmware Memory Map View
//!
//! The firmware reports its memory map as an array of descriptor blobs whose
//! stride is runtime data: future firmware revisions may append fields, so
//! the stride can exceed the version-1 descriptor size. This module provides
//! a bounded, read-only view that extracts version-1 descriptors by value
//! and ignores any trailing bytes.

use core::mem::size_of;

use kernel_info::boot::FirmwareMap;
use kernel_memory_regions::MemoryRegion;

/// The descriptor layout version this view extracts.
pub const FIRMWARE_DESCRIPTOR_VERSION: u32 = 1;

/// The firmware pagesize (4 KiB), in which descriptor page counts are given.
pub const FIRMWARE_PAGESIZE: usize = 1 << 12;

/// Memory types reported by the firmware.
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FirmwareMemoryType {
    ReservedMemoryType = 0,
    LoaderCode,
    LoaderData,
    BootServicesCode,
    BootServicesData,
    RuntimeServicesCode,
    RuntimeServicesData,
    ConventionalMemory,
    UnusableMemory,
    AcpiReclaimMemory,
    AcpiMemoryNvs,
    MemoryMappedIo,
    MemoryMappedIoPortSpace,
    PalCode,
    MaxMemoryType,
}

bitflags::bitflags! {
    /// Memory attribute bits reported alongside each firmware descriptor.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct MemoryAttributes: u64 {
        /// Uncacheable.
        const UC = 1 << 0;
        /// Write-combining.
        const WC = 1 << 1;
        /// Write-through.
        const WT = 1 << 2;
        /// Write-back.
        const WB = 1 << 3;
        /// Uncacheable, exported.
        const UCE = 1 << 4;
        /// Write-protected.
        const WP = 1 << 12;
        /// Read-protected.
        const RP = 1 << 13;
        /// Not executable.
        const XP = 1 << 14;
        /// Needed by runtime services.
        const RUNTIME = 1 << 63;
    }
}

/// A version-1 firmware memory descriptor.
///
/// `physical_start` and `virtual_start` are 4 KiB aligned; `number_of_pages`
/// counts firmware pages ([`FIRMWARE_PAGESIZE`]).
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct FirmwareDescriptor {
    /// Raw memory type value; see [`FirmwareMemoryType`].
    pub ty: u32,
    pub physical_start: u64,
    pub virtual_start: u64,
    pub number_of_pages: u64,
    /// Raw attribute bits; see [`MemoryAttributes`].
    pub attribute: u64,
}

impl FirmwareDescriptor {
    /// Whether this descriptor reports conventional (general-purpose) memory.
    #[inline]
    #[must_use]
    pub const fn is_conventional(&self) -> bool {
        self.ty == FirmwareMemoryType::ConventionalMemory as u32
    }

    #[inline]
    #[must_use]
    pub const fn attributes(&self) -> MemoryAttributes {
        MemoryAttributes::from_bits_retain(self.attribute)
    }
}

/// The firmware map cannot be interpreted by this kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FirmwareMapError {
    /// The stride is smaller than a version-1 descriptor.
    #[error("firmware descriptor stride is smaller than the v1 descriptor")]
    StrideTooSmall,
    /// The firmware requires a descriptor version this kernel predates.
    #[error("firmware memory map requires an incompatible descriptor version")]
    IncompatibleVersion,
}

/// A bounded, read-only view over the firmware's descriptor blobs.
///
/// Descriptors are produced by value: the first
/// `size_of::<FirmwareDescriptor>()` bytes of each stride are read
/// (unaligned), the rest is ignored. All index arithmetic happens in
/// address space, never through typed pointer offsets.
#[derive(Clone, Copy, Debug)]
pub struct FirmwareMapView {
    base: *const u8,
    count: usize,
    stride: usize,
    version: u32,
}

impl FirmwareMapView {
    /// Create a view over the descriptor buffer described by `map`.
    ///
    /// # Safety
    ///
    /// `map.descriptors` must point to at least
    /// `map.number_of_descriptors * map.descriptor_size` readable bytes for
    /// the lifetime of the view.
    pub unsafe fn new(map: &FirmwareMap) -> Result<Self, FirmwareMapError> {
        if map.descriptor_size < size_of::<FirmwareDescriptor>() {
            return Err(FirmwareMapError::StrideTooSmall);
        }
        if map.least_compatible_version > FIRMWARE_DESCRIPTOR_VERSION {
            return Err(FirmwareMapError::IncompatibleVersion);
        }
        Ok(Self {
            base: map.descriptors,
            count: map.number_of_descriptors,
            stride: map.descriptor_size,
            version: map.descriptor_version,
        })
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// The memory occupied by the descriptor buffer itself.
    #[must_use]
    pub fn storage_region(&self) -> MemoryRegion {
        MemoryRegion::new(self.base as usize, self.count * self.stride)
    }

    /// Extract descriptor `index` by value.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn get(&self, index: usize) -> FirmwareDescriptor {
        assert!(index < self.count, "firmware descriptor index out of bounds");
        let addr = self.base as usize + index * self.stride;
        // The stride need not preserve the descriptor's natural alignment.
        unsafe { (addr as *const FirmwareDescriptor).read_unaligned() }
    }

    #[inline]
    #[must_use]
    pub fn iter(&self) -> FirmwareMapIter<'_> {
        FirmwareMapIter {
            view: self,
            index: 0,
        }
    }
}

/// Forward iterator over a [`FirmwareMapView`].
#[derive(Clone)]
pub struct FirmwareMapIter<'a> {
    view: &'a FirmwareMapView,
    index: usize,
}

impl Iterator for FirmwareMapIter<'_> {
    type Item = FirmwareDescriptor;

    fn next(&mut self) -> Option<FirmwareDescriptor> {
        if self.index == self.view.len() {
            return None;
        }
        let desc = self.view.get(self.index);
        self.index += 1;
        Some(desc)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.view.len() - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for FirmwareMapIter<'_> {}
