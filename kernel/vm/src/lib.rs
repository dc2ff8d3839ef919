//! Memory-management core for the Hadron kernel.
//!
//! Layers, leaves first:
//!
//! - [`vmem`]: boundary-tag arena allocator over abstract integer spans.
//! - [`kmem`]: slab caches and the general-purpose size-class allocator,
//!   backed by page-granularity arenas.
//! - [`page`]: the frame table, one record per physical frame with its
//!   reference count, state and owner back-references.
//! - [`pmap`]: the page-table shim and cross-CPU TLB shootdown.
//! - [`map`]: address spaces, an ordered set of mapping entries per task.
//!
//! [`context::Vm`] ties the layers together and [`kernel`] holds the boot
//! wiring and process-wide singletons.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod context;
pub mod kernel;
pub mod kmem;
pub mod map;
pub mod page;
pub mod pmap;
pub mod vmem;

#[cfg(test)]
pub(crate) mod testutil;

use core::fmt;

use hadron_core::addr::{PhysAddr, VirtAddr};
use hadron_core::paging::{PageSize, Size4KiB};

/// Base page size in bytes.
pub const PAGE_SIZE: u64 = Size4KiB::SIZE;

/// Rounds `bytes` up to a whole number of pages.
#[inline]
pub const fn page_round_up(bytes: u64) -> u64 {
    (bytes + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Lock levels. A CPU may only acquire a lock whose level is higher than
/// every level it already holds.
pub(crate) mod lock_level {
    /// Per-address-space map lock.
    pub const MAP: u8 = 1;
    /// Slab cache lock.
    pub const CACHE: u8 = 2;
    /// Arena lock.
    pub const ARENA: u8 = 3;
    /// Frame table lock.
    pub const FRAMES: u8 = 4;
    /// TLB shootdown request slot.
    pub const SHOOTDOWN: u8 = 5;
}

/// The higher-half direct map: all physical memory mapped at a fixed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hhdm {
    offset: u64,
}

impl Hhdm {
    /// Creates a direct-map descriptor at `offset`.
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Returns the direct-map offset.
    pub const fn offset(self) -> u64 {
        self.offset
    }

    /// Translates a physical address to its direct-map virtual address.
    #[inline]
    pub const fn phys_to_virt(self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new_truncate(self.offset.wrapping_add(phys.as_u64()))
    }

    /// Returns a pointer to `phys` through the direct map.
    #[inline]
    pub const fn phys_to_ptr<T>(self, phys: PhysAddr) -> *mut T {
        self.offset.wrapping_add(phys.as_u64()) as *mut T
    }

    /// Translates a direct-map virtual address back to physical.
    #[inline]
    pub const fn virt_to_phys(self, virt: VirtAddr) -> PhysAddr {
        PhysAddr::new_truncate(virt.as_u64().wrapping_sub(self.offset))
    }
}

/// Kind of a boot memory-map region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// General-purpose RAM.
    Usable,
    /// Firmware-reserved; never handed out.
    Reserved,
    /// Boot-loader data that may be reclaimed once boot has finished.
    Reclaimable,
    /// Linear framebuffer.
    Framebuffer,
    /// Boot modules (initrd and friends).
    Modules,
}

/// A physical memory region descriptor, independent of bootloader types.
#[derive(Debug, Clone, Copy)]
pub struct PhysMemoryRegion {
    /// Physical start address of the region.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// What the region holds.
    pub kind: MemoryKind,
}

impl PhysMemoryRegion {
    /// Creates a region descriptor.
    pub const fn new(start: u64, size: u64, kind: MemoryKind) -> Self {
        Self {
            start: PhysAddr::new(start),
            size,
            kind,
        }
    }

    /// Returns the end address (exclusive).
    pub const fn end(&self) -> u64 {
        self.start.as_u64() + self.size
    }
}

/// Errors from the memory-management core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// An arena has no free segment large enough for the request.
    OutOfSpace,
    /// No physical frame, no slab growth, or no boundary tag available.
    OutOfMemory,
    /// The virtual address space has no gap large enough.
    NoSpace,
    /// The address or range is not valid for the operation.
    InvalidRange,
    /// The access is not permitted by the mapping's protection.
    AccessViolation,
    /// The resource is still in use.
    Busy,
    /// A boot-time singleton was initialized twice.
    AlreadyInitialized,
    /// A boot-time singleton was used before it was opened.
    NotInitialized,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfSpace => write!(f, "arena out of space"),
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::NoSpace => write!(f, "no virtual address space"),
            VmError::InvalidRange => write!(f, "invalid address range"),
            VmError::AccessViolation => write!(f, "access violation"),
            VmError::Busy => write!(f, "resource busy"),
            VmError::AlreadyInitialized => write!(f, "already initialized"),
            VmError::NotInitialized => write!(f, "not initialized"),
        }
    }
}
