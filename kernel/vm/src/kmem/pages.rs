//! Page-granularity kernel memory.
//!
//! A [`PageArena`] is a vmem arena over physical addresses that imports
//! wired spans from the frame table and returns them once they are entirely
//! free. Its boundary tags grow from the same source, one page at a time. Callers get pointers through the direct map. It backs slab caches
//! and allocations too large for a size class.

use core::ptr::NonNull;

use hadron_core::addr::{PhysAddr, VirtAddr};
use hadron_core::kwarn;

use super::SlabBacking;
use crate::vmem::{AllocPolicy, Constraints, SpanSource, TagSource, Vmem};
use crate::{Hhdm, PAGE_SIZE, VmError};

/// Page-granularity allocator over the direct map.
pub struct PageArena {
    arena: Vmem,
    hhdm: Hhdm,
}

impl PageArena {
    /// Creates an empty arena importing at least `import_quantum` bytes at a
    /// time from `source`, which also supplies its boundary-tag pages.
    pub fn new<S: SpanSource + TagSource>(
        name: &'static str,
        source: &'static S,
        hhdm: Hhdm,
        import_quantum: u64,
    ) -> Self {
        Self {
            arena: Vmem::new(name, 0, 0, PAGE_SIZE, Some(source))
                .with_import_quantum(import_quantum)
                .with_tag_source(source),
            hhdm,
        }
    }

    /// Allocates `size` bytes (rounded up to pages) aligned to `align`.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if no frames are left; `InvalidRange` for a zero size
    /// or a bad alignment.
    pub fn alloc_pages(&self, size: u64, align: u64) -> Result<NonNull<u8>, VmError> {
        let phys = self
            .arena
            .xalloc(
                size,
                Constraints::aligned(align.max(PAGE_SIZE)),
                AllocPolicy::InstantFit,
            )
            .map_err(|e| match e {
                VmError::OutOfSpace => VmError::OutOfMemory,
                e => e,
            })?;
        let ptr = self.hhdm.phys_to_ptr::<u8>(PhysAddr::new(phys));
        NonNull::new(ptr).ok_or(VmError::InvalidRange)
    }

    /// Frees pages returned by [`PageArena::alloc_pages`], returning the
    /// number of bytes released.
    ///
    /// # Errors
    ///
    /// `InvalidRange` if `ptr` is not the start of an allocation.
    ///
    /// # Safety
    ///
    /// Nothing may use the memory after this call.
    pub unsafe fn free_pages(&self, ptr: NonNull<u8>) -> Result<u64, VmError> {
        let phys = self.hhdm.virt_to_phys(VirtAddr::new_truncate(ptr.as_ptr() as u64));
        self.arena.free(phys.as_u64())
    }

    /// Returns the underlying arena.
    pub fn arena(&self) -> &Vmem {
        &self.arena
    }

    /// Returns the direct map this arena hands out pointers through.
    pub fn hhdm(&self) -> Hhdm {
        self.hhdm
    }
}

// SAFETY: `alloc_pages` returns exclusively owned direct-map memory of the
// requested size and alignment; the direct map preserves alignment up to the
// offset's own alignment, which is at least 1 GiB on real hardware.
unsafe impl SlabBacking for PageArena {
    fn alloc_slab(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        self.alloc_pages(size as u64, size as u64)
    }

    unsafe fn free_slab(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: Forwarded from the caller.
        if let Err(e) = unsafe { self.free_pages(ptr) } {
            kwarn!("kmem: slab {:p} ({} bytes) not returned: {}", ptr, size, e);
        }
    }
}
