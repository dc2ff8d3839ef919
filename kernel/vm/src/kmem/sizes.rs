//! General-purpose kernel allocator.
//!
//! Requests up to 4 KiB are served from one of 32 size-class caches; larger
//! requests (or alignments a class cannot honour) take whole pages from the
//! page arena.

use core::ptr::NonNull;

use hadron_core::kdebug;
use planck_noalloc::vec::ArrayVec;

use super::{KmemCache, PageArena};
use crate::{PAGE_SIZE, VmError, page_round_up};

/// Object sizes of the size-class caches.
pub const KMEM_SIZE_CLASSES: [usize; 32] = [
    8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640,
    768, 896, 1024, 1280, 1536, 1792, 2048, 2560, 3072, 3584, 4096,
];

const CLASS_NAMES: [&str; 32] = [
    "kmem-8", "kmem-16", "kmem-24", "kmem-32", "kmem-40", "kmem-48", "kmem-56", "kmem-64",
    "kmem-80", "kmem-96", "kmem-112", "kmem-128", "kmem-160", "kmem-192", "kmem-224", "kmem-256",
    "kmem-320", "kmem-384", "kmem-448", "kmem-512", "kmem-640", "kmem-768", "kmem-896",
    "kmem-1024", "kmem-1280", "kmem-1536", "kmem-1792", "kmem-2048", "kmem-2560", "kmem-3072",
    "kmem-3584", "kmem-4096",
];

/// Natural alignment of a size class: its largest power-of-two divisor,
/// capped at a page.
const fn class_align(size: usize) -> usize {
    let align = 1usize << size.trailing_zeros();
    if align > PAGE_SIZE as usize {
        PAGE_SIZE as usize
    } else {
        align
    }
}

/// Index of the smallest class that fits `size` at `align`.
fn class_for(size: usize, align: usize) -> Option<usize> {
    KMEM_SIZE_CLASSES
        .iter()
        .position(|&class| class >= size && class_align(class) >= align)
}

/// Size-class allocator.
pub struct KmemAllocator {
    classes: ArrayVec<KmemCache, 32>,
    pages: &'static PageArena,
}

impl KmemAllocator {
    /// Creates the size-class caches over `pages`.
    ///
    /// # Errors
    ///
    /// Propagates cache creation failures.
    pub fn new(pages: &'static PageArena, retained_empty: usize) -> Result<Self, VmError> {
        let mut classes = ArrayVec::new();
        for (&size, &name) in KMEM_SIZE_CLASSES.iter().zip(CLASS_NAMES.iter()) {
            let cache = KmemCache::new(name, size, class_align(size), None, None, pages, retained_empty)?;
            if classes.try_push(cache).is_err() {
                return Err(VmError::OutOfMemory);
            }
        }
        Ok(Self { classes, pages })
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` when memory is exhausted; `InvalidRange` for a zero
    /// size or a non-power-of-two alignment.
    pub fn alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 || !align.is_power_of_two() {
            return Err(VmError::InvalidRange);
        }
        match class_for(size, align) {
            Some(class) => self.classes[class].alloc(),
            None => self
                .pages
                .alloc_pages(page_round_up(size as u64), (align as u64).max(PAGE_SIZE)),
        }
    }

    /// Frees memory returned by [`KmemAllocator::alloc`] with the same size
    /// and alignment.
    ///
    /// # Errors
    ///
    /// `InvalidRange` if `ptr` was not allocated with this size and
    /// alignment.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator, and nothing may use the memory
    /// after this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<(), VmError> {
        match class_for(size, align) {
            // SAFETY: Forwarded from the caller.
            Some(class) => unsafe { self.classes[class].free(ptr) },
            None => unsafe { self.pages.free_pages(ptr).map(|_| ()) },
        }
    }

    /// Resizes an allocation, moving it if it no longer fits its class.
    ///
    /// # Errors
    ///
    /// As for [`KmemAllocator::alloc`]. On failure the old allocation is
    /// left intact.
    ///
    /// # Safety
    ///
    /// As for [`KmemAllocator::free`], with `old_size` the size `ptr` was
    /// allocated with.
    pub unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, VmError> {
        let old_class = class_for(old_size, align);
        let new_class = class_for(new_size, align);
        let same_pages = old_class.is_none()
            && new_class.is_none()
            && page_round_up(old_size as u64) == page_round_up(new_size as u64);
        if (old_class.is_some() && old_class == new_class) || same_pages {
            return Ok(ptr);
        }

        let new = self.alloc(new_size, align)?;
        // SAFETY: Both regions are valid for the smaller size and distinct.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), old_size.min(new_size));
            self.free(ptr, old_size, align)?;
        }
        Ok(new)
    }

    /// Visits every size-class cache.
    pub fn for_each_cache(&self, mut f: impl FnMut(&KmemCache)) {
        for cache in self.classes.iter() {
            f(cache);
        }
    }

    /// Releases empty slabs in every class, returning how many were freed.
    pub fn reap(&self) -> usize {
        self.classes.iter().map(KmemCache::reap).sum()
    }

    /// Logs the counters of every class that has slabs.
    pub fn dump(&self) {
        let pages = self.pages.arena().stats();
        kdebug!(
            "kmem: {} size classes, page arena {:#x} in use / {:#x} imported",
            self.classes.len(),
            pages.in_use,
            pages.imported
        );
        for cache in self.classes.iter() {
            if cache.stats().slabs != 0 {
                cache.dump();
            }
        }
    }
}
