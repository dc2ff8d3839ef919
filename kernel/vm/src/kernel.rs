//! Boot wiring and process-wide singletons.
//!
//! Bring-up is two-phase. [`init_frames`] runs as soon as the memory map is
//! known and builds the frame table. [`open`] runs once the kernel can take
//! over its page tables: it builds the page arena, the caches and the
//! kernel map. Until `open` returns, [`KernelHeap`] hands out nothing.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use hadron_core::addr::{PhysAddr, VirtAddr};
use hadron_core::sync::Once;
use hadron_core::{kerr, kinfo};

use crate::config::VmConfig;
use crate::context::Vm;
use crate::kmem::pages::PageArena;
use crate::map::VmMap;
use crate::page::FrameTable;
use crate::pmap::X86_64Mmu;
use crate::{Hhdm, PhysMemoryRegion, VmError};

/// The build-selected page-table implementation.
pub type KernelMmu = X86_64Mmu;

static FRAMES: Once<FrameTable> = Once::new();
static MMU: Once<KernelMmu> = Once::new();
static PAGES: Once<PageArena> = Once::new();
static VM: Once<Vm<KernelMmu>> = Once::new();

/// Phase one: builds the frame table from the boot memory map.
///
/// # Errors
///
/// `AlreadyInitialized` on a second call; `OutOfMemory` if no usable
/// region can hold the table.
///
/// # Safety
///
/// `regions` must describe physical memory accurately, and every usable
/// region must be unused and reachable through `hhdm`.
pub unsafe fn init_frames(regions: &[PhysMemoryRegion], hhdm: Hhdm) -> Result<&'static FrameTable, VmError> {
    if FRAMES.is_initialized() {
        return Err(VmError::AlreadyInitialized);
    }
    // SAFETY: Forwarded from the caller.
    let table = unsafe { FrameTable::new(regions, hhdm)? };
    FRAMES.set(table).map_err(|_| VmError::AlreadyInitialized)
}

/// Phase two: opens the core for allocation and address spaces.
///
/// # Errors
///
/// `NotInitialized` before [`init_frames`]; `AlreadyInitialized` on a
/// second call; `OutOfMemory` if the kernel map cannot be set up.
///
/// # Safety
///
/// `kernel_root` must be the live kernel root table.
pub unsafe fn open(mmu: KernelMmu, kernel_root: PhysAddr, config: VmConfig) -> Result<&'static Vm<KernelMmu>, VmError> {
    let frames = FRAMES.get().ok_or(VmError::NotInitialized)?;
    if VM.is_initialized() {
        return Err(VmError::AlreadyInitialized);
    }
    let mmu = MMU.set(mmu).map_err(|_| VmError::AlreadyInitialized)?;
    let pages = PAGES
        .set(PageArena::new("kernel_pages", frames, frames.hhdm(), config.kernel_import_quantum))
        .map_err(|_| VmError::AlreadyInitialized)?;
    let vm = VM
        .set(Vm::new(config, mmu, frames, pages)?)
        .map_err(|_| VmError::AlreadyInitialized)?;
    // SAFETY: Forwarded from the caller.
    unsafe { vm.open(kernel_root)? };

    let stats = frames.stats();
    kinfo!(
        "vm: ready, {} of {} frames free",
        stats.free_frames,
        stats.total_frames
    );
    Ok(vm)
}

/// Returns the core once [`open`] has run.
pub fn vm() -> Option<&'static Vm<KernelMmu>> {
    VM.get()
}

/// Returns the frame table once [`init_frames`] has run.
pub fn frames() -> Option<&'static FrameTable> {
    FRAMES.get()
}

/// Runs `f` with the kernel map.
///
/// # Errors
///
/// `NotInitialized` before [`open`].
pub fn with_kernel_map<R>(f: impl FnOnce(&VmMap<KernelMmu>) -> R) -> Result<R, VmError> {
    let map = VM.get().and_then(Vm::kernel_map).ok_or(VmError::NotInitialized)?;
    Ok(f(map))
}

/// Maps `pages` pages of zeroed kernel memory.
///
/// # Errors
///
/// As for [`Vm::kernel_alloc`].
pub fn kernel_alloc(pages: u64) -> Result<VirtAddr, VmError> {
    VM.get().ok_or(VmError::NotInitialized)?.kernel_alloc(pages)
}

/// Releases memory from [`kernel_alloc`].
///
/// # Errors
///
/// As for [`Vm::kernel_free`].
pub fn kernel_free(va: VirtAddr, pages: u64) -> Result<(), VmError> {
    VM.get().ok_or(VmError::NotInitialized)?.kernel_free(va, pages)
}

/// Handler body of the TLB shootdown IPI.
pub fn handle_shootdown_ipi() {
    if let Some(vm) = VM.get() {
        vm.handle_shootdown_ipi();
    }
}

/// `#[global_allocator]` adapter over the kernel's size-class allocator.
pub struct KernelHeap;

// SAFETY: Memory comes from the slab caches and page arena, which never hand
// out overlapping live objects; null is returned on any failure.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(vm) = VM.get() else {
            return ptr::null_mut();
        };
        vm.kmem()
            .alloc(layout.size(), layout.align())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let (Some(vm), Some(ptr)) = (VM.get(), NonNull::new(ptr)) else {
            return;
        };
        // SAFETY: `ptr` was returned by `alloc` with this layout.
        if let Err(e) = unsafe { vm.kmem().free(ptr, layout.size(), layout.align()) } {
            kerr!("heap: bad free of {:p} ({} bytes): {}", ptr, layout.size(), e);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let (Some(vm), Some(old)) = (VM.get(), NonNull::new(ptr)) else {
            return ptr::null_mut();
        };
        // SAFETY: `ptr` was returned by `alloc` with this layout.
        unsafe { vm.kmem().realloc(old, layout.size(), new_size, layout.align()) }
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}
