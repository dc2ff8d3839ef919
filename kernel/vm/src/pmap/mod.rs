//! Page-table shim.
//!
//! [`Mmu`] is the per-architecture capability: install, remove and protect
//! leaf translations, flush the local TLB, switch address spaces, and poke
//! other CPUs. [`Pmap`] is one address space's root plus the bookkeeping
//! that keeps every CPU's TLB coherent with it: removals and downgrades
//! are invalidated locally and shot down on every other CPU the pmap is
//! active on before the call returns, and frames are only handed back to
//! the caller after that.
//!
//! The architecture is chosen at build time: pmaps are generic over the
//! `Mmu` type, so there is no dynamic dispatch per operation.

pub mod shootdown;
pub mod x86_64;

use core::sync::atomic::{AtomicU64, Ordering};

use hadron_core::addr::{PhysAddr, VirtAddr};
use hadron_core::cpu::CpuSet;
use hadron_core::kwarn;
use planck_noalloc::vec::ArrayVec;

use crate::page::{FrameTable, KernelUse, PageOwner};
use crate::{PAGE_SIZE, VmError};

pub use shootdown::TlbShootdown;
pub use x86_64::X86_64Mmu;

/// Translations removed before the TLB is invalidated and the callback runs.
const REMOVE_BATCH: usize = 32;

bitflags::bitflags! {
    /// Access rights of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Prot: u8 {
        /// Readable.
        const READ    = 1 << 0;
        /// Writable.
        const WRITE   = 1 << 1;
        /// Executable.
        const EXECUTE = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Mapping attributes beyond protection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PmapFlags: u8 {
        /// 2 MiB leaf.
        const HUGE    = 1 << 0;
        /// 1 GiB leaf.
        const LARGE   = 1 << 1;
        /// Accessible from user mode.
        const USER    = 1 << 2;
        /// Survives address-space switches.
        const GLOBAL  = 1 << 3;
        /// Uncached (device memory).
        const NOCACHE = 1 << 4;
    }
}

impl PmapFlags {
    /// Bytes covered by one leaf with these flags.
    pub const fn leaf_size(self) -> u64 {
        if self.contains(PmapFlags::LARGE) {
            0x4000_0000
        } else if self.contains(PmapFlags::HUGE) {
            0x20_0000
        } else {
            PAGE_SIZE
        }
    }
}

/// Architecture page-table capability.
///
/// # Safety
///
/// Implementations must edit only the tables reachable from the roots they
/// are given, and the `invalidate_*` methods must actually drop the local
/// CPU's cached translations.
pub unsafe trait Mmu: Sync + 'static {
    /// Installs `va -> pa`, allocating intermediate tables with `alloc`.
    /// Returns the frame previously mapped at `va`, if any.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if `alloc` fails; `InvalidRange` for misaligned
    /// addresses or a conflicting leaf of another size.
    ///
    /// # Safety
    ///
    /// `root` must be a valid root table and the caller must serialize
    /// edits to it.
    unsafe fn enter(
        &self,
        root: PhysAddr,
        va: VirtAddr,
        pa: PhysAddr,
        prot: Prot,
        flags: PmapFlags,
        alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> Result<Option<PhysAddr>, VmError>;

    /// Removes the leaf covering `va`, returning its frame and size.
    ///
    /// # Safety
    ///
    /// As for [`Mmu::enter`].
    unsafe fn remove(&self, root: PhysAddr, va: VirtAddr) -> Option<(PhysAddr, u64)>;

    /// Bytes from `va` to the end of the unmapped region around it that a
    /// walk can rule out at once; 0 if `va` is mapped.
    ///
    /// # Safety
    ///
    /// As for [`Mmu::enter`].
    unsafe fn unmapped_span(&self, root: PhysAddr, va: VirtAddr) -> u64 {
        let _ = (root, va);
        PAGE_SIZE
    }

    /// Changes the protection of the leaf covering `va`; `false` if unmapped.
    ///
    /// # Safety
    ///
    /// As for [`Mmu::enter`].
    unsafe fn protect(&self, root: PhysAddr, va: VirtAddr, prot: Prot) -> bool;

    /// Returns the physical address and protection `va` translates to.
    ///
    /// # Safety
    ///
    /// `root` must be a valid root table.
    unsafe fn translate(&self, root: PhysAddr, va: VirtAddr) -> Option<(PhysAddr, Prot)>;

    /// Pre-creates the root-level entries covering `[start, end)` so that
    /// roots sharing the kernel half see later kernel mappings.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if `alloc` fails.
    ///
    /// # Safety
    ///
    /// As for [`Mmu::enter`].
    unsafe fn reserve_kernel_range(
        &self,
        root: PhysAddr,
        start: VirtAddr,
        end: VirtAddr,
        alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> Result<(), VmError>;

    /// Copies the kernel half of `src` into the root `dst`.
    ///
    /// # Safety
    ///
    /// Both must be valid root tables.
    unsafe fn share_kernel_half(&self, src: PhysAddr, dst: PhysAddr);

    /// Hands every user-half table below `root`, then `root` itself, to
    /// `free`. Leaf frames are not touched.
    ///
    /// # Safety
    ///
    /// `root` must not be active anywhere and must not be used afterwards.
    unsafe fn release_tables(&self, root: PhysAddr, free: &mut dyn FnMut(PhysAddr));

    /// Drops the local translation of `va`.
    fn invalidate_local(&self, va: VirtAddr);

    /// Drops all local non-global translations.
    fn invalidate_local_all(&self);

    /// Switches the local CPU to `root`.
    ///
    /// # Safety
    ///
    /// `root` must map the running kernel.
    unsafe fn activate_local(&self, root: PhysAddr);

    /// Returns the executing CPU's index.
    fn current_cpu(&self) -> u32;

    /// Asks `targets` to run [`TlbShootdown::handle_ipi`].
    fn notify_shootdown(&self, targets: CpuSet);
}

/// One address space's page tables.
pub struct Pmap<M: Mmu> {
    root: PhysAddr,
    mmu: &'static M,
    frames: &'static FrameTable,
    shootdown: &'static TlbShootdown,
    active: AtomicU64,
    kernel: bool,
}

impl<M: Mmu> Pmap<M> {
    /// Creates an empty address space sharing `kernel`'s kernel half.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if no frame is available for the root.
    pub fn create(
        mmu: &'static M,
        frames: &'static FrameTable,
        shootdown: &'static TlbShootdown,
        kernel: &Pmap<M>,
    ) -> Result<Self, VmError> {
        let root = frames.page_alloc_wired(PageOwner::Kernel(KernelUse::PageTable))?;
        // SAFETY: Both roots are valid; the new one is not yet reachable.
        unsafe { mmu.share_kernel_half(kernel.root, root) };
        Ok(Self {
            root,
            mmu,
            frames,
            shootdown,
            active: AtomicU64::new(0),
            kernel: false,
        })
    }

    /// Wraps the kernel's boot page tables.
    ///
    /// # Safety
    ///
    /// `root` must be the live kernel root, and only one pmap may wrap it.
    pub unsafe fn adopt(
        mmu: &'static M,
        frames: &'static FrameTable,
        shootdown: &'static TlbShootdown,
        root: PhysAddr,
    ) -> Self {
        Self {
            root,
            mmu,
            frames,
            shootdown,
            active: AtomicU64::new(CpuSet::single(mmu.current_cpu()).bits()),
            kernel: true,
        }
    }

    /// Returns the root table.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Returns `true` for the kernel pmap.
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Returns `true` if some CPU runs on this pmap.
    pub fn is_active(&self) -> bool {
        !self.kernel && self.active.load(Ordering::SeqCst) != 0
    }

    /// Pre-creates the kernel-half root entries covering `[start, end)`.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if table frames run out.
    pub fn reserve_kernel_range(&self, start: VirtAddr, end: VirtAddr) -> Result<(), VmError> {
        let frames = self.frames;
        let mut alloc = || frames.page_alloc_wired(PageOwner::Kernel(KernelUse::PageTable)).ok();
        // SAFETY: The root is valid; callers hold the owning map's lock.
        unsafe { self.mmu.reserve_kernel_range(self.root, start, end, &mut alloc) }
    }

    /// Installs or replaces the translation at `va`. A replaced translation
    /// is invalidated everywhere before returning.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if an intermediate table cannot be allocated;
    /// `InvalidRange` for misaligned or conflicting requests.
    pub fn enter(&self, va: VirtAddr, pa: PhysAddr, prot: Prot, flags: PmapFlags) -> Result<(), VmError> {
        let frames = self.frames;
        let mut alloc = || frames.page_alloc_wired(PageOwner::Kernel(KernelUse::PageTable)).ok();
        // SAFETY: The root is valid; callers hold the owning map's lock.
        let previous = unsafe { self.mmu.enter(self.root, va, pa, prot, flags, &mut alloc)? };
        if previous.is_some() {
            self.invalidate(va, flags.leaf_size() / PAGE_SIZE);
        }
        Ok(())
    }

    /// Removes every translation in `[start, end)`. `removed(va, pa, size)`
    /// runs for each one, only after it has been invalidated on every CPU.
    pub fn remove(&self, start: VirtAddr, end: VirtAddr, mut removed: impl FnMut(VirtAddr, PhysAddr, u64)) {
        let mut batch: ArrayVec<(VirtAddr, PhysAddr, u64), REMOVE_BATCH> = ArrayVec::new();
        let mut va = start;
        while va < end {
            // SAFETY: The root is valid; callers hold the owning map's lock.
            match unsafe { self.mmu.remove(self.root, va) } {
                Some((pa, size)) => {
                    let base = va.align_down(size);
                    if batch.is_full() {
                        self.flush_batch(&mut batch, &mut removed);
                    }
                    batch.push((base, pa, size));
                    va = base + size;
                }
                None => {
                    // SAFETY: As above.
                    let hole = unsafe { self.mmu.unmapped_span(self.root, va) }.max(PAGE_SIZE);
                    let Some(next) = va.checked_add(hole) else {
                        break;
                    };
                    va = next;
                }
            }
        }
        self.flush_batch(&mut batch, &mut removed);
    }

    /// Changes the protection of every translation in `[start, end)`,
    /// returning how many leaves changed.
    pub fn protect(&self, start: VirtAddr, end: VirtAddr, prot: Prot) -> usize {
        let mut changed = 0;
        let mut va = start;
        while va < end {
            // SAFETY: The root is valid; callers hold the owning map's lock.
            if unsafe { self.mmu.protect(self.root, va, prot) } {
                changed += 1;
            }
            va = va + PAGE_SIZE;
        }
        if changed != 0 {
            self.invalidate(start, (end - start) / PAGE_SIZE);
        }
        changed
    }

    /// Drops cached translations of `pages` pages at `start` on every CPU
    /// this pmap is active on, waiting for remote acknowledgment.
    pub fn invalidate(&self, start: VirtAddr, pages: u64) {
        let me = self.mmu.current_cpu();
        let targets = if self.kernel {
            self.shootdown.online()
        } else {
            CpuSet::from_bits(self.active.load(Ordering::SeqCst))
        };

        if self.kernel || targets.contains(me) {
            if pages > self.shootdown.flush_all_threshold() {
                self.mmu.invalidate_local_all();
            } else {
                for i in 0..pages {
                    self.mmu.invalidate_local(start + i * PAGE_SIZE);
                }
            }
        }
        let remote = targets.without(me);
        if !remote.is_empty() {
            self.shootdown.shoot(self.mmu, remote, start, pages);
        }
    }

    /// Switches the calling CPU to this address space.
    ///
    /// # Safety
    ///
    /// The calling task must be the one being switched into, and the CPU
    /// must [`Pmap::deactivate`] its previous pmap.
    pub unsafe fn activate(&self) {
        let me = self.mmu.current_cpu();
        self.active.fetch_or(CpuSet::single(me).bits(), Ordering::SeqCst);
        // SAFETY: The root shares the kernel half, so the kernel stays mapped.
        unsafe { self.mmu.activate_local(self.root) };
    }

    /// Records that the calling CPU no longer runs on this address space.
    pub fn deactivate(&self) {
        let me = self.mmu.current_cpu();
        self.active.fetch_and(!CpuSet::single(me).bits(), Ordering::SeqCst);
    }

    /// Returns the physical address and protection `va` translates to.
    pub fn translate(&self, va: VirtAddr) -> Option<(PhysAddr, Prot)> {
        // SAFETY: The root is valid.
        unsafe { self.mmu.translate(self.root, va) }
    }

    /// Releases the page tables (not the frames they map).
    ///
    /// # Errors
    ///
    /// Returns the pmap back if it is the kernel pmap or still active.
    pub fn destroy(self) -> Result<(), Self> {
        if self.kernel || self.is_active() {
            return Err(self);
        }
        let frames = self.frames;
        let mut free = |pa: PhysAddr| {
            if let Err(e) = frames.page_free_wired(pa, PageOwner::Kernel(KernelUse::PageTable)) {
                kwarn!("pmap: table frame {:#x} not freed: {}", pa.as_u64(), e);
            }
        };
        // SAFETY: Not active anywhere and consumed here.
        unsafe { self.mmu.release_tables(self.root, &mut free) };
        Ok(())
    }

    fn flush_batch(
        &self,
        batch: &mut ArrayVec<(VirtAddr, PhysAddr, u64), REMOVE_BATCH>,
        removed: &mut impl FnMut(VirtAddr, PhysAddr, u64),
    ) {
        let (Some(&(first, _, _)), Some(&(last, _, last_size))) = (batch.as_slice().first(), batch.as_slice().last())
        else {
            return;
        };
        self.invalidate(first, (last + last_size - first) / PAGE_SIZE);
        while let Some((va, pa, size)) = batch.pop() {
            removed(va, pa, size);
        }
    }
}

impl<M: Mmu> core::fmt::Debug for Pmap<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pmap")
            .field("root", &self.root)
            .field("active", &CpuSet::from_bits(self.active.load(Ordering::Relaxed)))
            .field("kernel", &self.kernel)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::FrameState;
    use crate::testutil::{FakePhys, SimMmu};

    struct Fixture {
        phys: FakePhys,
        mmu: &'static SimMmu,
        shootdown: &'static TlbShootdown,
        kernel: Pmap<SimMmu>,
    }

    fn fixture() -> Fixture {
        let phys = FakePhys::new();
        let mmu: &'static SimMmu = Box::leak(Box::new(SimMmu::new(phys.hhdm())));
        let shootdown: &'static TlbShootdown = Box::leak(Box::new(TlbShootdown::new(1 << 20, 32)));
        let root = phys.table_frame();
        SimMmu::set_cpu(0);
        let kernel = unsafe { Pmap::adopt(mmu, phys.frames(), shootdown, root) };
        Fixture {
            phys,
            mmu,
            shootdown,
            kernel,
        }
    }

    #[test]
    fn enter_and_translate() {
        let f = fixture();
        let pmap = Pmap::create(f.mmu, f.phys.frames(), f.shootdown, &f.kernel).unwrap();
        let va = VirtAddr::new(0x40_0000);
        pmap.enter(va, PhysAddr::new(0x30_0000), Prot::READ, PmapFlags::USER).unwrap();
        assert_eq!(pmap.translate(va), Some((PhysAddr::new(0x30_0000), Prot::READ)));
        assert_eq!(pmap.translate(va + PAGE_SIZE), None);
    }

    #[test]
    fn remove_invalidates_before_callback() {
        let f = fixture();
        let pmap = Pmap::create(f.mmu, f.phys.frames(), f.shootdown, &f.kernel).unwrap();
        unsafe { pmap.activate() };
        let base = VirtAddr::new(0x10_0000);
        for i in 0..40 {
            pmap.enter(base + i * PAGE_SIZE, PhysAddr::new(0x20_0000 + i * PAGE_SIZE), Prot::READ, PmapFlags::empty())
                .unwrap();
            f.mmu.access(&pmap, base + i * PAGE_SIZE, Prot::READ).unwrap();
        }

        let mut seen = Vec::new();
        let mmu = f.mmu;
        pmap.remove(base, base + 40 * PAGE_SIZE, |va, pa, size| {
            assert!(!mmu.tlb_contains(0, va));
            seen.push((va, pa, size));
        });
        assert_eq!(seen.len(), 40);
        assert!(seen.iter().all(|&(_, _, size)| size == PAGE_SIZE));
        assert_eq!(pmap.translate(base), None);
        pmap.deactivate();
    }

    #[test]
    fn remove_skips_unpopulated_tables() {
        let f = fixture();
        let pmap = Pmap::create(f.mmu, f.phys.frames(), f.shootdown, &f.kernel).unwrap();
        let far = VirtAddr::new(0x7F00_0000_0000);
        pmap.enter(far, PhysAddr::new(0x20_0000), Prot::READ, PmapFlags::USER).unwrap();

        // Nearly all of the lower half; page-by-page this would never end.
        let mut seen = Vec::new();
        pmap.remove(VirtAddr::new(0x1000), VirtAddr::new(0x7FFF_FFFF_F000), |va, pa, _| seen.push((va, pa)));
        assert_eq!(seen, [(far, PhysAddr::new(0x20_0000))]);
        assert_eq!(pmap.translate(far), None);
    }

    #[test]
    fn protect_counts_changed_leaves() {
        let f = fixture();
        let pmap = Pmap::create(f.mmu, f.phys.frames(), f.shootdown, &f.kernel).unwrap();
        let base = VirtAddr::new(0x10_0000);
        pmap.enter(base, PhysAddr::new(0x20_0000), Prot::READ | Prot::WRITE, PmapFlags::empty()).unwrap();
        pmap.enter(base + 2 * PAGE_SIZE, PhysAddr::new(0x20_1000), Prot::READ | Prot::WRITE, PmapFlags::empty())
            .unwrap();
        assert_eq!(pmap.protect(base, base + 3 * PAGE_SIZE, Prot::READ), 2);
        assert_eq!(pmap.translate(base).map(|(_, p)| p), Some(Prot::READ));
    }

    #[test]
    fn destroy_releases_tables() {
        let f = fixture();
        let frames = f.phys.frames();
        let free_before = frames.stats().free_frames;
        let pmap = Pmap::create(f.mmu, frames, f.shootdown, &f.kernel).unwrap();
        pmap.enter(VirtAddr::new(0x1000), PhysAddr::new(0x20_0000), Prot::READ, PmapFlags::empty()).unwrap();
        let root = pmap.root();

        unsafe { pmap.activate() };
        let pmap = pmap.destroy().unwrap_err();
        pmap.deactivate();
        pmap.destroy().unwrap();

        assert_eq!(frames.info(root).unwrap().state, FrameState::Free);
        assert_eq!(frames.stats().free_frames, free_before);
        assert!(f.kernel.destroy().is_err());
    }
}
