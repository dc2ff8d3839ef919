//! Host fixtures: fake physical memory and a simulated multi-CPU MMU.

use std::alloc::Layout;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use hadron_core::addr::{PhysAddr, VirtAddr};
use hadron_core::cpu::CpuSet;

use crate::config::VmConfig;
use crate::context::Vm;
use crate::kmem::ObjectCache;
use crate::kmem::pages::PageArena;
use crate::page::{FrameTable, KernelUse, PageOwner, PvEntry};
use crate::pmap::{Mmu, PmapFlags, Pmap, Prot, TlbShootdown, X86_64Mmu};
use crate::{Hhdm, MemoryKind, PAGE_SIZE, PhysMemoryRegion, VmError};

/// Bytes of RAM behind a [`FakePhys`].
const BACKED_SIZE: u64 = 4 << 20;

/// A leaked host buffer standing in for physical memory.
///
/// Physical addresses below [`FakePhys::USABLE_START`] are firmware holes
/// with no backing; the buffer covers everything from there to
/// [`FakePhys::end`]. The last [`FakePhys::RECLAIMABLE_SIZE`] bytes are a
/// reclaimable boot region.
pub struct FakePhys {
    hhdm: Hhdm,
    frames: Option<&'static FrameTable>,
}

impl FakePhys {
    /// First physical address backed by the buffer.
    pub const USABLE_START: u64 = 0x10_0000;
    /// Size of the reclaimable region at the top.
    pub const RECLAIMABLE_SIZE: u64 = 64 * 1024;
    /// Kernel map base used by the fixtures.
    pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_C000_0000_0000;

    /// Fake memory with a frame table built over it.
    pub fn new() -> Self {
        let mut phys = Self::unbuilt();
        // SAFETY: The regions describe the leaked buffer, which is unused.
        let table = unsafe { FrameTable::new(&phys.regions(), phys.hhdm) }.unwrap();
        phys.frames = Some(Box::leak(Box::new(table)));
        phys
    }

    /// Fake memory with no frame table yet.
    pub fn unbuilt() -> Self {
        let layout = Layout::from_size_align(BACKED_SIZE as usize, 0x20_0000).unwrap();
        // SAFETY: The layout has a non-zero size.
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!buf.is_null());
        Self {
            hhdm: Hhdm::new((buf as u64).wrapping_sub(Self::USABLE_START)),
            frames: None,
        }
    }

    /// The boot memory map.
    pub fn regions(&self) -> Vec<PhysMemoryRegion> {
        let end = self.end();
        vec![
            PhysMemoryRegion::new(0, 0x9_F000, MemoryKind::Reserved),
            PhysMemoryRegion::new(
                Self::USABLE_START,
                end - Self::RECLAIMABLE_SIZE - Self::USABLE_START,
                MemoryKind::Usable,
            ),
            PhysMemoryRegion::new(end - Self::RECLAIMABLE_SIZE, Self::RECLAIMABLE_SIZE, MemoryKind::Reclaimable),
        ]
    }

    /// One past the highest physical address.
    pub fn end(&self) -> u64 {
        Self::USABLE_START + BACKED_SIZE
    }

    pub fn hhdm(&self) -> Hhdm {
        self.hhdm
    }

    pub fn frames(&self) -> &'static FrameTable {
        self.frames.expect("frame table not built")
    }

    /// A fresh page arena importing from `frames`.
    pub fn page_arena(&self, frames: &'static FrameTable) -> &'static PageArena {
        Box::leak(Box::new(PageArena::new("test_pages", frames, self.hhdm, 64 * 1024)))
    }

    /// Attaches a chain-entry cache so frames can have several owners.
    pub fn attach_pv_cache(&self, frames: &'static FrameTable) -> &'static ObjectCache<PvEntry> {
        let cache = Box::leak(Box::new(ObjectCache::new("pv_entry", self.page_arena(frames), 1).unwrap()));
        frames.attach_pv_cache(cache).unwrap();
        cache
    }

    /// A zeroed page-table frame.
    pub fn table_frame(&self) -> PhysAddr {
        self.frames()
            .page_alloc_wired(PageOwner::Kernel(KernelUse::PageTable))
            .unwrap()
    }

    /// A core over this memory on a [`SimMmu`], not yet opened.
    pub fn unopened_vm(&self) -> &'static Vm<SimMmu> {
        let mmu: &'static SimMmu = Box::leak(Box::new(SimMmu::new(self.hhdm)));
        let config = VmConfig {
            kernel_heap_base: Self::KERNEL_HEAP_BASE,
            ..VmConfig::default()
        };
        let frames = self.frames();
        Box::leak(Box::new(Vm::new(config, mmu, frames, self.page_arena(frames)).unwrap()))
    }

    /// A core over this memory on a [`SimMmu`], opened on a fresh kernel
    /// root with the calling thread as CPU 0.
    pub fn vm(&self) -> &'static Vm<SimMmu> {
        let vm = self.unopened_vm();
        SimMmu::set_cpu(0);
        let root = self.table_frame();
        unsafe { vm.open(root) }.unwrap();
        vm
    }
}

thread_local! {
    static CPU: Cell<u32> = const { Cell::new(0) };
}

/// x86-64 page tables plus a software model of per-CPU TLBs.
///
/// Each host thread plays the CPU it last passed to [`SimMmu::set_cpu`].
/// [`SimMmu::access`] resolves through the calling CPU's TLB first, so a
/// missed invalidation shows up as a stale translation. Shootdown IPIs are
/// latched and answered when the target CPU calls [`SimMmu::poll`].
pub struct SimMmu {
    tables: X86_64Mmu,
    tlb: Mutex<HashMap<(u32, u64), (u64, Prot)>>,
    pending_ipis: AtomicU64,
    ipis: AtomicUsize,
    removed: Mutex<Vec<VirtAddr>>,
}

impl SimMmu {
    pub fn new(hhdm: Hhdm) -> Self {
        Self {
            tables: X86_64Mmu::new(hhdm),
            tlb: Mutex::new(HashMap::new()),
            pending_ipis: AtomicU64::new(0),
            ipis: AtomicUsize::new(0),
            removed: Mutex::new(Vec::new()),
        }
    }

    /// Makes the calling thread act as `cpu`.
    pub fn set_cpu(cpu: u32) {
        CPU.with(|c| c.set(cpu));
    }

    fn cpu() -> u32 {
        CPU.with(Cell::get)
    }

    /// Number of CPUs interrupted so far.
    pub fn ipis_sent(&self) -> usize {
        self.ipis.load(Ordering::SeqCst)
    }

    /// Plants a writable translation in `cpu`'s TLB.
    pub fn tlb_fill(&self, cpu: u32, va: VirtAddr, pa: u64) {
        self.tlb
            .lock()
            .unwrap()
            .insert((cpu, va.align_down(PAGE_SIZE).as_u64()), (pa, Prot::READ | Prot::WRITE));
    }

    pub fn tlb_contains(&self, cpu: u32, va: VirtAddr) -> bool {
        self.tlb
            .lock()
            .unwrap()
            .contains_key(&(cpu, va.align_down(PAGE_SIZE).as_u64()))
    }

    /// Answers a latched shootdown IPI for the calling CPU; `true` if there
    /// was one.
    pub fn poll(&self, shootdown: &TlbShootdown) -> bool {
        let bit = CpuSet::single(Self::cpu()).bits();
        if self.pending_ipis.fetch_and(!bit, Ordering::SeqCst) & bit == 0 {
            return false;
        }
        shootdown.handle_ipi(self);
        true
    }

    /// Performs an access from the calling CPU, filling its TLB on a miss.
    pub fn access(&self, pmap: &Pmap<SimMmu>, va: VirtAddr, want: Prot) -> Result<PhysAddr, VmError> {
        let page = va.align_down(PAGE_SIZE);
        let key = (Self::cpu(), page.as_u64());
        let mut tlb = self.tlb.lock().unwrap();
        let (pa, prot) = match tlb.get(&key) {
            Some(&hit) => hit,
            None => {
                let (pa, prot) = pmap.translate(page).ok_or(VmError::InvalidRange)?;
                tlb.insert(key, (pa.as_u64(), prot));
                (pa.as_u64(), prot)
            }
        };
        if !prot.contains(want) {
            return Err(VmError::AccessViolation);
        }
        Ok(PhysAddr::new(pa + (va - page)))
    }

    /// Drains the log of addresses whose translation was removed.
    pub fn take_removed(&self) -> Vec<VirtAddr> {
        std::mem::take(&mut *self.removed.lock().unwrap())
    }
}

// SAFETY: Table edits go to the real x86-64 implementation; the TLB model
// drops entries exactly when asked to.
unsafe impl Mmu for SimMmu {
    unsafe fn enter(
        &self,
        root: PhysAddr,
        va: VirtAddr,
        pa: PhysAddr,
        prot: Prot,
        flags: PmapFlags,
        alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> Result<Option<PhysAddr>, VmError> {
        unsafe { self.tables.enter(root, va, pa, prot, flags, alloc) }
    }

    unsafe fn remove(&self, root: PhysAddr, va: VirtAddr) -> Option<(PhysAddr, u64)> {
        let removed = unsafe { self.tables.remove(root, va) };
        if removed.is_some() {
            self.removed.lock().unwrap().push(va);
        }
        removed
    }

    unsafe fn unmapped_span(&self, root: PhysAddr, va: VirtAddr) -> u64 {
        unsafe { self.tables.unmapped_span(root, va) }
    }

    unsafe fn protect(&self, root: PhysAddr, va: VirtAddr, prot: Prot) -> bool {
        unsafe { self.tables.protect(root, va, prot) }
    }

    unsafe fn translate(&self, root: PhysAddr, va: VirtAddr) -> Option<(PhysAddr, Prot)> {
        unsafe { self.tables.translate(root, va) }
    }

    unsafe fn reserve_kernel_range(
        &self,
        root: PhysAddr,
        start: VirtAddr,
        end: VirtAddr,
        alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> Result<(), VmError> {
        unsafe { self.tables.reserve_kernel_range(root, start, end, alloc) }
    }

    unsafe fn share_kernel_half(&self, src: PhysAddr, dst: PhysAddr) {
        unsafe { self.tables.share_kernel_half(src, dst) }
    }

    unsafe fn release_tables(&self, root: PhysAddr, free: &mut dyn FnMut(PhysAddr)) {
        unsafe { self.tables.release_tables(root, free) }
    }

    fn invalidate_local(&self, va: VirtAddr) {
        self.tlb
            .lock()
            .unwrap()
            .remove(&(Self::cpu(), va.align_down(PAGE_SIZE).as_u64()));
    }

    fn invalidate_local_all(&self) {
        let cpu = Self::cpu();
        self.tlb.lock().unwrap().retain(|&(c, _), _| c != cpu);
    }

    unsafe fn activate_local(&self, _root: PhysAddr) {
        self.invalidate_local_all();
    }

    fn current_cpu(&self) -> u32 {
        Self::cpu()
    }

    fn notify_shootdown(&self, targets: CpuSet) {
        self.ipis.fetch_add(targets.iter().count(), Ordering::SeqCst);
        self.pending_ipis.fetch_or(targets.bits(), Ordering::SeqCst);
    }
}
