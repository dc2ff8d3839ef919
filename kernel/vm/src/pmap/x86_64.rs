//! x86_64 4-level page tables.
//!
//! Tables are reached through the direct map. Entries with an empty
//! protection keep their address with PRESENT cleared and a software bit
//! set, so the mapping survives a `protect(NONE)` round trip.

use core::sync::atomic::{AtomicPtr, Ordering};

use hadron_core::addr::{PhysAddr, VirtAddr};
use hadron_core::cpu::{self, CpuSet};
use hadron_core::paging::{PageSize, Size1GiB, Size2MiB, Size4KiB};

use super::{Mmu, PmapFlags, Prot};
use crate::{Hhdm, VmError};

/// Physical address mask: bits 12..51 of a page table entry.
pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Root-table index of the first kernel-half entry.
const KERNEL_HALF_START: usize = 256;

bitflags::bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Entry is present / valid.
        const PRESENT       = 1 << 0;
        /// Page is writable.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode (ring 3).
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Cache disabled.
        const CACHE_DISABLE = 1 << 4;
        /// PS bit -- 2 MiB page in PD, 1 GiB page in PDPT.
        const HUGE_PAGE     = 1 << 7;
        /// Global page (not flushed on CR3 switch when CR4.PGE is set).
        const GLOBAL        = 1 << 8;
        /// Software bit: mapped with no access rights.
        const PROT_NONE     = 1 << 9;
        /// No-execute bit (requires EFER.NXE).
        const NO_EXECUTE    = 1 << 63;
    }
}

/// A single page table entry (64 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// An empty (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates an entry pointing to `phys_addr` with the given `flags`.
    pub const fn new(phys_addr: PhysAddr, flags: PageTableFlags) -> Self {
        Self((phys_addr.as_u64() & ADDR_MASK) | flags.bits())
    }

    /// Returns `true` if the PRESENT bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Returns `true` for present entries and no-access leaves.
    pub const fn is_mapped(self) -> bool {
        self.is_present() || self.0 & PageTableFlags::PROT_NONE.bits() != 0
    }

    /// Returns the physical address stored in this entry.
    pub const fn address(self) -> PhysAddr {
        PhysAddr::new_truncate(self.0 & ADDR_MASK)
    }

    /// Returns the flags portion of this entry.
    pub const fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }
}

/// A 4 KiB-aligned page table containing 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The 512 entries of this page table.
    pub entries: [PageTableEntry; 512],
}

impl PageTable {
    /// Zero-initializes all entries.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }
}

// ---------------------------------------------------------------------------
// Shootdown IPI hook
// ---------------------------------------------------------------------------

static SHOOTDOWN_IPI_FN: AtomicPtr<()> = AtomicPtr::new(nop_ipi as fn(CpuSet) as *mut ());

fn nop_ipi(_targets: CpuSet) {}

/// Registers the function that sends the TLB-shootdown IPI to a CPU set.
///
/// Before registration shootdown notifications are dropped, which is only
/// correct while a single CPU is running.
pub fn register_shootdown_ipi(f: fn(CpuSet)) {
    SHOOTDOWN_IPI_FN.store(f as *mut (), Ordering::Release);
}

fn send_shootdown_ipi(targets: CpuSet) {
    let ptr = SHOOTDOWN_IPI_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn(CpuSet)` pointers (or `nop_ipi`) are stored.
    let f: fn(CpuSet) = unsafe { core::mem::transmute(ptr) };
    f(targets);
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    use hadron_core::addr::{PhysAddr, VirtAddr};

    pub fn invlpg(addr: VirtAddr) {
        // SAFETY: INVLPG only invalidates a single TLB entry.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) addr.as_u64(), options(nostack, preserves_flags));
        }
    }

    pub fn read_cr3() -> u64 {
        let value: u64;
        // SAFETY: Reading CR3 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        value
    }

    /// # Safety
    ///
    /// `root` must be a valid PML4 that maps the running code.
    pub unsafe fn write_cr3(root: PhysAddr) {
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
        }
    }

    pub fn flush_all() {
        // SAFETY: Writing back the same CR3 only flushes non-global entries.
        unsafe { write_cr3(PhysAddr::new_truncate(read_cr3() & super::ADDR_MASK)) };
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    use hadron_core::addr::{PhysAddr, VirtAddr};

    pub fn invlpg(_addr: VirtAddr) {}

    pub unsafe fn write_cr3(_root: PhysAddr) {}

    pub fn flush_all() {}
}

/// Page-table walker for x86_64 4-level paging.
#[derive(Debug, Clone, Copy)]
pub struct X86_64Mmu {
    hhdm: Hhdm,
}

impl X86_64Mmu {
    /// Creates a walker reaching tables through `hhdm`.
    pub const fn new(hhdm: Hhdm) -> Self {
        Self { hhdm }
    }

    /// Returns a mutable reference to the [`PageTable`] at `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must be a page-table frame reachable through the direct map,
    /// and the caller must serialize access to it.
    #[allow(clippy::mut_from_ref)]
    unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        unsafe { &mut *self.hhdm.phys_to_ptr::<PageTable>(phys) }
    }

    /// Ensures `table[index]` points to a next-level table, allocating and
    /// zeroing one if needed.
    ///
    /// # Safety
    ///
    /// `table_phys` must be a valid table.
    unsafe fn ensure_table(
        &self,
        table_phys: PhysAddr,
        index: usize,
        intermediate: PageTableFlags,
        alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> Result<PhysAddr, VmError> {
        let table = unsafe { self.table_at(table_phys) };
        let entry = table.entries[index];
        if entry.is_present() {
            if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(VmError::InvalidRange);
            }
            let combined = entry.flags() | intermediate;
            if combined != entry.flags() {
                table.entries[index] = PageTableEntry::new(entry.address(), combined);
            }
            return Ok(entry.address());
        }
        if entry.is_mapped() {
            return Err(VmError::InvalidRange);
        }
        let frame = alloc().ok_or(VmError::OutOfMemory)?;
        // SAFETY: The frame was just allocated for this table.
        unsafe { self.table_at(frame).zero() };
        table.entries[index] = PageTableEntry::new(frame, intermediate);
        Ok(frame)
    }

    /// Finds the leaf entry mapping `va` and its level (0 = 4 KiB).
    ///
    /// # Safety
    ///
    /// `root` must be a valid PML4.
    unsafe fn leaf(&self, root: PhysAddr, va: VirtAddr) -> Option<(&mut PageTableEntry, u32)> {
        let mut table = root;
        for level in (0..=3u32).rev() {
            let entry = &mut unsafe { self.table_at(table) }.entries[va.table_index(level)];
            if !entry.is_mapped() {
                return None;
            }
            if level == 0 || (level < 3 && entry.flags().contains(PageTableFlags::HUGE_PAGE)) {
                return Some((entry, level));
            }
            table = entry.address();
        }
        None
    }

    /// Frees the tables below `table_phys` (a table at `level`) and the
    /// table itself, leaving leaf frames alone.
    ///
    /// # Safety
    ///
    /// The table must no longer be reachable from any active root.
    unsafe fn release_level(&self, table_phys: PhysAddr, level: u32, free: &mut dyn FnMut(PhysAddr)) {
        if level > 0 {
            let table = unsafe { self.table_at(table_phys) };
            for entry in table.entries.iter() {
                if entry.is_present() && !entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                    unsafe { self.release_level(entry.address(), level - 1, free) };
                }
            }
        }
        free(table_phys);
    }

    /// Computes intermediate entry flags from leaf flags.
    ///
    /// Intermediate entries are always `PRESENT | WRITABLE`; `USER` is added
    /// for user leaves so ring 3 can traverse the walk.
    fn intermediate_flags_for(leaf: PageTableFlags) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if leaf.contains(PageTableFlags::USER) {
            flags |= PageTableFlags::USER;
        }
        flags
    }

    /// Converts a protection to native leaf flags, keeping `attrs`.
    fn prot_to_native(prot: Prot, attrs: PageTableFlags) -> PageTableFlags {
        if prot.is_empty() {
            return attrs | PageTableFlags::PROT_NONE | PageTableFlags::NO_EXECUTE;
        }
        let mut native = attrs | PageTableFlags::PRESENT;
        if prot.contains(Prot::WRITE) {
            native |= PageTableFlags::WRITABLE;
        }
        if !prot.contains(Prot::EXECUTE) {
            native |= PageTableFlags::NO_EXECUTE;
        }
        native
    }

    fn native_to_prot(flags: PageTableFlags) -> Prot {
        if flags.contains(PageTableFlags::PROT_NONE) {
            return Prot::empty();
        }
        let mut prot = Prot::READ;
        if flags.contains(PageTableFlags::WRITABLE) {
            prot |= Prot::WRITE;
        }
        if !flags.contains(PageTableFlags::NO_EXECUTE) {
            prot |= Prot::EXECUTE;
        }
        prot
    }

    /// Native attribute bits for `flags`, independent of protection.
    fn attrs_for(flags: PmapFlags) -> PageTableFlags {
        let mut attrs = PageTableFlags::empty();
        if flags.contains(PmapFlags::USER) {
            attrs |= PageTableFlags::USER;
        }
        if flags.contains(PmapFlags::GLOBAL) {
            attrs |= PageTableFlags::GLOBAL;
        }
        if flags.contains(PmapFlags::NOCACHE) {
            attrs |= PageTableFlags::CACHE_DISABLE;
        }
        if flags.intersects(PmapFlags::HUGE | PmapFlags::LARGE) {
            attrs |= PageTableFlags::HUGE_PAGE;
        }
        attrs
    }

    const fn leaf_size(level: u32) -> u64 {
        match level {
            0 => Size4KiB::SIZE,
            1 => Size2MiB::SIZE,
            _ => Size1GiB::SIZE,
        }
    }
}

// SAFETY: Walks and edits x86_64 4-level tables through the direct map and
// issues the matching TLB instructions on bare metal.
unsafe impl Mmu for X86_64Mmu {
    unsafe fn enter(
        &self,
        root: PhysAddr,
        va: VirtAddr,
        pa: PhysAddr,
        prot: Prot,
        flags: PmapFlags,
        alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> Result<Option<PhysAddr>, VmError> {
        let leaf_level = if flags.contains(PmapFlags::LARGE) {
            2
        } else if flags.contains(PmapFlags::HUGE) {
            1
        } else {
            0
        };
        let size = Self::leaf_size(leaf_level);
        if !va.is_aligned(size) || !pa.is_aligned(size) {
            return Err(VmError::InvalidRange);
        }

        let native = Self::prot_to_native(prot, Self::attrs_for(flags));
        let intermediate = Self::intermediate_flags_for(native);
        let mut table = root;
        for level in (leaf_level + 1..=3).rev() {
            table = unsafe { self.ensure_table(table, va.table_index(level), intermediate, alloc)? };
        }

        let entries = unsafe { &mut self.table_at(table).entries };
        let slot = &mut entries[va.table_index(leaf_level)];
        let old = *slot;
        if leaf_level > 0 && old.is_present() && !old.flags().contains(PageTableFlags::HUGE_PAGE) {
            // A table hangs here; a huge leaf would orphan it.
            return Err(VmError::InvalidRange);
        }
        *slot = PageTableEntry::new(pa, native);
        Ok(old.is_mapped().then(|| old.address()))
    }

    unsafe fn remove(&self, root: PhysAddr, va: VirtAddr) -> Option<(PhysAddr, u64)> {
        let (entry, level) = unsafe { self.leaf(root, va)? };
        let pa = entry.address();
        *entry = PageTableEntry::empty();
        Some((pa, Self::leaf_size(level)))
    }

    unsafe fn unmapped_span(&self, root: PhysAddr, va: VirtAddr) -> u64 {
        let mut table = root;
        for level in (0..=3u32).rev() {
            let entry = &unsafe { self.table_at(table) }.entries[va.table_index(level)];
            if !entry.is_mapped() {
                let covered = 1u64 << (12 + 9 * level);
                return covered - (va.as_u64() & (covered - 1));
            }
            if level == 0 || (level < 3 && entry.flags().contains(PageTableFlags::HUGE_PAGE)) {
                return 0;
            }
            table = entry.address();
        }
        0
    }

    unsafe fn protect(&self, root: PhysAddr, va: VirtAddr, prot: Prot) -> bool {
        let Some((entry, _)) = (unsafe { self.leaf(root, va) }) else {
            return false;
        };
        let attrs = entry.flags()
            & (PageTableFlags::USER
                | PageTableFlags::GLOBAL
                | PageTableFlags::CACHE_DISABLE
                | PageTableFlags::WRITE_THROUGH
                | PageTableFlags::HUGE_PAGE);
        *entry = PageTableEntry::new(entry.address(), Self::prot_to_native(prot, attrs));
        true
    }

    unsafe fn translate(&self, root: PhysAddr, va: VirtAddr) -> Option<(PhysAddr, Prot)> {
        let (entry, level) = unsafe { self.leaf(root, va)? };
        let offset = va.as_u64() & (Self::leaf_size(level) - 1);
        Some((
            PhysAddr::new_truncate(entry.address().as_u64() + offset),
            Self::native_to_prot(entry.flags()),
        ))
    }

    unsafe fn reserve_kernel_range(
        &self,
        root: PhysAddr,
        start: VirtAddr,
        end: VirtAddr,
        alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> Result<(), VmError> {
        let first = start.table_index(3);
        let last = (end - 1u64).table_index(3);
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        for index in first..=last {
            unsafe { self.ensure_table(root, index, flags, alloc)? };
        }
        Ok(())
    }

    unsafe fn share_kernel_half(&self, src: PhysAddr, dst: PhysAddr) {
        let src = unsafe { self.table_at(src) };
        let dst = unsafe { self.table_at(dst) };
        dst.entries[KERNEL_HALF_START..].copy_from_slice(&src.entries[KERNEL_HALF_START..]);
    }

    unsafe fn release_tables(&self, root: PhysAddr, free: &mut dyn FnMut(PhysAddr)) {
        let table = unsafe { self.table_at(root) };
        for entry in table.entries[..KERNEL_HALF_START].iter() {
            if entry.is_present() {
                unsafe { self.release_level(entry.address(), 2, free) };
            }
        }
        free(root);
    }

    fn invalidate_local(&self, va: VirtAddr) {
        arch::invlpg(va);
    }

    fn invalidate_local_all(&self) {
        arch::flush_all();
    }

    unsafe fn activate_local(&self, root: PhysAddr) {
        unsafe { arch::write_cr3(root) };
    }

    fn current_cpu(&self) -> u32 {
        cpu::current_cpu()
    }

    fn notify_shootdown(&self, targets: CpuSet) {
        send_shootdown_ipi(targets);
    }
}
