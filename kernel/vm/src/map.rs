//! Address spaces.
//!
//! A [`VmMap`] is an ordered set of non-overlapping [`VmMapEntry`] ranges
//! plus the [`Pmap`] that materializes them. Entries are kept in a B-tree
//! keyed by start address, so lookup is logarithmic; the entry records
//! themselves come from a slab cache.
//!
//! Anonymous memory is entered lazily by [`VmMap::fault`]. Shared and
//! device ranges are entered eagerly by [`VmMap::map`]. Every tracked frame
//! mapped into a map holds one frame-table reference whose owner names the
//! map and the virtual address, so an entry's pages can always be released
//! exactly.
//!
//! One spinlock covers the entry tree and all pmap edits of a map.
//!
//! Dropping a map tears it down the same way [`VmMap::destroy`] does.

use alloc::collections::BTreeMap;
use core::mem::ManuallyDrop;

use hadron_core::addr::{PhysAddr, VirtAddr};
use hadron_core::sync::SpinLock;
use hadron_core::{kdebug, kerr, ktrace};

use crate::context::Vm;
use crate::kmem::SlabBox;
use crate::page::{KernelUse, PageOwner};
use crate::pmap::{Mmu, Pmap, PmapFlags, Prot};
use crate::{PAGE_SIZE, VmError, lock_level, page_round_up};

/// Identifier of an address space, used in frame back-references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(u32);

impl MapId {
    /// Wraps a raw identifier.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// What a mapping's pages come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Zero-filled frames allocated on first touch.
    Anonymous,
    /// Existing tracked frames starting at `phys`, shared with their other
    /// holders.
    Shared {
        /// Frame backing the first page.
        phys: PhysAddr,
    },
    /// Untracked device memory starting at `phys`, mapped uncached.
    Device {
        /// Physical address of the first page.
        phys: PhysAddr,
    },
}

impl Backing {
    /// The backing of the part of a range that starts `bytes` in.
    fn offset(self, bytes: u64) -> Self {
        match self {
            Backing::Anonymous => Backing::Anonymous,
            Backing::Shared { phys } => Backing::Shared {
                phys: PhysAddr::new_truncate(phys.as_u64() + bytes),
            },
            Backing::Device { phys } => Backing::Device {
                phys: PhysAddr::new_truncate(phys.as_u64() + bytes),
            },
        }
    }

    fn is_tracked(self) -> bool {
        !matches!(self, Backing::Device { .. })
    }
}

/// One contiguous mapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmMapEntry {
    /// First address.
    pub start: VirtAddr,
    /// One past the last address.
    pub end: VirtAddr,
    /// Access rights.
    pub prot: Prot,
    /// Source of the pages.
    pub backing: Backing,
}

impl VmMapEntry {
    /// Returns the size in bytes.
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Returns `true` if `addr` falls inside the entry.
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Physical page backing `va` for eagerly entered backings.
    fn frame_at(&self, va: VirtAddr) -> Option<PhysAddr> {
        match self.backing.offset(va - self.start) {
            Backing::Anonymous => None,
            Backing::Shared { phys } | Backing::Device { phys } => Some(phys),
        }
    }
}

struct MapInner {
    entries: BTreeMap<u64, SlabBox<VmMapEntry>>,
}

impl MapInner {
    /// Returns the entry containing `addr`.
    fn lookup(&self, addr: VirtAddr) -> Option<&VmMapEntry> {
        self.entries
            .range(..=addr.as_u64())
            .next_back()
            .map(|(_, e)| &**e)
            .filter(|e| e.contains(addr))
    }

    fn intersects(&self, start: VirtAddr, end: VirtAddr) -> bool {
        // Entries are disjoint and sorted, so the last one starting below
        // `end` has the highest end of all candidates.
        self.entries
            .range(..end.as_u64())
            .next_back()
            .is_some_and(|(_, e)| e.end > start)
    }

    /// Lowest free `size`-byte range in `[base, end)`.
    fn first_gap(&self, base: VirtAddr, end: VirtAddr, size: u64) -> Option<VirtAddr> {
        let mut cursor = base;
        for entry in self.entries.values() {
            if entry.start >= cursor && entry.start - cursor >= size {
                return Some(cursor);
            }
            if entry.end > cursor {
                cursor = entry.end;
            }
        }
        (end >= cursor && end - cursor >= size).then_some(cursor)
    }
}

/// An address space.
pub struct VmMap<M: Mmu> {
    id: MapId,
    name: &'static str,
    base: VirtAddr,
    end: VirtAddr,
    leaf_flags: PmapFlags,
    vm: &'static Vm<M>,
    /// Taken only by `drop`.
    pmap: ManuallyDrop<Pmap<M>>,
    inner: SpinLock<MapInner>,
}

impl<M: Mmu> VmMap<M> {
    /// Creates an empty map over `[base, base + size)` with its own pmap.
    pub(crate) fn new(
        vm: &'static Vm<M>,
        id: MapId,
        name: &'static str,
        base: VirtAddr,
        size: u64,
        leaf_flags: PmapFlags,
        pmap: Pmap<M>,
    ) -> Self {
        Self {
            id,
            name,
            base,
            end: base + size,
            leaf_flags,
            vm,
            pmap: ManuallyDrop::new(pmap),
            inner: SpinLock::leveled("vm_map", lock_level::MAP, MapInner { entries: BTreeMap::new() }),
        }
    }

    /// Returns the map's identifier.
    pub fn id(&self) -> MapId {
        self.id
    }

    /// Returns the map's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the lowest mappable address.
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// Returns one past the highest mappable address.
    pub fn end(&self) -> VirtAddr {
        self.end
    }

    /// Returns the underlying pmap.
    pub fn pmap(&self) -> &Pmap<M> {
        &self.pmap
    }

    /// Maps `size` bytes (rounded up to pages) and returns the start.
    ///
    /// `hint` is used when it is page-aligned and the range there is free;
    /// otherwise the lowest free range that fits is taken.
    ///
    /// # Errors
    ///
    /// `NoSpace` if no free range fits; `InvalidRange` for a zero size or an
    /// unaligned backing address; `OutOfMemory` if the entry, a page table
    /// or a frame back-reference cannot be allocated.
    pub fn map(&self, hint: Option<VirtAddr>, size: u64, prot: Prot, backing: Backing) -> Result<VirtAddr, VmError> {
        let size = page_round_up(size);
        if size == 0 {
            return Err(VmError::InvalidRange);
        }
        if let Backing::Shared { phys } | Backing::Device { phys } = backing {
            if !phys.is_aligned(PAGE_SIZE) {
                return Err(VmError::InvalidRange);
            }
        }
        let placeholder = VmMapEntry {
            start: self.base,
            end: self.base,
            prot,
            backing,
        };
        let mut slot = self.vm.entry_cache().alloc(placeholder)?;

        let mut inner = self.inner.lock();
        let start = hint
            .filter(|&h| {
                h.is_aligned(PAGE_SIZE)
                    && h >= self.base
                    && h.as_u64().checked_add(size).is_some_and(|e| e <= self.end.as_u64())
                    && !inner.intersects(h, h + size)
            })
            .or_else(|| inner.first_gap(self.base, self.end, size))
            .ok_or(VmError::NoSpace)?;
        slot.start = start;
        slot.end = start + size;

        if !matches!(backing, Backing::Anonymous) {
            self.enter_range(&slot)?;
        }
        inner.entries.insert(start.as_u64(), slot);
        drop(inner);

        ktrace!(
            "vm {}: map [{:#x}, {:#x}) {:?} {:?}",
            self.name,
            start.as_u64(),
            start.as_u64() + size,
            prot,
            backing
        );
        Ok(start)
    }

    /// Unmaps `[addr, addr + size)`, splitting entries that straddle either
    /// end and releasing every frame the removed part referenced.
    ///
    /// # Errors
    ///
    /// `InvalidRange` if the range is unaligned or no entry intersects it;
    /// `OutOfMemory` if a split entry cannot be allocated.
    pub fn unmap(&self, addr: VirtAddr, size: u64) -> Result<(), VmError> {
        let (start, end) = self.check_range(addr, size)?;
        let mut inner = self.inner.lock();
        if !inner.intersects(start, end) {
            return Err(VmError::InvalidRange);
        }
        self.split_at(&mut inner, start)?;
        self.split_at(&mut inner, end)?;

        let mut removed = 0usize;
        while let Some(key) = inner.entries.range(start.as_u64()..end.as_u64()).next().map(|(&k, _)| k) {
            if let Some(entry) = inner.entries.remove(&key) {
                self.release_range(&entry);
                removed += 1;
            }
        }
        drop(inner);

        ktrace!(
            "vm {}: unmap [{:#x}, {:#x}) removed {} entries",
            self.name,
            start.as_u64(),
            end.as_u64(),
            removed
        );
        Ok(())
    }

    /// Changes the protection of `[addr, addr + size)`. Entries straddling
    /// either end are split; translations already present are updated and
    /// invalidated on every CPU before returning.
    ///
    /// # Errors
    ///
    /// `InvalidRange` if the range is unaligned or no entry intersects it;
    /// `OutOfMemory` if a split entry cannot be allocated.
    pub fn protect(&self, addr: VirtAddr, size: u64, prot: Prot) -> Result<(), VmError> {
        let (start, end) = self.check_range(addr, size)?;
        let mut inner = self.inner.lock();
        if !inner.intersects(start, end) {
            return Err(VmError::InvalidRange);
        }
        self.split_at(&mut inner, start)?;
        self.split_at(&mut inner, end)?;
        for entry in inner.entries.range_mut(start.as_u64()..end.as_u64()).map(|(_, e)| e) {
            entry.prot = prot;
        }
        let changed = self.pmap.protect(start, end, prot);
        drop(inner);

        ktrace!(
            "vm {}: protect [{:#x}, {:#x}) {:?}, {} pages updated",
            self.name,
            start.as_u64(),
            end.as_u64(),
            prot,
            changed
        );
        Ok(())
    }

    /// Returns the entry containing `addr`.
    pub fn find(&self, addr: VirtAddr) -> Option<VmMapEntry> {
        self.inner.lock().lookup(addr).copied()
    }

    /// Resolves a page fault at `addr` for an `access` the CPU attempted.
    ///
    /// # Errors
    ///
    /// `InvalidRange` if nothing is mapped at `addr`; `AccessViolation` if
    /// the entry forbids `access`; `OutOfMemory` if no frame or page table
    /// is available.
    pub fn fault(&self, addr: VirtAddr, access: Prot) -> Result<(), VmError> {
        let va = addr.align_down(PAGE_SIZE);
        let inner = self.inner.lock();
        let entry = *inner.lookup(va).ok_or(VmError::InvalidRange)?;
        if !entry.prot.contains(access) {
            return Err(VmError::AccessViolation);
        }
        let resolved = self.resolve(&entry, va)?;
        drop(inner);

        if resolved {
            ktrace!("vm {}: fault at {:#x} ({:?}) resolved", self.name, va.as_u64(), access);
        }
        Ok(())
    }

    /// Enters every page of `[addr, addr + size)` that is not yet present.
    ///
    /// # Errors
    ///
    /// `InvalidRange` if part of the range is unmapped; `OutOfMemory` as
    /// for [`VmMap::fault`]. Pages entered before the failure stay.
    pub fn populate(&self, addr: VirtAddr, size: u64) -> Result<(), VmError> {
        let (start, end) = self.check_range(addr, size)?;
        let inner = self.inner.lock();
        let mut va = start;
        while va < end {
            let entry = *inner.lookup(va).ok_or(VmError::InvalidRange)?;
            let stop = if entry.end < end { entry.end } else { end };
            while va < stop {
                if self.pmap.translate(va).is_none() {
                    self.resolve(&entry, va)?;
                }
                va = va + PAGE_SIZE;
            }
        }
        Ok(())
    }

    /// Calls `f` with every entry in address order.
    pub fn for_each_entry(&self, mut f: impl FnMut(&VmMapEntry)) {
        let inner = self.inner.lock();
        for entry in inner.entries.values() {
            f(entry);
        }
    }

    /// Returns the number of entries.
    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Switches the calling CPU to this address space.
    ///
    /// # Safety
    ///
    /// As for [`Pmap::activate`].
    pub unsafe fn activate(&self) {
        // SAFETY: Forwarded from the caller.
        unsafe { self.pmap.activate() };
    }

    /// Records that the calling CPU left this address space.
    pub fn deactivate(&self) {
        self.pmap.deactivate();
    }

    /// Unmaps everything, releases the page tables and the identifier.
    ///
    /// # Errors
    ///
    /// Returns the map back if it is the kernel map or still active on
    /// some CPU.
    pub fn destroy(self) -> Result<(), Self> {
        if self.in_use() {
            return Err(self);
        }
        drop(self);
        Ok(())
    }

    fn in_use(&self) -> bool {
        self.pmap.is_kernel() || self.pmap.is_active()
    }

    /// Frame-table owner of the page at `va`.
    fn owner(&self, va: VirtAddr) -> PageOwner {
        if self.pmap.is_kernel() {
            PageOwner::Kernel(KernelUse::Heap)
        } else {
            PageOwner::Mapping { map: self.id, va }
        }
    }

    fn flags_for(&self, backing: Backing) -> PmapFlags {
        match backing {
            Backing::Device { .. } => self.leaf_flags | PmapFlags::NOCACHE,
            _ => self.leaf_flags,
        }
    }

    fn check_range(&self, addr: VirtAddr, size: u64) -> Result<(VirtAddr, VirtAddr), VmError> {
        let size = page_round_up(size);
        if size == 0 || !addr.is_aligned(PAGE_SIZE) {
            return Err(VmError::InvalidRange);
        }
        let end = addr.checked_add(size).ok_or(VmError::InvalidRange)?;
        Ok((addr, end))
    }

    /// Splits the entry strictly containing `addr` into two at `addr`.
    fn split_at(&self, inner: &mut MapInner, addr: VirtAddr) -> Result<(), VmError> {
        let Some(entry) = inner.lookup(addr).copied() else {
            return Ok(());
        };
        if entry.start == addr {
            return Ok(());
        }
        let tail = self.vm.entry_cache().alloc(VmMapEntry {
            start: addr,
            end: entry.end,
            prot: entry.prot,
            backing: entry.backing.offset(addr - entry.start),
        })?;
        if let Some(head) = inner.entries.get_mut(&entry.start.as_u64()) {
            head.end = addr;
        }
        inner.entries.insert(addr.as_u64(), tail);
        Ok(())
    }

    /// Enters every page of an eagerly backed entry, undoing the pages
    /// already entered on failure.
    fn enter_range(&self, entry: &VmMapEntry) -> Result<(), VmError> {
        let flags = self.flags_for(entry.backing);
        let frames = self.vm.frames();
        let mut va = entry.start;
        while va < entry.end {
            let Some(pa) = entry.frame_at(va) else {
                return Err(VmError::InvalidRange);
            };
            let entered = if entry.backing.is_tracked() {
                frames.page_ref(pa, self.owner(va)).and_then(|()| {
                    self.pmap.enter(va, pa, entry.prot, flags).inspect_err(|_| {
                        if let Err(e) = frames.page_unref(pa, self.owner(va)) {
                            kerr!("vm {}: frame {:#x} kept after failed enter: {}", self.name, pa.as_u64(), e);
                        }
                    })
                })
            } else {
                self.pmap.enter(va, pa, entry.prot, flags)
            };
            if let Err(e) = entered {
                let partial = VmMapEntry { end: va, ..*entry };
                self.release_range(&partial);
                return Err(e);
            }
            va = va + PAGE_SIZE;
        }
        Ok(())
    }

    /// Enters the page at `va`; `false` if it was already present.
    fn resolve(&self, entry: &VmMapEntry, va: VirtAddr) -> Result<bool, VmError> {
        if let Some((_, current)) = self.pmap.translate(va) {
            if current == entry.prot {
                // Another CPU got here first, or this CPU holds a stale entry.
                self.vm.mmu().invalidate_local(va);
            } else {
                self.pmap.protect(va, va + PAGE_SIZE, entry.prot);
            }
            return Ok(false);
        }

        let flags = self.flags_for(entry.backing);
        let frames = self.vm.frames();
        let owner = self.owner(va);
        let pa = match entry.backing {
            Backing::Anonymous => frames.page_alloc_zeroed(owner)?,
            Backing::Shared { .. } => {
                let pa = entry.frame_at(va).ok_or(VmError::InvalidRange)?;
                frames.page_ref(pa, owner)?;
                pa
            }
            Backing::Device { .. } => {
                let pa = entry.frame_at(va).ok_or(VmError::InvalidRange)?;
                self.pmap.enter(va, pa, entry.prot, flags)?;
                return Ok(true);
            }
        };
        if let Err(e) = self.pmap.enter(va, pa, entry.prot, flags) {
            if let Err(undo) = frames.page_unref(pa, owner) {
                kerr!("vm {}: frame {:#x} kept after failed enter: {}", self.name, pa.as_u64(), undo);
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Removes the translations of `entry` and drops the frame references
    /// they held. Frames are released only after every CPU has
    /// invalidated them.
    fn release_range(&self, entry: &VmMapEntry) {
        let frames = self.vm.frames();
        let tracked = entry.backing.is_tracked();
        self.pmap.remove(entry.start, entry.end, |va, pa, _size| {
            if !tracked {
                return;
            }
            if let Err(e) = frames.page_unref(pa, self.owner(va)) {
                kerr!("vm {}: frame {:#x} at {:#x} not released: {}", self.name, pa.as_u64(), va.as_u64(), e);
            }
        });
    }
}

impl<M: Mmu> Drop for VmMap<M> {
    fn drop(&mut self) {
        if self.in_use() {
            kerr!("vm {}: dropped while in use, leaking its pages and tables", self.name);
            return;
        }
        let entries = core::mem::take(&mut self.inner.get_mut().entries);
        let count = entries.len();
        for entry in entries.values() {
            self.release_range(entry);
        }
        drop(entries);

        // SAFETY: Taken once, here; nothing touches the field afterwards.
        let pmap = unsafe { ManuallyDrop::take(&mut self.pmap) };
        if pmap.destroy().is_err() {
            kerr!("vm {}: pmap still in use at destroy", self.name);
        }
        self.vm.free_map_id(self.id);
        kdebug!("vm {}: destroyed ({} entries)", self.name, count);
    }
}

impl<M: Mmu> core::fmt::Debug for VmMap<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmMap")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base", &self.base)
            .field("end", &self.end)
            .field("pmap", &self.pmap)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakePhys, SimMmu};
    use crate::vmem::SpanSource;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

    const RW: Prot = Prot::READ.union(Prot::WRITE);

    /// Contiguous wired frames, each holding one kernel reference.
    fn shared_frames(vm: &Vm<SimMmu>, count: u64) -> PhysAddr {
        PhysAddr::new(vm.frames().import(count * PAGE_SIZE, PAGE_SIZE).unwrap())
    }

    #[test]
    fn unmap_middle_page_splits_entry() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let map = vm.create_map("task").unwrap();
        let frames = shared_frames(vm, 3);
        let a = map.map(None, 3 * PAGE_SIZE, RW, Backing::Shared { phys: frames }).unwrap();
        let middle = PhysAddr::new(frames.as_u64() + PAGE_SIZE);
        assert_eq!(vm.frames().info(middle).unwrap().ref_count, 2);

        vm.mmu().take_removed();
        map.unmap(a + PAGE_SIZE, PAGE_SIZE).unwrap();

        let mut entries = Vec::new();
        map.for_each_entry(|e| entries.push((e.start, e.end)));
        assert_eq!(entries, [(a, a + PAGE_SIZE), (a + 2 * PAGE_SIZE, a + 3 * PAGE_SIZE)]);
        assert_eq!(vm.frames().info(middle).unwrap().ref_count, 1);
        assert_eq!(vm.frames().info(frames).unwrap().ref_count, 2);
        assert_eq!(vm.mmu().take_removed(), [a + PAGE_SIZE]);

        let tail = map.find(a + 2 * PAGE_SIZE).unwrap();
        assert_eq!(tail.backing, Backing::Shared { phys: PhysAddr::new(frames.as_u64() + 2 * PAGE_SIZE) });
    }

    #[test]
    fn find_is_boundary_exact() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let map = vm.create_map("task").unwrap();
        let hint = VirtAddr::new(map.base().as_u64() + 0x10_0000);
        let a = map.map(Some(hint), 2 * PAGE_SIZE, Prot::READ, Backing::Anonymous).unwrap();
        assert_eq!(a, hint);

        assert!(map.find(a - 1).is_none());
        assert_eq!(map.find(a).map(|e| e.start), Some(a));
        assert_eq!(map.find(a + 2 * PAGE_SIZE - 1).map(|e| e.start), Some(a));
        assert!(map.find(a + 2 * PAGE_SIZE).is_none());
    }

    #[test]
    fn placement_uses_hint_or_first_gap() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let map = vm.create_map("task").unwrap();
        let base = map.base();

        let first = map.map(None, PAGE_SIZE, Prot::READ, Backing::Anonymous).unwrap();
        assert_eq!(first, base);
        let far = map.map(Some(base + 4 * PAGE_SIZE), PAGE_SIZE, Prot::READ, Backing::Anonymous).unwrap();
        assert_eq!(far, base + 4 * PAGE_SIZE);

        // Taken hint falls back to the lowest gap that fits.
        let gap = map.map(Some(far), 2 * PAGE_SIZE, Prot::READ, Backing::Anonymous).unwrap();
        assert_eq!(gap, base + PAGE_SIZE);
        // Unaligned hint is ignored.
        let next = map.map(Some(base + 0x123), PAGE_SIZE, Prot::READ, Backing::Anonymous).unwrap();
        assert_eq!(next, base + 3 * PAGE_SIZE);
        assert_eq!(map.entry_count(), 4);
    }

    #[test]
    fn exhausted_space_is_no_space() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let map = vm.create_map("task").unwrap();
        let size = map.end() - map.base();
        assert_eq!(map.map(None, size + PAGE_SIZE, Prot::READ, Backing::Anonymous), Err(VmError::NoSpace));
        map.map(None, size, Prot::READ, Backing::Anonymous).unwrap();
        assert_eq!(map.map(None, PAGE_SIZE, Prot::READ, Backing::Anonymous), Err(VmError::NoSpace));
        assert_eq!(map.map(None, 0, Prot::READ, Backing::Anonymous), Err(VmError::InvalidRange));
    }

    #[test]
    fn unmap_and_protect_reject_holes() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let map = vm.create_map("task").unwrap();
        let a = map.map(None, PAGE_SIZE, Prot::READ, Backing::Anonymous).unwrap();
        let hole = a + 8 * PAGE_SIZE;
        assert_eq!(map.unmap(hole, PAGE_SIZE), Err(VmError::InvalidRange));
        assert_eq!(map.protect(hole, PAGE_SIZE, Prot::READ), Err(VmError::InvalidRange));
        assert_eq!(map.unmap(a + 1, PAGE_SIZE), Err(VmError::InvalidRange));
        map.unmap(a, PAGE_SIZE).unwrap();
        assert_eq!(map.unmap(a, PAGE_SIZE), Err(VmError::InvalidRange));
    }

    #[test]
    fn anonymous_fault_paths() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let map = vm.create_map("task").unwrap();
        let a = map.map(None, 2 * PAGE_SIZE, Prot::READ, Backing::Anonymous).unwrap();
        assert!(map.pmap().translate(a).is_none());

        map.fault(a + 0x10, Prot::READ).unwrap();
        let (pa, prot) = map.pmap().translate(a).unwrap();
        assert_eq!(prot, Prot::READ);
        let info = vm.frames().info(pa).unwrap();
        assert_eq!(info.ref_count, 1);
        assert_eq!(info.owner, Some(PageOwner::Mapping { map: map.id(), va: a }));

        // Present page: nothing new is allocated.
        map.fault(a, Prot::READ).unwrap();
        assert_eq!(map.fault(a, Prot::WRITE), Err(VmError::AccessViolation));
        assert_eq!(map.fault(a + 2 * PAGE_SIZE, Prot::READ), Err(VmError::InvalidRange));

        map.unmap(a, 2 * PAGE_SIZE).unwrap();
        assert_eq!(vm.frames().info(pa).unwrap().ref_count, 0);
    }

    #[test]
    fn protect_splits_and_updates_present_pages() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let map = vm.create_map("task").unwrap();
        let a = map.map(None, 4 * PAGE_SIZE, RW, Backing::Anonymous).unwrap();
        map.populate(a, 4 * PAGE_SIZE).unwrap();

        map.protect(a + PAGE_SIZE, 2 * PAGE_SIZE, Prot::READ).unwrap();
        assert_eq!(map.entry_count(), 3);
        assert_eq!(map.find(a).unwrap().prot, RW);
        assert_eq!(map.find(a + PAGE_SIZE).unwrap().prot, Prot::READ);
        assert_eq!(map.pmap().translate(a + 2 * PAGE_SIZE).map(|(_, p)| p), Some(Prot::READ));
        assert_eq!(map.pmap().translate(a + 3 * PAGE_SIZE).map(|(_, p)| p), Some(RW));
        assert_eq!(map.fault(a + PAGE_SIZE, Prot::WRITE), Err(VmError::AccessViolation));
    }

    #[test]
    fn device_mappings_are_untracked() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let map = vm.create_map("mmio").unwrap();
        let mmio = PhysAddr::new(0xFEE0_0000);
        let a = map.map(None, PAGE_SIZE, RW, Backing::Device { phys: mmio }).unwrap();
        assert_eq!(map.pmap().translate(a).map(|(pa, _)| pa), Some(mmio));
        map.unmap(a, PAGE_SIZE).unwrap();
        assert!(map.pmap().translate(a).is_none());
        assert_eq!(
            map.map(None, PAGE_SIZE, RW, Backing::Device { phys: PhysAddr::new(0x123) }),
            Err(VmError::InvalidRange)
        );
    }

    #[test]
    fn failed_shared_map_rolls_back() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let map = vm.create_map("task").unwrap();
        // Last frame of the table: the page after it is untracked.
        let pa = PhysAddr::new(phys.end() - PAGE_SIZE);
        let result = map.map(None, 2 * PAGE_SIZE, Prot::READ, Backing::Shared { phys: pa });
        assert_eq!(result, Err(VmError::InvalidRange));
        assert_eq!(map.entry_count(), 0);
        assert_eq!(vm.frames().info(pa).unwrap().ref_count, 1);
        assert!(map.pmap().translate(map.base()).is_none());
    }

    #[test]
    fn destroy_releases_frames_and_id() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let map = vm.create_map("task").unwrap();
        let pa = shared_frames(vm, 1);
        map.map(None, PAGE_SIZE, Prot::READ, Backing::Shared { phys: pa }).unwrap();
        let a = map.map(None, PAGE_SIZE, RW, Backing::Anonymous).unwrap();
        map.fault(a, Prot::WRITE).unwrap();
        let (anon, _) = map.pmap().translate(a).unwrap();

        unsafe { map.activate() };
        let map = map.destroy().unwrap_err();
        map.deactivate();
        map.destroy().unwrap();

        assert_eq!(vm.frames().info(pa).unwrap().ref_count, 1);
        assert_eq!(vm.frames().info(anon).unwrap().ref_count, 0);
    }

    #[test]
    fn protect_is_seen_by_other_cpu() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let map: &'static VmMap<SimMmu> = Box::leak(Box::new(vm.create_map("task").unwrap()));
        vm.shootdown().cpu_online(1);

        SimMmu::set_cpu(0);
        let a = map.map(None, PAGE_SIZE, RW, Backing::Anonymous).unwrap();
        map.fault(a, Prot::WRITE).unwrap();
        unsafe { map.activate() };
        vm.mmu().access(map.pmap(), a, Prot::WRITE).unwrap();

        // 0: warming up, 1: cached a writable translation, 2: protect returned.
        let stage = Arc::new(AtomicU8::new(0));
        let stale = Arc::new(AtomicBool::new(false));
        let other = {
            let stage = Arc::clone(&stage);
            let stale = Arc::clone(&stale);
            std::thread::spawn(move || {
                SimMmu::set_cpu(1);
                unsafe { map.activate() };
                vm.mmu().access(map.pmap(), a, Prot::WRITE).unwrap();
                stage.store(1, Ordering::SeqCst);
                while stage.load(Ordering::SeqCst) != 2 {
                    vm.mmu().poll(vm.shootdown());
                    std::thread::yield_now();
                }
                if vm.mmu().access(map.pmap(), a, Prot::WRITE).is_ok() {
                    stale.store(true, Ordering::SeqCst);
                }
                map.deactivate();
            })
        };

        while stage.load(Ordering::SeqCst) != 1 {
            std::thread::yield_now();
        }
        map.protect(a, PAGE_SIZE, Prot::READ).unwrap();
        assert_eq!(vm.mmu().access(map.pmap(), a, Prot::WRITE), Err(VmError::AccessViolation));
        stage.store(2, Ordering::SeqCst);
        other.join().unwrap();
        assert!(!stale.load(Ordering::SeqCst));
        map.deactivate();
    }
}
