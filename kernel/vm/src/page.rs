//! Physical frame table.
//!
//! One [`VmPage`] record per physical frame below the highest usable
//! address, placed in the first usable region large enough at boot. Each
//! record carries the frame's state, reference and wire counts, and the
//! set of owners holding a reference. The first owner is stored inline;
//! further owners hang off a chain of [`PvEntry`] records from a slab
//! cache attached once the slab layer is up.
//!
//! Free frames are tracked by a vmem arena over physical addresses whose
//! boundary tags live next to the records, one per frame, so the arena can
//! never run out of tags however fragmented memory gets.
//!
//! Frames are also a [`SpanSource`]: page arenas import contiguous wired
//! spans from here and hand them back when empty. Arenas that outgrow their
//! inline boundary tags take tag pages from here as a [`TagSource`].

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use hadron_core::addr::{PhysAddr, VirtAddr};
use hadron_core::sync::{Once, SpinLock};
use hadron_core::{kinfo, kwarn};
use planck_noalloc::vec::ArrayVec;

use crate::kmem::{ObjectCache, SlabBox};
use crate::map::MapId;
use crate::vmem::{AllocPolicy, BoundaryTag, Constraints, SpanSource, TagSource, Vmem};
use crate::{Hhdm, MemoryKind, PAGE_SIZE, PhysMemoryRegion, VmError, lock_level};

/// Reclaimable regions remembered until [`FrameTable::reclaim`].
const MAX_RECLAIMABLE: usize = 64;

/// Boundary tags reserved beyond one per frame: two per usable region for
/// span markers and the free segment that follows a carve, plus slack.
const EXTRA_TAGS: usize = 2 * 64 + 2;

/// Lifecycle state of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    /// In the free arena.
    Free = 0,
    /// Referenced and pageable.
    Active = 1,
    /// Referenced and pinned.
    Wired = 2,
}

/// What the kernel itself uses a frame for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelUse {
    /// Page-table page.
    PageTable,
    /// Slab or page-arena memory.
    Slab,
    /// Firmware, boot-loader or hole; never handed out.
    Firmware,
    /// The frame table itself.
    FrameTable,
    /// Kernel heap pages mapped through the kernel map.
    Heap,
    /// Boundary tags of a vmem arena.
    ArenaTags,
}

/// A holder of a frame reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOwner {
    /// Mapped at `va` in address space `map`.
    Mapping {
        /// Address space.
        map: MapId,
        /// Virtual address of the mapping.
        va: VirtAddr,
    },
    /// Held by the kernel.
    Kernel(KernelUse),
}

/// Additional owner of a frame, chained from its [`VmPage`].
pub struct PvEntry {
    owner: PageOwner,
    next: Option<NonNull<PvEntry>>,
}

/// Per-frame record.
#[derive(Clone, Copy)]
struct VmPage {
    state: FrameState,
    ref_count: u32,
    wire_count: u32,
    first: Option<PageOwner>,
    rest: Option<NonNull<PvEntry>>,
}

impl VmPage {
    const FREE: Self = Self {
        state: FrameState::Free,
        ref_count: 0,
        wire_count: 0,
        first: None,
        rest: None,
    };

    const fn held(owner: PageOwner, wired: bool) -> Self {
        Self {
            state: if wired { FrameState::Wired } else { FrameState::Active },
            ref_count: 1,
            wire_count: wired as u32,
            first: Some(owner),
            rest: None,
        }
    }

    fn holds(&self, owner: PageOwner) -> bool {
        if self.first == Some(owner) {
            return true;
        }
        let mut cur = self.rest;
        while let Some(entry) = cur {
            // SAFETY: Chain entries stay live while linked, and the chain is
            // only touched under the frame lock.
            let entry = unsafe { entry.as_ref() };
            if entry.owner == owner {
                return true;
            }
            cur = entry.next;
        }
        false
    }

    /// Unlinks `owner`, returning the chain entry that is no longer needed.
    /// The owner must be present.
    fn remove_owner(&mut self, owner: PageOwner) -> Option<NonNull<PvEntry>> {
        if self.first == Some(owner) {
            let Some(head) = self.rest else {
                self.first = None;
                return None;
            };
            // SAFETY: As in `holds`.
            let entry = unsafe { head.as_ref() };
            self.first = Some(entry.owner);
            self.rest = entry.next;
            return Some(head);
        }
        let mut link = &mut self.rest;
        while let Some(mut entry) = *link {
            // SAFETY: As in `holds`; the lock gives exclusive access.
            let entry_mut = unsafe { entry.as_mut() };
            if entry_mut.owner == owner {
                *link = entry_mut.next;
                return Some(entry);
            }
            link = &mut entry_mut.next;
        }
        None
    }
}

/// Snapshot of one frame record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Lifecycle state.
    pub state: FrameState,
    /// Number of owners.
    pub ref_count: u32,
    /// Number of outstanding wires.
    pub wire_count: u32,
    /// First owner, if any.
    pub owner: Option<PageOwner>,
}

/// Frame counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames covered by the table.
    pub total_frames: u64,
    /// Frames in the free arena.
    pub free_frames: u64,
    /// Referenced pageable frames.
    pub active_frames: u64,
    /// Wired frames, firmware and table frames included.
    pub wired_frames: u64,
}

struct FrameInner {
    pages: &'static mut [VmPage],
    counts: [u64; 3],
    reclaimable: ArrayVec<(u64, u64), MAX_RECLAIMABLE>,
}

// SAFETY: The pv chains are only reached through the frame lock.
unsafe impl Send for FrameInner {}

impl FrameInner {
    fn set(&mut self, index: usize, page: VmPage) {
        let old = self.pages[index].state;
        self.counts[old as usize] -= 1;
        self.counts[page.state as usize] += 1;
        self.pages[index] = page;
    }
}

/// The physical frame table.
pub struct FrameTable {
    hhdm: Hhdm,
    frame_count: usize,
    arena: Vmem,
    inner: SpinLock<FrameInner>,
    pv_cache: Once<&'static ObjectCache<PvEntry>>,
}

impl FrameTable {
    /// Builds the frame table from the boot memory map.
    ///
    /// Frames outside usable regions are recorded as wired firmware frames.
    /// Reclaimable regions stay wired until [`FrameTable::reclaim`].
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if no usable region can hold the table;
    /// `InvalidRange` if the map has no usable memory.
    ///
    /// # Safety
    ///
    /// `regions` must describe physical memory accurately, all of it must be
    /// mapped through `hhdm`, and usable regions must not be in use.
    pub unsafe fn new(regions: &[PhysMemoryRegion], hhdm: Hhdm) -> Result<Self, VmError> {
        let managed = |r: &&PhysMemoryRegion| {
            matches!(r.kind, MemoryKind::Usable | MemoryKind::Reclaimable)
        };
        let top = regions
            .iter()
            .filter(managed)
            .map(|r| r.end() & !(PAGE_SIZE - 1))
            .max()
            .ok_or(VmError::InvalidRange)?;
        let frame_count = (top / PAGE_SIZE) as usize;
        let tag_count = frame_count + EXTRA_TAGS;

        let pages_bytes = frame_count * size_of::<VmPage>();
        let tags_offset = (pages_bytes + align_of::<BoundaryTag>() - 1) & !(align_of::<BoundaryTag>() - 1);
        let table_bytes = crate::page_round_up((tags_offset + tag_count * size_of::<BoundaryTag>()) as u64);

        let usable = |r: &PhysMemoryRegion| {
            let start = (r.start.as_u64() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            let end = r.end() & !(PAGE_SIZE - 1);
            (r.kind == MemoryKind::Usable && end > start).then_some((start, end))
        };
        let table_phys = regions
            .iter()
            .filter_map(usable)
            .find(|&(start, end)| end - start >= table_bytes)
            .map(|(start, _)| start)
            .ok_or(VmError::OutOfMemory)?;
        let table_end = table_phys + table_bytes;

        let base = hhdm.phys_to_ptr::<u8>(PhysAddr::new(table_phys));
        // SAFETY: The table range lies in a usable region mapped through the
        // direct map and nothing else uses it.
        let (pages, tags) = unsafe {
            let page_ptr = base.cast::<VmPage>();
            let firmware = VmPage::held(PageOwner::Kernel(KernelUse::Firmware), true);
            for i in 0..frame_count {
                page_ptr.add(i).write(firmware);
            }
            let tag_ptr = base.add(tags_offset).cast::<BoundaryTag>();
            for i in 0..tag_count {
                tag_ptr.add(i).write(BoundaryTag::EMPTY);
            }
            (
                core::slice::from_raw_parts_mut(page_ptr, frame_count),
                core::slice::from_raw_parts_mut(tag_ptr, tag_count),
            )
        };

        let arena = Vmem::with_tags("frames", PAGE_SIZE, tags);
        let mut counts = [0u64; 3];
        counts[FrameState::Wired as usize] = frame_count as u64;
        let mut inner = FrameInner {
            pages,
            counts,
            reclaimable: ArrayVec::new(),
        };

        let mut usable_bytes = 0;
        for region in regions {
            let start = (region.start.as_u64() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            let end = (region.end() & !(PAGE_SIZE - 1)).min(top);
            if end <= start {
                continue;
            }
            match region.kind {
                MemoryKind::Usable => {
                    let (start, end) = if start == table_phys { (table_end, end) } else { (start, end) };
                    if end <= start {
                        continue;
                    }
                    for frame in start / PAGE_SIZE..end / PAGE_SIZE {
                        inner.set(frame as usize, VmPage::FREE);
                    }
                    arena.add(start, end - start)?;
                    usable_bytes += end - start;
                }
                MemoryKind::Reclaimable => {
                    if inner.reclaimable.try_push((start, end)).is_err() {
                        kwarn!("pmm: dropping reclaimable region [{:#x}, {:#x})", start, end);
                    }
                }
                _ => {}
            }
        }
        for frame in table_phys / PAGE_SIZE..table_end / PAGE_SIZE {
            inner.pages[frame as usize].first = Some(PageOwner::Kernel(KernelUse::FrameTable));
        }

        kinfo!(
            "pmm: {} frames, {} MiB free, table {} KiB at {:#x}",
            frame_count,
            usable_bytes / (1024 * 1024),
            table_bytes / 1024,
            table_phys
        );

        Ok(Self {
            hhdm,
            frame_count,
            arena,
            inner: SpinLock::leveled("frames", lock_level::FRAMES, inner),
            pv_cache: Once::new(),
        })
    }

    /// Supplies the cache that chain entries for additional owners come
    /// from. Until then a frame can only have one owner.
    ///
    /// # Errors
    ///
    /// `AlreadyInitialized` on a second call.
    pub fn attach_pv_cache(&self, cache: &'static ObjectCache<PvEntry>) -> Result<(), VmError> {
        self.pv_cache
            .set(cache)
            .map(|_| ())
            .map_err(|_| VmError::AlreadyInitialized)
    }

    /// Returns the direct map.
    pub fn hhdm(&self) -> Hhdm {
        self.hhdm
    }

    /// Returns the number of frames the table covers.
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Allocates a frame held by `owner`.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if no frame is free.
    pub fn page_alloc(&self, owner: PageOwner) -> Result<PhysAddr, VmError> {
        self.alloc_frame(owner, false)
    }

    /// Allocates a zero-filled frame held by `owner`.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if no frame is free.
    pub fn page_alloc_zeroed(&self, owner: PageOwner) -> Result<PhysAddr, VmError> {
        let phys = self.alloc_frame(owner, false)?;
        self.zero(phys);
        Ok(phys)
    }

    /// Allocates a zero-filled, wired frame held by `owner`.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if no frame is free.
    pub fn page_alloc_wired(&self, owner: PageOwner) -> Result<PhysAddr, VmError> {
        let phys = self.alloc_frame(owner, true)?;
        self.zero(phys);
        Ok(phys)
    }

    /// Adds `owner` as a holder of the frame at `phys`.
    ///
    /// # Errors
    ///
    /// `InvalidRange` if the frame is free or outside the table;
    /// `OutOfMemory` if no chain entry can be allocated.
    pub fn page_ref(&self, phys: PhysAddr, owner: PageOwner) -> Result<(), VmError> {
        let index = self.index(phys)?;
        {
            let mut inner = self.inner.lock();
            let page = &mut inner.pages[index];
            if page.state == FrameState::Free {
                return Err(VmError::InvalidRange);
            }
            if page.first.is_none() {
                page.first = Some(owner);
                page.ref_count += 1;
                return Ok(());
            }
        }

        // Chain entries come from a slab cache, which may need frames: the
        // entry is allocated without the frame lock and the frame re-checked.
        let cache = self.pv_cache.get().ok_or(VmError::OutOfMemory)?;
        let entry = cache.alloc(PvEntry { owner, next: None })?;

        let mut inner = self.inner.lock();
        let page = &mut inner.pages[index];
        let outcome = match (page.state, page.first) {
            (FrameState::Free, _) => Err(VmError::InvalidRange),
            (_, None) => {
                page.first = Some(owner);
                page.ref_count += 1;
                Ok(false)
            }
            (_, Some(_)) => Ok(true),
        };
        if let Ok(true) = outcome {
            let mut raw = SlabBox::into_raw(entry);
            // SAFETY: `raw` is a live entry owned by nothing else.
            unsafe { raw.as_mut().next = page.rest };
            page.rest = Some(raw);
            page.ref_count += 1;
            return Ok(());
        }
        drop(inner);
        drop(entry);
        outcome.map(|_| ())
    }

    /// Drops `owner`'s reference to the frame at `phys`, freeing the frame
    /// when the last reference goes.
    ///
    /// # Errors
    ///
    /// `InvalidRange` if the frame is free or `owner` does not hold it;
    /// `Busy` if this is the last reference and the frame is still wired.
    pub fn page_unref(&self, phys: PhysAddr, owner: PageOwner) -> Result<(), VmError> {
        self.drop_ref(phys, owner, false)
    }

    /// Pins the frame at `phys`.
    ///
    /// # Errors
    ///
    /// `InvalidRange` if the frame is free or outside the table.
    pub fn page_wire(&self, phys: PhysAddr) -> Result<(), VmError> {
        let index = self.index(phys)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let page = &mut inner.pages[index];
        if page.state == FrameState::Free {
            return Err(VmError::InvalidRange);
        }
        page.wire_count += 1;
        if page.state == FrameState::Active {
            page.state = FrameState::Wired;
            inner.counts[FrameState::Active as usize] -= 1;
            inner.counts[FrameState::Wired as usize] += 1;
        }
        Ok(())
    }

    /// Releases one pin on the frame at `phys`.
    ///
    /// # Errors
    ///
    /// `InvalidRange` if the frame is not wired.
    pub fn page_unwire(&self, phys: PhysAddr) -> Result<(), VmError> {
        let index = self.index(phys)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let page = &mut inner.pages[index];
        if page.wire_count == 0 {
            return Err(VmError::InvalidRange);
        }
        page.wire_count -= 1;
        if page.wire_count == 0 {
            page.state = FrameState::Active;
            inner.counts[FrameState::Wired as usize] -= 1;
            inner.counts[FrameState::Active as usize] += 1;
        }
        Ok(())
    }

    /// Unwires and unreferences a frame in one step, as for a page-table
    /// page being torn down.
    ///
    /// # Errors
    ///
    /// As for [`FrameTable::page_unwire`] and [`FrameTable::page_unref`].
    pub fn page_free_wired(&self, phys: PhysAddr, owner: PageOwner) -> Result<(), VmError> {
        self.drop_ref(phys, owner, true)
    }

    /// Returns the frames of reclaimable boot regions to the free arena,
    /// returning how many were added.
    pub fn reclaim(&self) -> u64 {
        let regions = core::mem::replace(&mut self.inner.lock().reclaimable, ArrayVec::new());
        let mut added = 0;
        for &(start, end) in regions.iter() {
            {
                let mut inner = self.inner.lock();
                for frame in start / PAGE_SIZE..end / PAGE_SIZE {
                    inner.set(frame as usize, VmPage::FREE);
                }
            }
            if let Err(e) = self.arena.add(start, end - start) {
                kwarn!("pmm: cannot reclaim [{:#x}, {:#x}): {}", start, end, e);
                let mut inner = self.inner.lock();
                for frame in start / PAGE_SIZE..end / PAGE_SIZE {
                    inner.set(frame as usize, VmPage::held(PageOwner::Kernel(KernelUse::Firmware), true));
                }
                continue;
            }
            added += (end - start) / PAGE_SIZE;
        }
        if added != 0 {
            kinfo!("pmm: reclaimed {} frames", added);
        }
        added
    }

    /// Returns a snapshot of the frame at `phys`.
    pub fn info(&self, phys: PhysAddr) -> Option<FrameInfo> {
        let index = self.index(phys).ok()?;
        let inner = self.inner.lock();
        let page = &inner.pages[index];
        Some(FrameInfo {
            state: page.state,
            ref_count: page.ref_count,
            wire_count: page.wire_count,
            owner: page.first,
        })
    }

    /// Visits every owner of the frame at `phys`.
    ///
    /// Runs with the frame table locked: `f` must not call back into it.
    ///
    /// # Errors
    ///
    /// `InvalidRange` if `phys` is outside the table.
    pub fn for_each_owner(&self, phys: PhysAddr, mut f: impl FnMut(PageOwner)) -> Result<(), VmError> {
        let index = self.index(phys)?;
        let inner = self.inner.lock();
        let page = &inner.pages[index];
        if let Some(first) = page.first {
            f(first);
        }
        let mut cur = page.rest;
        while let Some(entry) = cur {
            // SAFETY: Chain entries stay live while linked.
            let entry = unsafe { entry.as_ref() };
            f(entry.owner);
            cur = entry.next;
        }
        Ok(())
    }

    /// Returns the frame counters.
    pub fn stats(&self) -> FrameStats {
        let inner = self.inner.lock();
        FrameStats {
            total_frames: self.frame_count as u64,
            free_frames: inner.counts[FrameState::Free as usize],
            active_frames: inner.counts[FrameState::Active as usize],
            wired_frames: inner.counts[FrameState::Wired as usize],
        }
    }

    /// Logs the frame counters and the free arena.
    pub fn dump(&self) {
        let stats = self.stats();
        kinfo!(
            "pmm: {} frames: {} free, {} active, {} wired",
            stats.total_frames,
            stats.free_frames,
            stats.active_frames,
            stats.wired_frames
        );
        self.arena.dump();
    }

    fn index(&self, phys: PhysAddr) -> Result<usize, VmError> {
        let index = (phys.as_u64() / PAGE_SIZE) as usize;
        if !phys.is_aligned(PAGE_SIZE) || index >= self.frame_count {
            return Err(VmError::InvalidRange);
        }
        Ok(index)
    }

    fn zero(&self, phys: PhysAddr) {
        // SAFETY: The frame was just allocated and is mapped by the direct map.
        unsafe {
            core::ptr::write_bytes(self.hhdm.phys_to_ptr::<u8>(phys), 0, PAGE_SIZE as usize);
        }
    }

    fn alloc_frame(&self, owner: PageOwner, wired: bool) -> Result<PhysAddr, VmError> {
        let phys = self
            .arena
            .alloc(PAGE_SIZE, AllocPolicy::InstantFit)
            .map_err(|_| VmError::OutOfMemory)?;
        let index = (phys / PAGE_SIZE) as usize;
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.pages[index].state, FrameState::Free);
        inner.set(index, VmPage::held(owner, wired));
        Ok(PhysAddr::new(phys))
    }

    fn drop_ref(&self, phys: PhysAddr, owner: PageOwner, unwire: bool) -> Result<(), VmError> {
        let index = self.index(phys)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let page = &mut inner.pages[index];
        if page.state == FrameState::Free || !page.holds(owner) {
            return Err(VmError::InvalidRange);
        }
        if unwire && page.wire_count == 0 {
            return Err(VmError::InvalidRange);
        }
        let wires = page.wire_count - u32::from(unwire);
        if page.ref_count == 1 && wires != 0 {
            return Err(VmError::Busy);
        }

        let stale = page.remove_owner(owner);
        page.ref_count -= 1;
        page.wire_count = wires;
        let old = page.state;
        page.state = match (page.ref_count, wires) {
            (0, _) => FrameState::Free,
            (_, 0) => FrameState::Active,
            _ => FrameState::Wired,
        };
        let new = page.state;
        inner.counts[old as usize] -= 1;
        inner.counts[new as usize] += 1;
        drop(guard);

        if let (Some(entry), Some(cache)) = (stale, self.pv_cache.get()) {
            // SAFETY: The entry was unlinked above and came from this cache.
            drop(unsafe { SlabBox::from_raw(entry, cache) });
        }
        if new == FrameState::Free {
            if let Err(e) = self.arena.free(phys.as_u64()) {
                kwarn!("pmm: frame {:#x} not returned: {}", phys.as_u64(), e);
            }
        }
        Ok(())
    }
}

impl SpanSource for FrameTable {
    fn import(&self, size: u64, align: u64) -> Result<u64, VmError> {
        let base = self
            .arena
            .xalloc(size, Constraints::aligned(align), AllocPolicy::InstantFit)
            .map_err(|_| VmError::OutOfMemory)?;
        let mut inner = self.inner.lock();
        for frame in base / PAGE_SIZE..(base + size) / PAGE_SIZE {
            inner.set(frame as usize, VmPage::held(PageOwner::Kernel(KernelUse::Slab), true));
        }
        Ok(base)
    }

    fn release(&self, base: u64, size: u64) {
        {
            let mut inner = self.inner.lock();
            for frame in base / PAGE_SIZE..(base + size) / PAGE_SIZE {
                inner.set(frame as usize, VmPage::FREE);
            }
        }
        if let Err(e) = self.arena.free(base) {
            kwarn!("pmm: span [{:#x}, {:#x}) not returned: {}", base, base + size, e);
        }
    }
}

// SAFETY: Tag pages are freshly allocated wired frames, exclusively owned
// until freed, and reached through the direct map at page alignment.
unsafe impl TagSource for FrameTable {
    fn alloc_tag_page(&self) -> Option<NonNull<u8>> {
        let phys = self.page_alloc_wired(PageOwner::Kernel(KernelUse::ArenaTags)).ok()?;
        NonNull::new(self.hhdm.phys_to_ptr::<u8>(phys))
    }

    unsafe fn free_tag_page(&self, page: NonNull<u8>) {
        let phys = self.hhdm.virt_to_phys(VirtAddr::new_truncate(page.as_ptr() as u64));
        if let Err(e) = self.page_free_wired(phys, PageOwner::Kernel(KernelUse::ArenaTags)) {
            kwarn!("pmm: tag page {:#x} not returned: {}", phys.as_u64(), e);
        }
    }
}
