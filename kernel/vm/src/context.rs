//! The assembled memory-management core.
//!
//! [`Vm`] owns the caches and coordinators the layers share and hands out
//! address spaces. It has the same two-phase lifecycle as the frame table:
//! [`Vm::new`] builds the allocators, [`Vm::open`] adopts the boot page
//! tables, attaches the frame back-reference cache and creates the kernel
//! map. Nothing that needs an address space works before `open`.

use hadron_core::addr::{PhysAddr, VirtAddr};
use hadron_core::{kerr, kinfo};
use hadron_core::sync::Once;

use crate::config::VmConfig;
use crate::kmem::pages::PageArena;
use crate::kmem::sizes::KmemAllocator;
use crate::kmem::ObjectCache;
use crate::map::{Backing, MapId, VmMap, VmMapEntry};
use crate::page::{FrameTable, PvEntry};
use crate::pmap::{Mmu, Pmap, PmapFlags, Prot, TlbShootdown};
use crate::vmem::{AllocPolicy, Vmem};
use crate::{PAGE_SIZE, VmError};

/// Map identifiers are allocated from `[1, MAX_MAP_ID)`.
const MAX_MAP_ID: u64 = 1 << 20;

/// Memory-management state shared by every address space.
pub struct Vm<M: Mmu> {
    config: VmConfig,
    mmu: &'static M,
    frames: &'static FrameTable,
    pages: &'static PageArena,
    kmem: KmemAllocator,
    entries: ObjectCache<VmMapEntry>,
    pv: ObjectCache<PvEntry>,
    shootdown: TlbShootdown,
    map_ids: Vmem,
    kernel_map: Once<VmMap<M>>,
}

impl<M: Mmu> Vm<M> {
    /// Builds the allocators over `frames` and `pages`.
    ///
    /// # Errors
    ///
    /// `InvalidRange` if a cache cannot be laid out.
    pub fn new(
        config: VmConfig,
        mmu: &'static M,
        frames: &'static FrameTable,
        pages: &'static PageArena,
    ) -> Result<Self, VmError> {
        let retained = config.kmem_retained_empty_slabs;
        Ok(Self {
            config,
            mmu,
            frames,
            pages,
            kmem: KmemAllocator::new(pages, retained)?,
            entries: ObjectCache::new("vm_map_entry", pages, retained)?,
            pv: ObjectCache::new("pv_entry", pages, retained)?,
            shootdown: TlbShootdown::new(config.shootdown_timeout_spins, config.shootdown_flush_all_threshold),
            map_ids: Vmem::new("map_ids", 1, MAX_MAP_ID - 1, 1, None).with_tag_source(frames),
            kernel_map: Once::new(),
        })
    }

    /// Opens the core for address-space operations: wraps the boot page
    /// tables in the kernel map and enables shared frames.
    ///
    /// # Errors
    ///
    /// `AlreadyInitialized` on a second call; `OutOfMemory` if the kernel
    /// half's page tables cannot be allocated.
    ///
    /// # Safety
    ///
    /// `kernel_root` must be the live kernel root table.
    pub unsafe fn open(&'static self, kernel_root: PhysAddr) -> Result<&'static VmMap<M>, VmError> {
        if self.kernel_map.is_initialized() {
            return Err(VmError::AlreadyInitialized);
        }
        self.frames.attach_pv_cache(&self.pv)?;

        let base = VirtAddr::new(self.config.kernel_heap_base);
        let size = self.config.kernel_heap_size;
        // SAFETY: Forwarded from the caller; `open` runs once.
        let pmap = unsafe { Pmap::adopt(self.mmu, self.frames, &self.shootdown, kernel_root) };
        pmap.reserve_kernel_range(base, base + size)?;

        let id = self.alloc_map_id()?;
        let map = VmMap::new(self, id, "kernel", base, size, PmapFlags::GLOBAL, pmap);
        let map = self.kernel_map.set(map).map_err(|_| VmError::AlreadyInitialized)?;
        kinfo!(
            "vm: open, kernel map [{:#x}, {:#x}), user [{:#x}, {:#x})",
            base.as_u64(),
            base.as_u64() + size,
            self.config.user_base,
            self.config.user_base + self.config.user_size
        );
        Ok(map)
    }

    /// Returns the kernel map once [`Vm::open`] has run.
    pub fn kernel_map(&self) -> Option<&VmMap<M>> {
        self.kernel_map.get()
    }

    /// Creates an empty user address space.
    ///
    /// # Errors
    ///
    /// `NotInitialized` before [`Vm::open`]; `OutOfMemory` if no frame is
    /// available for the root table; `NoSpace` if map identifiers ran out.
    pub fn create_map(&'static self, name: &'static str) -> Result<VmMap<M>, VmError> {
        let kernel = self.kernel_map.get().ok_or(VmError::NotInitialized)?;
        let pmap = Pmap::create(self.mmu, self.frames, &self.shootdown, kernel.pmap())?;
        let id = match self.alloc_map_id() {
            Ok(id) => id,
            Err(e) => {
                if pmap.destroy().is_err() {
                    kerr!("vm {}: root table not freed after id allocation failed", name);
                }
                return Err(e);
            }
        };
        Ok(VmMap::new(
            self,
            id,
            name,
            VirtAddr::new(self.config.user_base),
            self.config.user_size,
            PmapFlags::USER,
            pmap,
        ))
    }

    /// Maps and populates `pages` pages of zeroed kernel memory.
    ///
    /// # Errors
    ///
    /// `NotInitialized` before [`Vm::open`]; `NoSpace` or `OutOfMemory` as
    /// for [`VmMap::map`] and [`VmMap::populate`].
    pub fn kernel_alloc(&self, pages: u64) -> Result<VirtAddr, VmError> {
        let kernel = self.kernel_map.get().ok_or(VmError::NotInitialized)?;
        let size = pages * PAGE_SIZE;
        let va = kernel.map(None, size, Prot::READ | Prot::WRITE, Backing::Anonymous)?;
        if let Err(e) = kernel.populate(va, size) {
            if let Err(undo) = kernel.unmap(va, size) {
                kerr!("vm: kernel range {:#x} leaked after failed populate: {}", va.as_u64(), undo);
            }
            return Err(e);
        }
        Ok(va)
    }

    /// Releases memory from [`Vm::kernel_alloc`].
    ///
    /// # Errors
    ///
    /// `NotInitialized` before [`Vm::open`]; `InvalidRange` if nothing is
    /// mapped there.
    pub fn kernel_free(&self, va: VirtAddr, pages: u64) -> Result<(), VmError> {
        let kernel = self.kernel_map.get().ok_or(VmError::NotInitialized)?;
        kernel.unmap(va, pages * PAGE_SIZE)
    }

    /// Entry point of the TLB shootdown IPI.
    pub fn handle_shootdown_ipi(&self) {
        self.shootdown.handle_ipi(self.mmu);
    }

    /// Returns the configuration in effect.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Returns the architecture MMU.
    pub fn mmu(&self) -> &'static M {
        self.mmu
    }

    /// Returns the frame table.
    pub fn frames(&self) -> &'static FrameTable {
        self.frames
    }

    /// Returns the kernel page arena.
    pub fn pages(&self) -> &'static PageArena {
        self.pages
    }

    /// Returns the general-purpose kernel allocator.
    pub fn kmem(&self) -> &KmemAllocator {
        &self.kmem
    }

    /// Returns the shootdown coordinator.
    pub fn shootdown(&self) -> &TlbShootdown {
        &self.shootdown
    }

    pub(crate) fn entry_cache(&self) -> &ObjectCache<VmMapEntry> {
        &self.entries
    }

    fn alloc_map_id(&self) -> Result<MapId, VmError> {
        let raw = self.map_ids.alloc(1, AllocPolicy::NextFit).map_err(|_| VmError::NoSpace)?;
        Ok(MapId::from_raw(raw as u32))
    }

    pub(crate) fn free_map_id(&self, id: MapId) {
        let freed = self.map_ids.free(u64::from(id.as_u32()));
        if let Err(e) = freed {
            kerr!("vm: map id {} not allocated: {}", id.as_u32(), e);
        }
        debug_assert!(freed.is_ok(), "map id {} freed twice", id.as_u32());
    }

    /// Logs the state of every layer.
    pub fn dump(&self) {
        self.frames.dump();
        self.pages.arena().dump();
        self.kmem.dump();
        self.entries.cache().dump();
        self.pv.cache().dump();
        self.map_ids.dump();
    }
}

impl<M: Mmu> core::fmt::Debug for Vm<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vm")
            .field("config", &self.config)
            .field("shootdown", &self.shootdown)
            .field("kernel_map", &self.kernel_map.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakePhys;

    #[test]
    fn open_twice_fails() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let root = vm.kernel_map().unwrap().pmap().root();
        assert_eq!(unsafe { vm.open(root) }.err(), Some(VmError::AlreadyInitialized));
    }

    #[test]
    fn maps_need_open() {
        let phys = FakePhys::new();
        let vm = phys.unopened_vm();
        assert_eq!(vm.create_map("early").err(), Some(VmError::NotInitialized));
        assert_eq!(vm.kernel_alloc(1), Err(VmError::NotInitialized));
    }

    #[test]
    fn map_ids_are_unique_and_recycled() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let a = vm.create_map("a").unwrap();
        let b = vm.create_map("b").unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), vm.kernel_map().unwrap().id());
        let used = vm.map_ids.stats().in_use;
        a.destroy().unwrap();
        assert_eq!(vm.map_ids.stats().in_use, used - 1);
        b.destroy().unwrap();
    }

    #[test]
    fn many_maps_under_churn() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let baseline = vm.map_ids.stats().in_use;

        let mut kept = Vec::new();
        for i in 0..300 {
            let map = vm.create_map("churn").unwrap();
            if i % 2 == 0 {
                map.destroy().unwrap();
            } else {
                kept.push(map);
            }
        }
        for _ in 0..200 {
            kept.push(vm.create_map("churn").unwrap());
        }
        let mut ids: Vec<u32> = kept.iter().map(|m| m.id().as_u32()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 350);
        assert_eq!(vm.map_ids.stats().in_use, baseline + 350);

        for map in kept {
            map.destroy().unwrap();
        }
        assert_eq!(vm.map_ids.stats().in_use, baseline);
    }

    #[test]
    fn dropped_map_releases_frames_and_id() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        {
            // Leaves the entry cache warm so its slab is not counted below.
            let warm = vm.create_map("warm").unwrap();
            warm.map(None, PAGE_SIZE, Prot::READ, Backing::Anonymous).unwrap();
        }
        let free_before = vm.frames().stats().free_frames;
        let ids_before = vm.map_ids.stats().in_use;

        let map = vm.create_map("task").unwrap();
        let a = map.map(None, 8 * PAGE_SIZE, Prot::READ | Prot::WRITE, Backing::Anonymous).unwrap();
        for i in 0..8 {
            map.fault(a + i * PAGE_SIZE, Prot::WRITE).unwrap();
        }
        assert!(vm.frames().stats().free_frames < free_before - 8);
        assert_eq!(vm.map_ids.stats().in_use, ids_before + 1);

        drop(map);
        assert_eq!(vm.frames().stats().free_frames, free_before);
        assert_eq!(vm.map_ids.stats().in_use, ids_before);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn map_id_double_free_is_caught() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let id = vm.alloc_map_id().unwrap();
        vm.free_map_id(id);
        vm.free_map_id(id);
    }

    #[test]
    fn kernel_alloc_is_populated() {
        let phys = FakePhys::new();
        let vm = phys.vm();
        let kernel = vm.kernel_map().unwrap();
        let va = vm.kernel_alloc(3).unwrap();
        assert!(va >= kernel.base());
        for i in 0..3 {
            let (pa, prot) = kernel.pmap().translate(va + i * PAGE_SIZE).unwrap();
            assert_eq!(prot, Prot::READ | Prot::WRITE);
            assert_eq!(vm.frames().info(pa).unwrap().ref_count, 1);
        }

        // A user map sees kernel memory mapped after it was created.
        let user = vm.create_map("user").unwrap();
        let later = vm.kernel_alloc(1).unwrap();
        assert!(user.pmap().translate(later).is_some());

        let (pa, _) = kernel.pmap().translate(va).unwrap();
        vm.kernel_free(va, 3).unwrap();
        assert!(kernel.pmap().translate(va).is_none());
        assert_eq!(vm.frames().info(pa).unwrap().ref_count, 0);
        assert_eq!(vm.kernel_free(va, 3), Err(VmError::InvalidRange));
    }
}
