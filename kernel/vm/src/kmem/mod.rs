//! Slab allocator.
//!
//! A [`KmemCache`] hands out fixed-size objects carved from slabs. A slab
//! is a power-of-two run of pages aligned to its own size; its header sits
//! at the end of the slab, so the slab owning any object is found by
//! masking the object's address. Each object slot has a bufctl, a `u16`
//! in the header's index array holding the next free slot (or a sentinel
//! while the object is allocated). The allocator never writes to object
//! memory, so state set up by the cache's constructor survives every
//! free/alloc cycle; the constructor and destructor run once per object
//! when its slab is created and destroyed.
//!
//! Slabs live on one of three lists: partial (some objects free), full and
//! empty. Allocation prefers partial slabs. A slab that becomes empty is
//! kept if the cache holds fewer than its retention limit of empty slabs,
//! otherwise its memory goes straight back to the backing store.

pub mod pages;
pub mod sizes;

use core::fmt;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};

use hadron_core::sync::SpinLock;
use hadron_core::{kdebug, kerr, ktrace};

use crate::{PAGE_SIZE, VmError, lock_level};

pub use pages::PageArena;
pub use sizes::{KMEM_SIZE_CLASSES, KmemAllocator};

/// Default object alignment.
pub const KMEM_DEFAULT_ALIGN: usize = 8;

/// Objects per slab targeted for caches whose objects exceed
/// [`KMEM_SMALL_OBJECT_LIMIT`].
pub const KMEM_OBJECTS_PER_LARGE_SLAB: usize = 16;

/// Objects up to this size use single-page slabs.
pub const KMEM_SMALL_OBJECT_LIMIT: usize = PAGE_SIZE as usize / 8;

/// Bufctl value of an allocated slot.
const BUFCTL_ALLOCATED: u16 = 0xFFFE;
/// Bufctl value terminating the free chain.
const BUFCTL_END: u16 = 0xFFFF;
/// Largest slot count a slab may have.
const MAX_OBJECTS_PER_SLAB: usize = 0xFFFD;

const SLAB_MAGIC: u32 = 0x51AB_CAFE;

static NEXT_CACHE_ID: AtomicU32 = AtomicU32::new(1);

// ---------------------------------------------------------------------------
// Object poisoning helpers (always defined for cfg!() type-checking)
// ---------------------------------------------------------------------------

/// Byte written over freed objects of constructor-less caches.
const OBJECT_POISON: u8 = 0xDE;

/// Fills a freed object with the poison byte.
///
/// # Safety
///
/// `ptr` must be valid for writes of `size` bytes.
unsafe fn poison_object(ptr: *mut u8, size: usize) {
    unsafe { ptr::write_bytes(ptr, OBJECT_POISON, size) };
}

/// Returns `false` if a previously poisoned object has been written to.
///
/// An object whose first byte is not poison is treated as never poisoned.
///
/// # Safety
///
/// `ptr` must be valid for reads of `size` bytes.
unsafe fn check_object_poison(ptr: *const u8, size: usize) -> bool {
    // SAFETY: Guaranteed by the caller.
    let bytes = unsafe { core::slice::from_raw_parts(ptr, size) };
    match bytes.split_first() {
        Some((&first, rest)) if first == OBJECT_POISON => rest.iter().all(|&b| b == OBJECT_POISON),
        _ => true,
    }
}

/// Supplies slab memory to caches.
///
/// # Safety
///
/// `alloc_slab(size)` must return memory that is valid for `size` bytes,
/// aligned to `size`, and not used by anything else until it is handed
/// back with `free_slab`.
pub unsafe trait SlabBacking: Sync {
    /// Allocates a slab of `size` bytes (a power-of-two multiple of the page
    /// size), aligned to `size`.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if no memory is available.
    fn alloc_slab(&self, size: usize) -> Result<NonNull<u8>, VmError>;

    /// Returns a slab.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must come from a previous `alloc_slab` call on this
    /// backing, and nothing may reference the slab any more.
    unsafe fn free_slab(&self, ptr: NonNull<u8>, size: usize);
}

/// Per-object constructor or destructor.
pub type ObjectHook = fn(NonNull<u8>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ListKind {
    Partial = 0,
    Full = 1,
    Empty = 2,
}

/// Slab header, stored at the end of the slab and followed by the bufctl
/// array.
#[repr(C)]
struct SlabHeader {
    magic: u32,
    cache_id: u32,
    prev: *mut SlabHeader,
    next: *mut SlabHeader,
    base: *mut u8,
    in_use: u16,
    free_head: u16,
    list: ListKind,
}

/// Intrusive doubly-linked list of slab headers.
struct SlabList {
    head: *mut SlabHeader,
    len: usize,
}

impl SlabList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    /// # Safety
    ///
    /// `slab` must be a live header not on any list.
    unsafe fn push(&mut self, slab: *mut SlabHeader) {
        unsafe {
            (*slab).prev = ptr::null_mut();
            (*slab).next = self.head;
            if !self.head.is_null() {
                (*self.head).prev = slab;
            }
        }
        self.head = slab;
        self.len += 1;
    }

    /// # Safety
    ///
    /// `slab` must be a live header on this list.
    unsafe fn remove(&mut self, slab: *mut SlabHeader) {
        unsafe {
            let (prev, next) = ((*slab).prev, (*slab).next);
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*slab).prev = ptr::null_mut();
            (*slab).next = ptr::null_mut();
        }
        self.len -= 1;
    }
}

struct CacheInner {
    lists: [SlabList; 3],
    objects_in_use: usize,
    slabs: usize,
    alloc_count: u64,
    free_count: u64,
}

// SAFETY: The raw slab pointers are only dereferenced under the cache lock.
unsafe impl Send for CacheInner {}

impl CacheInner {
    fn list(&mut self, kind: ListKind) -> &mut SlabList {
        &mut self.lists[kind as usize]
    }

    fn first(&self, kind: ListKind) -> Option<*mut SlabHeader> {
        let head = self.lists[kind as usize].head;
        (!head.is_null()).then_some(head)
    }

    /// # Safety
    ///
    /// `slab` must be a live header of this cache.
    unsafe fn move_to(&mut self, slab: *mut SlabHeader, kind: ListKind) {
        unsafe {
            let from = (*slab).list;
            self.list(from).remove(slab);
            self.list(kind).push(slab);
            (*slab).list = kind;
        }
    }
}

/// Slab geometry of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    stride: usize,
    slab_size: usize,
    capacity: usize,
    header_offset: usize,
}

impl Geometry {
    fn compute(size: usize, align: usize) -> Option<Self> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }
        let stride = size.checked_add(align - 1)? & !(align - 1);
        let page = PAGE_SIZE as usize;
        let slab_size = if stride <= KMEM_SMALL_OBJECT_LIMIT {
            page
        } else {
            let bytes = stride.checked_mul(KMEM_OBJECTS_PER_LARGE_SLAB)?;
            (bytes.checked_add(page - 1)? & !(page - 1)).checked_next_power_of_two()?
        };

        let mut capacity = (slab_size / stride).min(MAX_OBJECTS_PER_SLAB);
        while capacity > 0 {
            let header_offset = Self::header_offset(slab_size, capacity)?;
            if capacity * stride <= header_offset {
                return Some(Self {
                    stride,
                    slab_size,
                    capacity,
                    header_offset,
                });
            }
            capacity -= 1;
        }
        None
    }

    fn header_offset(slab_size: usize, capacity: usize) -> Option<usize> {
        let bytes = size_of::<SlabHeader>() + capacity * size_of::<u16>();
        Some(slab_size.checked_sub(bytes)? & !(align_of::<SlabHeader>() - 1))
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmemCacheStats {
    /// Cache name.
    pub name: &'static str,
    /// Requested object size.
    pub object_size: usize,
    /// Distance between objects in a slab.
    pub stride: usize,
    /// Bytes per slab.
    pub slab_size: usize,
    /// Objects per slab.
    pub objects_per_slab: usize,
    /// Slabs currently held.
    pub slabs: usize,
    /// Of which are empty.
    pub empty_slabs: usize,
    /// Objects handed out and not yet freed.
    pub objects_in_use: usize,
    /// Allocations since creation.
    pub alloc_count: u64,
    /// Frees since creation.
    pub free_count: u64,
}

/// A cache of fixed-size objects.
pub struct KmemCache {
    name: &'static str,
    id: u32,
    object_size: usize,
    geometry: Geometry,
    ctor: Option<ObjectHook>,
    dtor: Option<ObjectHook>,
    backing: &'static dyn SlabBacking,
    retained_empty: usize,
    inner: SpinLock<CacheInner>,
}

impl KmemCache {
    /// Creates a cache of `size`-byte objects aligned to `align`.
    ///
    /// `ctor` runs on every object of a new slab and `dtor` on every object
    /// of a slab being released. At most `retained_empty` empty slabs are
    /// kept.
    ///
    /// # Errors
    ///
    /// `InvalidRange` for a zero size, a non-power-of-two alignment, or an
    /// object too large for a slab.
    pub fn new(
        name: &'static str,
        size: usize,
        align: usize,
        ctor: Option<ObjectHook>,
        dtor: Option<ObjectHook>,
        backing: &'static dyn SlabBacking,
        retained_empty: usize,
    ) -> Result<Self, VmError> {
        let geometry = Geometry::compute(size, align.max(1)).ok_or(VmError::InvalidRange)?;
        let id = NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed);
        kdebug!(
            "kmem: cache {} (object {} stride {}, {} per {} KiB slab)",
            name,
            size,
            geometry.stride,
            geometry.capacity,
            geometry.slab_size / 1024
        );
        Ok(Self {
            name,
            id,
            object_size: size,
            geometry,
            ctor,
            dtor,
            backing,
            retained_empty,
            inner: SpinLock::leveled(
                "kmem_cache",
                lock_level::CACHE,
                CacheInner {
                    lists: [SlabList::new(), SlabList::new(), SlabList::new()],
                    objects_in_use: 0,
                    slabs: 0,
                    alloc_count: 0,
                    free_count: 0,
                },
            ),
        })
    }

    /// Returns the cache's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the object size.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Allocates an object, growing the cache by one slab if needed.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if a new slab is needed and the backing has no memory.
    pub fn alloc(&self) -> Result<NonNull<u8>, VmError> {
        let mut inner = self.inner.lock();
        let mut grew = false;
        let slab = match inner.first(ListKind::Partial).or(inner.first(ListKind::Empty)) {
            Some(slab) => slab,
            None => {
                grew = true;
                self.grow(&mut inner)?
            }
        };
        // SAFETY: `slab` is a live header of this cache with a free slot,
        // and the cache lock is held.
        let obj = unsafe { self.take_object(&mut inner, slab) };
        inner.objects_in_use += 1;
        inner.alloc_count += 1;
        let slabs = inner.slabs;
        drop(inner);

        if grew {
            ktrace!("kmem {}: grew to {} slabs", self.name, slabs);
        }
        Ok(obj)
    }

    /// Returns an object to the cache.
    ///
    /// # Errors
    ///
    /// `InvalidRange` if `ptr` is not an allocated object of this cache,
    /// including a second free of the same object.
    ///
    /// # Safety
    ///
    /// `ptr` must point into memory owned by a slab of some [`KmemCache`],
    /// and nothing may use the object after this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), VmError> {
        let g = self.geometry;
        let addr = ptr.as_ptr() as usize;
        let base = addr & !(g.slab_size - 1);
        let slab = (base + g.header_offset) as *mut SlabHeader;

        let mut inner = self.inner.lock();
        // SAFETY: Per the caller contract the masked address lies in slab
        // memory, and the header lies within the same slab-sized block.
        unsafe {
            if (*slab).magic != SLAB_MAGIC || (*slab).cache_id != self.id {
                return Err(VmError::InvalidRange);
            }
            let offset = addr - base;
            if offset % g.stride != 0 || offset / g.stride >= g.capacity {
                return Err(VmError::InvalidRange);
            }
            let index = offset / g.stride;
            let bufctl = self.bufctls(slab).add(index);
            if *bufctl != BUFCTL_ALLOCATED {
                return Err(VmError::InvalidRange);
            }

            if cfg!(hadron_debug_kmem_poison) && self.ctor.is_none() {
                poison_object(ptr.as_ptr(), self.object_size);
            }

            *bufctl = (*slab).free_head;
            (*slab).free_head = index as u16;
            (*slab).in_use -= 1;
            inner.objects_in_use -= 1;
            inner.free_count += 1;

            if (*slab).in_use == 0 {
                inner.move_to(slab, ListKind::Empty);
                if inner.lists[ListKind::Empty as usize].len > self.retained_empty {
                    self.release_slab(&mut inner, slab);
                }
            } else if (*slab).list == ListKind::Full {
                inner.move_to(slab, ListKind::Partial);
            }
        }
        Ok(())
    }

    /// Releases every empty slab, returning how many were released.
    pub fn reap(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut released = 0;
        while let Some(slab) = inner.first(ListKind::Empty) {
            // SAFETY: `slab` is an empty slab of this cache, lock held.
            unsafe { self.release_slab(&mut inner, slab) };
            released += 1;
        }
        drop(inner);
        if released != 0 {
            ktrace!("kmem {}: reaped {} slabs", self.name, released);
        }
        released
    }

    /// Releases all slabs.
    ///
    /// # Errors
    ///
    /// `Busy` while objects are still allocated.
    pub fn destroy(&self) -> Result<(), VmError> {
        if self.inner.lock().objects_in_use != 0 {
            return Err(VmError::Busy);
        }
        self.reap();
        kdebug!("kmem {}: destroyed", self.name);
        Ok(())
    }

    /// Returns the cache counters.
    pub fn stats(&self) -> KmemCacheStats {
        let inner = self.inner.lock();
        KmemCacheStats {
            name: self.name,
            object_size: self.object_size,
            stride: self.geometry.stride,
            slab_size: self.geometry.slab_size,
            objects_per_slab: self.geometry.capacity,
            slabs: inner.slabs,
            empty_slabs: inner.lists[ListKind::Empty as usize].len,
            objects_in_use: inner.objects_in_use,
            alloc_count: inner.alloc_count,
            free_count: inner.free_count,
        }
    }

    /// Logs the cache counters.
    pub fn dump(&self) {
        let s = self.stats();
        kdebug!(
            "kmem {}: {} objects in use, {} slabs ({} empty), {} allocs {} frees",
            s.name,
            s.objects_in_use,
            s.slabs,
            s.empty_slabs,
            s.alloc_count,
            s.free_count
        );
    }

    /// Returns the bufctl array of `slab`.
    ///
    /// # Safety
    ///
    /// `slab` must be a header laid out by this cache.
    unsafe fn bufctls(&self, slab: *mut SlabHeader) -> *mut u16 {
        unsafe { slab.cast::<u8>().add(size_of::<SlabHeader>()).cast::<u16>() }
    }

    /// Allocates and formats a new slab, placing it on the empty list.
    fn grow(&self, inner: &mut CacheInner) -> Result<*mut SlabHeader, VmError> {
        let g = self.geometry;
        let base = self
            .backing
            .alloc_slab(g.slab_size)
            .map_err(|_| VmError::OutOfMemory)?;
        debug_assert_eq!(base.as_ptr() as usize & (g.slab_size - 1), 0);

        // SAFETY: The backing hands over `slab_size` bytes exclusively; the
        // header and bufctls fit past the last object by construction.
        unsafe {
            let slab = base.as_ptr().add(g.header_offset).cast::<SlabHeader>();
            slab.write(SlabHeader {
                magic: SLAB_MAGIC,
                cache_id: self.id,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
                base: base.as_ptr(),
                in_use: 0,
                free_head: 0,
                list: ListKind::Empty,
            });
            let bufctls = self.bufctls(slab);
            for i in 0..g.capacity {
                let next = if i + 1 < g.capacity { (i + 1) as u16 } else { BUFCTL_END };
                bufctls.add(i).write(next);
                let obj = NonNull::new_unchecked(base.as_ptr().add(i * g.stride));
                if let Some(ctor) = self.ctor {
                    ctor(obj);
                } else if cfg!(hadron_debug_kmem_poison) {
                    poison_object(obj.as_ptr(), self.object_size);
                }
            }
            inner.list(ListKind::Empty).push(slab);
            inner.slabs += 1;
            Ok(slab)
        }
    }

    /// Pops a free slot from `slab`.
    ///
    /// # Safety
    ///
    /// `slab` must be a live header of this cache with a free slot, and the
    /// cache lock must be held.
    unsafe fn take_object(&self, inner: &mut CacheInner, slab: *mut SlabHeader) -> NonNull<u8> {
        let g = self.geometry;
        unsafe {
            let index = usize::from((*slab).free_head);
            debug_assert!(index < g.capacity);
            let bufctl = self.bufctls(slab).add(index);
            (*slab).free_head = *bufctl;
            *bufctl = BUFCTL_ALLOCATED;
            (*slab).in_use += 1;

            let target = if usize::from((*slab).in_use) == g.capacity {
                ListKind::Full
            } else {
                ListKind::Partial
            };
            if (*slab).list != target {
                inner.move_to(slab, target);
            }

            let obj = (*slab).base.add(index * g.stride);
            if cfg!(hadron_debug_kmem_poison)
                && self.ctor.is_none()
                && !check_object_poison(obj, self.object_size)
            {
                panic!("kmem {}: object {:p} modified after free", self.name, obj);
            }
            NonNull::new_unchecked(obj)
        }
    }

    /// Runs destructors over an empty slab and hands it back.
    ///
    /// # Safety
    ///
    /// `slab` must be an empty slab of this cache, lock held.
    unsafe fn release_slab(&self, inner: &mut CacheInner, slab: *mut SlabHeader) {
        let g = self.geometry;
        unsafe {
            let list = (*slab).list;
            inner.list(list).remove(slab);
            let base = (*slab).base;
            (*slab).magic = 0;
            if let Some(dtor) = self.dtor {
                for i in 0..g.capacity {
                    dtor(NonNull::new_unchecked(base.add(i * g.stride)));
                }
            }
            inner.slabs -= 1;
            self.backing.free_slab(NonNull::new_unchecked(base), g.slab_size);
        }
    }
}

impl fmt::Debug for KmemCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmemCache")
            .field("name", &self.name)
            .field("object_size", &self.object_size)
            .field("slab_size", &self.geometry.slab_size)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Typed caches
// ---------------------------------------------------------------------------

/// A cache of `T` values.
pub struct ObjectCache<T> {
    cache: KmemCache,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ObjectCache<T> {
    /// Creates a cache sized and aligned for `T`.
    ///
    /// # Errors
    ///
    /// `InvalidRange` if `T` is too large for a slab.
    pub fn new(
        name: &'static str,
        backing: &'static dyn SlabBacking,
        retained_empty: usize,
    ) -> Result<Self, VmError> {
        Ok(Self {
            cache: KmemCache::new(
                name,
                size_of::<T>().max(1),
                align_of::<T>(),
                None,
                None,
                backing,
                retained_empty,
            )?,
            _marker: PhantomData,
        })
    }

    /// Moves `value` into a fresh object.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the cache cannot grow.
    pub fn alloc(&'static self, value: T) -> Result<SlabBox<T>, VmError> {
        let ptr = self.cache.alloc()?.cast::<T>();
        // SAFETY: The slot is sized and aligned for `T` and unused.
        unsafe { ptr.as_ptr().write(value) };
        Ok(SlabBox { ptr, cache: self })
    }

    /// Returns the untyped cache.
    pub fn cache(&self) -> &KmemCache {
        &self.cache
    }
}

/// An owning pointer to a `T` in an [`ObjectCache`]; dropping it returns
/// the object to its cache.
pub struct SlabBox<T: 'static> {
    ptr: NonNull<T>,
    cache: &'static ObjectCache<T>,
}

// SAFETY: A SlabBox owns its `T` exclusively, like `Box<T>`.
unsafe impl<T: Send> Send for SlabBox<T> {}
unsafe impl<T: Sync> Sync for SlabBox<T> {}

impl<T> SlabBox<T> {
    /// Gives up ownership without dropping the value.
    pub fn into_raw(this: Self) -> NonNull<T> {
        let ptr = this.ptr;
        core::mem::forget(this);
        ptr
    }

    /// Retakes ownership of a pointer produced by [`SlabBox::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `into_raw` on a box of `cache` and must not be
    /// owned by anything else.
    pub unsafe fn from_raw(ptr: NonNull<T>, cache: &'static ObjectCache<T>) -> Self {
        Self { ptr, cache }
    }
}

impl<T> Deref for SlabBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The box owns an initialized `T`.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for SlabBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The box owns an initialized `T` exclusively.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for SlabBox<T> {
    fn drop(&mut self) {
        // SAFETY: The box owns the value and the slot came from `cache`.
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            if let Err(e) = self.cache.cache.free(self.ptr.cast()) {
                kerr!("kmem {}: free of {:p} failed: {}", self.cache.cache.name, self.ptr, e);
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SlabBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
