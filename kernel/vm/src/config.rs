//! Runtime tunables for the memory-management core.

/// Default direct-map base used when no boot-provided offset is known.
pub const DEFAULT_HHDM_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Offset of the kernel heap above the direct-map base.
const KERNEL_HEAP_OFFSET: u64 = 4 << 30;

/// Tunables passed to [`crate::context::Vm::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Spin iterations to wait for shootdown acknowledgments before the
    /// kernel halts.
    pub shootdown_timeout_spins: u64,
    /// Remote CPUs flush their whole TLB when a shootdown covers more pages
    /// than this.
    pub shootdown_flush_all_threshold: u64,
    /// Empty slabs each cache keeps instead of returning them.
    pub kmem_retained_empty_slabs: usize,
    /// Lowest address of user address spaces.
    pub user_base: u64,
    /// Size of user address spaces.
    pub user_size: u64,
    /// Lowest address of the kernel map.
    pub kernel_heap_base: u64,
    /// Size of the kernel map.
    pub kernel_heap_size: u64,
    /// Minimum span the kernel page arena imports from the frame table.
    pub kernel_import_quantum: u64,
}

impl VmConfig {
    /// Places the kernel heap relative to the boot-provided direct map.
    #[must_use]
    pub const fn with_hhdm(mut self, hhdm_offset: u64) -> Self {
        self.kernel_heap_base = hhdm_offset.wrapping_add(KERNEL_HEAP_OFFSET);
        self
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            shootdown_timeout_spins: 50_000_000,
            shootdown_flush_all_threshold: 32,
            kmem_retained_empty_slabs: 1,
            user_base: 0x800_0000_0000,
            user_size: 0x1_0000_0000,
            kernel_heap_base: DEFAULT_HHDM_BASE + KERNEL_HEAP_OFFSET,
            kernel_heap_size: 2 << 30,
            kernel_import_quantum: 64 * 1024,
        }
    }
}
