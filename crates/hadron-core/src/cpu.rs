//! CPU identity and CPU sets.
//!
//! The architecture layer registers a function returning the executing
//! core's index via [`register_cpu_id_fn`]. Before registration every
//! caller is treated as CPU 0, which is correct for early boot and for
//! host tests.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Maximum supported CPUs. [`CpuSet`] is a single 64-bit mask.
pub const MAX_CPUS: usize = 64;

/// Signature of the registered CPU-id function.
pub type CpuIdFn = fn() -> u32;

fn boot_cpu_id() -> u32 {
    0
}

static CPU_ID_FN: AtomicPtr<()> = AtomicPtr::new(boot_cpu_id as CpuIdFn as *mut ());

/// Registers the architecture's "which core am I" function.
pub fn register_cpu_id_fn(f: CpuIdFn) {
    CPU_ID_FN.store(f as *mut (), Ordering::Release);
}

/// Returns the index of the executing CPU.
#[inline]
pub fn current_cpu() -> u32 {
    let ptr = CPU_ID_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `CpuIdFn` pointers (or the initial `boot_cpu_id`)
    // are ever stored into CPU_ID_FN.
    let f: CpuIdFn = unsafe { core::mem::transmute(ptr) };
    f()
}

/// A set of CPUs, one bit per CPU index.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet(u64);

impl CpuSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Creates a set from its raw bit mask.
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the set containing CPUs `0..count`.
    #[inline]
    pub const fn first(count: u32) -> Self {
        if count as usize >= MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    /// Returns the set containing only `cpu`.
    #[inline]
    pub const fn single(cpu: u32) -> Self {
        Self(1u64 << cpu)
    }

    /// Returns the raw bit mask.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns `true` if `cpu` is in the set.
    #[inline]
    pub const fn contains(self, cpu: u32) -> bool {
        self.0 & (1u64 << cpu) != 0
    }

    /// Returns `true` if the set is empty.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns this set with `cpu` removed.
    #[inline]
    #[must_use]
    pub const fn without(self, cpu: u32) -> Self {
        Self(self.0 & !(1u64 << cpu))
    }

    /// Returns this set with `cpu` added.
    #[inline]
    #[must_use]
    pub const fn with(self, cpu: u32) -> Self {
        Self(self.0 | (1u64 << cpu))
    }

    /// Iterates the CPU indices in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u32> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let cpu = bits.trailing_zeros();
            bits &= bits - 1;
            Some(cpu)
        })
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_cpu_is_zero() {
        assert_eq!(current_cpu(), 0);
    }

    #[test]
    fn set_operations() {
        let set = CpuSet::first(3);
        assert_eq!(set.bits(), 0b111);
        assert!(set.contains(2));
        assert!(!set.without(2).contains(2));
        assert_eq!(set.without(0).iter().collect::<Vec<_>>(), vec![1, 2]);
        assert!(CpuSet::EMPTY.with(5).contains(5));
        assert_eq!(CpuSet::first(64).bits(), u64::MAX);
    }
}
