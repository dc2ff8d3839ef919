//! Synchronization primitives for the kernel.
//!
//! Provides [`SpinLock`] (with optional lock levels for ordering checks)
//! and [`Once`] for boot-time singletons. Both are const-constructable so
//! they can live in `static` items and are usable before any allocator or
//! scheduler exists.

mod once;
mod spinlock;

pub(crate) mod loom_compat;

pub use once::Once;
pub use spinlock::{SpinLock, SpinLockGuard};
