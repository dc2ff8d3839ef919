//! Spin-based mutual exclusion lock with optional lock levels.
//!
//! Uses test-and-test-and-set (TTAS) to reduce cache-line contention.
//!
//! A lock built with [`SpinLock::leveled`] carries a level in `1..32`.
//! Locks must be taken in strictly increasing level order; with
//! `cfg(hadron_lock_debug)` each acquisition checks this against the levels
//! the executing CPU already holds and panics on an inversion. Level 0
//! means "not tracked".

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

use super::loom_compat::{AtomicBool, Ordering, loom_const_fn};

/// A spin-based mutual exclusion lock.
///
/// Const-constructable so it can be placed in `static` items.
pub struct SpinLock<T> {
    locked: AtomicBool,
    name: &'static str,
    level: u8,
    data: UnsafeCell<T>,
}

// SAFETY: The SpinLock ensures exclusive access to `T` via atomic operations.
// `T: Send` is required because the data may be accessed from different threads.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    loom_const_fn! {
        /// Creates a new unlocked, untracked `SpinLock` wrapping `value`.
        pub fn new(value: T) -> Self {
            Self {
                locked: AtomicBool::new(false),
                name: "<unnamed>",
                level: 0,
                data: UnsafeCell::new(value),
            }
        }
    }

    loom_const_fn! {
        /// Creates a new unlocked, untracked `SpinLock` with a diagnostic name.
        pub fn named(name: &'static str, value: T) -> Self {
            Self {
                locked: AtomicBool::new(false),
                name,
                level: 0,
                data: UnsafeCell::new(value),
            }
        }
    }

    loom_const_fn! {
        /// Creates a new unlocked `SpinLock` at lock level `level` (`1..32`).
        pub fn leveled(name: &'static str, level: u8, value: T) -> Self {
            assert!(level < 32, "SpinLock level out of range");
            Self {
                locked: AtomicBool::new(false),
                name,
                level,
                data: UnsafeCell::new(value),
            }
        }
    }

    /// Returns the diagnostic name of this lock.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the lock level (0 if untracked).
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Acquires the lock, spinning until it becomes available.
    ///
    /// Returns a [`SpinLockGuard`] that releases the lock when dropped.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        #[cfg(hadron_lock_debug)]
        held::check(self.name, self.level);

        loop {
            // Fast path: try to acquire directly.
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                #[cfg(hadron_lock_debug)]
                held::mark(self.level);
                return SpinLockGuard { lock: self };
            }

            // TTAS: spin on a read (shared cache line) until it looks free.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Returns `None` if the lock is already held. Never violates lock
    /// ordering, so no level check is made.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            #[cfg(hadron_lock_debug)]
            held::mark(self.level);
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Returns `true` if the lock is currently held by someone.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Returns a mutable reference to the data without going through the lock.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Returns a mutable reference to the underlying data without acquiring the lock.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other code is concurrently accessing the data.
    /// Intended as a last-resort escape hatch (e.g., panic handler on a uniprocessor).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn force_get(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// RAII guard that releases the [`SpinLock`] when dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(hadron_lock_debug)]
        held::unmark(self.lock.level);
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Per-CPU record of the lock levels currently held.
///
/// Host tests run every thread as CPU 0, so the check is only meaningful
/// there for single-threaded tests.
#[cfg(hadron_lock_debug)]
mod held {
    use core::sync::atomic::{AtomicU32, Ordering};

    use crate::cpu::{MAX_CPUS, current_cpu};

    static HELD: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(0) }; MAX_CPUS];

    fn slot() -> &'static AtomicU32 {
        &HELD[current_cpu() as usize % MAX_CPUS]
    }

    pub(super) fn check(name: &'static str, level: u8) {
        if level == 0 {
            return;
        }
        let held = slot().load(Ordering::Relaxed);
        let at_or_above = !((1u32 << level) - 1);
        if held & at_or_above != 0 {
            panic!(
                "lock order violation: {name} (level {level}) acquired while holding level {}",
                31 - held.leading_zeros()
            );
        }
    }

    pub(super) fn mark(level: u8) {
        if level != 0 {
            slot().fetch_or(1 << level, Ordering::Relaxed);
        }
    }

    pub(super) fn unmark(level: u8) {
        if level != 0 {
            slot().fetch_and(!(1 << level), Ordering::Relaxed);
        }
    }
}
