//! One-shot initialization cell for `no_std`.
//!
//! [`Once`] holds a value that is installed exactly once, at a point the
//! caller chooses, and read many times afterwards. Boot-time singletons with
//! a two-phase lifecycle (reserve at boot, open later) are built on it.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;

use super::loom_compat::{AtomicU8, Ordering, loom_const_fn};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// A cell that can be written once.
///
/// Unlike a lazy cell, the value is supplied explicitly with [`Once::set`]
/// rather than computed on first access. Readers never block: before the
/// value is ready [`Once::get`] returns `None`.
pub struct Once<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: The state machine publishes the value with Release and readers
// observe it with Acquire, so a `&T` is only handed out after the write.
unsafe impl<T: Send + Sync> Sync for Once<T> {}
unsafe impl<T: Send> Send for Once<T> {}

impl<T> Once<T> {
    loom_const_fn! {
        /// Creates an empty cell.
        pub fn new() -> Self {
            Self {
                state: AtomicU8::new(UNINIT),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            }
        }
    }

    /// Installs `value`, returning a reference to it.
    ///
    /// # Errors
    ///
    /// Returns the value back if the cell was already set (or is being set
    /// concurrently by another CPU).
    pub fn set(&self, value: T) -> Result<&T, T> {
        if self
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }
        // SAFETY: Winning the UNINIT -> INITIALIZING exchange gives this
        // caller exclusive access to the slot.
        unsafe { (*self.value.get()).write(value) };
        self.state.store(READY, Ordering::Release);
        // SAFETY: Just written.
        Ok(unsafe { (*self.value.get()).assume_init_ref() })
    }

    /// Returns the value if it has been installed.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: State is READY, so the value is fully initialized and
            // never written again.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Returns `true` once the value has been installed.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }
}

impl<T> Default for Once<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Once<T> {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY means the slot holds a live value, and `&mut self`
            // rules out concurrent readers.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Once<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(v) => f.debug_tuple("Once").field(v).finish(),
            None => f.write_str("Once(<uninit>)"),
        }
    }
}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;

    #[test]
    fn reader_sees_value_after_ready() {
        loom::model(|| {
            let cell = Arc::new(Once::new());
            let writer = Arc::clone(&cell);
            let t = loom::thread::spawn(move || {
                let _ = writer.set(5u32);
            });
            if let Some(v) = cell.get() {
                assert_eq!(*v, 5);
            }
            t.join().unwrap();
            assert_eq!(cell.get(), Some(&5));
        });
    }
}
