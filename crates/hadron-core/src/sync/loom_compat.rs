//! Loom compatibility shim.
//!
//! Under `cfg(loom)` the sync primitives use loom's atomics so their
//! orderings are checked by loom's model checker; otherwise the plain
//! `core::sync::atomic` types are used.
//!
//! Loom atomics cannot be built in a `const fn`, so constructors are
//! declared through [`loom_const_fn!`], which drops `const` under loom.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[cfg(not(loom))]
pub(crate) use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Declares a function that is `const` except under `cfg(loom)`.
macro_rules! loom_const_fn {
    (
        $(#[$meta:meta])*
        $vis:vis fn $name:ident ( $($arg:ident : $ty:ty),* $(,)? ) -> $ret:ty $body:block
    ) => {
        #[cfg(not(loom))]
        $(#[$meta])*
        $vis const fn $name($($arg: $ty),*) -> $ret $body

        #[cfg(loom)]
        $(#[$meta])*
        $vis fn $name($($arg: $ty),*) -> $ret $body
    };
}

pub(crate) use loom_const_fn;
