//! Core types and synchronization primitives for the Hadron kernel.
//!
//! This crate contains the host-testable pieces every kernel subsystem
//! leans on: typed addresses, page-size markers, the CPU identity hook,
//! spin locks with lock levels, one-shot cells for boot-time singletons,
//! and the leveled logging macros.
//!
//! By living outside the kernel crate, these types can be tested with
//! `cargo test` and loom on the host without a kernel target.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod addr;
pub mod cpu;
pub mod log;
pub mod paging;
pub mod sync;
