//! Page size markers.
//!
//! The VM core works in 4 KiB pages; the larger sizes exist so the
//! page-table shim can describe huge leaf mappings.

/// Trait for hardware page sizes.
pub trait PageSize: Copy + Eq + Ord {
    /// The size in bytes.
    const SIZE: u64;
    /// Human-readable size string for debug output.
    const NAME: &'static str;

    /// Rounds `bytes` up to a whole number of pages.
    #[inline]
    fn round_up(bytes: u64) -> u64 {
        (bytes + Self::SIZE - 1) & !(Self::SIZE - 1)
    }

    /// Returns the number of pages needed to hold `bytes`.
    #[inline]
    fn pages_for(bytes: u64) -> u64 {
        Self::round_up(bytes) / Self::SIZE
    }
}

/// 4 KiB page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size4KiB;

impl PageSize for Size4KiB {
    const SIZE: u64 = 4096;
    const NAME: &'static str = "4KiB";
}

/// 2 MiB page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size2MiB;

impl PageSize for Size2MiB {
    const SIZE: u64 = 0x20_0000;
    const NAME: &'static str = "2MiB";
}

/// 1 GiB page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size1GiB;

impl PageSize for Size1GiB {
    const SIZE: u64 = 0x4000_0000;
    const NAME: &'static str = "1GiB";
}
