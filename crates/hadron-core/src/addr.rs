//! Typed virtual and physical address wrappers.
//!
//! [`VirtAddr`] and [`PhysAddr`] keep the two address spaces apart at the
//! type level. The VM core converts between them only through the HHDM.

use core::fmt;
use core::ops::{Add, Sub};

/// Physical address space mask: bits 0..51.
const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_FFFF;

/// Mask for the 12-bit page offset.
const PAGE_OFFSET_MASK: u64 = 0xFFF;

/// Mask for one 9-bit radix-table index.
const TABLE_INDEX_MASK: u64 = 0x1FF;

/// A canonical 64-bit virtual address.
///
/// Bits 48..63 are always a sign-extension of bit 47.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

/// A 64-bit physical address (at most 52 significant bits).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl VirtAddr {
    /// Creates a new `VirtAddr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not canonical.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        let canonical = Self::new_truncate(addr);
        assert!(canonical.0 == addr, "VirtAddr::new: address is not canonical");
        canonical
    }

    /// Creates a new `VirtAddr`, sign-extending bit 47 into the upper bits.
    #[inline]
    pub const fn new_truncate(addr: u64) -> Self {
        Self(((addr << 16) as i64 >> 16) as u64)
    }

    /// Returns the zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u64` value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Converts this address to a raw pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts this address to a raw mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns `true` if the address is a multiple of `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to `align` (a power of two).
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        Self::new_truncate(self.0 & !(align - 1))
    }

    /// Aligns the address up to `align` (a power of two).
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        Self::new_truncate((self.0 + align - 1) & !(align - 1))
    }

    /// Returns the offset inside the containing 4 KiB page.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    /// Returns the radix-table index for `level`, where level 0 is the
    /// leaf table and level 3 the root of a 4-level walk.
    #[inline]
    pub const fn table_index(self, level: u32) -> usize {
        ((self.0 >> (12 + 9 * level)) & TABLE_INDEX_MASK) as usize
    }

    /// Adds `rhs` bytes, returning `None` on overflow of the raw value.
    #[inline]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self::new_truncate(v)),
            None => None,
        }
    }
}

impl Add<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self::new_truncate(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self {
        Self::new_truncate(self.0.wrapping_sub(rhs))
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: VirtAddr) -> u64 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

// ---------------------------------------------------------------------------
// PhysAddr
// ---------------------------------------------------------------------------

impl PhysAddr {
    /// Creates a new `PhysAddr`. Debug builds reject bits above 52.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        let masked = addr & PHYS_ADDR_MASK;
        debug_assert!(masked == addr, "PhysAddr::new: address exceeds 52 bits");
        Self(masked)
    }

    /// Creates a new `PhysAddr`, discarding bits above 52.
    #[inline]
    pub const fn new_truncate(addr: u64) -> Self {
        Self(addr & PHYS_ADDR_MASK)
    }

    /// Returns the zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u64` value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` if the address is a multiple of `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to `align` (a power of two).
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Aligns the address up to `align` (a power of two).
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }

    /// Returns the 4 KiB frame number containing this address.
    #[inline]
    pub const fn frame_number(self) -> u64 {
        self.0 >> 12
    }
}

impl Add<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self::new(self.0 + rhs)
    }
}

impl Sub<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self {
        Self::new(self.0 - rhs)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: PhysAddr) -> u64 {
        self.0 - rhs.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_addr_truncate_high_half() {
        let addr = VirtAddr::new_truncate(0x0000_8000_0000_0000);
        assert_eq!(addr.as_u64(), 0xFFFF_8000_0000_0000);
    }

    #[test]
    #[should_panic(expected = "not canonical")]
    fn virt_addr_rejects_non_canonical() {
        let _ = VirtAddr::new(0x0000_8000_0000_0000);
    }

    #[test]
    fn virt_addr_alignment() {
        let addr = VirtAddr::new(0x1234);
        assert!(!addr.is_aligned(4096));
        assert_eq!(addr.align_down(4096).as_u64(), 0x1000);
        assert_eq!(addr.align_up(4096).as_u64(), 0x2000);
        assert_eq!(addr.page_offset(), 0x234);
    }

    #[test]
    fn virt_addr_table_indices() {
        let addr = VirtAddr::new(0xFFFF_8000_0020_1000);
        assert_eq!(addr.table_index(3), 256);
        assert_eq!(addr.table_index(2), 0);
        assert_eq!(addr.table_index(1), 1);
        assert_eq!(addr.table_index(0), 1);
    }

    #[test]
    fn virt_addr_arithmetic() {
        let a = VirtAddr::new(0x2000);
        assert_eq!((a + 0x500).as_u64(), 0x2500);
        assert_eq!((a - 0x500).as_u64(), 0x1B00);
        assert_eq!(a - VirtAddr::new(0x1000), 0x1000);
        assert!(VirtAddr::new_truncate(u64::MAX).checked_add(1).is_none());
    }

    #[test]
    fn phys_addr_truncate_and_frames() {
        assert_eq!(PhysAddr::new_truncate(u64::MAX).as_u64(), PHYS_ADDR_MASK);
        let addr = PhysAddr::new(0x3456);
        assert_eq!(addr.align_down(4096).as_u64(), 0x3000);
        assert_eq!(addr.align_up(4096).as_u64(), 0x4000);
        assert_eq!(addr.frame_number(), 3);
    }
}
