//! Physical and Virtual Memory Addressing Schemes.
//!
//! This module provides the two address types the virtual memory subsystem
//! manipulates: [`Va`] for a virtual address of some address space, and
//! [`Pa`] for a physical address of a frame owned by the physical allocator.
//! Both are thin `usize` wrappers that support the arithmetic needed for page
//! rounding and offset computation.
//!
//! The virtual address space is split in the usual x86_64 way: canonical
//! addresses below [`USER_END`] belong to user processes, canonical addresses
//! at or above [`KERNEL_BASE`] belong to the kernel. Everything in between is
//! non-canonical and can never be constructed as a [`Va`].
//!
//! ## Example Usage:
//!
//! ```
//! use keos::addressing::{Va, PAGE_SIZE};
//!
//! let va = Va::new(0x1234).unwrap();
//! assert_eq!(va.page_down().into_usize(), 0x1000);
//! assert_eq!(va.offset(), 0x234);
//! assert_eq!((va.page_down() + PAGE_SIZE).into_usize(), 0x2000);
//! ```

/// The size of a single page in memory, in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page index from a given address.
pub const PAGE_SHIFT: usize = 12; // 12 bits (log2 of 4 KB)

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// First address past the user half of the address space.
pub const USER_END: usize = 0x0000_8000_0000_0000;

/// First address of the kernel half of the address space.
pub const KERNEL_BASE: usize = 0xffff_8000_0000_0000;

/// The top of the user stack. The stack grows downward from here.
pub const USER_STACK: usize = 0x4748_0000;

/// The maximum size of the user stack, in bytes.
///
/// Faults below `USER_STACK - MAX_STACK_SIZE` are never treated as stack
/// growth.
pub const MAX_STACK_SIZE: usize = 1 << 20;

/// Represents a physical address.
///
/// In the hosted kernel, a physical address names a frame inside the pool of
/// the physical allocator (see [`crate::mm::Palloc`]).
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// The physical address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new physical address if the address is valid.
    ///
    /// The address must be less than `0xffff_0000_0000_0000`.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast the address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Rounds down to the containing page.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Offset within the page.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a virtual address.
///
/// Only canonical addresses can be represented.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is canonical.
    ///
    /// # Returns
    /// - `Some(Va)` if the upper 17 bits are all zero or all one.
    /// - `None` otherwise.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Cast the address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Rounds down to the containing page.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Rounds up to the next page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Offset within the page.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Returns `true` if the address is page aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Returns `true` if the address is a non-null user address.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 != 0 && self.0 < USER_END
    }

    /// Returns `true` if the address lies in the kernel half.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNEL_BASE
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 += other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 -= other
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_check() {
        assert!(Va::new(0x1000).is_some());
        assert!(Va::new(0xffff_8000_0000_1000).is_some());
        assert!(Va::new(0x0000_8000_0000_0000).is_none());
        assert!(Va::new(0x1234_0000_0000_0000).is_none());
    }

    #[test]
    fn user_and_kernel_halves() {
        assert!(!Va::new(0).unwrap().is_user());
        assert!(Va::new(USER_STACK - 8).unwrap().is_user());
        assert!(Va::new(USER_END - 1).unwrap().is_user());
        let k = Va::new(KERNEL_BASE).unwrap();
        assert!(k.is_kernel() && !k.is_user());
    }

    #[test]
    fn rounding() {
        let va = Va::new(0x4747_fff8).unwrap();
        assert_eq!(va.page_down(), Va::new(0x4747_f000).unwrap());
        assert_eq!(va.page_up(), Va::new(0x4748_0000).unwrap());
        assert_eq!(va.offset(), 0xff8);
        assert!(!va.is_aligned() && va.page_down().is_aligned());
    }
}
