use crate::page_size::PageSize;
use crate::{align_down, page::PhysicalPage};
use core::fmt;
use core::ops::{Add, AddAssign};

/// A **physical** memory address (machine bus address).
///
/// Newtype over `u64` to prevent mixing with virtual addresses. Carries no
/// alignment guarantee by itself; page-table entries require the low bits to
/// be zero and assert that where it matters.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

/// A **virtual** memory address.
///
/// Newtype over `u64` to prevent mixing with physical addresses.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, a: u64) -> bool {
        self.0 & (a - 1) == 0
    }

    /// The page of size `S` containing this address (aligns down).
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage::from_addr(self)
    }

    /// The in-page offset of this address for page size `S`.
    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }
}

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, a: u64) -> bool {
        self.0 & (a - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, a: u64) -> Self {
        Self(align_down(self.0, a))
    }

    /// The in-page offset of this address for page size `S`.
    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    /// Canonicalize by sign-extending bit 47 into bits 63:48.
    ///
    /// Addresses assembled from table indices or cursor arithmetic do not
    /// carry the extension; the CPU faults on non-canonical forms.
    #[inline]
    #[must_use]
    pub const fn canonical(self) -> Self {
        if self.0 & (1 << 47) != 0 {
            Self(self.0 | 0xFFFF_0000_0000_0000)
        } else {
            Self(self.0 & 0x0000_FFFF_FFFF_FFFF)
        }
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("PhysicalAddress add"))
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("VirtualAddress add"))
    }
}

impl AddAssign<u64> for PhysicalAddress {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl AddAssign<u64> for VirtualAddress {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl From<u64> for PhysicalAddress {
    fn from(addr: u64) -> Self {
        Self::new(addr)
    }
}

impl From<u64> for VirtualAddress {
    fn from(addr: u64) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalAddress({:#018x})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualAddress({:#018x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_size::{Size2M, Size4K};

    #[test]
    fn offsets_and_pages() {
        let pa = PhysicalAddress::new(0x0000_0008_1234_5678);
        assert_eq!(pa.offset::<Size4K>(), 0x678);
        assert_eq!(pa.page::<Size2M>().base().as_u64() & (Size2M::SIZE - 1), 0);
    }

    #[test]
    fn canonical_sign_extension() {
        let high = VirtualAddress::new(0x0000_8000_0000_0000);
        assert_eq!(high.canonical().as_u64(), 0xFFFF_8000_0000_0000);

        let low = VirtualAddress::new(0x0000_7FFF_FFFF_F000);
        assert_eq!(low.canonical(), low);
    }
}
