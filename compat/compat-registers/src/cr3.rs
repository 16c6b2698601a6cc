use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use compat_memory_addresses::PhysicalAddress;

/// CR3, the root page-table base register (IA-32e, PCID disabled).
///
/// Holds the physical base address of the level-4 table and the two
/// cache-control flags that apply to walks of that table.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0-2: reserved, must be 0.
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3 (PWT): write-through caching for root-table accesses.
    pub pwt: bool,

    /// Bit 4 (PCD): cache disable for root-table accesses.
    pub pcd: bool,

    /// Bits 5-11: reserved, must be 0 when written.
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12-51: root-table physical base >> 12.
    #[bits(40)]
    root_base_4k: u64,

    /// Bits 52-63: reserved.
    #[bits(12)]
    pub reserved2: u16,
}

impl Cr3 {
    /// Full physical address of the level-4 table.
    #[must_use]
    pub const fn root_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.root_base_4k() << 12)
    }

    /// Build a `Cr3` value from a 4 KiB-aligned root-table base and flags.
    #[must_use]
    pub fn from_root_phys(root: PhysicalAddress, pwt: bool, pcd: bool) -> Self {
        debug_assert!(root.is_aligned_to(4096), "root table must be 4K-aligned");
        Self::new()
            .with_pwt(pwt)
            .with_pcd(pcd)
            .with_root_base_4k(root.as_u64() >> 12)
    }

    /// Write CR3 back with its current value.
    ///
    /// Discards all non-global cached translations; the one flush primitive
    /// the paging code uses after a batch of mapping changes.
    ///
    /// # Safety
    /// Requires CPL0 with paging enabled; the live hierarchy must be valid.
    #[cfg(feature = "asm")]
    pub unsafe fn reload() {
        unsafe {
            Self::load_unsafe().store_unsafe();
        }
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_base_round_trips() {
        let root = PhysicalAddress::new(0x0000_0000_0012_3000);
        let cr3 = Cr3::from_root_phys(root, false, false);
        assert_eq!(cr3.root_phys(), root);
        assert!(!cr3.pwt());
        assert!(!cr3.pcd());
    }

    #[test]
    fn flags_do_not_leak_into_base() {
        let root = PhysicalAddress::new(0x0000_000F_FFFF_F000);
        let cr3 = Cr3::from_root_phys(root, true, true);
        assert_eq!(cr3.root_phys(), root);
        assert_eq!(cr3.into_bits() & 0x18, 0x18);
    }
}
