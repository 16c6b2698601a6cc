//! Page-table entry encoding.
//!
//! The one module that knows the hardware bit layout. Entries are modeled as
//! a single 64-bit bitfield covering the superset of all four levels, and
//! decoded into a tagged [`PageEntryKind`] instead of reinterpreting the
//! word through per-kind struct overlays. The bit positions are consumed by
//! the CPU's hardware walker, not by software; they must match exactly.

use bitfield_struct::bitfield;
use compat_memory_addresses::{PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K};

/// Physical-address bits of a non-leaf or 4 KiB-leaf entry (bits 51:12).
pub const ADDRESS_MASK_4K: u64 = 0x000F_FFFF_FFFF_F000;
/// Physical-address bits of a 2 MiB leaf (bits 51:21).
pub const ADDRESS_MASK_2M: u64 = 0x000F_FFFF_FFE0_0000;
/// Physical-address bits of a 1 GiB leaf (bits 51:30).
pub const ADDRESS_MASK_1G: u64 = 0x000F_FFFF_C000_0000;

/// Paging level an entry is interpreted at.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Level {
    /// Level 4, the root. Entries always point to a PDPT.
    Pml4,
    /// Level 3. `PS=1` entries are 1 GiB leaves.
    Pdpt,
    /// Level 2. `PS=1` entries are 2 MiB leaves.
    Pd,
    /// Level 1. Entries are always 4 KiB leaves.
    Pt,
}

/// Decoded view of a present entry at a given level.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageEntryKind {
    /// Non-leaf: 4 KiB-aligned physical base of the next-level table.
    Table(PhysicalPage<Size4K>),
    /// 4 KiB leaf (PT level).
    Leaf4K(PhysicalPage<Size4K>),
    /// 2 MiB leaf (PD level, `PS=1`).
    Leaf2M(PhysicalPage<Size2M>),
    /// 1 GiB leaf (PDPT level, `PS=1`).
    Leaf1G(PhysicalPage<Size1G>),
}

/// One 64-bit x86-64 page-table entry, superset layout.
///
/// | Bits  | Name | Meaning |
/// |-------|------|---------|
/// | 0     | P    | Present |
/// | 1     | RW   | Writable |
/// | 2     | US   | User-mode accessible |
/// | 3     | PWT  | Write-through caching |
/// | 4     | PCD  | Cache disable |
/// | 5     | A    | Accessed (set by CPU) |
/// | 6     | D    | Dirty (leaf only, set by CPU) |
/// | 7     | PS   | Huge-page leaf at L3/L2; PAT at L1 |
/// | 8     | G    | Global (leaf only) |
/// | 9-11  |      | OS-available |
/// | 12-51 | addr | Physical frame bits 51:12 |
/// | 52-62 |      | OS-available / protection key |
/// | 63    | NX   | No-execute |
///
/// Huge leaves repurpose the low address bits (PAT at bit 12, zero padding
/// up to the leaf alignment); reading a leaf base therefore goes through the
/// level mask, never the raw frame field.
#[bitfield(u64)]
pub struct PageEntryBits {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User/supervisor (bit 2); clear means supervisor-only.
    pub user_access: bool,
    /// Write-through caching (bit 3).
    pub write_through: bool,
    /// Cache disable (bit 4).
    pub cache_disabled: bool,
    /// Accessed (bit 5), set by the CPU.
    pub accessed: bool,
    /// Dirty (bit 6), set by the CPU on leaf writes.
    pub dirty: bool,
    /// Page-size / huge-page flag (bit 7).
    pub huge_page: bool,
    /// Global translation (bit 8).
    pub global_translation: bool,
    /// OS-available (bits 9-11).
    #[bits(3)]
    pub os_available_low: u8,
    /// Physical frame, bits 51:12.
    #[bits(40)]
    frame_51_12: u64,
    /// OS-available (bits 52-58).
    #[bits(7)]
    pub os_available_high: u8,
    /// Protection key (bits 59-62) when enabled; OS use otherwise.
    #[bits(4)]
    pub protection_key: u8,
    /// No-execute (bit 63).
    pub no_execute: bool,
}

impl PageEntryBits {
    /// Non-leaf entry pointing at `next`, present and writable.
    #[must_use]
    pub const fn new_table(next: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame_51_12(next.base().as_u64() >> 12)
    }

    /// 4 KiB leaf mapping `page`, present and writable.
    #[must_use]
    pub const fn new_leaf_4k(page: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame_51_12(page.base().as_u64() >> 12)
    }

    /// 2 MiB leaf mapping `page`, present, writable, `PS=1`.
    #[must_use]
    pub const fn new_leaf_2m(page: PhysicalPage<Size2M>) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_huge_page(true)
            .with_frame_51_12(page.base().as_u64() >> 12)
    }

    /// 1 GiB leaf mapping `page`, present, writable, `PS=1`.
    #[must_use]
    pub const fn new_leaf_1g(page: PhysicalPage<Size1G>) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_huge_page(true)
            .with_frame_51_12(page.base().as_u64() >> 12)
    }

    /// The 4 KiB frame stored in the address field, mask applied.
    ///
    /// Meaningful for non-leaf entries; also used to compare raw frames when
    /// probing for the aliased-root quirk.
    #[must_use]
    pub const fn table_frame(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.into_bits() & ADDRESS_MASK_4K))
    }

    /// Decode this entry as seen by the walker at `level`.
    ///
    /// Returns `None` for non-present entries. The huge-page bit selects
    /// between leaf and next-table forms at L3/L2; L1 entries are always
    /// leaves and L4 entries always tables.
    #[must_use]
    pub const fn decode(self, level: Level) -> Option<PageEntryKind> {
        if !self.present() {
            return None;
        }
        let bits = self.into_bits();
        Some(match level {
            Level::Pml4 => PageEntryKind::Table(Self::page_4k(bits)),
            Level::Pdpt => {
                if self.huge_page() {
                    PageEntryKind::Leaf1G(PhysicalPage::from_addr(PhysicalAddress::new(
                        bits & ADDRESS_MASK_1G,
                    )))
                } else {
                    PageEntryKind::Table(Self::page_4k(bits))
                }
            }
            Level::Pd => {
                if self.huge_page() {
                    PageEntryKind::Leaf2M(PhysicalPage::from_addr(PhysicalAddress::new(
                        bits & ADDRESS_MASK_2M,
                    )))
                } else {
                    PageEntryKind::Table(Self::page_4k(bits))
                }
            }
            Level::Pt => PageEntryKind::Leaf4K(Self::page_4k(bits)),
        })
    }

    const fn page_4k(bits: u64) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(bits & ADDRESS_MASK_4K))
    }
}
