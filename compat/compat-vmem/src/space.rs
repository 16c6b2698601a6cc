//! Walking and mutating one PML4-rooted address space.

use crate::entry::{Level, PageEntryBits, PageEntryKind};
use crate::table::{ENTRIES_PER_TABLE, PageTable, TableIndex, split_indices};
use crate::{FrameAlloc, PhysMapper};
use compat_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress,
};
use log::trace;

/// Mapping failure: a missing intermediate table could not be allocated.
///
/// The scratch pool never grows; exhaustion ends the fix-up being attempted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory (PDPT)")]
    OutOfMemoryPdpt,
    #[error("out of memory (PD)")]
    OutOfMemoryPd,
    #[error("out of memory (PT)")]
    OutOfMemoryPt,
}

/// Handle to a single, concrete address space rooted at a PML4 frame.
///
/// The hierarchy stays a valid tree at every point during mutation: new
/// tables are fully populated before the parent entry is switched to point
/// at them, so the CPU (which is walking these tables while we edit) never
/// observes a half-built level.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Use an explicitly provided root frame.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// View the currently active address space by reading the root register.
    ///
    /// # Safety
    /// CPL0 with paging enabled; the register must point at a valid PML4.
    #[inline]
    pub unsafe fn from_current(mapper: &'m M) -> Self {
        let root = unsafe {
            use compat_registers::LoadRegisterUnsafe;
            compat_registers::cr3::Cr3::load_unsafe().root_phys()
        };
        Self::from_root(mapper, root.page())
    }

    /// Physical frame of the root table.
    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    fn table_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        // SAFETY: `page` is either the root or a frame this engine linked
        // into the hierarchy; both are mapped writable here.
        unsafe { self.mapper.phys_to_mut::<PageTable>(page.base()) }
    }

    /// Translate a virtual address against the live hierarchy.
    ///
    /// Terminates early at huge leaves, adding the level-appropriate in-page
    /// offset. `None` when any level on the walk is non-present.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (i4, i3, i2, i1) = split_indices(va);

        let pml4 = self.table_mut(self.root);
        let Some(PageEntryKind::Table(pdpt_page)) = pml4.get(i4).decode(Level::Pml4) else {
            return None;
        };

        let pdpt = self.table_mut(pdpt_page);
        match pdpt.get(i3).decode(Level::Pdpt)? {
            PageEntryKind::Leaf1G(page) => Some(page.join(va.offset::<Size1G>())),
            PageEntryKind::Table(pd_page) => {
                let pd = self.table_mut(pd_page);
                match pd.get(i2).decode(Level::Pd)? {
                    PageEntryKind::Leaf2M(page) => Some(page.join(va.offset::<Size2M>())),
                    PageEntryKind::Table(pt_page) => {
                        let pt = self.table_mut(pt_page);
                        match pt.get(i1).decode(Level::Pt)? {
                            PageEntryKind::Leaf4K(page) => Some(page.join(va.offset::<Size4K>())),
                            _ => None,
                        }
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Ensure a 4 KiB leaf maps `va` to `pa`, building intermediate tables
    /// from `alloc` as needed.
    ///
    /// Huge leaves in the way are split to the finer granularity with their
    /// translation preserved; only the requested page changes meaning. The
    /// caller flushes translation caches once per batch.
    ///
    /// # Errors
    /// [`MapError`] when a needed table frame cannot be allocated. Already
    /// performed table work is kept; the hierarchy stays valid.
    pub fn map_page<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
    ) -> Result<(), MapError> {
        let (i4, i3, i2, i1) = split_indices(va);
        let pml4 = self.table_mut(self.root);

        // Some firmware roots alias a high PML4 slot to the same frame as
        // slot 0 (seen on VirtualBox and DUET descendants). Rebuilding
        // through the shared frame would rewrite the first gigabyte's
        // identity mapping out from under the running firmware, so the
        // stale slot is cleared and rebuilt fresh.
        if i4.as_usize() != 0 {
            let e0 = pml4.get(TableIndex::new(0));
            let e4 = pml4.get(i4);
            if e4.present() && e4.table_frame() == e0.table_frame() {
                trace!("clearing aliased PML4 slot {}", i4.as_usize());
                pml4.set(i4, PageEntryBits::new());
            }
        }

        // L4 -> L3
        let pdpt_page = match pml4.get(i4).decode(Level::Pml4) {
            Some(PageEntryKind::Table(p)) => p,
            _ => {
                let frame = alloc.alloc_4k().ok_or(MapError::OutOfMemoryPdpt)?;
                let pdpt = self.table_mut(frame);
                pdpt.zero();
                if i4.as_usize() == 0 {
                    // This table spans the low 512 GiB; keep every address
                    // not explicitly remapped translating in place.
                    Self::fill_identity_1g(pdpt);
                }
                pml4.set(i4, PageEntryBits::new_table(frame));
                frame
            }
        };

        // L3 -> L2, splitting a 1 GiB leaf if one is in the way.
        let pdpt = self.table_mut(pdpt_page);
        let pd_page = match pdpt.get(i3).decode(Level::Pdpt) {
            Some(PageEntryKind::Table(p)) => p,
            other => {
                let frame = alloc.alloc_4k().ok_or(MapError::OutOfMemoryPd)?;
                let pd = self.table_mut(frame);
                pd.zero();
                if let Some(PageEntryKind::Leaf1G(old)) = other {
                    Self::fill_split_2m(pd, old.base());
                }
                pdpt.set(i3, PageEntryBits::new_table(frame));
                frame
            }
        };

        // L2 -> L1, splitting a 2 MiB leaf if one is in the way.
        let pd = self.table_mut(pd_page);
        let pt_page = match pd.get(i2).decode(Level::Pd) {
            Some(PageEntryKind::Table(p)) => p,
            other => {
                let frame = alloc.alloc_4k().ok_or(MapError::OutOfMemoryPt)?;
                let pt = self.table_mut(frame);
                pt.zero();
                if let Some(PageEntryKind::Leaf2M(old)) = other {
                    Self::fill_split_4k(pt, old.base());
                }
                pd.set(i2, PageEntryBits::new_table(frame));
                frame
            }
        };

        // L1: install the requested leaf.
        let pt = self.table_mut(pt_page);
        pt.set(i1, PageEntryBits::new_leaf_4k(pa.page::<Size4K>()));
        Ok(())
    }

    /// Map `page_count` consecutive 4 KiB pages starting at `va` to `pa`.
    ///
    /// Best-effort bring-up routine: stops at the first failure, leaving the
    /// earlier pages mapped.
    ///
    /// # Errors
    /// The first [`MapError`] encountered.
    pub fn map_range<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        page_count: u64,
    ) -> Result<(), MapError> {
        let mut va = va;
        let mut pa = pa;
        for _ in 0..page_count {
            self.map_page(alloc, va, pa)?;
            va += Size4K::SIZE;
            pa += Size4K::SIZE;
        }
        Ok(())
    }

    /// 512 identity 1 GiB leaves covering physical 0..512 GiB.
    fn fill_identity_1g(table: &mut PageTable) {
        let mut base = PhysicalAddress::new(0);
        for i in 0..ENTRIES_PER_TABLE {
            #[allow(clippy::cast_possible_truncation)]
            let idx = TableIndex::new(i as u16);
            table.set(idx, PageEntryBits::new_leaf_1g(base.page::<Size1G>()));
            base += Size1G::SIZE;
        }
    }

    /// 512 2 MiB leaves reproducing a former 1 GiB leaf at `base`.
    fn fill_split_2m(table: &mut PageTable, base: PhysicalAddress) {
        let mut base = base;
        for i in 0..ENTRIES_PER_TABLE {
            #[allow(clippy::cast_possible_truncation)]
            let idx = TableIndex::new(i as u16);
            table.set(idx, PageEntryBits::new_leaf_2m(base.page::<Size2M>()));
            base += Size2M::SIZE;
        }
    }

    /// 512 4 KiB leaves reproducing a former 2 MiB leaf at `base`.
    fn fill_split_4k(table: &mut PageTable, base: PhysicalAddress) {
        let mut base = base;
        for i in 0..ENTRIES_PER_TABLE {
            #[allow(clippy::cast_possible_truncation)]
            let idx = TableIndex::new(i as u16);
            table.set(idx, PageEntryBits::new_leaf_4k(base.page::<Size4K>()));
            base += Size4K::SIZE;
        }
    }
}
