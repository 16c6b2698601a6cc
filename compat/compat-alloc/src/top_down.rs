use compat_memory_addresses::{PhysicalAddress, pages_to_bytes};
use uefi_raw::table::boot::{MemoryDescriptor, MemoryType};

/// Pick the placement for a top-down allocation of `pages` pages below
/// `ceiling`.
///
/// Considers every conventional-memory descriptor and returns the highest
/// base that fits: the top of a block lying entirely under the ceiling, or
/// flush against the ceiling for a block straddling it. `None` when nothing
/// fits.
///
/// The caller still has to claim the returned address from the firmware
/// (allocate-at-address); the map may be stale by then and the claim can
/// fail, which callers treat like any other allocation failure.
pub fn find_allocation_from_top<'a>(
    descriptors: impl Iterator<Item = &'a MemoryDescriptor>,
    pages: u64,
    ceiling: PhysicalAddress,
) -> Option<PhysicalAddress> {
    let size = pages_to_bytes(pages);
    let ceiling = ceiling.as_u64();

    descriptors
        .filter_map(|desc| {
            if desc.ty != MemoryType::CONVENTIONAL || desc.page_count < pages {
                return None;
            }

            let start = desc.phys_start;
            let top = start + pages_to_bytes(desc.page_count);
            if start + size > ceiling {
                return None;
            }

            Some(if top <= ceiling {
                // Whole block under the ceiling: allocate from its top.
                top - size
            } else {
                // Block straddles the ceiling: allocate right below it.
                ceiling - size
            })
        })
        .max()
        .map(PhysicalAddress::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use compat_mmap::MemoryMapView;
    use uefi_raw::table::boot::MemoryAttribute;

    const STRIDE: usize = 48;

    fn build(entries: &[(MemoryType, u64, u64)]) -> (Vec<u64>, usize) {
        let map_size = entries.len() * STRIDE;
        let mut words = vec![0u64; map_size.div_ceil(8)];
        let base = words.as_mut_ptr().cast::<u8>();
        for (i, &(ty, phys_start, page_count)) in entries.iter().enumerate() {
            let d = MemoryDescriptor {
                ty,
                phys_start,
                virt_start: 0,
                page_count,
                att: MemoryAttribute::empty(),
            };
            // SAFETY: in-bounds, stride-aligned writes into the u64 backing.
            unsafe {
                core::ptr::write(base.add(i * STRIDE).cast::<MemoryDescriptor>(), d);
            }
        }
        (words, map_size)
    }

    fn view(words: &mut [u64], map_size: usize) -> MemoryMapView<'_> {
        let len = words.len() * 8;
        // SAFETY: u64 backing guarantees descriptor alignment.
        let bytes =
            unsafe { core::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), len) };
        MemoryMapView::new(bytes, map_size, STRIDE).unwrap()
    }

    #[test]
    fn picks_highest_block_under_ceiling() {
        let (mut words, size) = build(&[
            (MemoryType::CONVENTIONAL, 0x10_0000, 256),
            (MemoryType::BOOT_SERVICES_DATA, 0x8000_0000, 256),
            (MemoryType::CONVENTIONAL, 0x9000_0000, 256),
        ]);
        let map = view(&mut words, size);

        let at = find_allocation_from_top(map.iter(), 16, PhysicalAddress::new(0x1_0000_0000))
            .unwrap();
        // Top of the highest conventional block, minus the allocation.
        assert_eq!(at.as_u64(), 0x9010_0000 - 16 * 4096);
    }

    #[test]
    fn straddling_block_allocates_below_ceiling() {
        let (mut words, size) = build(&[(MemoryType::CONVENTIONAL, 0xFFF0_0000, 512)]);
        let map = view(&mut words, size);

        let at = find_allocation_from_top(map.iter(), 16, PhysicalAddress::new(0x1_0000_0000))
            .unwrap();
        assert_eq!(at.as_u64(), 0x1_0000_0000 - 16 * 4096);
    }

    #[test]
    fn no_fit_returns_none() {
        let (mut words, size) = build(&[
            (MemoryType::CONVENTIONAL, 0x10_0000, 8),
            (MemoryType::RESERVED, 0x9000_0000, 4096),
        ]);
        let map = view(&mut words, size);

        // Too many pages for the only conventional block.
        assert!(
            find_allocation_from_top(map.iter(), 16, PhysicalAddress::new(0x1_0000_0000))
                .is_none()
        );
        // Ceiling below every block.
        assert!(find_allocation_from_top(map.iter(), 4, PhysicalAddress::new(0x1000)).is_none());
    }
}
