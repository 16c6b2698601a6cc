//! Map-level fixes applied on the loader's behalf.

use crate::KERNEL_SPACE_BASE;
use crate::view::MemoryMapView;
use compat_memory_addresses::{VirtualAddress, pages_to_bytes};
use log::debug;
use uefi_raw::table::boot::{MemoryAttribute, MemoryType};

/// Start of the legacy wake range some boards misdescribe.
const WAKE_RANGE_BOTTOM: u64 = 0x9_E000;
/// End (exclusive) of the legacy wake range.
const WAKE_RANGE_TOP: u64 = 0xA_0000;

/// Free-or-freeable region types eligible for merging.
fn is_coalescable(ty: MemoryType) -> bool {
    ty == MemoryType::BOOT_SERVICES_CODE
        || ty == MemoryType::BOOT_SERVICES_DATA
        || ty == MemoryType::CONVENTIONAL
}

/// Merge adjacent descriptors in place.
///
/// Two neighbors merge when their attribute bits are identical, the first
/// region ends exactly where the second begins, and both carry a
/// free-or-freeable type (boot-services code/data or conventional memory).
/// Survivors keep the leading descriptor's type. The pass is idempotent and
/// never changes the total page count, only the descriptor count.
pub fn shrink(map: &mut MemoryMapView) {
    if map.is_empty() {
        return;
    }

    let before = map.len();
    let mut write = 0;

    for read in 1..map.len() {
        let cur = *map.get(write);
        let next = *map.get(read);

        let contiguous = cur.phys_start + pages_to_bytes(cur.page_count) == next.phys_start;
        if contiguous
            && next.att == cur.att
            && is_coalescable(cur.ty)
            && is_coalescable(next.ty)
        {
            map.get_mut(write).page_count += next.page_count;
        } else {
            write += 1;
            if write != read {
                map.copy_descriptor(read, write);
            }
        }
    }

    map.truncate(write + 1);
    debug!("shrink: {} -> {} descriptors", before, map.len());
}

/// Reclassify known-anomalous descriptors.
///
/// Some firmware marks Reserved regions with the runtime attribute; those
/// must not receive a virtual mapping, so the attribute is cleared. Regions
/// overlapping the legacy wake range are retagged as ACPI non-volatile with
/// all attributes cleared, which keeps sleep/wake intact on the affected
/// boards.
pub fn normalize(map: &mut MemoryMapView) {
    for i in 0..map.len() {
        let desc = map.get_mut(i);

        if desc.ty == MemoryType::RESERVED && desc.att.contains(MemoryAttribute::RUNTIME) {
            desc.att.remove(MemoryAttribute::RUNTIME);
        }

        let top = desc.phys_start + pages_to_bytes(desc.page_count);
        if desc.phys_start < WAKE_RANGE_TOP && top >= WAKE_RANGE_BOTTOM {
            desc.ty = MemoryType::ACPI_NON_VOLATILE;
            desc.att = MemoryAttribute::empty();
        }
    }
}

/// Assign kernel-space virtual addresses to runtime-attributed descriptors.
///
/// Walks the map in order (the consuming kernel replays the same traversal)
/// and gives each runtime region `KERNEL_SPACE_BASE + cursor`, where the
/// cursor starts at `runtime_base` and advances by the region's byte size.
/// Returns the cursor position after the last assignment.
pub fn assign_virtual_addresses(map: &mut MemoryMapView, runtime_base: u64) -> u64 {
    let mut cursor = runtime_base;
    for i in 0..map.len() {
        let desc = map.get_mut(i);
        if desc.att.contains(MemoryAttribute::RUNTIME) {
            desc.virt_start = VirtualAddress::new(KERNEL_SPACE_BASE + cursor)
                .canonical()
                .as_u64();
            cursor += pages_to_bytes(desc.page_count);
        }
    }
    cursor
}

/// Total number of pages carrying the runtime attribute.
#[must_use]
pub fn count_runtime_pages(map: &MemoryMapView) -> u64 {
    map.iter()
        .filter(|d| d.att.contains(MemoryAttribute::RUNTIME))
        .map(|d| d.page_count)
        .sum()
}

/// Retype runtime-data regions as MMIO so the kernel leaves them in place.
///
/// The region holding the system-table copy at `system_table_area` is spared;
/// the kernel must relocate that one into its own image or it crashes before
/// runtime regions are remapped.
pub fn protect_runtime_data(map: &mut MemoryMapView, system_table_area: u64) {
    for i in 0..map.len() {
        let desc = map.get_mut(i);
        if desc.att.contains(MemoryAttribute::RUNTIME)
            && desc.ty == MemoryType::RUNTIME_SERVICES_DATA
            && desc.phys_start != system_table_area
        {
            desc.ty = MemoryType::MMIO;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::build_map;

    const STRIDE: usize = 48;

    #[test]
    fn shrink_merges_adjacent_conventional() {
        let mut backing = build_map(
            &[
                (
                    MemoryType::CONVENTIONAL,
                    0x10_0000,
                    16,
                    MemoryAttribute::empty(),
                ),
                (
                    MemoryType::CONVENTIONAL,
                    0x11_0000,
                    16,
                    MemoryAttribute::empty(),
                ),
            ],
            STRIDE,
        );
        let mut map = backing.view();
        shrink(&mut map);

        assert_eq!(map.len(), 1);
        assert_eq!(map.get(0).phys_start, 0x10_0000);
        assert_eq!(map.get(0).page_count, 32);
        assert_eq!(map.get(0).att, MemoryAttribute::empty());
    }

    #[test]
    fn shrink_preserves_page_totals_and_is_idempotent() {
        let mut backing = build_map(
            &[
                (
                    MemoryType::BOOT_SERVICES_CODE,
                    0x10_0000,
                    4,
                    MemoryAttribute::empty(),
                ),
                (
                    MemoryType::BOOT_SERVICES_DATA,
                    0x10_4000,
                    8,
                    MemoryAttribute::empty(),
                ),
                (
                    MemoryType::RUNTIME_SERVICES_DATA,
                    0x10_C000,
                    2,
                    MemoryAttribute::RUNTIME,
                ),
                (
                    MemoryType::CONVENTIONAL,
                    0x10_E000,
                    6,
                    MemoryAttribute::empty(),
                ),
                (
                    MemoryType::CONVENTIONAL,
                    0x11_4000,
                    10,
                    MemoryAttribute::empty(),
                ),
            ],
            STRIDE,
        );
        let mut map = backing.view();
        let total_before: u64 = map.iter().map(|d| d.page_count).sum();

        shrink(&mut map);
        let after_once: Vec<(u64, u64)> =
            map.iter().map(|d| (d.phys_start, d.page_count)).collect();
        let total_after: u64 = map.iter().map(|d| d.page_count).sum();
        assert_eq!(total_before, total_after);
        // The runtime descriptor blocks the merge chain.
        assert_eq!(map.len(), 3);

        shrink(&mut map);
        let after_twice: Vec<(u64, u64)> =
            map.iter().map(|d| (d.phys_start, d.page_count)).collect();
        assert_eq!(after_once, after_twice);
    }

    #[test]
    fn shrink_requires_contiguity_and_equal_attributes() {
        let mut backing = build_map(
            &[
                (
                    MemoryType::CONVENTIONAL,
                    0x10_0000,
                    16,
                    MemoryAttribute::empty(),
                ),
                // gap of one page
                (
                    MemoryType::CONVENTIONAL,
                    0x11_1000,
                    16,
                    MemoryAttribute::empty(),
                ),
                (
                    MemoryType::CONVENTIONAL,
                    0x12_1000,
                    4,
                    MemoryAttribute::WRITE_BACK,
                ),
            ],
            STRIDE,
        );
        let mut map = backing.view();
        shrink(&mut map);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn normalize_strips_runtime_from_reserved() {
        let mut backing = build_map(
            &[
                (
                    MemoryType::RESERVED,
                    0x8000_0000,
                    32,
                    MemoryAttribute::RUNTIME | MemoryAttribute::UNCACHEABLE,
                ),
                (
                    MemoryType::RUNTIME_SERVICES_CODE,
                    0x9000_0000,
                    8,
                    MemoryAttribute::RUNTIME,
                ),
            ],
            STRIDE,
        );
        let mut map = backing.view();
        normalize(&mut map);

        assert!(!map.get(0).att.contains(MemoryAttribute::RUNTIME));
        assert!(map.get(0).att.contains(MemoryAttribute::UNCACHEABLE));
        // Genuine runtime regions stay untouched.
        assert!(map.get(1).att.contains(MemoryAttribute::RUNTIME));
    }

    #[test]
    fn normalize_retags_wake_range() {
        let mut backing = build_map(
            &[(
                MemoryType::BOOT_SERVICES_DATA,
                0x9_D000,
                4,
                MemoryAttribute::WRITE_BACK,
            )],
            STRIDE,
        );
        let mut map = backing.view();
        normalize(&mut map);

        assert_eq!(map.get(0).ty, MemoryType::ACPI_NON_VOLATILE);
        assert_eq!(map.get(0).att, MemoryAttribute::empty());
    }

    #[test]
    fn virtual_addresses_follow_map_order() {
        let mut backing = build_map(
            &[
                (
                    MemoryType::RUNTIME_SERVICES_CODE,
                    0x9000_0000,
                    4,
                    MemoryAttribute::RUNTIME,
                ),
                (
                    MemoryType::CONVENTIONAL,
                    0x9100_0000,
                    64,
                    MemoryAttribute::empty(),
                ),
                (
                    MemoryType::MMIO,
                    0xFED0_0000,
                    2,
                    MemoryAttribute::RUNTIME,
                ),
            ],
            STRIDE,
        );
        let mut map = backing.view();
        let end = assign_virtual_addresses(&mut map, 0x1000);

        assert_eq!(map.get(0).virt_start, KERNEL_SPACE_BASE + 0x1000);
        // Non-runtime descriptor skipped without advancing the cursor.
        assert_eq!(map.get(1).virt_start, 0);
        assert_eq!(map.get(2).virt_start, KERNEL_SPACE_BASE + 0x5000);
        assert_eq!(end, 0x7000);
    }

    #[test]
    fn runtime_page_count_and_protection() {
        let mut backing = build_map(
            &[
                (
                    MemoryType::RUNTIME_SERVICES_DATA,
                    0x9000_0000,
                    4,
                    MemoryAttribute::RUNTIME,
                ),
                (
                    MemoryType::RUNTIME_SERVICES_DATA,
                    0x9001_0000,
                    8,
                    MemoryAttribute::RUNTIME,
                ),
                (
                    MemoryType::RUNTIME_SERVICES_CODE,
                    0x9002_0000,
                    16,
                    MemoryAttribute::RUNTIME,
                ),
            ],
            STRIDE,
        );
        let mut map = backing.view();
        assert_eq!(count_runtime_pages(&map), 28);

        protect_runtime_data(&mut map, 0x9001_0000);
        assert_eq!(map.get(0).ty, MemoryType::MMIO);
        // System-table region spared, code region untouched.
        assert_eq!(map.get(1).ty, MemoryType::RUNTIME_SERVICES_DATA);
        assert_eq!(map.get(2).ty, MemoryType::RUNTIME_SERVICES_CODE);
    }
}
