//! Host-side construction of descriptor arrays at arbitrary strides.

use crate::view::MemoryMapView;
use core::mem::size_of;
use uefi_raw::table::boot::{MemoryAttribute, MemoryDescriptor, MemoryType};

/// 8-aligned backing store for a fabricated memory map.
pub(crate) struct MapBacking {
    words: Vec<u64>,
    map_size: usize,
    stride: usize,
}

impl MapBacking {
    pub(crate) fn view(&mut self) -> MemoryMapView<'_> {
        let len = self.words.len() * 8;
        // SAFETY: u64 backing guarantees alignment; the byte view borrows
        // the vector exclusively.
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), len)
        };
        MemoryMapView::new(bytes, self.map_size, self.stride).expect("valid test map")
    }
}

/// Build a map from `(type, phys_start, page_count, attributes)` tuples.
pub(crate) fn build_map(
    entries: &[(MemoryType, u64, u64, MemoryAttribute)],
    stride: usize,
) -> MapBacking {
    assert!(stride >= size_of::<MemoryDescriptor>() && stride % 8 == 0);

    let map_size = entries.len() * stride;
    let mut words = vec![0u64; map_size.div_ceil(8)];
    let base = words.as_mut_ptr().cast::<u8>();

    for (i, &(ty, phys_start, page_count, att)) in entries.iter().enumerate() {
        let desc = MemoryDescriptor {
            ty,
            phys_start,
            virt_start: 0,
            page_count,
            att,
        };
        // SAFETY: offset is within the vector and stride-aligned.
        unsafe {
            core::ptr::write(base.add(i * stride).cast::<MemoryDescriptor>(), desc);
        }
    }

    MapBacking {
        words,
        map_size,
        stride,
    }
}
