//! Reduced runtime-only memory map.
//!
//! Some firmware converts pointers for every descriptor handed to
//! `SetVirtualAddressMap`, runtime-flagged or not. Passing a map stripped to
//! the runtime descriptors sidesteps that, and it is also the shape the
//! target kernel's own accounting expects.

use crate::view::{MemoryMapError, MemoryMapView};
use log::warn;
use uefi_raw::table::boot::{MemoryAttribute, MemoryDescriptor};

/// Fixed capacity of the runtime subset, in descriptors.
pub const RUNTIME_DESCRIPTOR_CAPACITY: usize = 64;

/// Upper bound on the firmware descriptor stride this buffer supports.
const MAX_DESCRIPTOR_STRIDE: usize = 0x50;

/// Errors from [`select_runtime_subset`]. All of them fail the operation
/// closed; a silently truncated runtime map would corrupt the virtual
/// address assignment the kernel replays.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeMapError {
    /// More runtime descriptors than the fixed buffer holds.
    #[error("runtime map capacity of {RUNTIME_DESCRIPTOR_CAPACITY} descriptors exceeded")]
    CapacityExceeded,
    /// The firmware stride exceeds what the fixed buffer was sized for.
    #[error("descriptor stride {0} exceeds supported maximum")]
    StrideTooLarge(usize),
    /// The source view itself was malformed.
    #[error(transparent)]
    Map(#[from] MemoryMapError),
}

/// Fixed-capacity copy of the runtime-attributed descriptors of a map,
/// stored at the originating firmware stride.
#[repr(C, align(8))]
pub struct RuntimeMap {
    buf: [u8; RUNTIME_DESCRIPTOR_CAPACITY * MAX_DESCRIPTOR_STRIDE],
    map_size: usize,
    desc_size: usize,
}

impl core::fmt::Debug for RuntimeMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RuntimeMap")
            .field("len", &self.len())
            .field("desc_size", &self.desc_size)
            .finish_non_exhaustive()
    }
}

impl RuntimeMap {
    /// Number of descriptors held.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.map_size / self.desc_size
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.map_size == 0
    }

    /// Logical size in bytes, as passed to `SetVirtualAddressMap`.
    #[must_use]
    pub const fn map_size(&self) -> usize {
        self.map_size
    }

    /// Stride between descriptors, inherited from the source map.
    #[must_use]
    pub const fn desc_size(&self) -> usize {
        self.desc_size
    }

    /// Pointer to the first descriptor, for the firmware call.
    #[must_use]
    pub const fn as_ptr(&self) -> *const MemoryDescriptor {
        self.buf.as_ptr().cast()
    }

    /// Mutable view for walking or premapping the held descriptors.
    ///
    /// # Panics
    /// Never; the buffer geometry was validated when the map was built.
    pub fn view_mut(&mut self) -> MemoryMapView<'_> {
        MemoryMapView::new(&mut self.buf, self.map_size, self.desc_size)
            .expect("runtime map geometry was validated on construction")
    }
}

/// Copy the runtime-attributed descriptors of `src` into a [`RuntimeMap`].
///
/// Map order is preserved. Fails closed when the subset would not fit; the
/// caller is expected to fall back to the unreduced map in that case.
///
/// # Errors
/// [`RuntimeMapError::CapacityExceeded`] past 64 runtime descriptors,
/// [`RuntimeMapError::StrideTooLarge`] for oversized firmware strides.
pub fn select_runtime_subset(src: &MemoryMapView) -> Result<RuntimeMap, RuntimeMapError> {
    let stride = src.desc_size();
    if stride > MAX_DESCRIPTOR_STRIDE {
        warn!("runtime subset: unsupported descriptor stride {stride}");
        return Err(RuntimeMapError::StrideTooLarge(stride));
    }

    let mut out = RuntimeMap {
        buf: [0; RUNTIME_DESCRIPTOR_CAPACITY * MAX_DESCRIPTOR_STRIDE],
        map_size: 0,
        desc_size: stride,
    };

    let src_bytes = src.as_bytes();
    let mut count = 0;

    for i in 0..src.len() {
        if !src.get(i).att.contains(MemoryAttribute::RUNTIME) {
            continue;
        }
        if count == RUNTIME_DESCRIPTOR_CAPACITY {
            warn!("runtime subset: more than {RUNTIME_DESCRIPTOR_CAPACITY} runtime descriptors");
            return Err(RuntimeMapError::CapacityExceeded);
        }
        let s = i * stride;
        let d = count * stride;
        out.buf[d..d + stride].copy_from_slice(&src_bytes[s..s + stride]);
        count += 1;
    }

    out.map_size = count * stride;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::build_map;
    use uefi_raw::table::boot::MemoryType;

    const STRIDE: usize = 48;

    #[test]
    fn copies_only_runtime_descriptors_in_order() {
        let mut backing = build_map(
            &[
                (
                    MemoryType::CONVENTIONAL,
                    0x10_0000,
                    64,
                    MemoryAttribute::empty(),
                ),
                (
                    MemoryType::RUNTIME_SERVICES_CODE,
                    0x9000_0000,
                    4,
                    MemoryAttribute::RUNTIME,
                ),
                (
                    MemoryType::BOOT_SERVICES_DATA,
                    0x9100_0000,
                    4,
                    MemoryAttribute::empty(),
                ),
                (
                    MemoryType::MMIO,
                    0xFED0_0000,
                    2,
                    MemoryAttribute::RUNTIME | MemoryAttribute::UNCACHEABLE,
                ),
            ],
            STRIDE,
        );
        let map = backing.view();

        let mut rt = select_runtime_subset(&map).unwrap();
        assert_eq!(rt.len(), 2);
        assert_eq!(rt.desc_size(), STRIDE);
        assert_eq!(rt.map_size(), 2 * STRIDE);

        let rt_view = rt.view_mut();
        assert_eq!(rt_view.get(0).phys_start, 0x9000_0000);
        assert_eq!(rt_view.get(1).phys_start, 0xFED0_0000);
        assert_eq!(rt_view.get(1).ty, MemoryType::MMIO);
    }

    #[test]
    fn fails_closed_past_capacity() {
        let entries: Vec<_> = (0..RUNTIME_DESCRIPTOR_CAPACITY as u64 + 1)
            .map(|i| {
                (
                    MemoryType::RUNTIME_SERVICES_DATA,
                    0x9000_0000 + i * 0x1000,
                    1,
                    MemoryAttribute::RUNTIME,
                )
            })
            .collect();
        let mut backing = build_map(&entries, STRIDE);
        let map = backing.view();

        assert_eq!(
            select_runtime_subset(&map).unwrap_err(),
            RuntimeMapError::CapacityExceeded
        );
    }

    #[test]
    fn exactly_at_capacity_succeeds() {
        let entries: Vec<_> = (0..RUNTIME_DESCRIPTOR_CAPACITY as u64)
            .map(|i| {
                (
                    MemoryType::RUNTIME_SERVICES_DATA,
                    0x9000_0000 + i * 0x1000,
                    1,
                    MemoryAttribute::RUNTIME,
                )
            })
            .collect();
        let mut backing = build_map(&entries, STRIDE);
        let map = backing.view();

        let rt = select_runtime_subset(&map).unwrap();
        assert_eq!(rt.len(), RUNTIME_DESCRIPTOR_CAPACITY);
    }
}
