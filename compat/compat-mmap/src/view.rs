use core::mem::{align_of, size_of};
use uefi_raw::table::boot::MemoryDescriptor;

/// Errors detected while validating a raw memory-map buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryMapError {
    /// The buffer pointer is not aligned for descriptor access.
    #[error("memory map buffer is misaligned")]
    MisalignedBuffer,
    /// The reported stride cannot hold one descriptor.
    #[error("descriptor stride {0} smaller than descriptor")]
    StrideTooSmall(usize),
    /// The reported stride would misalign every descriptor after the first.
    #[error("descriptor stride {0} not a multiple of descriptor alignment")]
    StrideMisaligned(usize),
    /// The reported map size is not a whole number of descriptors.
    #[error("map size {map_size} not a multiple of stride {stride}")]
    SizeNotMultipleOfStride { map_size: usize, stride: usize },
    /// The logical map size exceeds the backing buffer.
    #[error("map size {map_size} exceeds buffer of {buffer} bytes")]
    BufferTooSmall { map_size: usize, buffer: usize },
}

/// Bounds-checked cursor over a firmware memory-map buffer.
///
/// Wraps `(buffer, logical size, stride)` and hands out descriptor
/// references only at stride multiples inside the logical size. Mutating
/// operations (merging, truncation) go through this type as well, so the
/// buffer and its bookkeeping cannot drift apart.
#[derive(Debug)]
pub struct MemoryMapView<'a> {
    buf: &'a mut [u8],
    map_size: usize,
    desc_size: usize,
}

impl<'a> MemoryMapView<'a> {
    /// Wrap a descriptor array of `map_size` bytes at `desc_size` stride.
    ///
    /// # Errors
    /// Rejects buffers the stride arithmetic could walk out of or misalign.
    pub fn new(
        buf: &'a mut [u8],
        map_size: usize,
        desc_size: usize,
    ) -> Result<Self, MemoryMapError> {
        if buf.as_ptr().addr() % align_of::<MemoryDescriptor>() != 0 {
            return Err(MemoryMapError::MisalignedBuffer);
        }
        if desc_size < size_of::<MemoryDescriptor>() {
            return Err(MemoryMapError::StrideTooSmall(desc_size));
        }
        if desc_size % align_of::<MemoryDescriptor>() != 0 {
            return Err(MemoryMapError::StrideMisaligned(desc_size));
        }
        if map_size % desc_size != 0 {
            return Err(MemoryMapError::SizeNotMultipleOfStride {
                map_size,
                stride: desc_size,
            });
        }
        if map_size > buf.len() {
            return Err(MemoryMapError::BufferTooSmall {
                map_size,
                buffer: buf.len(),
            });
        }
        Ok(Self {
            buf,
            map_size,
            desc_size,
        })
    }

    /// Wrap a raw firmware-owned buffer.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `map_size` bytes for the
    /// lifetime of the view, with no aliasing access while the view lives.
    pub unsafe fn from_raw(
        ptr: *mut u8,
        map_size: usize,
        desc_size: usize,
    ) -> Result<Self, MemoryMapError> {
        let buf = unsafe { core::slice::from_raw_parts_mut(ptr, map_size) };
        Self::new(buf, map_size, desc_size)
    }

    /// Logical size of the map in bytes.
    #[must_use]
    pub const fn map_size(&self) -> usize {
        self.map_size
    }

    /// Stride between descriptors in bytes.
    #[must_use]
    pub const fn desc_size(&self) -> usize {
        self.desc_size
    }

    /// Number of descriptors in the map.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.map_size / self.desc_size
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.map_size == 0
    }

    /// Descriptor at index `i`.
    ///
    /// # Panics
    /// If `i` is out of bounds.
    #[must_use]
    pub fn get(&self, i: usize) -> &MemoryDescriptor {
        assert!(i < self.len(), "descriptor index {i} out of bounds");
        let off = i * self.desc_size;
        // SAFETY: offset is in bounds and stride-aligned, checked at
        // construction; the buffer is exclusively borrowed.
        unsafe { &*self.buf.as_ptr().add(off).cast::<MemoryDescriptor>() }
    }

    /// Mutable descriptor at index `i`.
    ///
    /// # Panics
    /// If `i` is out of bounds.
    pub fn get_mut(&mut self, i: usize) -> &mut MemoryDescriptor {
        assert!(i < self.len(), "descriptor index {i} out of bounds");
        let off = i * self.desc_size;
        // SAFETY: as in `get`.
        unsafe { &mut *self.buf.as_mut_ptr().add(off).cast::<MemoryDescriptor>() }
    }

    /// Iterate over all descriptors.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryDescriptor> {
        (0..self.len()).map(move |i| self.get(i))
    }

    /// Copy the full stride of descriptor `src` over descriptor `dst`.
    ///
    /// Moves any vendor payload trailing the struct along with it.
    pub(crate) fn copy_descriptor(&mut self, src: usize, dst: usize) {
        assert!(src < self.len() && dst < self.len());
        let s = src * self.desc_size;
        let d = dst * self.desc_size;
        self.buf.copy_within(s..s + self.desc_size, d);
    }

    /// Shorten the map to `count` descriptors.
    ///
    /// # Panics
    /// If `count` exceeds the current length.
    pub fn truncate(&mut self, count: usize) {
        assert!(count <= self.len());
        self.map_size = count * self.desc_size;
    }

    /// Raw byte region of the logical map (for handing back to firmware).
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.map_size]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::build_map;
    use uefi_raw::table::boot::{MemoryAttribute, MemoryType};

    fn as_bytes(words: &mut [u64]) -> &mut [u8] {
        let len = words.len() * 8;
        // SAFETY: u64 backing guarantees descriptor alignment.
        unsafe { core::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), len) }
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut backing = [0u64; 32];
        let len = backing.len() * 8;

        assert_eq!(
            MemoryMapView::new(as_bytes(&mut backing), 96, 20).unwrap_err(),
            MemoryMapError::StrideTooSmall(20)
        );
        assert_eq!(
            MemoryMapView::new(as_bytes(&mut backing), 100, 48).unwrap_err(),
            MemoryMapError::SizeNotMultipleOfStride {
                map_size: 100,
                stride: 48
            }
        );
        assert_eq!(
            MemoryMapView::new(as_bytes(&mut backing), 480, 48).unwrap_err(),
            MemoryMapError::BufferTooSmall {
                map_size: 480,
                buffer: len
            }
        );
    }

    #[test]
    fn walks_by_stride_not_struct_size() {
        // Stride is 16 bytes wider than the descriptor struct; the second
        // entry must still be found at the stride boundary.
        let stride = size_of::<MemoryDescriptor>() + 16;
        let mut backing = build_map(
            &[
                (
                    MemoryType::CONVENTIONAL,
                    0x1000,
                    1,
                    MemoryAttribute::empty(),
                ),
                (MemoryType::MMIO, 0x2000, 1, MemoryAttribute::RUNTIME),
            ],
            stride,
        );
        let view = backing.view();
        assert_eq!(view.len(), 2);
        assert_eq!(view.get(1).ty, MemoryType::MMIO);
        assert_eq!(view.get(1).phys_start, 0x2000);
    }

    #[test]
    fn truncate_and_copy() {
        let mut backing = build_map(
            &[
                (
                    MemoryType::CONVENTIONAL,
                    0x1000,
                    1,
                    MemoryAttribute::empty(),
                ),
                (
                    MemoryType::BOOT_SERVICES_DATA,
                    0x2000,
                    2,
                    MemoryAttribute::empty(),
                ),
                (
                    MemoryType::BOOT_SERVICES_CODE,
                    0x4000,
                    3,
                    MemoryAttribute::empty(),
                ),
            ],
            48,
        );
        let mut view = backing.view();
        view.copy_descriptor(2, 1);
        view.truncate(2);

        assert_eq!(view.len(), 2);
        assert_eq!(view.get(1).ty, MemoryType::BOOT_SERVICES_CODE);
        assert_eq!(view.get(1).page_count, 3);
        assert_eq!(view.map_size(), 96);
    }
}
