use compat_memory_addresses::{PAGE_SHIFT, PhysicalAddress, PhysicalPage, Size4K};
use compat_vmem::FrameAlloc;
use log::error;

/// Pages in the scratch pool: 2 MiB, enough tables to remap every runtime
/// region seen in the wild with room to spare.
pub const SCRATCH_POOL_PAGES: usize = 512;

/// Monotonic bump allocator over one pre-reserved physical block.
///
/// `available_pages` only ever decreases. There is no free operation inside
/// the transition window; the pool lives exactly as long as the page tables
/// built from it, which is until the kernel takes over.
#[derive(Debug)]
pub struct ScratchPool {
    base: PhysicalAddress,
    pool_pages: usize,
    available_pages: usize,
}

impl ScratchPool {
    /// Adopt a reserved block of `pool_pages` pages at `base`.
    ///
    /// `base` must be the start of memory already claimed from the firmware
    /// for exclusive use; the pool itself never talks to the firmware.
    #[must_use]
    pub fn new(base: PhysicalAddress, pool_pages: usize) -> Self {
        debug_assert!(base.is_aligned_to(4096));
        Self {
            base,
            pool_pages,
            available_pages: pool_pages,
        }
    }

    /// Pages not yet handed out.
    #[must_use]
    pub const fn available_pages(&self) -> usize {
        self.available_pages
    }

    /// Allocate `count` contiguous pages by bumping the pool cursor.
    ///
    /// Returns `None` once the remaining capacity is insufficient. Never
    /// blocks, never retries, never grows.
    pub fn allocate_pages(&mut self, count: usize) -> Option<PhysicalAddress> {
        if count == 0 {
            return None;
        }
        if self.available_pages < count {
            error!(
                "scratch pool exhausted: {count} pages requested, {} left",
                self.available_pages
            );
            return None;
        }

        let consumed = self.pool_pages - self.available_pages;
        let at = self.base + ((consumed as u64) << PAGE_SHIFT);
        self.available_pages -= count;
        Some(at)
    }
}

impl FrameAlloc for ScratchPool {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.allocate_pages(1).map(|at| at.page::<Size4K>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bumps_monotonically() {
        let mut pool = ScratchPool::new(PhysicalAddress::new(0x8000_0000), 8);

        let a = pool.allocate_pages(1).unwrap();
        let b = pool.allocate_pages(3).unwrap();
        let c = pool.allocate_pages(1).unwrap();
        assert_eq!(a.as_u64(), 0x8000_0000);
        assert_eq!(b.as_u64(), 0x8000_1000);
        assert_eq!(c.as_u64(), 0x8000_4000);
        assert_eq!(pool.available_pages(), 3);
    }

    #[test]
    fn exact_capacity_then_fails_closed() {
        let mut pool = ScratchPool::new(PhysicalAddress::new(0x8000_0000), 8);

        // Requests summing to exactly the capacity all succeed.
        assert!(pool.allocate_pages(5).is_some());
        assert!(pool.allocate_pages(2).is_some());
        assert!(pool.allocate_pages(1).is_some());
        assert_eq!(pool.available_pages(), 0);

        // Any further request of any size fails.
        assert!(pool.allocate_pages(1).is_none());
        assert_eq!(pool.available_pages(), 0);
    }

    #[test]
    fn oversized_request_does_not_consume() {
        let mut pool = ScratchPool::new(PhysicalAddress::new(0x8000_0000), 4);
        assert!(pool.allocate_pages(5).is_none());
        assert_eq!(pool.available_pages(), 4);
        // The pool is still usable for requests that fit.
        assert!(pool.allocate_pages(4).is_some());
    }

    #[test]
    fn frame_alloc_hands_out_aligned_frames() {
        let mut pool = ScratchPool::new(PhysicalAddress::new(0x8000_0000), 2);
        let f = pool.alloc_4k().unwrap();
        assert!(f.base().is_aligned_to(4096));
        assert!(pool.alloc_4k().is_some());
        assert!(pool.alloc_4k().is_none());
    }
}
