//! Firmware-backed memory: the global allocator and top-down page claims.

use compat_alloc::find_allocation_from_top;
use compat_memory_addresses::PhysicalAddress;
use compat_sync::IrqGuard;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::ptr::NonNull;
use core::ptr::null_mut;
use log::warn;
use uefi::boot::{self, AllocateType, MemoryType};
use uefi::mem::memory_map::MemoryMap;

/// Firmware pool returns 8-aligned blocks; allocations up to this alignment
/// pass straight through.
const POOL_ALIGN: usize = 8;

/// A boot-services pool allocation backing Rust's global allocator.
///
/// Valid only while boot services are active; afterwards every allocation
/// reports exhaustion, which is correct for this driver since nothing on
/// the post-exit path allocates.
///
/// Requests up to the pool's natural alignment map directly onto pool
/// calls. Stricter alignments over-allocate and stash the pool pointer
/// right below the aligned block so `dealloc` can find it again.
pub struct UefiPoolAllocator;

#[global_allocator]
static GLOBAL_ALLOC: UefiPoolAllocator = UefiPoolAllocator;

unsafe impl GlobalAlloc for UefiPoolAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(1);

        if layout.align() <= POOL_ALIGN {
            return boot::allocate_pool(MemoryType::BOOT_SERVICES_DATA, size)
                .map_or(null_mut(), NonNull::as_ptr);
        }

        let Some(total) = size.checked_add(layout.align() + size_of::<usize>()) else {
            return null_mut();
        };
        let Ok(raw) = boot::allocate_pool(MemoryType::BOOT_SERVICES_DATA, total) else {
            return null_mut();
        };

        let raw_addr = raw.as_ptr() as usize;
        let aligned = (raw_addr + size_of::<usize>() + layout.align() - 1) & !(layout.align() - 1);
        // SAFETY: the header slot lies inside the over-allocated block.
        unsafe {
            ptr::write((aligned - size_of::<usize>()) as *mut usize, raw_addr);
        }
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, block: *mut u8, layout: Layout) {
        let Some(block) = NonNull::new(block) else {
            return;
        };

        if layout.align() <= POOL_ALIGN {
            // SAFETY: `block` came straight out of `allocate_pool`.
            let _ = unsafe { boot::free_pool(block) };
            return;
        }

        // SAFETY: `alloc` stored the pool pointer right below the block.
        let pool_ptr = unsafe { ptr::read((block.as_ptr() as usize - size_of::<usize>()) as *const usize) };
        if let Some(pool_ptr) = NonNull::new(pool_ptr as *mut u8) {
            // SAFETY: recovered from the header `alloc` wrote.
            let _ = unsafe { boot::free_pool(pool_ptr) };
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }
}

/// Allocate `pages` pages of `mem_ty` at the highest address below
/// `ceiling`.
///
/// Reads a fresh memory map, computes the placement, then claims it with an
/// allocate-at-address call under a raised interrupt level so the map cannot
/// go stale between the two steps.
pub fn allocate_pages_from_top(
    pages: usize,
    ceiling: PhysicalAddress,
    mem_ty: MemoryType,
) -> Option<PhysicalAddress> {
    let mmap = match boot::memory_map(MemoryType::BOOT_SERVICES_DATA) {
        Ok(mmap) => mmap,
        Err(e) => {
            warn!("memory map read failed: {e:?}");
            return None;
        }
    };

    let _masked = IrqGuard::new();
    let base = find_allocation_from_top(mmap.entries(), pages as u64, ceiling)?;
    drop(mmap);

    match boot::allocate_pages(AllocateType::Address(base.as_u64()), mem_ty, pages) {
        Ok(_) => Some(base),
        Err(e) => {
            warn!("allocation of {pages} pages at {base} failed: {e:?}");
            None
        }
    }
}

/// Free pages claimed by [`allocate_pages_from_top`].
///
/// # Safety
/// `base` must be an allocation of exactly `pages` pages that is no longer
/// referenced anywhere.
pub unsafe fn free_pages(base: PhysicalAddress, pages: usize) {
    let Some(ptr) = core::ptr::NonNull::new(base.as_u64() as *mut u8) else {
        return;
    };
    // SAFETY: caller guarantees the allocation.
    if let Err(e) = unsafe { boot::free_pages(ptr, pages) } {
        warn!("freeing {pages} pages at {base} failed: {e:?}");
    }
}
