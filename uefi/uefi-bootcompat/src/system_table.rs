//! Private system-table copy for the loader.
//!
//! A restore on the recovery path writes original pointers back into the
//! global system table; a loader that cached that table's address would see
//! the overrides vanish mid-flight. Handing the loader a private copy keeps
//! its view stable no matter what the controller does to the real one. The
//! copy lives in runtime data below the loader's addressing ceiling so the
//! kernel-side bookkeeping can still reach it.

use crate::memory;
use compat_memory_addresses::{PhysicalAddress, bytes_to_pages};
use log::{debug, warn};
use uefi::boot::MemoryType;
use uefi_raw::protocol::loaded_image::LoadedImageProtocol;
use uefi_raw::table::system::SystemTable;
use uefi_raw::{Handle, Status};

/// Highest address the loader's own bookkeeping can express.
const LOADER_ADDRESS_CEILING: u64 = 0x8000_0000;

/// An allocated copy of the system table, owned until freed on the
/// recovery path.
pub struct SystemTableCopy {
    base: PhysicalAddress,
    pages: usize,
}

impl SystemTableCopy {
    /// Physical base of the copy.
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Copy `st` into fresh runtime data and point the loader image at it.
    ///
    /// Skips (returns `None`) when allocation fails or the loader image
    /// cannot be reached; the boot continues on the shared table then.
    ///
    /// # Safety
    /// `st` must be the live system table and `loader_handle` a valid image
    /// handle.
    pub unsafe fn create_for(st: *mut SystemTable, loader_handle: Handle) -> Option<Self> {
        // SAFETY: header of the live table.
        let header_size = unsafe { (*st).header.size } as usize;
        let pages = usize::try_from(bytes_to_pages(header_size as u64)).ok()?;

        let base = memory::allocate_pages_from_top(
            pages,
            PhysicalAddress::new(LOADER_ADDRESS_CEILING),
            MemoryType::RUNTIME_SERVICES_DATA,
        )?;

        // SAFETY: fresh exclusive allocation of at least `header_size` bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(
                st.cast::<u8>().cast_const(),
                base.as_u64() as *mut u8,
                header_size,
            );
        }

        let copy = Self { base, pages };

        // SAFETY: raw protocol lookup on the caller-supplied handle.
        let redirected = unsafe { redirect_loader_image(st, loader_handle, copy.base) };
        if !redirected {
            warn!("loader image not redirected to the private system table");
            copy.free();
            return None;
        }

        debug!("loader runs on a private system table at {base}");
        Some(copy)
    }

    /// Release the copy. The loader must no longer be running.
    pub fn free(self) {
        // SAFETY: exclusive allocation made in `create_for`.
        unsafe {
            memory::free_pages(self.base, self.pages);
        }
    }
}

/// Point the loaded image's `system_table` field at the copy.
unsafe fn redirect_loader_image(
    st: *mut SystemTable,
    loader_handle: Handle,
    copy_base: PhysicalAddress,
) -> bool {
    let mut interface = core::ptr::null_mut();
    // SAFETY: the firmware's own handle-protocol lookup; the loaded-image
    // interface stays valid while the image exists.
    unsafe {
        let bs = (*st).boot_services;
        let status = ((*bs).handle_protocol)(
            loader_handle,
            &LoadedImageProtocol::GUID,
            &mut interface,
        );
        if status != Status::SUCCESS || interface.is_null() {
            return false;
        }
        let loaded_image = interface.cast::<LoadedImageProtocol>();
        (*loaded_image).system_table = copy_base.as_u64() as *mut SystemTable;
    }
    true
}
