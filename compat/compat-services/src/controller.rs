//! Saving, overriding and restoring the live service tables.

use crate::mask::IrqGuard;
use crate::wrappers;
use core::ffi::c_void;
use log::{debug, error, warn};
use uefi_raw::table::Header;
use uefi_raw::table::boot::{MemoryDescriptor, MemoryType};
use uefi_raw::table::system::SystemTable;
use uefi_raw::{Guid, Handle, PhysicalAddress, Status};

pub type AllocatePagesFn =
    unsafe extern "efiapi" fn(u32, MemoryType, usize, *mut PhysicalAddress) -> Status;
pub type FreePagesFn = unsafe extern "efiapi" fn(PhysicalAddress, usize) -> Status;
pub type GetMemoryMapFn = unsafe extern "efiapi" fn(
    *mut usize,
    *mut MemoryDescriptor,
    *mut usize,
    *mut usize,
    *mut u32,
) -> Status;
pub type AllocatePoolFn = unsafe extern "efiapi" fn(MemoryType, usize, *mut *mut u8) -> Status;
pub type FreePoolFn = unsafe extern "efiapi" fn(*mut u8) -> Status;
pub type ExitBootServicesFn = unsafe extern "efiapi" fn(Handle, usize) -> Status;
pub type HandleProtocolFn =
    unsafe extern "efiapi" fn(Handle, *const Guid, *mut *mut c_void) -> Status;
pub type LocateProtocolFn =
    unsafe extern "efiapi" fn(*const Guid, *mut c_void, *mut *mut c_void) -> Status;
pub type SetVirtualAddressMapFn =
    unsafe extern "efiapi" fn(usize, usize, u32, *mut MemoryDescriptor) -> Status;
pub type CalculateCrc32Fn = unsafe extern "efiapi" fn(*const c_void, usize, *mut u32) -> Status;

/// Original firmware entry points, captured before the wrappers went in.
///
/// The wrappers delegate through this record; restore writes it back.
/// `locate_protocol` and `calculate_crc32` are never overridden, they are
/// kept here so the wrappers call the same firmware the originals came from.
#[derive(Copy, Clone)]
pub struct SavedFirmwareServices {
    pub allocate_pages: AllocatePagesFn,
    pub free_pages: FreePagesFn,
    pub get_memory_map: GetMemoryMapFn,
    pub allocate_pool: AllocatePoolFn,
    pub free_pool: FreePoolFn,
    pub exit_boot_services: ExitBootServicesFn,
    pub handle_protocol: HandleProtocolFn,
    pub locate_protocol: LocateProtocolFn,
    pub set_virtual_address_map: SetVirtualAddressMapFn,
    pub calculate_crc32: CalculateCrc32Fn,
}

/// Depth-gated installer for the service overrides.
///
/// `Idle -> Installed -> Idle`, with an internal nesting depth: only the
/// 0-to-1 install and the 1-to-0 restore touch the hardware tables, so
/// nested loader sessions see stable pointers. Restoring more often than
/// installing is a caller bookkeeping bug; debug builds halt on it,
/// production builds refuse the operation and leave the tables alone.
pub struct OverrideController {
    depth: usize,
    saved: Option<SavedFirmwareServices>,
}

impl Default for OverrideController {
    fn default() -> Self {
        Self::new()
    }
}

impl OverrideController {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            depth: 0,
            saved: None,
        }
    }

    /// Current nesting depth; zero means the live tables are original.
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// The captured originals, present while installed.
    #[must_use]
    pub const fn saved_services(&self) -> Option<SavedFirmwareServices> {
        self.saved
    }

    /// Install the wrappers; only the outermost call writes the tables.
    ///
    /// # Safety
    /// `st` must point at the live system table, with its boot- and
    /// runtime-services tables valid and writable.
    pub unsafe fn install(&mut self, st: *mut SystemTable) {
        let _masked = IrqGuard::new();

        if self.depth == 0 {
            // SAFETY: caller guarantees the tables; interrupts stay masked
            // until both tables and checksums are consistent again.
            unsafe {
                let bs = (*st).boot_services;
                let rt = (*st).runtime_services;

                let saved = SavedFirmwareServices {
                    allocate_pages: (*bs).allocate_pages,
                    free_pages: (*bs).free_pages,
                    get_memory_map: (*bs).get_memory_map,
                    allocate_pool: (*bs).allocate_pool,
                    free_pool: (*bs).free_pool,
                    exit_boot_services: (*bs).exit_boot_services,
                    handle_protocol: (*bs).handle_protocol,
                    locate_protocol: (*bs).locate_protocol,
                    set_virtual_address_map: (*rt).set_virtual_address_map,
                    calculate_crc32: (*bs).calculate_crc32,
                };

                (*bs).allocate_pages = wrappers::allocate_pages;
                (*bs).free_pages = wrappers::free_pages;
                (*bs).get_memory_map = wrappers::get_memory_map;
                (*bs).allocate_pool = wrappers::allocate_pool;
                (*bs).free_pool = wrappers::free_pool;
                (*bs).exit_boot_services = wrappers::exit_boot_services;
                (*bs).handle_protocol = wrappers::handle_protocol;
                (*rt).set_virtual_address_map = wrappers::set_virtual_address_map;

                update_checksum(&raw mut (*bs).header, saved.calculate_crc32);
                update_checksum(&raw mut (*rt).header, saved.calculate_crc32);

                self.saved = Some(saved);
            }
            debug!("firmware service overrides installed");
        }

        self.depth += 1;
    }

    /// Undo one `install`; only the outermost restore writes the tables.
    ///
    /// # Safety
    /// Same requirements as [`install`](Self::install).
    pub unsafe fn restore(&mut self, st: *mut SystemTable) {
        let _masked = IrqGuard::new();

        if self.depth == 0 {
            debug_assert!(false, "restore without matching install");
            error!("restore without matching install; firmware tables left untouched");
            return;
        }

        self.depth -= 1;
        if self.depth > 0 {
            return;
        }

        let Some(saved) = self.saved.take() else {
            debug_assert!(false, "installed controller lost its saved services");
            error!("no saved services to restore; firmware tables left untouched");
            return;
        };

        // SAFETY: as in `install`.
        unsafe {
            let bs = (*st).boot_services;
            let rt = (*st).runtime_services;

            (*bs).allocate_pages = saved.allocate_pages;
            (*bs).free_pages = saved.free_pages;
            (*bs).get_memory_map = saved.get_memory_map;
            (*bs).allocate_pool = saved.allocate_pool;
            (*bs).free_pool = saved.free_pool;
            (*bs).exit_boot_services = saved.exit_boot_services;
            (*bs).handle_protocol = saved.handle_protocol;
            (*rt).set_virtual_address_map = saved.set_virtual_address_map;

            update_checksum(&raw mut (*bs).header, saved.calculate_crc32);
            update_checksum(&raw mut (*rt).header, saved.calculate_crc32);
        }
        debug!("firmware service overrides restored");
    }
}

/// Recompute a table header's CRC32 after mutation.
///
/// Zeroes the field, asks the firmware's own checksum service to cover
/// `header.size` bytes, and writes the result back.
unsafe fn update_checksum(header: *mut Header, calc: CalculateCrc32Fn) {
    // SAFETY: caller passes a header inside a live, writable table.
    unsafe {
        (*header).crc = 0;
        let size = (*header).size as usize;
        let mut crc = 0u32;
        let status = calc(header.cast::<c_void>().cast_const(), size, &mut crc);
        if status == Status::SUCCESS {
            (*header).crc = crc;
        } else {
            warn!("firmware checksum service failed: {status:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CompatConfig, CompatContext, install_context, with_context};
    use core::mem::MaybeUninit;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use uefi_raw::table::Revision;
    use uefi_raw::table::boot::BootServices;
    use uefi_raw::table::runtime::RuntimeServices;

    static ALLOCATE_CALLS: AtomicUsize = AtomicUsize::new(0);
    static FREE_CALLS: AtomicUsize = AtomicUsize::new(0);

    mod dummies {
        use super::{ALLOCATE_CALLS, FREE_CALLS};
        use core::ffi::c_void;
        use core::sync::atomic::Ordering;
        use uefi_raw::table::boot::{MemoryDescriptor, MemoryType};
        use uefi_raw::{Guid, Handle, PhysicalAddress, Status};

        pub unsafe extern "efiapi" fn allocate_pages(
            _: u32,
            _: MemoryType,
            _: usize,
            _: *mut PhysicalAddress,
        ) -> Status {
            ALLOCATE_CALLS.fetch_add(1, Ordering::SeqCst);
            Status::SUCCESS
        }

        pub unsafe extern "efiapi" fn free_pages(_: PhysicalAddress, _: usize) -> Status {
            FREE_CALLS.fetch_add(1, Ordering::SeqCst);
            Status::SUCCESS
        }

        pub unsafe extern "efiapi" fn get_memory_map(
            _: *mut usize,
            _: *mut MemoryDescriptor,
            _: *mut usize,
            _: *mut usize,
            _: *mut u32,
        ) -> Status {
            Status::SUCCESS
        }

        pub unsafe extern "efiapi" fn allocate_pool(
            _: MemoryType,
            _: usize,
            _: *mut *mut u8,
        ) -> Status {
            Status::SUCCESS
        }

        pub unsafe extern "efiapi" fn free_pool(_: *mut u8) -> Status {
            Status::SUCCESS
        }

        pub unsafe extern "efiapi" fn exit_boot_services(_: Handle, _: usize) -> Status {
            Status::SUCCESS
        }

        pub unsafe extern "efiapi" fn handle_protocol(
            _: Handle,
            _: *const Guid,
            _: *mut *mut c_void,
        ) -> Status {
            Status::SUCCESS
        }

        pub unsafe extern "efiapi" fn locate_protocol(
            _: *const Guid,
            _: *mut c_void,
            _: *mut *mut c_void,
        ) -> Status {
            Status::SUCCESS
        }

        pub unsafe extern "efiapi" fn set_virtual_address_map(
            _: usize,
            _: usize,
            _: u32,
            _: *mut MemoryDescriptor,
        ) -> Status {
            Status::SUCCESS
        }

        pub unsafe extern "efiapi" fn calculate_crc32(
            _: *const c_void,
            _: usize,
            out: *mut u32,
        ) -> Status {
            // SAFETY: test passes a valid out pointer.
            unsafe { *out = 0x1234_5678 };
            Status::SUCCESS
        }
    }

    /// Fabricated firmware tables with only the touched fields initialized.
    struct FakeFirmware {
        bs: Box<MaybeUninit<BootServices>>,
        rt: Box<MaybeUninit<RuntimeServices>>,
        st: Box<MaybeUninit<SystemTable>>,
    }

    impl FakeFirmware {
        fn new() -> Self {
            let mut bs = Box::new(MaybeUninit::<BootServices>::uninit());
            let mut rt = Box::new(MaybeUninit::<RuntimeServices>::uninit());
            let mut st = Box::new(MaybeUninit::<SystemTable>::uninit());

            let b = bs.as_mut_ptr();
            let r = rt.as_mut_ptr();
            let s = st.as_mut_ptr();

            // SAFETY: field-by-field initialization through raw pointers;
            // only initialized fields are ever read by the code under test.
            unsafe {
                (&raw mut (*b).header).write(Header {
                    signature: 0x4242,
                    revision: Revision::new(2, 70),
                    size: u32::try_from(size_of::<BootServices>()).unwrap(),
                    crc32: 0,
                    reserved: 0,
                });
                (&raw mut (*b).allocate_pages).write(dummies::allocate_pages);
                (&raw mut (*b).free_pages).write(dummies::free_pages);
                (&raw mut (*b).get_memory_map).write(dummies::get_memory_map);
                (&raw mut (*b).allocate_pool).write(dummies::allocate_pool);
                (&raw mut (*b).free_pool).write(dummies::free_pool);
                (&raw mut (*b).exit_boot_services).write(dummies::exit_boot_services);
                (&raw mut (*b).handle_protocol).write(dummies::handle_protocol);
                (&raw mut (*b).locate_protocol).write(dummies::locate_protocol);
                (&raw mut (*b).calculate_crc32).write(dummies::calculate_crc32);

                (&raw mut (*r).header).write(Header {
                    signature: 0x4243,
                    revision: Revision::new(2, 70),
                    size: u32::try_from(size_of::<RuntimeServices>()).unwrap(),
                    crc32: 0,
                    reserved: 0,
                });
                (&raw mut (*r).set_virtual_address_map).write(dummies::set_virtual_address_map);

                (&raw mut (*s).boot_services).write(b);
                (&raw mut (*s).runtime_services).write(r);
                (&raw mut (*s).stdout_handle).write(core::ptr::null_mut());
            }

            Self { bs, rt, st }
        }

        fn bs_ptr(&self) -> *mut BootServices {
            self.bs.as_ptr().cast_mut()
        }

        fn st_ptr(&self) -> *mut SystemTable {
            self.st.as_ptr().cast_mut()
        }
    }

    #[test]
    fn nesting_checksums_and_memory_guard() {
        let fw = FakeFirmware::new();
        let st = fw.st_ptr();
        let bs = fw.bs_ptr();

        assert!(install_context(CompatContext::new(CompatConfig::default(), st)));

        // Outermost install swaps the pointers and recomputes the checksum.
        with_context(|c| unsafe { c.controller.install(st) });
        unsafe {
            assert_eq!(
                (*bs).get_memory_map as usize,
                wrappers::get_memory_map as usize
            );
            assert_eq!((*bs).header.crc32, 0x1234_5678);
        }

        // Nested install plus one restore must leave the wrappers live.
        with_context(|c| unsafe { c.controller.install(st) });
        with_context(|c| unsafe { c.controller.restore(st) });
        unsafe {
            assert_eq!(
                (*bs).get_memory_map as usize,
                wrappers::get_memory_map as usize
            );
            assert_eq!((*bs).allocate_pages as usize, wrappers::allocate_pages as usize);
        }
        assert_eq!(with_context(|c| c.controller.depth()), Some(1));

        // While the disabled window is open, allocations are refused without
        // reaching the firmware and frees are swallowed.
        with_context(|c| c.memory_services_disabled = true);
        let status = unsafe {
            wrappers::allocate_pages(
                crate::abi::ALLOCATE_ANY_PAGES,
                MemoryType::LOADER_DATA,
                1,
                core::ptr::null_mut(),
            )
        };
        assert_eq!(status, Status::OUT_OF_RESOURCES);
        assert_eq!(ALLOCATE_CALLS.load(Ordering::SeqCst), 0);

        let status = unsafe { wrappers::free_pages(0x1000, 1) };
        assert_eq!(status, Status::SUCCESS);
        assert_eq!(FREE_CALLS.load(Ordering::SeqCst), 0);

        // Window closed: calls delegate to the originals again.
        with_context(|c| c.memory_services_disabled = false);
        let status = unsafe {
            wrappers::allocate_pages(
                crate::abi::ALLOCATE_ANY_PAGES,
                MemoryType::LOADER_DATA,
                1,
                core::ptr::null_mut(),
            )
        };
        assert_eq!(status, Status::SUCCESS);
        assert_eq!(ALLOCATE_CALLS.load(Ordering::SeqCst), 1);

        // The second restore reverts to the originals.
        with_context(|c| unsafe { c.controller.restore(st) });
        unsafe {
            assert_eq!(
                (*bs).get_memory_map as usize,
                dummies::get_memory_map as usize
            );
            assert_eq!((*bs).allocate_pages as usize, dummies::allocate_pages as usize);
        }
        assert_eq!(with_context(|c| c.controller.depth()), Some(0));

        drop(fw);
    }

    #[test]
    #[should_panic(expected = "restore without matching install")]
    fn restore_below_zero_halts_in_debug() {
        let fw = FakeFirmware::new();
        let mut controller = OverrideController::new();
        unsafe { controller.restore(fw.st_ptr()) };
    }
}
