//! Replacement service functions.
//!
//! Each wrapper forwards to the saved original and applies at most one fix
//! before or after delegating. A genuine firmware error is always propagated
//! verbatim; fixes whose preconditions are not met are skipped silently.
//! State is copied out of the global context before delegating, never held
//! across a firmware call.

use crate::context::with_context;
use crate::controller::SavedFirmwareServices;
use compat_memory_addresses::{PhysicalAddress, VirtualAddress};
use compat_mmap::{
    MemoryMapView, assign_virtual_addresses, count_runtime_pages, normalize,
    protect_runtime_data, select_runtime_subset, shrink,
};
use compat_vmem::{AddressSpace, PhysMapper, flush_translation_caches};
use core::ffi::c_void;
use log::{error, warn};
use uefi_raw::protocol::console::GraphicsOutputProtocol;
use uefi_raw::table::boot::{MemoryAttribute, MemoryDescriptor, MemoryType};
use uefi_raw::{Guid, Handle, Status};

/// The saved originals, or `None` before the controller ever installed.
fn saved_services() -> Option<SavedFirmwareServices> {
    with_context(|ctx| ctx.controller.saved_services()).flatten()
}

/// Whether allocation traffic is currently refused.
fn memory_guard_active() -> bool {
    with_context(|ctx| ctx.config.guard_memory_services && ctx.memory_services_disabled)
        .unwrap_or(false)
}

/// Physical memory is identity-mapped during the transition window; table
/// frames are reached by plain casts.
struct DirectMapper;

impl PhysMapper for DirectMapper {
    unsafe fn phys_to_mut<T>(&self, at: PhysicalAddress) -> &mut T {
        // SAFETY: caller upholds the identity-mapping requirement.
        unsafe { &mut *(at.as_u64() as *mut T) }
    }
}

/// `GetMemoryMap` override: delegate, then normalize and shrink the result
/// per configuration. Also raises the "memory map is about to be read"
/// signal so collaborators can take their own snapshots first.
pub unsafe extern "efiapi" fn get_memory_map(
    size: *mut usize,
    map: *mut MemoryDescriptor,
    key: *mut usize,
    desc_size: *mut usize,
    desc_version: *mut u32,
) -> Status {
    let Some(saved) = saved_services() else {
        return Status::UNSUPPORTED;
    };
    let (do_normalize, do_shrink, do_protect, st_area, signal) = with_context(|ctx| {
        (
            ctx.config.normalize_memory_map,
            ctx.config.shrink_memory_map,
            ctx.config.protect_runtime_data,
            ctx.system_table_area,
            ctx.on_memory_map_read,
        )
    })
    .unwrap_or((false, false, false, 0, None));

    if let Some(signal) = signal {
        signal();
    }

    // SAFETY: forwarding the caller's own pointers.
    let status = unsafe { (saved.get_memory_map)(size, map, key, desc_size, desc_version) };
    if status != Status::SUCCESS || map.is_null() || size.is_null() || desc_size.is_null() {
        return status;
    }

    // SAFETY: on success the firmware filled `map` with `*size` bytes of
    // descriptors at `*desc_size` stride.
    unsafe {
        match MemoryMapView::from_raw(map.cast::<u8>(), *size, *desc_size) {
            Ok(mut view) => {
                if do_normalize {
                    normalize(&mut view);
                }
                if do_shrink {
                    shrink(&mut view);
                    *size = view.map_size();
                }
                if do_protect {
                    protect_runtime_data(&mut view, st_area);
                }
            }
            Err(e) => warn!("memory map left untransformed: {e}"),
        }
    }

    status
}

/// `ExitBootServices` override: refuse allocator traffic while the call is
/// in flight, and raise the handoff signal once it has succeeded.
pub unsafe extern "efiapi" fn exit_boot_services(image_handle: Handle, map_key: usize) -> Status {
    let Some(saved) = saved_services() else {
        return Status::UNSUPPORTED;
    };

    with_context(|ctx| ctx.memory_services_disabled = true);
    // SAFETY: forwarding the caller's own arguments.
    let status = unsafe { (saved.exit_boot_services)(image_handle, map_key) };
    let handoff = with_context(|ctx| {
        ctx.memory_services_disabled = false;
        ctx.on_loader_handoff
    })
    .flatten();

    if status == Status::SUCCESS {
        if let Some(handoff) = handoff {
            handoff();
        }
    }

    status
}

/// `AllocatePages` override: refused while the disabled window is open.
pub unsafe extern "efiapi" fn allocate_pages(
    alloc_ty: u32,
    mem_ty: MemoryType,
    pages: usize,
    addr: *mut uefi_raw::PhysicalAddress,
) -> Status {
    let Some(saved) = saved_services() else {
        return Status::UNSUPPORTED;
    };
    if memory_guard_active() {
        warn!("refusing AllocatePages({pages}) during ExitBootServices");
        return Status::OUT_OF_RESOURCES;
    }
    // SAFETY: forwarding the caller's own arguments.
    unsafe { (saved.allocate_pages)(alloc_ty, mem_ty, pages, addr) }
}

/// `FreePages` override: swallowed as a no-op while the window is open.
pub unsafe extern "efiapi" fn free_pages(addr: uefi_raw::PhysicalAddress, pages: usize) -> Status {
    let Some(saved) = saved_services() else {
        return Status::UNSUPPORTED;
    };
    if memory_guard_active() {
        warn!("ignoring FreePages({addr:#x}, {pages}) during ExitBootServices");
        return Status::SUCCESS;
    }
    // SAFETY: forwarding the caller's own arguments.
    unsafe { (saved.free_pages)(addr, pages) }
}

/// `AllocatePool` override: refused while the disabled window is open.
pub unsafe extern "efiapi" fn allocate_pool(
    pool_ty: MemoryType,
    size: usize,
    buffer: *mut *mut u8,
) -> Status {
    let Some(saved) = saved_services() else {
        return Status::UNSUPPORTED;
    };
    if memory_guard_active() {
        warn!("refusing AllocatePool({size}) during ExitBootServices");
        return Status::OUT_OF_RESOURCES;
    }
    // SAFETY: forwarding the caller's own arguments.
    unsafe { (saved.allocate_pool)(pool_ty, size, buffer) }
}

/// `FreePool` override: swallowed as a no-op while the window is open.
pub unsafe extern "efiapi" fn free_pool(buffer: *mut u8) -> Status {
    let Some(saved) = saved_services() else {
        return Status::UNSUPPORTED;
    };
    if memory_guard_active() {
        warn!("ignoring FreePool during ExitBootServices");
        return Status::SUCCESS;
    }
    // SAFETY: forwarding the caller's own arguments.
    unsafe { (saved.free_pool)(buffer) }
}

/// `HandleProtocol` override: when a graphics-output lookup on the console
/// handle comes back unsupported, retry as a global protocol search. Some
/// firmware publishes the protocol on a different handle than the loader
/// expects.
pub unsafe extern "efiapi" fn handle_protocol(
    handle: Handle,
    protocol: *const Guid,
    interface: *mut *mut c_void,
) -> Status {
    let Some(saved) = saved_services() else {
        return Status::UNSUPPORTED;
    };
    // SAFETY: forwarding the caller's own arguments.
    let status = unsafe { (saved.handle_protocol)(handle, protocol, interface) };
    if status != Status::UNSUPPORTED || protocol.is_null() {
        return status;
    }

    let Some((fallback, st)) =
        with_context(|ctx| (ctx.config.gop_handle_fallback, ctx.system_table))
    else {
        return status;
    };
    if !fallback || st.is_null() {
        return status;
    }

    // SAFETY: `st` is the live system table; `protocol` was checked non-null.
    unsafe {
        if handle != (*st).stdout_handle || *protocol != GraphicsOutputProtocol::GUID {
            return status;
        }
        warn!("graphics output missing on console handle, searching globally");
        (saved.locate_protocol)(protocol, core::ptr::null_mut(), interface)
    }
}

/// `SetVirtualAddressMap` override: optionally swap in the runtime-only
/// subset and pre-establish every mapping before delegating; the firmware's
/// own address-space switch silently fails on some implementations without
/// the mappings already in place.
pub unsafe extern "efiapi" fn set_virtual_address_map(
    map_size: usize,
    desc_size: usize,
    desc_version: u32,
    virtual_map: *mut MemoryDescriptor,
) -> Status {
    let Some(saved) = saved_services() else {
        return Status::UNSUPPORTED;
    };
    let (partial, premap) = with_context(|ctx| {
        (
            ctx.config.partial_virtual_address_map,
            ctx.config.premap_runtime_pages,
        )
    })
    .unwrap_or((false, false));

    let mut runtime = None;
    if (partial || premap) && !virtual_map.is_null() {
        // SAFETY: the caller owns `map_size` bytes of descriptors here.
        match unsafe { MemoryMapView::from_raw(virtual_map.cast::<u8>(), map_size, desc_size) } {
            Ok(mut view) => {
                // A wake-path caller can hand the map over with every
                // virtual address still zero; assign the kernel-space
                // layout it expects before anything consumes the addresses.
                let unassigned = view
                    .iter()
                    .filter(|d| d.att.contains(MemoryAttribute::RUNTIME))
                    .all(|d| d.virt_start == 0);
                if unassigned {
                    assign_virtual_addresses(&mut view, 0);
                }

                if partial {
                    match select_runtime_subset(&view) {
                        Ok(rt) => runtime = Some(rt),
                        // Fail closed on the reduction, keep the other fix.
                        Err(e) => warn!("partial virtual map skipped: {e}"),
                    }
                }

                if premap {
                    let mapped = with_context(|ctx| match runtime.as_mut() {
                        Some(rt) => premap_entries(ctx, &rt.view_mut()),
                        None => premap_entries(ctx, &view),
                    })
                    .unwrap_or(false);
                    if mapped {
                        // One flush for the whole batch.
                        // SAFETY: CPL0, live hierarchy.
                        unsafe { flush_translation_caches() };
                    }
                }
            }
            Err(e) => warn!("malformed virtual map, fixes skipped: {e}"),
        }
    }

    // SAFETY: delegating with either the caller's map or the held subset.
    unsafe {
        match runtime.as_ref() {
            Some(rt) => (saved.set_virtual_address_map)(
                rt.map_size(),
                desc_size,
                desc_version,
                rt.as_ptr().cast_mut(),
            ),
            None => (saved.set_virtual_address_map)(map_size, desc_size, desc_version, virtual_map),
        }
    }
}

/// Walk `view` and map every runtime descriptor's virtual range onto its
/// physical range, pulling table frames from the scratch pool.
fn premap_entries(ctx: &mut crate::CompatContext, view: &MemoryMapView) -> bool {
    let Some(scratch) = ctx.scratch.as_mut() else {
        warn!("no scratch pool reserved, premapping skipped");
        return false;
    };

    // Size the job before touching the tables: one page table covers 512
    // mapped pages, every region can straddle one extra table, and the
    // directory chain above costs a few more. Refusing up front beats
    // running dry with the hierarchy half-grown.
    let runtime_pages = count_runtime_pages(view);
    let worst_case_tables = runtime_pages.div_ceil(512) + view.len() as u64 + 8;
    if worst_case_tables > scratch.available_pages() as u64 {
        warn!("scratch pool cannot cover {runtime_pages} runtime pages, premapping skipped");
        return false;
    }

    let mapper = DirectMapper;
    // SAFETY: runs at CPL0 on the live hierarchy during the transition.
    let space = unsafe { AddressSpace::from_current(&mapper) };

    let mut any = false;
    for desc in view.iter() {
        if !desc.att.contains(MemoryAttribute::RUNTIME) {
            continue;
        }
        if let Err(e) = space.map_range(
            scratch,
            VirtualAddress::new(desc.virt_start),
            PhysicalAddress::new(desc.phys_start),
            desc.page_count,
        ) {
            // Exhaustion ends this fix-up; the switch may still succeed.
            error!("premap of {:#x} failed: {e}", desc.phys_start);
            return any;
        }
        any = true;
    }
    any
}
