//! Sequencing one boot attempt.
//!
//! Drives the override controller and the kernel entry hook around the two
//! decisive moments: the platform handing control to the OS loader, and the
//! loader either giving control back (recovery) or exiting boot services on
//! its way into the kernel.

use crate::events;
use crate::hibernate;
use crate::kernel_hook::KernelEntryHook;
use crate::logger::CompatLogger;
use crate::system_table::SystemTableCopy;
use compat_memory_addresses::PhysicalAddress;
use compat_services::with_context;
use compat_sync::IrqGuard;
use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::ptr::NonNull;
use log::{debug, info, warn};
use uefi::boot::{self, SearchType};
use uefi::{Event, Handle};

/// Progress of the current boot attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransitionState {
    /// Armed, no loader seen yet.
    WaitingForLoaderStart,
    /// Overrides are in the firmware tables.
    Overridden,
    /// The loader is executing with our wrappers underneath it.
    RunningLoader,
    /// The loader returned without booting; everything was restored.
    LoaderReturned,
    /// `ExitBootServices` succeeded; the kernel owns the machine next.
    KernelEntered,
}

struct BootTransition {
    state: TransitionState,
    /// Nesting count of loader sessions; only the outermost transitions
    /// touch the firmware.
    level: usize,
    /// Registration key for finding the loader's image handle.
    loader_search: Option<SearchType<'static>>,
    st_copy: Option<SystemTableCopy>,
    entry_hook: Option<KernelEntryHook>,
    /// Wake handoff chain, when this boot is a hibernate wake.
    wake_handoff: Option<PhysicalAddress>,
    /// Virtual-to-physical displacement of a relocated kernel image, when
    /// the loader had to place it in a relocation block.
    relocation_offset: Option<u64>,
}

impl BootTransition {
    const fn new() -> Self {
        Self {
            state: TransitionState::WaitingForLoaderStart,
            level: 0,
            loader_search: None,
            st_copy: None,
            entry_hook: None,
            wake_handoff: None,
            relocation_offset: None,
        }
    }
}

struct TransitionCell(UnsafeCell<BootTransition>);

// SAFETY: one logical thread; all access is through `with_transition`,
// which masks interrupts for the borrow's duration.
unsafe impl Sync for TransitionCell {}

static TRANSITION: TransitionCell = TransitionCell(UnsafeCell::new(BootTransition::new()));

fn with_transition<R>(f: impl FnOnce(&mut BootTransition) -> R) -> R {
    let _masked = IrqGuard::new();
    // SAFETY: single logical thread; borrow ends before the mask lifts.
    f(unsafe { &mut *TRANSITION.0.get() })
}

/// Register for the loader-start and loader-exit signals.
///
/// # Errors
/// Propagates event-registration failures.
pub fn arm() -> uefi::Result<()> {
    let search = events::listen_named_event(&events::LOADER_HANDLE_PROTOCOL_GUID, loader_start_notify)?;
    events::listen_named_event(&events::LOADER_EXIT_EVENT_GUID, loader_exit_notify)?;
    with_transition(|t| t.loader_search = Some(search));
    Ok(())
}

/// Context hook: broadcast that the memory map is about to be read.
pub fn signal_memory_map_read() {
    events::signal_named_event(&events::MEMORY_MAP_READ_EVENT_GUID);
}

unsafe extern "efiapi" fn loader_start_notify(_event: Event, _ctx: Option<NonNull<c_void>>) {
    on_loader_start();
}

unsafe extern "efiapi" fn loader_exit_notify(_event: Event, _ctx: Option<NonNull<c_void>>) {
    on_loader_exit();
}

/// The platform published the loader handle: go from waiting to overridden.
///
/// Only the outermost session installs; a loader chain-starting another
/// loader just bumps the nesting level.
fn on_loader_start() {
    let outermost = with_transition(|t| {
        t.level += 1;
        t.level == 1
    });
    if !outermost {
        debug!("nested loader session, overrides stay as they are");
        return;
    }

    info!("OS loader starting, installing service overrides");

    let (preserve, st) = with_context(|ctx| (ctx.config.preserve_system_table, ctx.system_table))
        .unwrap_or((false, core::ptr::null_mut()));
    if st.is_null() {
        warn!("no compat context; loader runs unpatched");
        return;
    }

    if preserve {
        let copy = loader_handle().and_then(|handle| {
            // SAFETY: live system table, handle fresh from the search.
            unsafe { SystemTableCopy::create_for(st, handle.as_ptr()) }
        });
        if let Some(copy) = &copy {
            // The relocation protection must spare this one region.
            let area = copy.base().as_u64();
            with_context(|ctx| ctx.system_table_area = area);
        }
        with_transition(|t| t.st_copy = copy);
    }

    with_context(|ctx| {
        // SAFETY: `st` is the live system table.
        unsafe { ctx.controller.install(st) };
    });
    with_transition(|t| t.state = TransitionState::Overridden);

    // Control goes back to the firmware, which jumps into the loader next.
    with_transition(|t| {
        t.state = TransitionState::RunningLoader;
        debug!("boot transition: {:?}", t.state);
    });
}

/// The loader gave control back without booting: the recovery path.
///
/// Everything must read exactly as before install, tables and checksums
/// included.
fn on_loader_exit() {
    let outermost = with_transition(|t| {
        if t.level == 0 {
            warn!("loader exit without a matching start");
            return false;
        }
        t.level -= 1;
        t.level == 0
    });
    if !outermost {
        return;
    }

    info!("loader relinquished control, restoring firmware services");

    if let Some(copy) = with_transition(|t| t.st_copy.take()) {
        with_context(|ctx| ctx.system_table_area = 0);
        copy.free();
    }

    with_context(|ctx| {
        let st = ctx.system_table;
        // SAFETY: `st` is the live system table.
        unsafe { ctx.controller.restore(st) };
    });

    with_transition(|t| {
        t.state = TransitionState::LoaderReturned;
        debug!("boot transition: {:?}", t.state);
    });
}

/// Context hook: `ExitBootServices` succeeded, the loader is headed for the
/// kernel. Place the one-shot entry hook now; the next instruction fetch
/// from the entry point is ours.
pub fn on_loader_handoff() {
    CompatLogger::note_boot_services_exited();
    with_transition(|t| {
        t.state = TransitionState::KernelEntered;
        if let Some(hook) = t.entry_hook.as_mut() {
            // SAFETY: the entry address was vetted when the hook was armed;
            // nothing executes the kernel image yet.
            unsafe { hook.install() };
        } else {
            debug!("no kernel entry hook armed, handing off untouched");
        }
    });
}

/// Arm the one-shot kernel entry hook for this boot attempt.
///
/// The entry address and the trampoline blob come from the image-loading
/// glue; this module only owns the sequencing.
pub fn arm_kernel_entry_hook(entry: PhysicalAddress, trampoline: &'static [u8]) -> bool {
    let Some(hook) = KernelEntryHook::new(entry, trampoline) else {
        warn!("kernel entry trampoline rejected");
        return false;
    };
    with_transition(|t| t.entry_hook = Some(hook));
    true
}

/// Note that this boot is a hibernate wake with a handoff chain to fix.
pub fn set_wake_handoff(handoff: PhysicalAddress) {
    with_transition(|t| t.wake_handoff = Some(handoff));
}

/// Note the displacement of a relocation-block placed kernel.
pub fn set_relocation_offset(offset: u64) {
    with_transition(|t| t.relocation_offset = Some(offset));
}

/// Regained control at the kernel entry: run the final fix-ups, put the
/// original entry bytes back, and report the boot-argument pointer the real
/// entry code should see.
pub fn on_kernel_entry(boot_args: usize) -> usize {
    with_transition(|t| {
        if let Some(hook) = t.entry_hook.as_mut() {
            // SAFETY: same range the install used; nothing else runs.
            unsafe { hook.restore() };
        }

        if let Some(handoff) = t.wake_handoff.take() {
            // SAFETY: the wake glue vetted the chain address.
            unsafe { hibernate::suppress_memory_map_handoff(handoff) };
        }

        // A kernel staged in a relocation block still believes in its
        // original addresses; rebase the argument pointer accordingly.
        let args = match t.relocation_offset {
            Some(offset) => boot_args.wrapping_sub(offset as usize),
            None => boot_args,
        };

        debug!("resuming kernel entry with boot args at {args:#x}");
        args
    })
}

/// The loader's image handle, looked up through the registration key.
fn loader_handle() -> Option<Handle> {
    let search = with_transition(|t| t.loader_search)?;
    match boot::locate_handle_buffer(search) {
        Ok(handles) => handles.first().copied(),
        Err(e) => {
            warn!("loader handle lookup failed: {e:?}");
            None
        }
    }
}
