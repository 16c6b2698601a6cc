//! The one global the replacement service functions reach their state from.

use crate::config::CompatConfig;
use crate::controller::OverrideController;
use compat_alloc::ScratchPool;
use compat_sync::SyncOnceCell;
use core::cell::UnsafeCell;
use log::warn;
use uefi_raw::table::system::SystemTable;

use crate::mask::IrqGuard;

/// Everything the boot-transition machinery keeps between service calls.
///
/// Constructed once at the start of the transition window and threaded by
/// reference from there on; the global cell exists only because installed
/// function pointers have nowhere to carry it.
pub struct CompatContext {
    /// Active fix toggles.
    pub config: CompatConfig,
    /// Saved originals plus the nesting depth.
    pub controller: OverrideController,
    /// Table pages for post-boot-services page-table work. `None` until the
    /// reservation succeeded.
    pub scratch: Option<ScratchPool>,
    /// The firmware system table, for handle comparisons and non-overridden
    /// services.
    pub system_table: *mut SystemTable,
    /// Set while a wrapped `ExitBootServices` call is in flight; allocation
    /// requests arriving in that window are refused.
    pub memory_services_disabled: bool,
    /// Physical base of the relocated system-table copy, or 0. The one
    /// runtime-data region relocation protection must spare.
    pub system_table_area: u64,
    /// Raised just before the memory map is read on the loader's behalf.
    pub on_memory_map_read: Option<fn()>,
    /// Raised after `ExitBootServices` succeeded and the loader is headed
    /// for the kernel.
    pub on_loader_handoff: Option<fn()>,
}

impl CompatContext {
    /// Fresh context around the given system table.
    #[must_use]
    pub const fn new(config: CompatConfig, system_table: *mut SystemTable) -> Self {
        Self {
            config,
            controller: OverrideController::new(),
            scratch: None,
            system_table,
            memory_services_disabled: false,
            system_table_area: 0,
            on_memory_map_read: None,
            on_loader_handoff: None,
        }
    }
}

struct ContextCell(UnsafeCell<CompatContext>);

// SAFETY: one logical thread of control; every access goes through
// `with_context`, which masks interrupts for the borrow's duration.
unsafe impl Sync for ContextCell {}

static CONTEXT: SyncOnceCell<ContextCell> = SyncOnceCell::new();

/// Park the context in the global cell. Returns `false` (and drops the new
/// value) if one is already installed.
pub fn install_context(ctx: CompatContext) -> bool {
    let fresh = CONTEXT.set(ContextCell(UnsafeCell::new(ctx)));
    if !fresh {
        warn!("compat context already installed");
    }
    fresh
}

/// Run `f` against the installed context with interrupts masked.
///
/// Returns `None` when no context has been installed yet. Do not call the
/// wrapped firmware services from inside `f`; copy what you need out, drop
/// the borrow, then delegate.
pub fn with_context<R>(f: impl FnOnce(&mut CompatContext) -> R) -> Option<R> {
    let cell = CONTEXT.get()?;
    let _masked = IrqGuard::new();
    // SAFETY: single logical thread; the exclusive borrow ends before the
    // interrupt mask is released.
    Some(f(unsafe { &mut *cell.0.get() }))
}
