//! # Boot Compatibility Driver
//!
//! Resident UEFI driver that patches the boot path of a legacy OS loader on
//! firmware whose services deviate from what that loader expects. The driver
//! itself is thin: it reserves the scratch pool, parks the shared context,
//! and arms the orchestrator; from then on everything happens inside the
//! service wrappers and the event callbacks.
//!
//! ## Boot timeline
//!
//! ```text
//! DriverEntry                          (this file)
//!   - reserve VM scratch pool           while allocation is dependable
//!   - install global compat context
//!   - arm orchestrator                  listen for the loader handle
//!         |
//! platform publishes loader handle  ->  install service overrides
//! loader runs                       ->  wrapped GetMemoryMap / allocator /
//!                                       HandleProtocol / SetVirtualAddressMap
//!         |
//!         +-- loader returns        ->  restore everything (recovery path)
//!         +-- ExitBootServices OK   ->  one-shot kernel entry hook, final
//!                                       fix-ups, resume the real kernel
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![no_main]
#![allow(unsafe_code)]

mod events;
mod ffi;
mod hibernate;
mod kernel_hook;
mod logger;
mod memory;
mod orchestrator;
mod system_table;

use crate::logger::CompatLogger;
use compat_alloc::{SCRATCH_POOL_PAGES, ScratchPool};
use compat_memory_addresses::PhysicalAddress;
use compat_services::{CompatConfig, CompatContext, install_context};
use log::{LevelFilter, info, warn};
use uefi::boot::MemoryType;
use uefi::prelude::*;

/// Scratch-pool placement ceiling: stay below 4 GiB so the tables remain
/// addressable once the target kernel's 32-bit bookkeeping sees them.
const SCRATCH_CEILING: u64 = 0x1_0000_0000;

#[entry]
fn efi_main() -> Status {
    if uefi::helpers::init().is_err() {
        return Status::UNSUPPORTED;
    }
    if CompatLogger::init(LevelFilter::Debug).is_err() {
        return Status::UNSUPPORTED;
    }

    let Some(st) = uefi::table::system_table_raw() else {
        return Status::UNSUPPORTED;
    };

    let mut ctx = CompatContext::new(CompatConfig::default(), st.as_ptr());
    ctx.scratch = reserve_scratch_pool();
    ctx.on_memory_map_read = Some(orchestrator::signal_memory_map_read);
    ctx.on_loader_handoff = Some(orchestrator::on_loader_handoff);
    if !install_context(ctx) {
        return Status::ALREADY_STARTED;
    }

    if let Err(e) = orchestrator::arm() {
        warn!("failed to arm the boot orchestrator: {e:?}");
        return Status::UNSUPPORTED;
    }

    info!("boot compatibility overrides armed");
    Status::SUCCESS
}

/// Reserve the fixed scratch pool while boot services are dependable.
///
/// Page-table frames must still be available after the loader tears the
/// allocator down, so the whole pool is claimed now, top-down below the
/// ceiling. A failed reservation is survivable: the premapping fix simply
/// reports itself not applied later.
fn reserve_scratch_pool() -> Option<ScratchPool> {
    let base = memory::allocate_pages_from_top(
        SCRATCH_POOL_PAGES,
        PhysicalAddress::new(SCRATCH_CEILING),
        MemoryType::BOOT_SERVICES_DATA,
    )?;
    info!("scratch pool reserved at {base}");
    Some(ScratchPool::new(base, SCRATCH_POOL_PAGES))
}
