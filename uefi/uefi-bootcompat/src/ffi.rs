//! C-ABI surface for the collaborators outside this driver.
//!
//! The image-loading glue discovers the kernel entry address and owns the
//! trampoline machine code; the wake glue finds the hibernate handoff
//! chain; the trampoline itself calls back with the boot-argument pointer.
//! None of them are Rust, so the contract is a handful of exported
//! `efiapi` symbols.

use crate::orchestrator;
use compat_memory_addresses::PhysicalAddress;

/// Arm the one-shot hook at `entry` with the given trampoline blob.
///
/// Returns `false` when the blob does not fit the patch budget.
///
/// # Safety
/// `blob` must point at `len` bytes of trampoline code that stay resident
/// for the remainder of the boot.
#[unsafe(no_mangle)]
pub unsafe extern "efiapi" fn bootcompat_arm_kernel_entry_hook(
    entry: u64,
    blob: *const u8,
    len: usize,
) -> bool {
    if blob.is_null() || len == 0 {
        return false;
    }
    // SAFETY: caller guarantees the blob stays resident.
    let trampoline: &'static [u8] = unsafe { core::slice::from_raw_parts(blob, len) };
    orchestrator::arm_kernel_entry_hook(PhysicalAddress::new(entry), trampoline)
}

/// Mark this boot as a hibernate wake with its handoff chain at `handoff`.
#[unsafe(no_mangle)]
pub extern "efiapi" fn bootcompat_set_wake_handoff(handoff: u64) {
    orchestrator::set_wake_handoff(PhysicalAddress::new(handoff));
}

/// Record the displacement of a kernel staged in a relocation block.
#[unsafe(no_mangle)]
pub extern "efiapi" fn bootcompat_set_relocation_offset(offset: u64) {
    orchestrator::set_relocation_offset(offset);
}

/// Trampoline landing point: runs the final fix-ups and returns the
/// boot-argument pointer the restored kernel entry should receive.
#[unsafe(no_mangle)]
pub extern "efiapi" fn bootcompat_kernel_entry_jump_back(boot_args: usize) -> usize {
    orchestrator::on_kernel_entry(boot_args)
}
