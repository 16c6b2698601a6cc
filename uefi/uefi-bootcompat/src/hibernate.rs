//! Wake-image handoff suppression.
//!
//! On wake from hibernation the loader passes the kernel a chain of handoff
//! records alongside the restored image. One of them carries the firmware
//! memory map from before sleep; replaying it makes the kernel remap
//! runtime regions that this module's fixes have already arranged
//! differently, which reboots the machine on the affected firmware. The fix
//! is the wake-path equivalent of dropping runtime mappings on a normal
//! boot: retag that one record so the kernel skips it.

use compat_memory_addresses::PhysicalAddress;
use log::debug;

/// Handoff record tags share a fixed prefix; the low half selects the kind.
const HANDOFF_TYPE_PREFIX: u32 = 0x686F_0000;
/// Chain terminator.
const HANDOFF_TYPE_END: u32 = HANDOFF_TYPE_PREFIX;
/// The pre-sleep firmware memory map.
const HANDOFF_TYPE_MEMORY_MAP: u32 = HANDOFF_TYPE_PREFIX | 3;
/// A tag the kernel does not know and therefore skips.
const HANDOFF_TYPE_IGNORED: u32 = HANDOFF_TYPE_PREFIX | 0xFFFF;

/// One record in the wake handoff chain; `bytes_count` payload bytes follow
/// the header directly.
#[repr(C)]
struct HandoffRecord {
    ty: u32,
    bytes_count: u32,
}

/// Retag the memory-map record in the handoff chain at `handoff_base` so
/// the waking kernel ignores it.
///
/// No-op when the chain carries no memory-map record.
///
/// # Safety
/// `handoff_base` must point at a well-formed handoff chain (terminated by
/// an end record) in writable memory.
pub unsafe fn suppress_memory_map_handoff(handoff_base: PhysicalAddress) {
    let mut at = handoff_base.as_u64();
    loop {
        let record = at as *mut HandoffRecord;
        // SAFETY: caller guarantees a terminated chain.
        let (ty, bytes_count) = unsafe { ((*record).ty, (*record).bytes_count) };
        match ty {
            HANDOFF_TYPE_END => break,
            HANDOFF_TYPE_MEMORY_MAP => {
                // SAFETY: as above; the record header is writable.
                unsafe {
                    (*record).ty = HANDOFF_TYPE_IGNORED;
                }
                debug!("wake memory-map handoff suppressed at {at:#x}");
                break;
            }
            _ => {
                at += (size_of::<HandoffRecord>() + bytes_count as usize) as u64;
            }
        }
    }
}
