//! Named, payload-free signals between boot-path modules.
//!
//! A named event is a transient protocol install: signaling installs and
//! immediately uninstalls a null interface under the event's GUID, which
//! fires every notify registered for that GUID. Listening is a
//! notify-signal event plus a protocol-notify registration. Collaborators
//! only ever see the GUID, never a payload.

use log::warn;
use uefi::boot::{self, EventNotifyFn, EventType, SearchType, Tpl};
use uefi::{Guid, guid};

/// Raised just before the memory map is read on the loader's behalf.
pub const MEMORY_MAP_READ_EVENT_GUID: Guid = guid!("7c15e1a4-1d2b-4e3e-9f26-8bd3a5c86d10");

/// Raised by the start-image glue once the loader has relinquished control.
pub const LOADER_EXIT_EVENT_GUID: Guid = guid!("a93f3f3c-2b1c-4fd5-a94d-9cdd40ba97ed");

/// Installed on the loader's image handle when the platform hands the OS
/// loader control; our cue to put the overrides in place.
pub const LOADER_HANDLE_PROTOCOL_GUID: Guid = guid!("1f0a5a9b-72a7-4158-bd56-7c49cbd773f3");

/// Fire the named event `guid`.
pub fn signal_named_event(guid: &Guid) {
    // SAFETY: a null interface under a fresh handle; nothing dereferences it.
    unsafe {
        match boot::install_protocol_interface(None, guid, core::ptr::null()) {
            Ok(handle) => {
                let _ = boot::uninstall_protocol_interface(handle, guid, core::ptr::null());
            }
            Err(e) => warn!("signaling named event {guid} failed: {e:?}"),
        }
    }
}

/// Register `notify` to run whenever `guid` is next installed.
///
/// The registration lives for the rest of the boot; the backing event is
/// deliberately leaked. Returns the search key for looking up the handle
/// the protocol got installed on.
///
/// # Errors
/// Propagates event-creation or registration failures verbatim.
pub fn listen_named_event(
    guid: &'static Guid,
    notify: EventNotifyFn,
) -> uefi::Result<SearchType<'static>> {
    // SAFETY: the callback contract is the firmware's; no context pointer.
    let event = unsafe { boot::create_event(EventType::NOTIFY_SIGNAL, Tpl::NOTIFY, Some(notify), None)? };
    let key = boot::register_protocol_notify(guid, &event)?;
    core::mem::forget(event);
    Ok(key)
}
