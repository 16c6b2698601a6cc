//! ABI constants matching the UEFI spec that are not exposed by `uefi-raw`.
//!
//! `BootServices::allocate_pages` takes the `EFI_ALLOCATE_TYPE` discriminant
//! as a plain `u32`, so these are defined as `u32` constants rather than a
//! newtype to keep the call sites assignable to the firmware's function
//! pointer type.

/// Allocate any available range of pages.
pub const ALLOCATE_ANY_PAGES: u32 = 0;
/// Allocate pages at any address below the given address.
pub const ALLOCATE_MAX_ADDRESS: u32 = 1;
/// Allocate pages at the specified address.
pub const ALLOCATE_ADDRESS: u32 = 2;
