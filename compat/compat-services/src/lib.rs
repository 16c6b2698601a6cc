//! # Firmware Service Overrides
//!
//! Swaps selected function pointers in the live boot- and runtime-services
//! tables for wrappers that forward to the saved originals with one fix
//! applied around the delegation, and restores them afterwards.
//!
//! The controller is nesting-aware: only the outermost install/restore pair
//! touches the hardware tables, so a loader starting a nested loader sees
//! stable pointers throughout. Every live-table write happens with
//! interrupts masked and is followed by a recompute of the owning table's
//! CRC32, using the firmware's own checksum service.
//!
//! Replacement functions cannot carry state, so exactly one global
//! [`CompatContext`] exists, parked in a once-cell and reached through
//! [`with_context`]; everything else threads the context by reference.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod abi;
mod config;
mod context;
mod controller;
mod mask;
pub mod wrappers;

pub use config::CompatConfig;
pub use context::{CompatContext, install_context, with_context};
pub use controller::{OverrideController, SavedFirmwareServices};
