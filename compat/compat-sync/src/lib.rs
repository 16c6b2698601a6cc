//! # Pre-OS Synchronization Primitives
//!
//! The boot-transition window has no scheduler and a single logical thread of
//! control; the only preemption source is the interrupt level. Masking
//! interrupts for the duration of a critical section is therefore the entire
//! locking story, and [`IrqGuard`] is the one primitive every firmware-table
//! swap and the scratch-pool reservation run under.
//!
//! [`SyncOnceCell`] exists because replacement service functions installed
//! into the firmware table cannot carry state; the driver parks its context
//! in exactly one of these.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use sync_once_cell::SyncOnceCell;
