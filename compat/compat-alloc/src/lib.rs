//! # Scratch Memory for the Boot Transition
//!
//! The Page-Table Engine needs fresh table frames *after* the loader has
//! torn down the ordinary allocator, so a fixed pool is reserved up front,
//! while allocation still works, and then consumed page by page with no
//! reclamation. Exhaustion fails closed; there is nothing sensible to do but
//! report it and skip the fix-up that needed the memory.
//!
//! Reservation placement is computed by [`find_allocation_from_top`], which
//! walks the firmware memory map for the highest conventional block below a
//! ceiling; the firmware call that claims the block stays with the driver so
//! this crate remains pure arithmetic.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod scratch;
mod top_down;

pub use scratch::{SCRATCH_POOL_PAGES, ScratchPool};
pub use top_down::find_allocation_from_top;
