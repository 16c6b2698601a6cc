//! One-shot hook at the kernel entry point.
//!
//! The loader's jump target is overwritten with a small trampoline so this
//! module regains control exactly once before the kernel truly starts. The
//! trampoline machine code itself is opaque here: it is handed in as a byte
//! blob with a known calling contract ("install me at an address; I call
//! back, then you resume the saved bytes"). This module only does the
//! bookkeeping: save the original bytes, place the blob, put everything
//! back.

use compat_memory_addresses::PhysicalAddress;
use log::debug;

/// Longest entry patch supported; matches the trampoline contract.
const MAX_PATCH_LEN: usize = 32;

/// Saved original entry bytes plus where they came from.
pub struct KernelEntryHook {
    entry: PhysicalAddress,
    trampoline: &'static [u8],
    saved: [u8; MAX_PATCH_LEN],
    installed: bool,
}

impl KernelEntryHook {
    /// Prepare a hook for `entry`. `None` when the blob exceeds the patch
    /// budget.
    #[must_use]
    pub const fn new(entry: PhysicalAddress, trampoline: &'static [u8]) -> Option<Self> {
        if trampoline.len() > MAX_PATCH_LEN || trampoline.is_empty() {
            return None;
        }
        Some(Self {
            entry,
            trampoline,
            saved: [0; MAX_PATCH_LEN],
            installed: false,
        })
    }

    /// Save the original entry bytes and write the trampoline over them.
    ///
    /// # Safety
    /// `entry` must point at `trampoline.len()` writable bytes of the
    /// loaded kernel image, and nothing may execute them concurrently.
    pub unsafe fn install(&mut self) {
        debug_assert!(!self.installed);
        let len = self.trampoline.len();
        let at = self.entry.as_u64() as *mut u8;
        // SAFETY: caller guarantees the range.
        unsafe {
            core::ptr::copy_nonoverlapping(at, self.saved.as_mut_ptr(), len);
            core::ptr::copy_nonoverlapping(self.trampoline.as_ptr(), at, len);
        }
        self.installed = true;
        debug!("kernel entry hook installed at {}", self.entry);
    }

    /// Put the original bytes back and return the entry to resume.
    ///
    /// # Safety
    /// Same range requirements as [`install`](Self::install); must run
    /// before anything executes the entry again.
    pub unsafe fn restore(&mut self) -> PhysicalAddress {
        if self.installed {
            let len = self.trampoline.len();
            let at = self.entry.as_u64() as *mut u8;
            // SAFETY: caller guarantees the range.
            unsafe {
                core::ptr::copy_nonoverlapping(self.saved.as_ptr(), at, len);
            }
            self.installed = false;
            debug!("kernel entry restored at {}", self.entry);
        }
        self.entry
    }
}
