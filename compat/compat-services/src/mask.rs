//! Interrupt-mask shim: the real guard on target, a no-op in the host test
//! build where `cli` would fault in user mode.

#[cfg(not(test))]
pub(crate) use compat_sync::IrqGuard;

#[cfg(test)]
pub(crate) struct IrqGuard;

#[cfg(test)]
impl IrqGuard {
    pub(crate) const fn new() -> Self {
        Self
    }
}
