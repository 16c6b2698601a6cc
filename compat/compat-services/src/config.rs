/// Per-fix toggles.
///
/// Each fix is independently settable; the default combination is the full
/// legacy behavior, with every fix applied.
#[derive(Copy, Clone, Debug)]
pub struct CompatConfig {
    /// Merge adjacent compatible descriptors in `GetMemoryMap` results.
    pub shrink_memory_map: bool,
    /// Reclassify known-anomalous descriptors in `GetMemoryMap` results.
    pub normalize_memory_map: bool,
    /// Hand `SetVirtualAddressMap` the runtime-only subset instead of the
    /// caller's full map.
    pub partial_virtual_address_map: bool,
    /// Pre-establish the virtual mappings before delegating
    /// `SetVirtualAddressMap`; some firmware's address-space switch silently
    /// fails without them.
    pub premap_runtime_pages: bool,
    /// Retype runtime-data regions as MMIO in `GetMemoryMap` results so the
    /// target kernel leaves them in place instead of relocating them.
    pub protect_runtime_data: bool,
    /// Retry graphics-output lookups on the console handle via a global
    /// protocol search when the firmware reports them unsupported.
    pub gop_handle_fallback: bool,
    /// Refuse allocation calls between `ExitBootServices` entry and return,
    /// when the firmware's own bookkeeping is already stale.
    pub guard_memory_services: bool,
    /// Give the loader a private copy of the system table so a later
    /// restore cannot pull overridden pointers out from under it.
    pub preserve_system_table: bool,
}

impl Default for CompatConfig {
    fn default() -> Self {
        Self {
            shrink_memory_map: true,
            normalize_memory_map: true,
            partial_virtual_address_map: true,
            premap_runtime_pages: true,
            protect_runtime_data: true,
            gop_handle_fallback: true,
            guard_memory_services: true,
            preserve_system_table: true,
        }
    }
}
