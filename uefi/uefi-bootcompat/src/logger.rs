//! Console plus debug-console logging.

use compat_debugcon::debugcon_trace;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Flipped once `ExitBootServices` has succeeded; the firmware text console
/// is gone from that point on and only the debug console keeps working.
static BOOT_SERVICES_LIVE: AtomicBool = AtomicBool::new(true);

pub struct CompatLogger {
    max_level: LevelFilter,
}

impl CompatLogger {
    /// Install as the global logger. Call once during driver entry.
    ///
    /// # Errors
    /// Propagates [`log::set_logger`] failure (a logger was already set).
    pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
        static LOGGER: CompatLogger = CompatLogger {
            max_level: LevelFilter::Trace,
        };
        // The static's own filter stays permissive; the effective ceiling is
        // the max level configured here.
        log::set_logger(&LOGGER)?;
        log::set_max_level(max_level);
        Ok(())
    }

    /// Stop mirroring to the firmware console.
    pub fn note_boot_services_exited() {
        BOOT_SERVICES_LIVE.store(false, Ordering::Release);
    }
}

impl Log for CompatLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        debugcon_trace!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );

        if BOOT_SERVICES_LIVE.load(Ordering::Acquire) {
            uefi::println!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {
        // no-op, both sinks are unbuffered
    }
}
