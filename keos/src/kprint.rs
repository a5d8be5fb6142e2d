//! Kernel print utilities.
//!
//! The kernel logs through the [`log`] facade. [`init`] installs a console
//! logger that prefixes each line with its level, in the same `[INFO]`,
//! `[WARN]`, `[DEBUG]` format the kernel has always printed. The [`info!`],
//! [`warning!`] and [`debug!`] macros are thin aliases of the facade macros.
//!
//! [`info!`]: crate::info
//! [`warning!`]: crate::warning
//! [`debug!`]: crate::debug

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::sync::atomic::{AtomicBool, Ordering};

/// Silences every message when set.
pub static QUITE: AtomicBool = AtomicBool::new(false);

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        !QUITE.load(Ordering::SeqCst) && metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "[ERROR]",
            Level::Warn => "[WARN]",
            Level::Info => "[INFO]",
            Level::Debug => "[DEBUG]",
            Level::Trace => "[TRACE]",
        };
        println!("{} {}", tag, record.args());
    }

    fn flush(&self) {}
}

/// Installs the console logger and sets the maximum level.
///
/// Calling it again only updates the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::log::info!($($arg)*));
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => ($crate::log::warn!($($arg)*));
}

/// Display a debug message.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => ($crate::log::debug!($($arg)*));
}
