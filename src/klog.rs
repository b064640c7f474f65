// Kernel logger: routes the `log` facade to the console.

use core::fmt::Write;

use log::{LevelFilter, Log, Metadata, Record};

use crate::console;

struct Klog;

impl Log for Klog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut w = console::Writer;
        let _ = writeln!(w, "[{}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

static KLOG: Klog = Klog;

/// Install the console logger. Called once from `kernel_start`; a second
/// call leaves the first installation in place.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&KLOG);
    log::set_max_level(level);
}
