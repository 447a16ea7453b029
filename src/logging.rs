//! Kernel logging over the QEMU debug console port.

use core::fmt::{self, Write};

use log::{Log, Metadata, Record};

use crate::arch::x86::cpu;

const DEBUGCON_PORT: u16 = 0xE9;

struct Debugcon;

impl Write for Debugcon {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            cpu::outb(DEBUGCON_PORT, byte);
        }
        Ok(())
    }
}

struct DebugconLog {
    writer: spin::Mutex<Debugcon>,
}

static LOGGER: DebugconLog = DebugconLog {
    writer: spin::Mutex::new(Debugcon),
};

impl Log for DebugconLog {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            let mut writer = self.writer.lock();
            let _ = writeln!(writer, "[{:5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

pub fn init() {
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(log::LevelFilter::Info);
}
