//! Kernel debug output (kd)
//!
//! Backend for the `log` facade. On bare metal, records go to the first
//! serial port; the writer is guarded by a spin mutex so concurrent
//! processors do not interleave lines. Host builds leave the facade
//! unwired and the macros compile to nothing observable.

use log::{LevelFilter, Log, Metadata, Record};

#[cfg(target_os = "none")]
mod serial {
    use core::fmt::{self, Write};
    use spin::Mutex;
    use x86_64::instructions::port::Port;

    const COM1: u16 = 0x3F8;

    pub struct SerialPort {
        data: Port<u8>,
        line_status: Port<u8>,
    }

    impl SerialPort {
        const fn new(base: u16) -> Self {
            Self {
                data: Port::new(base),
                line_status: Port::new(base + 5),
            }
        }

        fn write_byte(&mut self, byte: u8) {
            unsafe {
                while self.line_status.read() & 0x20 == 0 {
                    core::hint::spin_loop();
                }
                self.data.write(byte);
            }
        }
    }

    impl Write for SerialPort {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for byte in s.bytes() {
                if byte == b'\n' {
                    self.write_byte(b'\r');
                }
                self.write_byte(byte);
            }
            Ok(())
        }
    }

    pub static PORT: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));

    pub fn write(args: fmt::Arguments) {
        let _ = PORT.lock().write_fmt(args);
    }
}

struct KdLogger;

impl Log for KdLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        #[cfg(target_os = "none")]
        serial::write(format_args!(
            "[{:5}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
        #[cfg(not(target_os = "none"))]
        let _ = record;
    }

    fn flush(&self) {}
}

static KD_LOGGER: KdLogger = KdLogger;

/// Route `log` records to the debug sink. Call once, early in phase 0.
pub fn kd_initialize() {
    let _ = log::set_logger(&KD_LOGGER);
    log::set_max_level(LevelFilter::Trace);
}
