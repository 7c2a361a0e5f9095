//! Serial debug sink.
//!
//! The log macros write here. The port stays uninitialized until
//! `serial::init` runs, so kernel code can log from any path without touching
//! hardware; on non-x86 targets the sink compiles to a no-op.

use conquer_once::spin::Lazy;
use core::fmt;
use spin::Mutex;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use uart_16550::SerialPort;

/// Serial sink for kernel logging.
pub static SERIAL1: Lazy<Mutex<SerialSink>> = Lazy::new(|| Mutex::new(SerialSink::new()));

pub struct SerialSink {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    port: Option<SerialPort>,
}

impl SerialSink {
    const fn new() -> Self {
        SerialSink {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            port: None,
        }
    }
}

impl fmt::Write for SerialSink {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        match self.port.as_mut() {
            Some(port) => port.write_str(s),
            None => Ok(()),
        }
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    fn write_str(&mut self, _s: &str) -> fmt::Result {
        Ok(())
    }
}

/// Brings the COM1 port up. Only the bare-metal embedding calls this.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn init() {
    let mut serial_port = unsafe { SerialPort::new(0x3F8) };
    serial_port.init();
    SERIAL1.lock().port.replace(serial_port);
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub fn init() {}

/// Global print! macro that writes to the serial sink.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {{
        // Use absolute paths to prevent conflicts
        let _ = ::core::fmt::Write::write_fmt(
            &mut *$crate::serial::SERIAL1.lock(),
            format_args!($($arg)*)
        );
    }};
}

/// Global println! macro that writes to the serial sink.
#[macro_export]
macro_rules! serial_println {
    () => {
        $crate::serial_print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*));
    };
}
