//! Print macros for logging.
//!
//! The console itself belongs to the surrounding firmware. It installs a sink
//! with [`set_console`] during bring-up; until then the macros are silent.

use core::fmt::{self, Write};

use spin::Mutex;

/// Console sink installed by the firmware.
static CONSOLE: Mutex<Option<fn(&str)>> = Mutex::new(None);

/// Install the console sink used by `print!`/`println!`.
pub fn set_console(sink: fn(&str)) {
    *CONSOLE.lock() = Some(sink);
}

/// Writer for print macro.
struct Writer(fn(&str));

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

/// Print function calling from print macro.
pub fn print_for_macro(args: fmt::Arguments) {
    if let Some(sink) = *CONSOLE.lock() {
        let mut writer = Writer(sink);
        // The sink cannot fail; Writer::write_str always returns Ok.
        let _ = writer.write_fmt(args);
    }
}

/// Print to the firmware console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::log::print_for_macro(format_args!($($arg)*)));
}

/// Print with linebreak to the firmware console.
#[macro_export]
macro_rules! println {
    ($fmt:expr) => ($crate::print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::print!(concat!($fmt, "\n"), $($arg)*));
}
