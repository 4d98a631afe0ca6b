//! Kernel logging subsystem.
//!
//! Records are formatted as `[LEVEL] message` with an ANSI colour prefix and
//! handed to a single registered [`Sink`]. Until a sink is installed every
//! record is dropped, so the macros are safe to call from the first
//! instruction of boot.
//!
//! The logger also registers itself as the backend of the `log` facade, so
//! dependencies that log through `log::info!` end up on the same sink.
#![cfg_attr(not(test), no_std)]

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod serial;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => " INFO",
            Level::Warn => " WARN",
            Level::Error => "ERROR",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Level::Trace => "\x1b[90m", // Gray
            Level::Debug => "\x1b[36m", // Cyan
            Level::Info => "\x1b[32m",  // Green
            Level::Warn => "\x1b[33m",  // Yellow
            Level::Error => "\x1b[31m", // Red
        }
    }

    fn from_u8(raw: u8) -> Level {
        match raw {
            0 => Level::Trace,
            1 => Level::Debug,
            2 => Level::Info,
            3 => Level::Warn,
            _ => Level::Error,
        }
    }

    fn to_filter(self) -> log::LevelFilter {
        match self {
            Level::Trace => log::LevelFilter::Trace,
            Level::Debug => log::LevelFilter::Debug,
            Level::Info => log::LevelFilter::Info,
            Level::Warn => log::LevelFilter::Warn,
            Level::Error => log::LevelFilter::Error,
        }
    }
}

impl From<log::Level> for Level {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => Level::Trace,
            log::Level::Debug => Level::Debug,
            log::Level::Info => Level::Info,
            log::Level::Warn => Level::Warn,
            log::Level::Error => Level::Error,
        }
    }
}

/// Destination for formatted log output.
///
/// Implementations must tolerate being called from interrupt context.
pub trait Sink: Send + Sync {
    fn write_str(&self, s: &str);
}

static SINK: spin::Once<&'static dyn Sink> = spin::Once::new();
static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Bridges records from the `log` facade into [`log`].
struct FacadeBridge;

impl log::Log for FacadeBridge {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        Level::from(metadata.level()) >= max_level()
    }

    fn log(&self, record: &log::Record) {
        log(Level::from(record.level()), *record.args());
    }

    fn flush(&self) {}
}

static BRIDGE: FacadeBridge = FacadeBridge;

/// Initialize the kernel logger with its output sink and level filter.
///
/// Only the first call installs a sink; later calls just adjust the level.
pub fn init(sink: &'static dyn Sink, level: Level) {
    SINK.call_once(|| sink);
    set_max_level(level);
    // A second registration (e.g. another init) is harmless.
    let _ = log::set_logger(&BRIDGE);
}

/// Change the minimum level that reaches the sink.
pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
    log::set_max_level(level.to_filter());
}

pub fn max_level() -> Level {
    Level::from_u8(MAX_LEVEL.load(Ordering::Relaxed))
}

/// `fmt::Write` adapter over the installed sink.
struct SinkWriter(&'static dyn Sink);

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// Log a message with a specific level
pub fn log(level: Level, args: fmt::Arguments) {
    if level < max_level() {
        return;
    }
    let Some(sink) = SINK.get() else {
        return;
    };
    let mut out = SinkWriter(*sink);
    out.0.write_str(level.color());
    out.0.write_str("[");
    out.0.write_str(level.as_str());
    out.0.write_str("]\x1b[0m ");
    let _ = out.write_fmt(args);
    out.0.write_str("\n");
}

/// Print to the sink without formatting or filtering
pub fn print(args: fmt::Arguments) {
    if let Some(sink) = SINK.get() {
        let _ = SinkWriter(*sink).write_fmt(args);
    }
}

/// Log at TRACE level
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Trace, format_args!($($arg)*))
    };
}

/// Log at DEBUG level
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Debug, format_args!($($arg)*))
    };
}

/// Log at INFO level
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Info, format_args!($($arg)*))
    };
}

/// Log at WARN level
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Warn, format_args!($($arg)*))
    };
}

/// Log at ERROR level
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Error, format_args!($($arg)*))
    };
}

/// Print without newline
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::print(format_args!($($arg)*))
    };
}

/// Print with newline
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => {{
        $crate::print(format_args!($($arg)*));
        $crate::print(format_args!("\n"));
    }};
}
