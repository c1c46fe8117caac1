//! Leveled logging facade for the driver stack.
//!
//! The driver never owns an output device, so all messages are forwarded to a
//! sink installed by the embedding platform through [`set_log_fn`]. Until a
//! sink is installed, messages are discarded. A global maximum level filters
//! messages before any formatting work reaches the sink.
//!
//! Use [`sd_log!`] or one of the level shorthands (`sd_err!`, `sd_info!`, ...).

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

// ---------------------------------------------------------------------------
// Log levels (lower = more severe)
// ---------------------------------------------------------------------------

/// Log severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// The controller is in a state the driver cannot recover from.
    Fatal = 0,
    /// A request or recovery step failed.
    Error = 1,
    /// Unexpected hardware behaviour that was handled.
    Warn = 2,
    /// Lifecycle events: reset, card insertion, queue enable.
    Info = 3,
    /// Per-request diagnostics.
    Debug = 4,
    /// Register-level tracing.
    Trace = 5,
}

impl LogLevel {
    /// Returns the fixed-width level name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warn => "WARN ",
            Self::Info => "INFO ",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Fatal,
            1 => Self::Error,
            2 => Self::Warn,
            3 => Self::Info,
            4 => Self::Debug,
            _ => Self::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name().trim_end())
    }
}

// ---------------------------------------------------------------------------
// Sink registration
// ---------------------------------------------------------------------------

/// Signature of the platform log sink.
pub type LogFn = fn(LogLevel, fmt::Arguments<'_>);

fn null_log(_level: LogLevel, _args: fmt::Arguments<'_>) {}

static LOG_FN: AtomicPtr<()> = AtomicPtr::new(null_log as *mut ());
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Installs the platform log sink.
///
/// # Safety
///
/// `f` is called from both interrupt and polling context, so it must not
/// block and must not call back into the driver.
pub unsafe fn set_log_fn(f: LogFn) {
    LOG_FN.store(f as *mut (), Ordering::Release);
}

/// Sets the most verbose level that reaches the sink.
pub fn set_max_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Returns the current maximum level.
#[must_use]
pub fn max_level() -> LogLevel {
    LogLevel::from_u8(MAX_LEVEL.load(Ordering::Relaxed))
}

/// Returns `true` if messages at `level` currently reach the sink.
#[inline]
#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

#[inline]
fn load_log_fn() -> LogFn {
    let ptr = LOG_FN.load(Ordering::Acquire);
    // SAFETY: Only `LogFn` pointers (or the initial `null_log`) are ever
    // stored into LOG_FN.
    unsafe { core::mem::transmute::<*mut (), LogFn>(ptr) }
}

/// Implementation detail for [`sd_log!`]. Not public API.
#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments<'_>) {
    if enabled(level) {
        load_log_fn()(level, args);
    }
}

// ---------------------------------------------------------------------------
// Macros
// ---------------------------------------------------------------------------

/// Logs a message at the given level.
#[macro_export]
macro_rules! sd_log {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, format_args!($($arg)*))
    };
}

/// Logs a fatal-level message.
#[macro_export]
macro_rules! sd_fatal {
    ($($arg:tt)*) => { $crate::sd_log!($crate::log::LogLevel::Fatal, $($arg)*) };
}

/// Logs an error-level message.
#[macro_export]
macro_rules! sd_err {
    ($($arg:tt)*) => { $crate::sd_log!($crate::log::LogLevel::Error, $($arg)*) };
}

/// Logs a warning-level message.
#[macro_export]
macro_rules! sd_warn {
    ($($arg:tt)*) => { $crate::sd_log!($crate::log::LogLevel::Warn, $($arg)*) };
}

/// Logs an info-level message.
#[macro_export]
macro_rules! sd_info {
    ($($arg:tt)*) => { $crate::sd_log!($crate::log::LogLevel::Info, $($arg)*) };
}

/// Logs a debug-level message.
#[macro_export]
macro_rules! sd_debug {
    ($($arg:tt)*) => { $crate::sd_log!($crate::log::LogLevel::Debug, $($arg)*) };
}

/// Logs a trace-level message.
#[macro_export]
macro_rules! sd_trace {
    ($($arg:tt)*) => { $crate::sd_log!($crate::log::LogLevel::Trace, $($arg)*) };
}
