//! A minimal, zero-dependency diagnostics logger for `rawmem`.
//!
//! The memory primitives report ledger activity, collection growth and leak
//! reports through this crate. Output goes to stderr so it never interleaves
//! with data a program writes to stdout.
//!
//! # Example
//!
//! ```
//! use rawmem_log::{debug, error, info, warn, Level};
//!
//! rawmem_log::set_level(Level::Debug);
//!
//! let bytes = 64;
//! info!("allocated {} bytes", bytes);
//! debug!("slot states: {:?}", [0u8, 1, 2]);
//! warn!("table is mostly tombstones");
//! error!("leaked allocation at {:#x}", 0x1000);
//! ```
//!
//! # Configuration
//!
//! The level defaults to [`Level::Warn`]. [`init_from_env`] reads a level name
//! (`error`, `warn`, `info`, `debug`, `trace`, or `off`) from an environment
//! variable, which is how `rawmem::init` picks up `RAWMEM_LOG`.

use std::fmt::{self, Arguments};
use std::io::Write;
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

/// Log levels ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Failures the caller has to act on (leaks, corrupted bookkeeping).
    Error = 1,
    /// Recoverable misuse, such as a disposal error swallowed during drop.
    Warn = 2,
    /// Lifecycle events.
    Info = 3,
    /// Growth, rehashing and other internal decisions.
    Debug = 4,
    /// Every ledger operation.
    Trace = 5,
}

/// Threshold value meaning "log nothing".
const OFF: u8 = 0;

impl Level {
    const fn color_code(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    /// Returns the upper-case name of this level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn from_u8(raw: u8) -> Option<Level> {
        match raw {
            1 => Some(Level::Error),
            2 => Some(Level::Warn),
            3 => Some(Level::Info),
            4 => Some(Level::Debug),
            5 => Some(Level::Trace),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a level name cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError {
    input: String,
}

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level: {:?}", self.input)
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for Level {
    type Err = ParseLevelError;

    /// Parses a level name case-insensitively.
    ///
    /// ```
    /// use rawmem_log::Level;
    ///
    /// assert_eq!("trace".parse::<Level>(), Ok(Level::Trace));
    /// assert_eq!("WARN".parse::<Level>(), Ok(Level::Warn));
    /// assert!("loud".parse::<Level>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ERROR" => Ok(Level::Error),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "INFO" => Ok(Level::Info),
            "DEBUG" => Ok(Level::Debug),
            "TRACE" => Ok(Level::Trace),
            _ => Err(ParseLevelError {
                input: s.to_owned(),
            }),
        }
    }
}

/// The global logger.
///
/// Holds the active threshold in an atomic so any thread can change or query
/// it without locking. Obtain it through [`get_logger`].
pub struct Logger {
    threshold: AtomicU8,
    color: bool,
}

impl Logger {
    const fn new(threshold: u8, color: bool) -> Self {
        Logger {
            threshold: AtomicU8::new(threshold),
            color,
        }
    }

    /// Sets the minimum level that will be emitted.
    pub fn set_level(&self, level: Level) {
        self.threshold.store(level as u8, Ordering::SeqCst);
    }

    /// Silences the logger entirely.
    pub fn disable(&self) {
        self.threshold.store(OFF, Ordering::SeqCst);
    }

    /// Returns the current threshold, or `None` when logging is off.
    pub fn level(&self) -> Option<Level> {
        Level::from_u8(self.threshold.load(Ordering::Relaxed))
    }

    /// Checks whether a message at `level` would be emitted.
    #[inline]
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.threshold.load(Ordering::Relaxed)
    }

    fn emit(&self, level: Level, target: &str, args: Arguments<'_>) {
        const RESET: &str = "\x1b[0m";

        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        // A failed diagnostic write has nowhere better to go.
        let _ = if self.color {
            writeln!(out, "{}[{level}]{RESET} {target}: {args}", level.color_code())
        } else {
            writeln!(out, "[{level}] {target}: {args}")
        };
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Returns the global logger, creating it at [`Level::Warn`] on first use.
///
/// Colored output is used unless the `NO_COLOR` environment variable is set.
pub fn get_logger() -> &'static Logger {
    LOGGER.get_or_init(|| {
        let color = std::env::var_os("NO_COLOR").is_none();
        Logger::new(Level::Warn as u8, color)
    })
}

/// Sets the minimum level for the global logger.
pub fn set_level(level: Level) {
    get_logger().set_level(level);
}

/// Sets the minimum level from a level name.
///
/// # Errors
///
/// Returns [`ParseLevelError`] when `s` is not a level name.
pub fn set_level_from_str(s: &str) -> Result<(), ParseLevelError> {
    set_level(s.parse()?);
    Ok(())
}

/// Configures the global logger from the environment variable `var`.
///
/// An unset variable leaves the level untouched, `off` disables logging, and
/// an unparsable value is reported once at warn level.
///
/// ```
/// // No such variable, so the level stays as it was.
/// rawmem_log::init_from_env("RAWMEM_LOG_DOCTEST_UNSET");
/// ```
pub fn init_from_env(var: &str) {
    let Ok(value) = std::env::var(var) else {
        return;
    };

    if value.trim().eq_ignore_ascii_case("off") {
        get_logger().disable();
        return;
    }

    if let Err(err) = set_level_from_str(&value) {
        __log_with_target(Level::Warn, module_path!(), format_args!("{var}: {err}"));
    }
}

/// Emits a record. Called by the macros after their level check.
#[doc(hidden)]
pub fn __log_with_target(level: Level, target: &str, args: Arguments<'_>) {
    let logger = get_logger();
    if logger.enabled(level) {
        logger.emit(level, target, args);
    }
}

/// Returns `true` when the given level would currently be logged.
///
/// Useful to skip building expensive diagnostics.
#[macro_export]
macro_rules! log_enabled {
    ($level:expr) => {
        $crate::get_logger().enabled($level)
    };
}

/// Logs a message at an explicit level, tagged with the caller's module path.
///
/// ```
/// use rawmem_log::{log, Level};
///
/// log!(level: Level::Info, "ledger holds {} entries", 3);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {{
        let level = $level;
        if $crate::get_logger().enabled(level) {
            $crate::__log_with_target(level, module_path!(), format_args!($($arg)*));
        }
    }};
}

/// Logs a message at the Error level.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Error, $($arg)*)
    };
}

/// Logs a message at the Warn level.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Warn, $($arg)*)
    };
}

/// Logs a message at the Info level.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Info, $($arg)*)
    };
}

/// Logs a message at the Debug level.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Debug, $($arg)*)
    };
}

/// Logs a message at the Trace level.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Trace, $($arg)*)
    };
}
