//! Build-mode switches and tunables.
//!
//! Checks are enabled in debug builds and whenever the `checked` feature is
//! on. With checks off the ledger only keeps counters: no entry map, no
//! liveness lookups before dereference, no allocation sites and no leak
//! report. Range checks on spans and collections are not affected; those stay
//! on so the safe API remains sound, and `unsafe` `*_unchecked` methods exist
//! for hot loops that have already validated their indices.

/// Whether ledger bookkeeping and liveness checks are compiled in.
pub const CHECKS_ENABLED: bool = cfg!(any(debug_assertions, feature = "checked"));

/// Whether each ledger entry also captures a full backtrace.
pub const CAPTURE_BACKTRACES: bool = cfg!(feature = "ledger_backtrace");

/// Largest alignment [`natural_alignment`](crate::alloc::natural_alignment) picks.
pub const MAX_NATURAL_ALIGNMENT: usize = 8;

/// Capacity of a `DynArray` created with `new`.
pub const DEFAULT_ARRAY_CAPACITY: usize = 4;

/// Slot count of a `HashTable` created with `new`.
pub const DEFAULT_TABLE_SLOTS: usize = 8;

/// Initial capacity of a `Writer` created with `new`.
pub const DEFAULT_WRITER_CAPACITY: usize = 64;

/// Load factor numerator: a table grows past `slots * NUM / DEN` used slots.
pub const LOAD_FACTOR_NUM: usize = 3;

/// Load factor denominator.
pub const LOAD_FACTOR_DEN: usize = 4;

/// Default number of disposed addresses remembered for use-after-free reports.
pub const DEFAULT_DISPOSED_HISTORY: usize = 4096;

/// Runtime settings for a [`Ledger`](crate::ledger::Ledger).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerConfig {
    /// How many disposed addresses to remember. Once full, the history is
    /// dropped and use-after-free degrades to an invalid-pointer report.
    pub disposed_history: usize,
    /// Whether [`LedgerGuard`](crate::ledger::LedgerGuard) reports leaks on drop.
    pub report_leaks: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            disposed_history: DEFAULT_DISPOSED_HISTORY,
            report_leaks: CHECKS_ENABLED,
        }
    }
}

impl LedgerConfig {
    /// Reads overrides from `RAWMEM_DISPOSED_HISTORY` and `RAWMEM_REPORT_LEAKS`.
    ///
    /// Unset or unparsable variables keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = LedgerConfig::default();

        if let Some(history) = env_parse::<usize>("RAWMEM_DISPOSED_HISTORY") {
            config.disposed_history = history;
        }

        if let Ok(value) = std::env::var("RAWMEM_REPORT_LEAKS") {
            match parse_flag(&value) {
                Some(flag) => config.report_leaks = flag,
                None => rawmem_log::warn!("RAWMEM_REPORT_LEAKS: expected a boolean, got {value:?}"),
            }
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    let value = std::env::var(var).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            rawmem_log::warn!("{var}: cannot parse {value:?}, using default");
            None
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
