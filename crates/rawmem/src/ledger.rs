//! Allocation ledger.
//!
//! Every block handed out by `rawmem` goes through a [`Ledger`]. The ledger
//! talks to the system allocator and, when checks are enabled, keeps a table
//! of live addresses so that:
//!
//! - freeing an address twice, or one that was never allocated, is reported
//!   instead of corrupting the heap
//! - reads through a stale address can be caught before dereference
//! - blocks still live at shutdown are reported with the call site that
//!   allocated them
//!
//! # Build modes
//!
//! With [`CHECKS_ENABLED`](crate::config::CHECKS_ENABLED) off the ledger only
//! maintains atomic counters. The entry table, the disposed-address history
//! and site capture all disappear, and [`Ledger::is_live`] answers `true` for
//! any address.
//!
//! # Thread Safety
//!
//! The ledger is the only `rawmem` type meant to be shared between threads.
//! The entry table sits behind a `Mutex`; counters are atomics updated while
//! that lock is held, so `live_count() == entry_count()` holds whenever no
//! call is in flight.
//!
//! # Example
//!
//! ```
//! use rawmem::ledger::Ledger;
//!
//! let ledger = Ledger::new();
//! let ptr = ledger.allocate(64, 8);
//! assert!(ledger.is_live(ptr.addr().get()));
//!
//! // SAFETY: `ptr` came from this ledger with the same size and alignment.
//! unsafe { ledger.free(ptr, 64, 8).unwrap() };
//! assert_eq!(ledger.live_count(), 0);
//! ```

use crate::config::{CAPTURE_BACKTRACES, CHECKS_ENABLED, LedgerConfig};
use crate::error::{Error, Result};
use fxhash::FxBuildHasher;
use hashbrown::HashMap;
use rawmem_log::{debug, error, info, trace, warn};
use std::alloc::{self, Layout};
use std::fmt;
use std::panic::Location;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

/// Where a block was allocated or disposed.
#[derive(Clone)]
pub struct Site {
    location: &'static Location<'static>,
    #[cfg(feature = "ledger_backtrace")]
    backtrace: backtrace::Backtrace,
}

impl Site {
    fn capture(location: &'static Location<'static>) -> Self {
        Site {
            location,
            #[cfg(feature = "ledger_backtrace")]
            backtrace: backtrace::Backtrace::new_unresolved(),
        }
    }

    /// Source location of the call.
    #[must_use]
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Resolved backtrace, when the `ledger_backtrace` feature captured one.
    #[must_use]
    pub fn backtrace(&self) -> Option<String> {
        #[cfg(feature = "ledger_backtrace")]
        {
            let mut backtrace = self.backtrace.clone();
            backtrace.resolve();
            Some(format!("{backtrace:?}"))
        }

        #[cfg(not(feature = "ledger_backtrace"))]
        {
            None
        }
    }
}

impl fmt::Debug for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Site({})", self.location)
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.location, f)
    }
}

/// A live allocation as recorded by the ledger.
struct LedgerEntry {
    size: usize,
    align: usize,
    site: Site,
}

/// An address that has been disposed, kept to tell use-after-free apart from
/// a pointer the ledger never saw.
struct DisposedEntry {
    allocated_at: &'static Location<'static>,
    freed_at: &'static Location<'static>,
}

#[derive(Default)]
struct Books {
    live: HashMap<usize, LedgerEntry, FxBuildHasher>,
    disposed: HashMap<usize, DisposedEntry, FxBuildHasher>,
}

/// A block that was still live when leaks were checked.
#[derive(Debug, Clone)]
pub struct LeakRecord {
    /// Address of the block.
    pub addr: usize,
    /// Size in bytes.
    pub size: usize,
    /// Alignment the block was allocated with.
    pub align: usize,
    /// Where it was allocated.
    pub site: Site,
}

impl fmt::Display for LeakRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes at {:#x} allocated at {}",
            self.size, self.addr, self.site
        )
    }
}

/// Counters describing ledger traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerStats {
    /// Blocks currently live.
    pub live: usize,
    /// Bytes currently live.
    pub live_bytes: usize,
    /// Highest value `live_bytes` has reached.
    pub peak_bytes: usize,
    /// Blocks ever allocated.
    pub total_allocations: usize,
    /// Blocks ever freed.
    pub total_frees: usize,
    /// Reallocations performed.
    pub total_reallocations: usize,
}

/// Registry of live allocations.
///
/// Most code uses the process-wide instance returned by [`ledger`]. Separate
/// instances are useful for isolating counts, for example in tests.
pub struct Ledger {
    books: Mutex<Books>,
    config: LedgerConfig,
    live: AtomicUsize,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    total_allocations: AtomicUsize,
    total_frees: AtomicUsize,
    total_reallocations: AtomicUsize,
}

impl Default for Ledger {
    fn default() -> Self {
        Ledger::new()
    }
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Builds the layout used for a block. Zero-size requests reserve one byte so
/// the system allocator never sees a zero-size layout.
#[track_caller]
fn layout_for(size: usize, align: usize) -> Layout {
    assert!(
        align.is_power_of_two(),
        "Alignment must be a power of two, got {align}"
    );

    match Layout::from_size_align(size.max(1), align) {
        Ok(layout) => layout,
        Err(_) => panic!("Allocation of {size} bytes overflows the address space"),
    }
}

impl Ledger {
    /// Creates a ledger with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Ledger::with_config(LedgerConfig::default())
    }

    /// Creates a ledger with an explicit configuration.
    #[must_use]
    pub fn with_config(config: LedgerConfig) -> Self {
        Ledger {
            books: Mutex::new(Books::default()),
            config,
            live: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
            total_allocations: AtomicUsize::new(0),
            total_frees: AtomicUsize::new(0),
            total_reallocations: AtomicUsize::new(0),
        }
    }

    /// Returns the configuration this ledger was built with.
    #[must_use]
    pub fn config(&self) -> LedgerConfig {
        self.config
    }

    fn books(&self) -> MutexGuard<'_, Books> {
        // The tables are updated atomically with respect to panics (no user
        // code runs under the lock), so a poisoned lock is still consistent.
        self.books.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates `size` zeroed bytes aligned to `align` and registers them.
    ///
    /// The caller's location is recorded as the allocation site.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two or the size overflows. An
    /// allocator failure is fatal and goes through
    /// [`std::alloc::handle_alloc_error`].
    #[track_caller]
    #[must_use]
    pub fn allocate(&self, size: usize, align: usize) -> NonNull<u8> {
        let layout = layout_for(size, align);

        // SAFETY: `layout_for` never produces a zero-size layout.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout)
        };

        let addr = ptr.addr().get();
        let site = Location::caller();
        self.track_alloc(addr, size, align, site);
        trace!("allocate {size} bytes (align {align}) at {addr:#x} from {site}");

        ptr
    }

    /// Deregisters and deallocates a block.
    ///
    /// # Errors
    ///
    /// With checks enabled, returns [`Error::UseAfterFree`] when the address
    /// was already disposed and [`Error::InvalidPointer`] when it was never
    /// allocated or `size` differs from the recorded size. The block is left
    /// untouched in both cases.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this ledger's [`allocate`] or
    /// [`reallocate`] with the same `size` and `align`, and must not be used
    /// after this call. With checks enabled a violation is reported instead
    /// of being undefined behaviour.
    ///
    /// [`allocate`]: Ledger::allocate
    /// [`reallocate`]: Ledger::reallocate
    #[track_caller]
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<()> {
        let addr = ptr.addr().get();
        let site = Location::caller();
        self.track_free(addr, size, site)?;

        let layout = layout_for(size, align);
        // SAFETY: the caller guarantees `ptr` was allocated by this ledger
        // with this layout; `track_free` validated it when checks are on.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };

        trace!("free {size} bytes at {addr:#x} from {site}");
        Ok(())
    }

    /// Resizes a block, possibly moving it.
    ///
    /// Bytes past the old size are zeroed. The old address is deregistered
    /// and the returned one registered, so any pointer into the old block
    /// must be refreshed.
    ///
    /// # Errors
    ///
    /// Same as [`Ledger::free`] for the old block.
    ///
    /// # Safety
    ///
    /// Same contract as [`Ledger::free`] for `ptr`, `size` and `align`.
    #[track_caller]
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        size: usize,
        align: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>> {
        let old_addr = ptr.addr().get();
        let site = Location::caller();
        let old_layout = layout_for(size, align);
        let new_layout = layout_for(new_size, align);

        // The old entry leaves the table before `realloc` can hand the
        // address to another thread.
        let old_entry = self.begin_realloc(old_addr, size, site)?;

        // SAFETY: `ptr` was allocated with `old_layout` (caller contract,
        // validated above when checks are on) and `new_layout.size()` is
        // non-zero and does not overflow when rounded to `align`.
        let raw = unsafe { alloc::realloc(ptr.as_ptr(), old_layout, new_layout.size()) };
        let Some(new_ptr) = NonNull::new(raw) else {
            // The old block is untouched on failure.
            self.abort_realloc(old_addr, old_entry);
            alloc::handle_alloc_error(new_layout)
        };

        if new_size > size {
            // SAFETY: the block is `new_size` bytes long; the tail past the
            // old size is uninitialized and ours to write.
            unsafe { new_ptr.as_ptr().add(size).write_bytes(0, new_size - size) };
        }

        let new_addr = new_ptr.addr().get();
        self.finish_realloc(new_addr, size, new_size, align, site);
        trace!("reallocate {old_addr:#x} ({size} bytes) -> {new_addr:#x} ({new_size} bytes) from {site}");

        Ok(new_ptr)
    }

    /// Returns `true` if `addr` is a live block.
    ///
    /// Without checks the ledger keeps no table and reports every address as
    /// live.
    #[must_use]
    pub fn is_live(&self, addr: usize) -> bool {
        !CHECKS_ENABLED || self.books().live.contains_key(&addr)
    }

    /// Returns `Ok` if `addr` is live, otherwise the reason it is not.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterFree`] for a disposed block still in the history,
    /// [`Error::InvalidPointer`] otherwise.
    pub fn check_live(&self, addr: usize) -> Result<()> {
        if !CHECKS_ENABLED {
            return Ok(());
        }

        let books = self.books();
        if books.live.contains_key(&addr) {
            return Ok(());
        }

        Err(match books.disposed.get(&addr) {
            Some(disposed) => Error::UseAfterFree {
                addr,
                allocated_at: disposed.allocated_at,
                freed_at: disposed.freed_at,
            },
            None => Error::InvalidPointer { addr },
        })
    }

    /// Panics unless `addr` is live. Compiles to nothing without checks.
    ///
    /// # Panics
    ///
    /// Panics with the [`check_live`](Ledger::check_live) error.
    #[inline]
    #[track_caller]
    pub fn assert_live(&self, addr: usize) {
        if CHECKS_ENABLED
            && let Err(err) = self.check_live(addr)
        {
            panic!("{err}");
        }
    }

    /// Size recorded for a live block, when checks are on.
    #[must_use]
    pub fn tracked_size(&self, addr: usize) -> Option<usize> {
        self.books().live.get(&addr).map(|entry| entry.size)
    }

    /// Number of live blocks.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Number of entries in the live table (always 0 without checks).
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.books().live.len()
    }

    /// Returns a snapshot of the ledger counters.
    #[must_use]
    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            live: self.live.load(Ordering::Acquire),
            live_bytes: self.live_bytes.load(Ordering::Acquire),
            peak_bytes: self.peak_bytes.load(Ordering::Acquire),
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_frees: self.total_frees.load(Ordering::Relaxed),
            total_reallocations: self.total_reallocations.load(Ordering::Relaxed),
        }
    }

    /// Lists every live block, ordered by address.
    #[must_use]
    pub fn leaks(&self) -> Vec<LeakRecord> {
        let books = self.books();
        let mut leaks: Vec<LeakRecord> = books
            .live
            .iter()
            .map(|(&addr, entry)| LeakRecord {
                addr,
                size: entry.size,
                align: entry.align,
                site: entry.site.clone(),
            })
            .collect();
        leaks.sort_unstable_by_key(|leak| leak.addr);
        leaks
    }

    /// Verifies that no blocks are live, logging each one that is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeakDetected`] with the aggregate count and size.
    pub fn check_leaks(&self) -> Result<()> {
        let live = self.live_count();
        if live == 0 {
            return Ok(());
        }

        let bytes = self.live_bytes.load(Ordering::Acquire);
        if CHECKS_ENABLED {
            for leak in self.leaks() {
                error!("leaked {leak}");
                if let Some(backtrace) = leak.site.backtrace() {
                    error!("allocation backtrace:\n{backtrace}");
                }
            }
        }

        Err(Error::LeakDetected { count: live, bytes })
    }

    /// Returns a guard that runs [`check_leaks`](Ledger::check_leaks) when dropped.
    #[must_use = "dropping the guard runs the leak report immediately"]
    pub fn guard(&'static self) -> LedgerGuard {
        LedgerGuard { ledger: self }
    }

    fn track_alloc(&self, addr: usize, size: usize, align: usize, site: &'static Location<'static>) {
        if CHECKS_ENABLED {
            let mut books = self.books();
            books.disposed.remove(&addr);
            let entry = LedgerEntry {
                size,
                align,
                site: Site::capture(site),
            };
            if books.live.insert(addr, entry).is_some() {
                warn!("allocator returned live address {addr:#x} twice");
            }
            self.count_alloc(size);
        } else {
            self.count_alloc(size);
        }
    }

    fn track_free(&self, addr: usize, size: usize, site: &'static Location<'static>) -> Result<()> {
        if CHECKS_ENABLED {
            let mut books = self.books();
            let entry = Self::take_entry(&mut books, addr, size)?;
            self.remember_disposed(&mut books, addr, entry.site.location, site);
            self.count_free(size);
        } else {
            self.count_free(size);
        }
        Ok(())
    }

    /// Validates the old block and moves it from the live table to the
    /// disposed history in one critical section.
    fn begin_realloc(
        &self,
        addr: usize,
        size: usize,
        site: &'static Location<'static>,
    ) -> Result<Option<LedgerEntry>> {
        if !CHECKS_ENABLED {
            return Ok(None);
        }

        let mut books = self.books();
        let entry = Self::take_entry(&mut books, addr, size)?;
        self.remember_disposed(&mut books, addr, entry.site.location, site);
        Ok(Some(entry))
    }

    fn abort_realloc(&self, addr: usize, entry: Option<LedgerEntry>) {
        if let Some(entry) = entry {
            let mut books = self.books();
            books.disposed.remove(&addr);
            books.live.insert(addr, entry);
        }
    }

    fn finish_realloc(
        &self,
        new_addr: usize,
        size: usize,
        new_size: usize,
        align: usize,
        site: &'static Location<'static>,
    ) {
        if CHECKS_ENABLED {
            let mut books = self.books();
            books.disposed.remove(&new_addr);
            let entry = LedgerEntry {
                size: new_size,
                align,
                site: Site::capture(site),
            };
            if books.live.insert(new_addr, entry).is_some() {
                warn!("allocator returned live address {new_addr:#x} twice");
            }
            self.count_realloc(size, new_size);
        } else {
            self.count_realloc(size, new_size);
        }
    }

    fn take_entry(books: &mut Books, addr: usize, size: usize) -> Result<LedgerEntry> {
        match books.live.get(&addr) {
            Some(entry) if entry.size == size => {}
            Some(_) => return Err(Error::InvalidPointer { addr }),
            None => {
                return Err(match books.disposed.get(&addr) {
                    Some(disposed) => Error::UseAfterFree {
                        addr,
                        allocated_at: disposed.allocated_at,
                        freed_at: disposed.freed_at,
                    },
                    None => Error::InvalidPointer { addr },
                });
            }
        }

        books.live.remove(&addr).ok_or(Error::InvalidPointer { addr })
    }

    fn remember_disposed(
        &self,
        books: &mut Books,
        addr: usize,
        allocated_at: &'static Location<'static>,
        freed_at: &'static Location<'static>,
    ) {
        let limit = self.config.disposed_history;
        if limit == 0 {
            return;
        }

        if books.disposed.len() >= limit {
            debug!("disposed-address history full ({limit}), starting over");
            books.disposed.clear();
        }

        books.disposed.insert(
            addr,
            DisposedEntry {
                allocated_at,
                freed_at,
            },
        );
    }

    fn count_alloc(&self, size: usize) {
        self.live.fetch_add(1, Ordering::AcqRel);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        let now = self.live_bytes.fetch_add(size, Ordering::AcqRel) + size;
        self.peak_bytes.fetch_max(now, Ordering::AcqRel);
    }

    fn count_free(&self, size: usize) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.total_frees.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(size, Ordering::AcqRel);
    }

    fn count_realloc(&self, size: usize, new_size: usize) {
        self.total_reallocations.fetch_add(1, Ordering::Relaxed);
        if new_size >= size {
            let now = self.live_bytes.fetch_add(new_size - size, Ordering::AcqRel) + (new_size - size);
            self.peak_bytes.fetch_max(now, Ordering::AcqRel);
        } else {
            self.live_bytes.fetch_sub(size - new_size, Ordering::AcqRel);
        }
    }
}

/// Shutdown hook for a ledger.
///
/// Dropping the guard checks for leaks and logs every live block when the
/// ledger's configuration asks for it. Keep it alive for the duration of
/// `main`.
#[derive(Debug)]
pub struct LedgerGuard {
    ledger: &'static Ledger,
}

impl LedgerGuard {
    /// The ledger this guard watches.
    #[must_use]
    pub fn ledger(&self) -> &'static Ledger {
        self.ledger
    }

    /// Runs the leak check now and consumes the guard without a second report.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeakDetected`] when blocks are still live.
    pub fn shutdown(self) -> Result<()> {
        let result = self.ledger.check_leaks();
        std::mem::forget(self);
        result
    }
}

impl Drop for LedgerGuard {
    fn drop(&mut self) {
        if !self.ledger.config.report_leaks {
            return;
        }

        match self.ledger.check_leaks() {
            Ok(()) => debug!("shutdown: no live allocations"),
            Err(err) => error!("shutdown: {err}"),
        }
    }
}

/// Returns the process-wide ledger, configured from the environment on first use.
///
/// The ledger registers no exit hook of its own: Rust runs no destructors
/// for statics. The shutdown leak report comes from the [`LedgerGuard`]
/// returned by [`init`] (or [`Ledger::guard`]), so hold it until the end of
/// `main`.
///
/// # Examples
///
/// ```
/// use rawmem::ledger::ledger;
///
/// let a = ledger();
/// let b = ledger();
/// assert!(std::ptr::eq(a, b));
/// ```
#[must_use]
pub fn ledger() -> &'static Ledger {
    static LEDGER: OnceLock<Ledger> = OnceLock::new();
    LEDGER.get_or_init(|| Ledger::with_config(LedgerConfig::from_env()))
}

/// Initializes logging from `RAWMEM_LOG` and returns the shutdown guard for
/// the process-wide ledger.
///
/// Leaks are reported when the guard drops; without a live guard nothing is
/// reported at exit.
///
/// ```no_run
/// fn main() {
///     let _ledger = rawmem::init();
///     // ... allocate and free ...
/// } // leaks are reported here
/// ```
#[must_use = "dropping the guard runs the leak report immediately"]
pub fn init() -> LedgerGuard {
    rawmem_log::init_from_env("RAWMEM_LOG");
    let ledger = ledger();
    info!(
        "ledger ready (checks: {CHECKS_ENABLED}, backtraces: {CAPTURE_BACKTRACES}, history: {})",
        ledger.config.disposed_history
    );
    ledger.guard()
}
