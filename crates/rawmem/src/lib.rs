//! Ledger-tracked manual memory primitives.
//!
//! `rawmem` provides deterministic, collector-free memory control built in
//! layers:
//!
//! - **Ledger**: process-wide registry of live allocations with double-free,
//!   use-after-free and leak detection ([`ledger`])
//! - **Allocation**: owning handle to one ledger block with typed,
//!   range-checked reads and writes ([`Allocation`])
//! - **Span**: non-owning bounds-checked views with search, equality and
//!   hashing ([`Span`], [`SpanMut`])
//! - **Collections**: a geometric-growth array ([`DynArray`]) and an
//!   open-addressed hash table with tombstone deletion ([`HashTable`])
//! - **Cursors**: position-tracked binary [`Writer`] and [`Reader`] with a
//!   UTF-16/UTF-8 codec and a [`Serialize`] hook for user types
//!
//! # Checked builds
//!
//! Debug builds, or any build with the `checked` feature, keep a table of
//! live blocks and verify liveness before each access. The
//! `ledger_backtrace` feature additionally records a backtrace per block.
//! Index and offset checks stay on in every build; see [`config`].
//!
//! # Example
//!
//! ```
//! use rawmem::{DynArray, HashTable, Reader, Writer};
//!
//! let _guard = rawmem::init();
//!
//! let mut ids = DynArray::new();
//! ids.add_range(&[3u32, 1, 4]);
//!
//! let mut names = HashTable::new();
//! names.add(1u32, *b"one").unwrap();
//!
//! let mut writer = Writer::new();
//! writer.write(&ids).unwrap();
//!
//! let mut reader = Reader::from_writer(&writer);
//! let decoded: DynArray<u32> = reader.read().unwrap();
//! assert_eq!(decoded, ids);
//! assert_eq!(names.get(&1), Ok(*b"one"));
//! ```

pub mod alloc;
pub mod array;
pub mod config;
pub mod cursor;
pub mod error;
pub mod ledger;
pub mod map;
pub mod pod;
pub mod span;

pub use alloc::Allocation;
pub use array::{DynArray, ViewToken};
pub use cursor::{Reader, Serialize, Utf16Units, Writer};
pub use error::{Error, Result};
pub use ledger::{Ledger, LedgerGuard, init, ledger};
pub use map::HashTable;
pub use pod::Pod;
pub use span::{Span, SpanMut};
