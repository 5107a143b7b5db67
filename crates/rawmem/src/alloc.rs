//! Owning handle to a ledger-registered block.
//!
//! An [`Allocation`] is a byte buffer obtained from the global
//! [`ledger`](crate::ledger::ledger). It supports typed reads and writes at
//! arbitrary byte offsets, byte-range fill/clear/copy, and resizing. The
//! higher-level collections and cursors are built on it.
//!
//! # Memory Management
//!
//! - Bytes are zeroed on allocation and on growth, so every byte is
//!   initialized when handed out
//! - The block is freed by [`Allocation::dispose`] (which reports ledger
//!   errors) or when the handle is dropped. Dropping logs ledger errors
//!   instead of returning them
//! - Only blocks that escape their handle ([`Allocation::into_raw`],
//!   [`std::mem::forget`]) are left for the ledger's leak report
//! - [`Allocation::resize`] may move the block; the handle's generation is
//!   bumped so dependent views can notice
//!
//! # Example
//!
//! ```
//! use rawmem::Allocation;
//!
//! let mut block = Allocation::new(16);
//! block.write::<u32>(4, 0xABCD).unwrap();
//! assert_eq!(block.read::<u32>(4).unwrap(), 0xABCD);
//!
//! // Offsets are checked against the tracked length.
//! assert!(block.write::<u64>(12, 1).is_err());
//!
//! block.dispose().unwrap();
//! ```

use crate::config::MAX_NATURAL_ALIGNMENT;
use crate::error::{Error, Result, check_range};
use crate::ledger::ledger;
use crate::pod::Pod;
use crate::span::{Span, SpanMut};
use rawmem_log::warn;
use std::fmt;
use std::mem::{self, ManuallyDrop};
use std::ptr::{self, NonNull};

/// Largest power of two, capped at [`MAX_NATURAL_ALIGNMENT`], that divides `size`.
///
/// Naturally sized types (a `u32`, a run of `f64`s) land on an address they
/// can be read from without an unaligned access.
///
/// ```
/// use rawmem::alloc::natural_alignment;
///
/// assert_eq!(natural_alignment(12), 4);
/// assert_eq!(natural_alignment(7), 1);
/// assert_eq!(natural_alignment(4096), 8);
/// ```
#[must_use]
pub const fn natural_alignment(size: usize) -> usize {
    if size == 0 {
        return MAX_NATURAL_ALIGNMENT;
    }

    let align = 1usize << size.trailing_zeros();
    if align > MAX_NATURAL_ALIGNMENT {
        MAX_NATURAL_ALIGNMENT
    } else {
        align
    }
}

/// An owned, ledger-tracked block of bytes.
pub struct Allocation {
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
    generation: u64,
}

// SAFETY: `Allocation` uniquely owns its block, like `Box<[u8]>`.
unsafe impl Send for Allocation {}
// SAFETY: shared access only reads through `&self`.
unsafe impl Sync for Allocation {}

impl Allocation {
    /// Allocates `len` zeroed bytes at the natural alignment for `len`.
    #[track_caller]
    #[must_use]
    pub fn new(len: usize) -> Self {
        Allocation::with_alignment(len, natural_alignment(len))
    }

    /// Allocates `len` zeroed bytes at an explicit alignment.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[track_caller]
    #[must_use]
    pub fn with_alignment(len: usize, align: usize) -> Self {
        let ptr = ledger().allocate(len, align);
        Allocation {
            ptr,
            len,
            align,
            generation: 0,
        }
    }

    /// Allocates a block holding a copy of `bytes`.
    #[track_caller]
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let block = Allocation::with_alignment(bytes.len(), MAX_NATURAL_ALIGNMENT);
        // SAFETY: the block is `bytes.len()` bytes and freshly allocated, so
        // the regions cannot overlap.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), block.ptr.as_ptr(), bytes.len()) };
        block
    }

    /// Rebuilds a handle from parts produced by [`Allocation::into_raw`].
    ///
    /// # Safety
    ///
    /// The parts must come from `into_raw` and not have been used to rebuild
    /// another handle.
    #[must_use]
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize, align: usize) -> Self {
        Allocation {
            ptr,
            len,
            align,
            generation: 0,
        }
    }

    /// Releases ownership without freeing. The ledger still tracks the block,
    /// so it shows up as a leak until it is rebuilt and disposed.
    #[must_use]
    pub fn into_raw(self) -> (NonNull<u8>, usize, usize) {
        let this = ManuallyDrop::new(self);
        (this.ptr, this.len, this.align)
    }

    /// Tracked length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for a zero-length block.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Alignment the block was allocated with.
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.align
    }

    /// Number of times the block has been resized.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Address of the block.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.ptr.addr().get()
    }

    /// Raw pointer to the first byte.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Mutable raw pointer to the first byte.
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    #[track_caller]
    pub(crate) fn assert_live(&self) {
        ledger().assert_live(self.addr());
    }

    /// The whole block as bytes.
    ///
    /// Only meaningful when the block holds plain data; collections that
    /// store padded types never expose their allocation this way.
    #[track_caller]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.assert_live();
        // SAFETY: the block is `len` initialized bytes owned by `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The whole block as mutable bytes.
    #[track_caller]
    #[must_use]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.assert_live();
        // SAFETY: as in `as_bytes`, and `&mut self` guarantees uniqueness.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Writes `value` at byte `offset`. No alignment is required.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if the value does not fit.
    #[track_caller]
    pub fn write<T: Pod>(&mut self, offset: usize, value: T) -> Result<()> {
        check_range(offset, mem::size_of::<T>(), self.len)?;
        self.assert_live();
        // SAFETY: the range was checked above; `write_unaligned` has no
        // alignment requirement.
        unsafe { self.ptr.as_ptr().add(offset).cast::<T>().write_unaligned(value) };
        Ok(())
    }

    /// Copies `bytes` into the block starting at `offset`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if the bytes do not fit.
    #[track_caller]
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        check_range(offset, bytes.len(), self.len)?;
        self.assert_live();
        // SAFETY: destination range checked; `&mut self` means `bytes` cannot
        // alias the block.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    /// Reads a `T` from byte `offset`. No alignment is required.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if the value would extend past the block.
    #[track_caller]
    pub fn read<T: Pod>(&self, offset: usize) -> Result<T> {
        check_range(offset, mem::size_of::<T>(), self.len)?;
        self.assert_live();
        // SAFETY: range checked; `T: Pod` accepts any initialized bytes.
        Ok(unsafe { self.ptr.as_ptr().add(offset).cast::<T>().read_unaligned() })
    }

    fn check_aligned<T>(&self, offset: usize) -> Result<()> {
        let align = mem::align_of::<T>();
        if (self.addr() + offset) % align == 0 {
            Ok(())
        } else {
            Err(Error::Misaligned { offset, align })
        }
    }

    /// Borrows the `T` stored at byte `offset`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if it does not fit, [`Error::Misaligned`] if the
    /// address is not aligned for `T`.
    #[track_caller]
    pub fn read_ref<T: Pod>(&self, offset: usize) -> Result<&T> {
        check_range(offset, mem::size_of::<T>(), self.len)?;
        self.check_aligned::<T>(offset)?;
        self.assert_live();
        // SAFETY: in range, aligned, and `T: Pod` accepts the bytes.
        Ok(unsafe { &*self.ptr.as_ptr().add(offset).cast::<T>() })
    }

    /// Mutably borrows the `T` stored at byte `offset`.
    ///
    /// # Errors
    ///
    /// As for [`Allocation::read_ref`].
    #[track_caller]
    pub fn read_mut<T: Pod>(&mut self, offset: usize) -> Result<&mut T> {
        check_range(offset, mem::size_of::<T>(), self.len)?;
        self.check_aligned::<T>(offset)?;
        self.assert_live();
        // SAFETY: as in `read_ref`, plus uniqueness from `&mut self`.
        Ok(unsafe { &mut *self.ptr.as_ptr().add(offset).cast::<T>() })
    }

    fn span_bounds<T>(&self, offset: usize, count: usize) -> Result<()> {
        let bytes = count
            .checked_mul(mem::size_of::<T>())
            .ok_or(Error::OutOfRange { index: usize::MAX, len: self.len })?;
        check_range(offset, bytes, self.len)?;
        self.check_aligned::<T>(offset)
    }

    /// Views `count` elements of `T` starting at byte `offset`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] or [`Error::Misaligned`].
    #[track_caller]
    pub fn as_span<T: Pod>(&self, offset: usize, count: usize) -> Result<Span<'_, T>> {
        self.span_bounds::<T>(offset, count)?;
        self.assert_live();
        // SAFETY: bounds and alignment checked; the span borrows `self`.
        Ok(unsafe { Span::from_raw_parts(self.ptr.as_ptr().add(offset).cast::<T>(), count) })
    }

    /// Mutable counterpart of [`Allocation::as_span`].
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] or [`Error::Misaligned`].
    #[track_caller]
    pub fn as_span_mut<T: Pod>(&mut self, offset: usize, count: usize) -> Result<SpanMut<'_, T>> {
        self.span_bounds::<T>(offset, count)?;
        self.assert_live();
        // SAFETY: as in `as_span`, plus uniqueness from `&mut self`.
        Ok(unsafe { SpanMut::from_raw_parts(self.ptr.as_ptr().add(offset).cast::<T>(), count) })
    }

    /// Sets `len` bytes starting at `offset` to `byte`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if the range exceeds the block.
    #[track_caller]
    pub fn fill(&mut self, offset: usize, len: usize, byte: u8) -> Result<()> {
        check_range(offset, len, self.len)?;
        self.assert_live();
        // SAFETY: range checked. Writing through a raw pointer is fine even
        // over bytes a collection left uninitialized.
        unsafe { self.ptr.as_ptr().add(offset).write_bytes(byte, len) };
        Ok(())
    }

    /// Zeroes `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if the range exceeds the block.
    #[track_caller]
    pub fn clear(&mut self, offset: usize, len: usize) -> Result<()> {
        self.fill(offset, len, 0)
    }

    /// Zeroes the whole block.
    #[track_caller]
    pub fn zero(&mut self) {
        self.assert_live();
        // SAFETY: the block is `len` bytes.
        unsafe { self.ptr.as_ptr().write_bytes(0, self.len) };
    }

    /// Copies `len` bytes from `self[src_offset..]` to `dst[dst_offset..]`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if either range exceeds its block.
    #[track_caller]
    pub fn copy_to(
        &self,
        dst: &mut Allocation,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        check_range(src_offset, len, self.len)?;
        check_range(dst_offset, len, dst.len)?;
        self.assert_live();
        dst.assert_live();
        // SAFETY: both ranges checked; `&self` and `&mut dst` are distinct
        // allocations so the ranges cannot overlap.
        unsafe {
            ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(src_offset),
                dst.ptr.as_ptr().add(dst_offset),
                len,
            );
        }
        Ok(())
    }

    /// Moves `len` bytes within the block. The ranges may overlap.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if either range exceeds the block.
    #[track_caller]
    pub fn copy_within(&mut self, src_offset: usize, dst_offset: usize, len: usize) -> Result<()> {
        check_range(src_offset, len, self.len)?;
        check_range(dst_offset, len, self.len)?;
        self.assert_live();
        // SAFETY: both ranges checked; `ptr::copy` handles overlap.
        unsafe {
            ptr::copy(
                self.ptr.as_ptr().add(src_offset),
                self.ptr.as_ptr().add(dst_offset),
                len,
            );
        }
        Ok(())
    }

    /// Resizes the block through the ledger. New bytes are zeroed; the block
    /// may move, and the generation is bumped either way.
    ///
    /// # Errors
    ///
    /// Propagates a ledger error if the block is no longer registered.
    #[track_caller]
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        // SAFETY: `ptr`, `len` and `align` describe a block this handle owns.
        let ptr = unsafe { ledger().reallocate(self.ptr, self.len, self.align, new_len)? };
        self.ptr = ptr;
        self.len = new_len;
        self.generation += 1;
        Ok(())
    }

    /// Frees the block, reporting any ledger inconsistency.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterFree`] or [`Error::InvalidPointer`] when the ledger
    /// no longer recognizes the block.
    #[track_caller]
    pub fn dispose(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        // SAFETY: the handle owns the block and is not used afterwards.
        unsafe { ledger().free(this.ptr, this.len, this.align) }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // SAFETY: the handle owns the block and is being destroyed.
        if let Err(err) = unsafe { ledger().free(self.ptr, self.len, self.align) } {
            warn!("dropping allocation: {err}");
        }
    }
}

impl Clone for Allocation {
    #[track_caller]
    fn clone(&self) -> Self {
        let copy = Allocation::with_alignment(self.len, self.align);
        self.assert_live();
        // SAFETY: both blocks are `len` bytes and distinct. Copying raw bytes
        // preserves whatever the owner stored, initialized or not.
        unsafe { ptr::copy_nonoverlapping(self.ptr.as_ptr(), copy.ptr.as_ptr(), self.len) };
        copy
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .field("align", &self.align)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_alignment() {
        assert_eq!(natural_alignment(0), 8);
        assert_eq!(natural_alignment(1), 1);
        assert_eq!(natural_alignment(2), 2);
        assert_eq!(natural_alignment(6), 2);
        assert_eq!(natural_alignment(12), 4);
        assert_eq!(natural_alignment(24), 8);
        assert_eq!(natural_alignment(1 << 20), 8);
    }

    #[test]
    fn test_new_is_zeroed_and_aligned() {
        let block = Allocation::new(32);
        assert_eq!(block.len(), 32);
        assert_eq!(block.alignment(), 8);
        assert_eq!(block.addr() % 8, 0);
        assert!(block.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_read_values() {
        let mut block = Allocation::new(16);
        block.write::<u8>(0, 0x7F).unwrap();
        block.write::<u32>(1, 0x1234_5678).unwrap(); // unaligned
        block.write::<f64>(8, 2.5).unwrap();

        assert_eq!(block.read::<u8>(0).unwrap(), 0x7F);
        assert_eq!(block.read::<u32>(1).unwrap(), 0x1234_5678);
        assert_eq!(block.read::<f64>(8).unwrap(), 2.5);
    }

    #[test]
    fn test_offsets_are_checked() {
        let mut block = Allocation::new(8);
        assert_eq!(
            block.write::<u32>(6, 1),
            Err(Error::OutOfRange { index: 10, len: 8 })
        );
        assert!(block.read::<u64>(1).is_err());
        assert!(block.write_bytes(7, &[1, 2]).is_err());
        assert!(block.fill(0, 9, 0xFF).is_err());
    }

    #[test]
    fn test_read_ref_alignment() {
        let mut block = Allocation::with_alignment(16, 8);
        block.write::<u32>(4, 99).unwrap();

        assert_eq!(*block.read_ref::<u32>(4).unwrap(), 99);
        assert_eq!(
            block.read_ref::<u32>(2),
            Err(Error::Misaligned { offset: 2, align: 4 })
        );

        *block.read_mut::<u32>(4).unwrap() += 1;
        assert_eq!(block.read::<u32>(4).unwrap(), 100);
    }

    #[test]
    fn test_as_span() {
        let mut block = Allocation::new(16);
        {
            let mut span = block.as_span_mut::<u32>(0, 4).unwrap();
            span.fill(7);
            span[3] = 9;
        }

        let span = block.as_span::<u32>(0, 4).unwrap();
        assert_eq!(span.as_slice(), &[7, 7, 7, 9]);
        assert!(block.as_span::<u32>(4, 4).is_err());
        assert!(block.as_span::<u32>(0, usize::MAX).is_err());

        let empty = block.as_span::<u64>(16, 0).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_fill_and_clear() {
        let mut block = Allocation::new(8);
        block.fill(2, 4, 0xAA).unwrap();
        assert_eq!(block.as_bytes(), &[0, 0, 0xAA, 0xAA, 0xAA, 0xAA, 0, 0]);

        block.clear(3, 2).unwrap();
        assert_eq!(block.as_bytes(), &[0, 0, 0xAA, 0, 0, 0xAA, 0, 0]);

        block.zero();
        assert!(block.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_copy_to_and_within() {
        let src = Allocation::from_bytes(b"abcdef");
        let mut dst = Allocation::new(8);

        src.copy_to(&mut dst, 1, 2, 4).unwrap();
        assert_eq!(dst.as_bytes(), b"\0\0bcde\0\0");
        assert!(src.copy_to(&mut dst, 4, 0, 4).is_err());
        assert!(src.copy_to(&mut dst, 0, 6, 4).is_err());

        dst.copy_within(2, 3, 4).unwrap();
        assert_eq!(dst.as_bytes(), b"\0\0bbcde\0");
    }

    #[test]
    fn test_resize_preserves_prefix() {
        let mut block = Allocation::from_bytes(&[1, 2, 3, 4]);
        assert_eq!(block.generation(), 0);

        block.resize(64).unwrap();
        assert_eq!(block.len(), 64);
        assert_eq!(block.generation(), 1);
        assert_eq!(&block.as_bytes()[..4], &[1, 2, 3, 4]);
        assert!(block.as_bytes()[4..].iter().all(|&b| b == 0));

        block.resize(2).unwrap();
        assert_eq!(block.as_bytes(), &[1, 2]);
        assert_eq!(block.generation(), 2);
    }

    #[test]
    fn test_registered_with_ledger() {
        let block = Allocation::new(40);
        assert!(ledger().is_live(block.addr()));
        if crate::config::CHECKS_ENABLED {
            assert_eq!(ledger().tracked_size(block.addr()), Some(40));
        }
        block.dispose().unwrap();
    }

    #[test]
    fn test_into_raw_roundtrip() {
        let mut block = Allocation::new(4);
        block.write::<u32>(0, 5).unwrap();

        let (ptr, len, align) = block.into_raw();
        assert!(ledger().is_live(ptr.addr().get()));

        // SAFETY: parts came straight from `into_raw`.
        let block = unsafe { Allocation::from_raw(ptr, len, align) };
        assert_eq!(block.read::<u32>(0).unwrap(), 5);
        block.dispose().unwrap();
    }

    #[test]
    fn test_escaped_block_is_reported_as_leak() {
        let block = Allocation::new(48);
        let addr = block.addr();
        let (ptr, len, align) = block.into_raw();

        if crate::config::CHECKS_ENABLED {
            let leak = ledger().leaks().into_iter().find(|leak| leak.addr == addr);
            assert_eq!(leak.map(|leak| leak.size), Some(48));
        }

        // SAFETY: parts came straight from `into_raw`.
        unsafe { Allocation::from_raw(ptr, len, align) }.dispose().unwrap();
    }

    #[test]
    fn test_clone_is_independent() {
        let mut a = Allocation::from_bytes(&[1, 2, 3]);
        let b = a.clone();
        a.write::<u8>(0, 9).unwrap();

        assert_eq!(b.as_bytes(), &[1, 2, 3]);
        assert_ne!(a.addr(), b.addr());
    }

    #[test]
    fn test_zero_length() {
        let block = Allocation::new(0);
        assert!(block.is_empty());
        assert!(block.as_bytes().is_empty());
        assert!(block.read::<u8>(0).is_err());
    }
}
