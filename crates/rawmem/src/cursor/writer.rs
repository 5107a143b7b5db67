use super::reader::Reader;
use super::{Serialize, utf8};
use crate::alloc::Allocation;
use crate::config::{DEFAULT_WRITER_CAPACITY, MAX_NATURAL_ALIGNMENT};
use crate::error::{Error, Result};
use crate::pod::Pod;
use crate::span::Span;
use rawmem_log::debug;
use std::fmt;
use std::mem;

/// Appends typed values to a growable, ledger-tracked buffer.
///
/// Values are written in native byte order with no padding between them, so a
/// [`Reader`] must read them back with the same types in the same order.
pub struct Writer {
    block: Allocation,
    len: usize,
}

impl Writer {
    /// Creates a writer with the default initial capacity.
    #[track_caller]
    #[must_use]
    pub fn new() -> Self {
        Writer::with_capacity(DEFAULT_WRITER_CAPACITY)
    }

    /// Creates a writer that can hold `capacity` bytes before growing.
    #[track_caller]
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Writer {
            block: Allocation::with_alignment(capacity.max(1), MAX_NATURAL_ALIGNMENT),
            len: 0,
        }
    }

    /// Bytes written so far.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if nothing has been written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing block.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.block.len()
    }

    /// Number of times the backing block has been reallocated.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.block.generation()
    }

    /// The written bytes.
    #[track_caller]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.block.as_bytes()[..self.len]
    }

    /// The written bytes as a span.
    #[track_caller]
    #[must_use]
    pub fn as_span(&self) -> Span<'_, u8> {
        Span::new(self.as_bytes())
    }

    /// Ensures room for `additional` more bytes, growing geometrically.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCapacity`] if the size overflows.
    #[track_caller]
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let required = self
            .len
            .checked_add(additional)
            .filter(|&required| required <= isize::MAX as usize - MAX_NATURAL_ALIGNMENT)
            .ok_or(Error::InvalidCapacity {
                requested: self.len.saturating_add(additional),
            })?;
        let capacity = self.block.len();
        if required <= capacity {
            return Ok(());
        }

        let new_capacity = capacity
            .saturating_mul(2)
            .max(required.checked_next_power_of_two().unwrap_or(required))
            .min(isize::MAX as usize - MAX_NATURAL_ALIGNMENT);
        debug!("growing writer from {capacity} to {new_capacity} bytes");
        self.block.resize(new_capacity)
    }

    /// Appends raw bytes.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCapacity`] if the buffer cannot grow enough.
    #[track_caller]
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.block.write_bytes(self.len, bytes)?;
        self.len += bytes.len();
        Ok(())
    }

    /// Appends `size_of::<T>()` bytes holding `value`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCapacity`] if the buffer cannot grow enough.
    #[track_caller]
    pub fn write_value<T: Pod>(&mut self, value: T) -> Result<()> {
        self.reserve(mem::size_of::<T>())?;
        self.block.write(self.len, value)?;
        self.len += mem::size_of::<T>();
        Ok(())
    }

    /// Appends the raw bytes of every element, with no length prefix.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCapacity`] if the buffer cannot grow enough.
    #[track_caller]
    pub fn write_span<T: Pod>(&mut self, values: &[T]) -> Result<()> {
        // SAFETY: `T: Pod` has no padding, so every byte of the slice is
        // initialized.
        let bytes = unsafe {
            std::slice::from_raw_parts(values.as_ptr().cast::<u8>(), mem::size_of_val(values))
        };
        self.write_bytes(bytes)
    }

    /// Encodes UTF-16 `units` as UTF-8, returning the number of bytes written.
    ///
    /// Surrogate pairs become one 4-byte sequence; unpaired surrogates are
    /// written in their 3-byte form.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCapacity`] if the buffer cannot grow enough.
    #[track_caller]
    pub fn write_utf8(&mut self, units: &[u16]) -> Result<usize> {
        self.reserve(utf8::max_encoded_len(units))?;

        let start = self.len;
        let mut buf = [0u8; 4];
        for cp in utf8::code_points(units) {
            let width = utf8::encode(cp, &mut buf);
            self.block.write_bytes(self.len, &buf[..width])?;
            self.len += width;
        }
        Ok(self.len - start)
    }

    /// Appends the UTF-8 bytes of `text`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCapacity`] if the buffer cannot grow enough.
    #[track_caller]
    pub fn write_str(&mut self, text: &str) -> Result<()> {
        self.write_bytes(text.as_bytes())
    }

    /// Serializes `value` through its [`Serialize`] impl.
    ///
    /// # Errors
    ///
    /// Whatever the impl reports.
    pub fn write<S: Serialize>(&mut self, value: &S) -> Result<()> {
        value.serialize(self)
    }

    /// Forgets everything written. Capacity is kept.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Shrinks the block to the written bytes and hands it over.
    ///
    /// # Errors
    ///
    /// Propagates ledger errors from the final resize.
    #[track_caller]
    pub fn into_allocation(mut self) -> Result<Allocation> {
        self.block.resize(self.len)?;
        Ok(self.block)
    }

    /// Turns the writer into a reader that owns the written bytes.
    pub fn into_reader(self) -> Reader<'static> {
        Reader::from_parts(self.block, self.len)
    }

    /// Frees the buffer, reporting any ledger inconsistency.
    ///
    /// # Errors
    ///
    /// Propagates [`Allocation::dispose`] errors.
    #[track_caller]
    pub fn dispose(self) -> Result<()> {
        self.block.dispose()
    }
}

impl Default for Writer {
    fn default() -> Self {
        Writer::new()
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("len", &self.len)
            .field("capacity", &self.block.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_are_packed() {
        let mut writer = Writer::new();
        writer.write_value(1u8).unwrap();
        writer.write_value(0x0302u16).unwrap();
        writer.write_value(0x0706_0504u32).unwrap();

        assert_eq!(writer.len(), 7);
        let expected: Vec<u8> = [1u8]
            .into_iter()
            .chain(0x0302u16.to_ne_bytes())
            .chain(0x0706_0504u32.to_ne_bytes())
            .collect();
        assert_eq!(writer.as_bytes(), expected);
    }

    #[test]
    fn test_growth_is_geometric() {
        let mut writer = Writer::with_capacity(4);
        for i in 0..100u32 {
            writer.write_value(i).unwrap();
        }

        assert_eq!(writer.len(), 400);
        assert_eq!(writer.capacity(), 512);
        assert_eq!(writer.generation(), 7);
    }

    #[test]
    fn test_large_batch_grows_once() {
        let mut writer = Writer::with_capacity(8);
        writer.write_span(&[0u64; 100]).unwrap();

        assert_eq!(writer.len(), 800);
        assert_eq!(writer.capacity(), 1024);
        assert_eq!(writer.generation(), 1);
    }

    #[test]
    fn test_write_utf8_returns_byte_count() {
        let mut writer = Writer::new();
        let units: Vec<u16> = "h\u{e9}\u{1F600}".encode_utf16().collect();

        assert_eq!(writer.write_utf8(&units).unwrap(), 7);
        assert_eq!(writer.as_bytes(), "h\u{e9}\u{1F600}".as_bytes());
    }

    #[test]
    fn test_reset_and_into_allocation() {
        let mut writer = Writer::new();
        writer.write_str("discard").unwrap();
        writer.reset();
        assert!(writer.is_empty());

        writer.write_str("keep").unwrap();
        let block = writer.into_allocation().unwrap();
        assert_eq!(block.as_bytes(), b"keep");
    }
}
