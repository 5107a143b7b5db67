use super::Serialize;
use super::utf8::{self, Utf16Units};
use super::writer::Writer;
use crate::alloc::Allocation;
use crate::array::DynArray;
use crate::config::MAX_NATURAL_ALIGNMENT;
use crate::error::{Error, Result};
use crate::pod::Pod;
use crate::span::Span;
use std::fmt;
use std::io::{ErrorKind, Read};
use std::mem;
use std::ptr::{self, NonNull};

const STREAM_CHUNK: usize = 4096;

enum Buffer<'a> {
    Borrowed(&'a [u8]),
    Owned(Allocation),
}

/// Reads typed values back out of a byte buffer, tracking a position.
///
/// A reader either borrows its bytes (from a slice or a [`Writer`]) or owns a
/// private [`Allocation`]. Only an owning reader frees anything on
/// [`dispose`](Reader::dispose); a borrowing one can never outlive its
/// source.
///
/// Reads reinterpret bytes as the requested [`Pod`] type without any check
/// that the same type was written there.
///
/// Spans are borrowed in place when the data is aligned for the element type.
/// The [`Writer`] packs values without padding, so a span that starts at an
/// unaligned offset is copied into a scratch block the reader keeps for the
/// next such read.
pub struct Reader<'a> {
    buffer: Buffer<'a>,
    position: usize,
    len: usize,
    scratch: Option<Allocation>,
}

impl<'a> Reader<'a> {
    /// Borrows `bytes`, starting at position 0.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Reader {
            buffer: Buffer::Borrowed(bytes),
            position: 0,
            len: bytes.len(),
            scratch: None,
        }
    }

    /// Borrows `bytes`, starting at `position`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if `position > bytes.len()`.
    pub fn with_position(bytes: &'a [u8], position: usize) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        reader.set_position(position)?;
        Ok(reader)
    }

    /// Borrows everything `writer` has written so far.
    #[track_caller]
    #[must_use]
    pub fn from_writer(writer: &'a Writer) -> Self {
        Reader::new(writer.as_bytes())
    }
}

impl Reader<'static> {
    /// Copies `bytes` into a private allocation the reader owns.
    #[track_caller]
    #[must_use]
    pub fn copy_from(bytes: &[u8]) -> Self {
        Reader::from_parts(Allocation::from_bytes(bytes), bytes.len())
    }

    pub(crate) fn from_parts(block: Allocation, len: usize) -> Self {
        Reader {
            buffer: Buffer::Owned(block),
            position: 0,
            len,
            scratch: None,
        }
    }

    /// Takes ownership of `block`, treating its first `len` bytes as data.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if `len` exceeds the block.
    pub fn from_allocation(block: Allocation, len: usize) -> Result<Self> {
        if len > block.len() {
            return Err(Error::OutOfRange {
                index: len,
                len: block.len(),
            });
        }
        Ok(Reader::from_parts(block, len))
    }

    /// Reads `stream` to the end into an owned buffer.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the stream fails.
    #[track_caller]
    pub fn from_stream<R: Read>(mut stream: R) -> Result<Self> {
        let mut block = Allocation::with_alignment(STREAM_CHUNK, MAX_NATURAL_ALIGNMENT);
        let mut len = 0;

        loop {
            if len == block.len() {
                block.resize(len * 2)?;
            }

            match stream.read(&mut block.as_bytes_mut()[len..]) {
                Ok(0) => break,
                Ok(read) => len += read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(Reader::from_parts(block, len))
    }
}

impl Reader<'_> {
    /// Returns `true` if the reader owns (and will free) its bytes.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        matches!(self.buffer, Buffer::Owned(_))
    }

    /// All valid bytes, regardless of position.
    #[track_caller]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match &self.buffer {
            Buffer::Borrowed(bytes) => &bytes[..self.len],
            Buffer::Owned(block) => &block.as_bytes()[..self.len],
        }
    }

    /// Current read position.
    #[inline]
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the read position.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if `position > len`.
    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position > self.len {
            return Err(Error::OutOfRange {
                index: position,
                len: self.len,
            });
        }
        self.position = position;
        Ok(())
    }

    /// Number of valid bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` when there are no valid bytes at all.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes left after the position.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.len - self.position
    }

    /// Returns `true` once every byte has been consumed.
    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.position == self.len
    }

    fn require(&self, position: usize, needed: usize) -> Result<()> {
        match position.checked_add(needed) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::UnexpectedEof {
                position,
                needed,
                len: self.len,
            }),
        }
    }

    /// Skips `count` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::UnexpectedEof`] if fewer than `count` bytes remain.
    pub fn advance(&mut self, count: usize) -> Result<()> {
        self.require(self.position, count)?;
        self.position += count;
        Ok(())
    }

    /// Reads a `T` at `position` without moving the cursor.
    ///
    /// # Errors
    ///
    /// [`Error::UnexpectedEof`] if the value extends past the data.
    #[track_caller]
    pub fn peek_value<T: Pod>(&self, position: usize) -> Result<T> {
        self.require(position, mem::size_of::<T>())?;
        // SAFETY: the range was checked; `T: Pod` accepts any bytes and
        // `read_unaligned` has no alignment requirement.
        Ok(unsafe { self.bytes().as_ptr().add(position).cast::<T>().read_unaligned() })
    }

    /// Reads a `T` and advances past it.
    ///
    /// # Errors
    ///
    /// [`Error::UnexpectedEof`] if the value extends past the data.
    #[track_caller]
    pub fn read_value<T: Pod>(&mut self) -> Result<T> {
        let value = self.peek_value(self.position)?;
        self.position += mem::size_of::<T>();
        Ok(value)
    }

    /// Returns a pointer to `count` aligned elements of `T` at `position`:
    /// the bytes themselves, or a scratch copy when they are unaligned.
    #[track_caller]
    fn span_start<T: Pod>(&mut self, position: usize, count: usize) -> Result<*const T> {
        let bytes = count.checked_mul(mem::size_of::<T>()).ok_or(Error::UnexpectedEof {
            position,
            needed: usize::MAX,
            len: self.len,
        })?;
        self.require(position, bytes)?;
        if bytes == 0 {
            return Ok(NonNull::<T>::dangling().as_ptr());
        }

        let start = self.bytes().as_ptr().wrapping_add(position);
        if start.addr() % mem::align_of::<T>() == 0 {
            return Ok(start.cast::<T>());
        }

        let align = mem::align_of::<T>().max(MAX_NATURAL_ALIGNMENT);
        let block = match self.scratch.take() {
            Some(block) if block.len() >= bytes && block.alignment() >= align => block,
            Some(block) => {
                block.dispose()?;
                Allocation::with_alignment(bytes, align)
            }
            None => Allocation::with_alignment(bytes, align),
        };
        let block = self.scratch.insert(block);
        // SAFETY: `start..start + bytes` was range-checked against the
        // reader's buffer, which the scratch block does not overlap.
        unsafe { ptr::copy_nonoverlapping(start, block.as_mut_ptr(), bytes) };
        Ok(block.as_ptr().cast::<T>())
    }

    /// Views `count` elements of `T` at `position` without moving the cursor.
    ///
    /// Aligned data is borrowed in place; unaligned data is copied into the
    /// reader's scratch block, which the next unaligned span may overwrite.
    ///
    /// # Errors
    ///
    /// [`Error::UnexpectedEof`] if they extend past the data.
    #[track_caller]
    pub fn peek_span<T: Pod>(&mut self, position: usize, count: usize) -> Result<Span<'_, T>> {
        let start = self.span_start::<T>(position, count)?;
        // SAFETY: `count` elements are readable and aligned at `start`,
        // `T: Pod`, and the span borrows `self`, which owns or borrows both
        // the buffer and the scratch block.
        Ok(unsafe { Span::from_raw_parts(start, count) })
    }

    /// Views `count` elements of `T` and advances past them.
    ///
    /// # Errors
    ///
    /// As for [`Reader::peek_span`].
    #[track_caller]
    pub fn read_span<T: Pod>(&mut self, count: usize) -> Result<Span<'_, T>> {
        let start = self.span_start::<T>(self.position, count)?;
        self.position += count * mem::size_of::<T>();
        // SAFETY: as in `peek_span`; moving the position touches neither
        // block.
        Ok(unsafe { Span::from_raw_parts(start, count) })
    }

    /// Copies `count` elements of `T` into a new array and advances past them.
    ///
    /// # Errors
    ///
    /// [`Error::UnexpectedEof`] if they extend past the data.
    #[track_caller]
    pub fn read_array<T: Pod>(&mut self, count: usize) -> Result<DynArray<T>> {
        let size = mem::size_of::<T>();
        let bytes = count.checked_mul(size).ok_or(Error::UnexpectedEof {
            position: self.position,
            needed: usize::MAX,
            len: self.len,
        })?;
        self.require(self.position, bytes)?;

        let mut array = DynArray::with_capacity(count);
        for index in 0..count {
            array.add(self.peek_value::<T>(self.position + index * size)?);
        }
        self.position += bytes;
        Ok(array)
    }

    /// Borrows the next `count` raw bytes and advances past them.
    ///
    /// # Errors
    ///
    /// [`Error::UnexpectedEof`] if fewer than `count` bytes remain.
    #[track_caller]
    pub fn read_bytes(&mut self, count: usize) -> Result<&[u8]> {
        let position = self.position;
        self.advance(count)?;
        Ok(&self.bytes()[position..position + count])
    }

    /// Decodes one UTF-8 sequence at the position and advances past it.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedEncoding`] for a bad lead or continuation byte,
    /// [`Error::UnexpectedEof`] for a truncated sequence. The position is
    /// unchanged on error.
    #[track_caller]
    pub fn read_utf8(&mut self) -> Result<Utf16Units> {
        let units = utf8::decode(self.bytes(), self.position)?;
        self.position += units.bytes_consumed();
        Ok(units)
    }

    /// Decodes the next `byte_len` bytes of UTF-8 into UTF-16 units.
    ///
    /// # Errors
    ///
    /// As for [`Reader::read_utf8`]; a sequence straddling the end of the
    /// range is reported as [`Error::UnexpectedEof`]. The position is
    /// unchanged on error.
    #[track_caller]
    pub fn read_utf8_units(&mut self, byte_len: usize) -> Result<DynArray<u16>> {
        self.require(self.position, byte_len)?;
        let end = self.position + byte_len;
        let bytes = &self.bytes()[..end];

        let mut units = DynArray::with_capacity(byte_len);
        let mut position = self.position;
        while position < end {
            let decoded = utf8::decode(bytes, position)?;
            units.add_range(decoded.as_slice());
            position += decoded.bytes_consumed();
        }

        self.position = end;
        Ok(units)
    }

    /// Deserializes an `S` through its [`Serialize`] impl.
    ///
    /// # Errors
    ///
    /// Whatever the impl reports.
    pub fn read<S: Serialize>(&mut self) -> Result<S> {
        S::deserialize(self)
    }

    /// Releases the reader, freeing the bytes only if it owns them.
    ///
    /// # Errors
    ///
    /// Propagates [`Allocation::dispose`] errors for an owning reader.
    #[track_caller]
    pub fn dispose(self) -> Result<()> {
        if let Some(scratch) = self.scratch {
            scratch.dispose()?;
        }
        match self.buffer {
            Buffer::Borrowed(_) => Ok(()),
            Buffer::Owned(block) => block.dispose(),
        }
    }
}

impl fmt::Debug for Reader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("owner", &self.is_owner())
            .field("position", &self.position)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_writer_layout() {
        let mut writer = Writer::new();
        writer.write_value(42i32).unwrap();
        writer.write_span(&[1.0f32, 2.0, 3.0]).unwrap();

        let mut reader = Reader::from_writer(&writer);
        assert!(!reader.is_owner());
        assert_eq!(reader.read_value::<i32>().unwrap(), 42);
        assert_eq!(reader.read_span::<f32>(3).unwrap().as_slice(), &[1.0, 2.0, 3.0]);
        assert_eq!(reader.position(), 16);
        assert!(reader.is_at_end());
    }

    #[test]
    fn test_peek_does_not_move() {
        let bytes = 0xAABB_CCDDu32.to_ne_bytes();
        let reader = Reader::new(&bytes);

        assert_eq!(reader.peek_value::<u32>(0).unwrap(), 0xAABB_CCDD);
        assert_eq!(reader.peek_value::<u8>(3).unwrap(), bytes[3]);
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_past_end() {
        let mut reader = Reader::new(&[1, 2, 3]);
        reader.advance(2).unwrap();

        assert_eq!(
            reader.read_value::<u16>(),
            Err(Error::UnexpectedEof {
                position: 2,
                needed: 2,
                len: 3
            })
        );
        assert_eq!(reader.position(), 2);
        assert!(reader.advance(2).is_err());
        assert_eq!(reader.read_bytes(1).unwrap(), &[3]);
        assert!(reader.read_bytes(1).is_err());
        assert!(reader.peek_value::<u64>(usize::MAX).is_err());
    }

    #[test]
    fn test_with_position() {
        let bytes = [9, 8, 7];
        let mut reader = Reader::with_position(&bytes, 1).unwrap();
        assert_eq!(reader.read_value::<u8>().unwrap(), 8);
        assert_eq!(reader.remaining(), 1);

        assert!(Reader::with_position(&bytes, 4).is_err());
        assert!(reader.set_position(3).is_ok());
        assert!(reader.is_at_end());
    }

    #[test]
    fn test_unaligned_span_after_packed_byte() {
        let mut writer = Writer::new();
        writer.write_value(1u8).unwrap();
        writer.write_span(&[10u32, 20]).unwrap();
        writer.write_value(7u8).unwrap();
        writer.write_span(&[0xABCD_u16, 0x1234, 0x5678]).unwrap();

        let mut reader = writer.into_reader();
        assert!(reader.is_owner());
        assert_eq!(reader.read_value::<u8>().unwrap(), 1);
        assert_eq!(reader.peek_span::<u32>(1, 2).unwrap().as_slice(), &[10, 20]);
        assert_eq!(reader.position(), 1);

        assert_eq!(reader.read_span::<u32>(2).unwrap().as_slice(), &[10, 20]);
        assert_eq!(reader.position(), 9);
        assert_eq!(reader.read_value::<u8>().unwrap(), 7);
        assert_eq!(
            reader.read_span::<u16>(3).unwrap().as_slice(),
            &[0xABCD, 0x1234, 0x5678]
        );
        assert!(reader.is_at_end());
        reader.dispose().unwrap();
    }

    #[test]
    fn test_copying_read_matches_span() {
        let mut writer = Writer::new();
        writer.write_value(1u8).unwrap();
        writer.write_span(&[3.5f64, -0.25]).unwrap();

        let mut reader = Reader::from_writer(&writer);
        reader.advance(1).unwrap();
        let copied = reader.read_array::<f64>(2).unwrap();
        reader.set_position(1).unwrap();
        assert_eq!(reader.read_span::<f64>(2).unwrap().as_slice(), copied.as_slice());
        assert!(reader.is_at_end());
    }

    #[test]
    fn test_empty_span_at_odd_offset() {
        let bytes = [0u8; 3];
        let mut reader = Reader::new(&bytes);
        reader.advance(1).unwrap();
        assert!(reader.read_span::<u64>(0).unwrap().is_empty());
        assert!(reader.read_span::<u64>(1).is_err());
        assert_eq!(reader.position(), 1);
    }

    #[test]
    fn test_read_utf8_sequence() {
        let mut writer = Writer::new();
        let units: Vec<u16> = "a\u{1F600}".encode_utf16().collect();
        writer.write_utf8(&units).unwrap();

        let mut reader = Reader::from_writer(&writer);
        let first = reader.read_utf8().unwrap();
        assert_eq!(first.as_slice(), &[u16::from(b'a')]);
        assert_eq!(reader.position(), 1);

        let second = reader.read_utf8().unwrap();
        assert_eq!(second.as_slice(), &units[1..]);
        assert_eq!(second.bytes_consumed(), 4);
        assert_eq!(reader.position(), 5);
    }

    #[test]
    fn test_malformed_continuation_keeps_position() {
        let mut reader = Reader::new(&[0xE2, 0x82, 0x41]);
        assert_eq!(
            reader.read_utf8(),
            Err(Error::MalformedEncoding { offset: 2, byte: 0x41 })
        );
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_read_utf8_units() {
        let text = "z\u{e9}\u{1F600}!";
        let mut reader = Reader::new(text.as_bytes());

        let units = reader.read_utf8_units(text.len()).unwrap();
        let expected: Vec<u16> = text.encode_utf16().collect();
        assert_eq!(units.as_slice(), expected.as_slice());
        assert!(reader.is_at_end());

        // A sequence cut by the requested length.
        let mut reader = Reader::new(text.as_bytes());
        assert!(matches!(
            reader.read_utf8_units(5),
            Err(Error::UnexpectedEof { .. })
        ));
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_copy_from_owns_bytes() {
        let reader = {
            let source = vec![5u8, 6, 7];
            Reader::copy_from(&source)
        };
        assert!(reader.is_owner());
        assert_eq!(reader.bytes(), &[5, 6, 7]);
        reader.dispose().unwrap();
    }

    #[test]
    fn test_from_stream() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let reader = Reader::from_stream(data.as_slice()).unwrap();

        assert!(reader.is_owner());
        assert_eq!(reader.len(), data.len());
        assert_eq!(reader.bytes(), data.as_slice());
    }

    #[test]
    fn test_from_allocation_checks_len() {
        let block = Allocation::from_bytes(&[1, 2]);
        assert!(Reader::from_allocation(block, 3).is_err());

        let block = Allocation::from_bytes(&[1, 2]);
        let mut reader = Reader::from_allocation(block, 1).unwrap();
        assert_eq!(reader.read_value::<u8>().unwrap(), 1);
        assert!(reader.read_value::<u8>().is_err());
    }
}
