//! Cursor-based binary serialization.
//!
//! [`Writer`] appends typed values to a growable buffer; [`Reader`] walks a
//! buffer with a position and reads them back. Both use native byte order and
//! pack values with no padding. Per-type layouts are up to the type, through
//! [`Serialize`].
//!
//! # Example
//!
//! ```
//! use rawmem::{Reader, Writer};
//!
//! let mut writer = Writer::new();
//! writer.write_value(42i32).unwrap();
//! writer.write_span(&[1.0f32, 2.0, 3.0]).unwrap();
//!
//! let mut reader = Reader::from_writer(&writer);
//! assert_eq!(reader.read_value::<i32>().unwrap(), 42);
//! assert_eq!(reader.read_span::<f32>(3).unwrap().as_slice(), &[1.0, 2.0, 3.0]);
//! assert_eq!(reader.position(), 16);
//! ```

mod reader;
mod utf8;
mod writer;

pub use reader::Reader;
pub use utf8::Utf16Units;
pub use writer::Writer;

use crate::array::DynArray;
use crate::error::{Error, Result};
use crate::pod::Pod;

/// Types with a binary layout written through a [`Writer`] and read back
/// through a [`Reader`].
pub trait Serialize: Sized {
    /// Appends `self` to `writer`.
    ///
    /// # Errors
    ///
    /// Any error from the writer.
    fn serialize(&self, writer: &mut Writer) -> Result<()>;

    /// Reads a value laid out by [`Serialize::serialize`].
    ///
    /// # Errors
    ///
    /// Any error from the reader, typically [`Error::UnexpectedEof`].
    fn deserialize(reader: &mut Reader<'_>) -> Result<Self>;
}

macro_rules! impl_serialize_pod {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Serialize for $ty {
                #[inline]
                fn serialize(&self, writer: &mut Writer) -> Result<()> {
                    writer.write_value(*self)
                }

                #[inline]
                fn deserialize(reader: &mut Reader<'_>) -> Result<Self> {
                    reader.read_value()
                }
            }
        )*
    };
}

impl_serialize_pod!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

impl<T: Pod, const N: usize> Serialize for [T; N] {
    fn serialize(&self, writer: &mut Writer) -> Result<()> {
        writer.write_value(*self)
    }

    fn deserialize(reader: &mut Reader<'_>) -> Result<Self> {
        reader.read_value()
    }
}

/// A `u32` element count followed by the packed elements.
impl<T: Pod> Serialize for DynArray<T> {
    fn serialize(&self, writer: &mut Writer) -> Result<()> {
        let count = u32::try_from(self.len()).map_err(|_| Error::InvalidCapacity {
            requested: self.len(),
        })?;
        writer.write_value(count)?;
        writer.write_span(self.as_slice())
    }

    fn deserialize(reader: &mut Reader<'_>) -> Result<Self> {
        let count = reader.read_value::<u32>()? as usize;
        reader.read_array(count)
    }
}
