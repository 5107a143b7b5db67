//! UTF-16 to UTF-8 encoding and single-sequence UTF-8 decoding.
//!
//! Byte layouts:
//!
//! | Code points         | Bytes                                 |
//! |---------------------|---------------------------------------|
//! | U+0000 - U+007F     | `0xxxxxxx`                            |
//! | U+0080 - U+07FF     | `110xxxxx 10xxxxxx`                   |
//! | U+0800 - U+FFFF     | `1110xxxx 10xxxxxx 10xxxxxx`          |
//! | U+10000 - U+10FFFF  | `11110xxx 10xxxxxx 10xxxxxx 10xxxxxx` |
//!
//! A high surrogate followed by a low surrogate is combined into one code
//! point above U+FFFF. An unpaired surrogate is emitted in its 3-byte form so
//! arbitrary UTF-16 survives a round trip.

use crate::error::{Error, Result};

const SURROGATE_OFFSET: u32 = 0x1_0000;

fn is_high_surrogate(unit: u16) -> bool {
    (0xD800..0xDC00).contains(&unit)
}

fn is_low_surrogate(unit: u16) -> bool {
    (0xDC00..0xE000).contains(&unit)
}

/// Up to two UTF-16 code units decoded from one UTF-8 sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utf16Units {
    units: [u16; 2],
    len: u8,
    consumed: u8,
}

impl Utf16Units {
    fn from_code_point(cp: u32, consumed: usize) -> Self {
        let consumed = consumed as u8;
        if cp < SURROGATE_OFFSET {
            return Utf16Units {
                units: [cp as u16, 0],
                len: 1,
                consumed,
            };
        }

        let offset = cp - SURROGATE_OFFSET;
        Utf16Units {
            units: [0xD800 | (offset >> 10) as u16, 0xDC00 | (offset & 0x3FF) as u16],
            len: 2,
            consumed,
        }
    }

    /// The units in sequence order: a lone unit, or high then low surrogate.
    #[must_use]
    pub fn as_slice(&self) -> &[u16] {
        &self.units[..usize::from(self.len)]
    }

    /// Returns `true` for a surrogate pair.
    #[must_use]
    pub fn is_pair(&self) -> bool {
        self.len == 2
    }

    /// The low (last) unit: the only unit, or the low surrogate of a pair.
    #[must_use]
    pub fn low(&self) -> u16 {
        self.units[usize::from(self.len) - 1]
    }

    /// The high surrogate of a pair.
    #[must_use]
    pub fn high(&self) -> Option<u16> {
        self.is_pair().then_some(self.units[0])
    }

    /// Number of UTF-8 bytes the sequence occupied.
    #[must_use]
    pub fn bytes_consumed(&self) -> usize {
        usize::from(self.consumed)
    }

    /// The decoded scalar value, or `None` for a lone surrogate.
    #[must_use]
    pub fn to_char(&self) -> Option<char> {
        char::decode_utf16(self.as_slice().iter().copied())
            .next()
            .and_then(|decoded| decoded.ok())
    }
}

/// Iterates over the code points of a UTF-16 sequence, pairing surrogates
/// where possible and passing unpaired ones through unchanged.
pub(crate) fn code_points(units: &[u16]) -> impl Iterator<Item = u32> + '_ {
    let mut index = 0;
    std::iter::from_fn(move || {
        let unit = *units.get(index)?;
        index += 1;

        if is_high_surrogate(unit)
            && let Some(&next) = units.get(index)
            && is_low_surrogate(next)
        {
            index += 1;
            let high = u32::from(unit - 0xD800);
            let low = u32::from(next - 0xDC00);
            return Some(SURROGATE_OFFSET + (high << 10) + low);
        }

        Some(u32::from(unit))
    })
}

/// Encodes one code point into `out`, returning the number of bytes used.
pub(crate) fn encode(cp: u32, out: &mut [u8; 4]) -> usize {
    match cp {
        0..=0x7F => {
            out[0] = cp as u8;
            1
        }
        0x80..=0x7FF => {
            out[0] = 0xC0 | (cp >> 6) as u8;
            out[1] = 0x80 | (cp & 0x3F) as u8;
            2
        }
        0x800..=0xFFFF => {
            out[0] = 0xE0 | (cp >> 12) as u8;
            out[1] = 0x80 | ((cp >> 6) & 0x3F) as u8;
            out[2] = 0x80 | (cp & 0x3F) as u8;
            3
        }
        _ => {
            out[0] = 0xF0 | (cp >> 18) as u8;
            out[1] = 0x80 | ((cp >> 12) & 0x3F) as u8;
            out[2] = 0x80 | ((cp >> 6) & 0x3F) as u8;
            out[3] = 0x80 | (cp & 0x3F) as u8;
            4
        }
    }
}

/// Upper bound on the UTF-8 size of `units`.
pub(crate) fn max_encoded_len(units: &[u16]) -> usize {
    units.len().saturating_mul(3)
}

/// Decodes the sequence starting at `bytes[position]`.
///
/// Returns the UTF-16 units and the number of bytes consumed. Offsets in
/// errors are absolute positions in `bytes`.
pub(crate) fn decode(bytes: &[u8], position: usize) -> Result<Utf16Units> {
    let len = bytes.len();
    let Some(&lead) = bytes.get(position) else {
        return Err(Error::UnexpectedEof {
            position,
            needed: 1,
            len,
        });
    };

    let (width, initial, min) = match lead {
        0x00..=0x7F => return Ok(Utf16Units::from_code_point(u32::from(lead), 1)),
        0xC2..=0xDF => (2, u32::from(lead & 0x1F), 0x80),
        0xE0..=0xEF => (3, u32::from(lead & 0x0F), 0x800),
        0xF0..=0xF4 => (4, u32::from(lead & 0x07), SURROGATE_OFFSET),
        _ => {
            return Err(Error::MalformedEncoding {
                offset: position,
                byte: lead,
            });
        }
    };

    if len - position < width {
        return Err(Error::UnexpectedEof {
            position,
            needed: width,
            len,
        });
    }

    let mut cp = initial;
    for offset in position + 1..position + width {
        let byte = bytes[offset];
        if byte & 0xC0 != 0x80 {
            return Err(Error::MalformedEncoding { offset, byte });
        }
        cp = (cp << 6) | u32::from(byte & 0x3F);
    }

    // Overlong forms and code points past U+10FFFF.
    if cp < min || cp > 0x10_FFFF {
        return Err(Error::MalformedEncoding {
            offset: position + 1,
            byte: bytes[position + 1],
        });
    }

    Ok(Utf16Units::from_code_point(cp, width))
}
