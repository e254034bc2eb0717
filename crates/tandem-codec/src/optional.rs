//! Tagged optional member headers.
//!
//! An optional member is preceded by a one-byte header holding the tag in the
//! upper five bits and the wire format in the lower three. Tags of 30 and
//! above escape to `30` and follow the header with the tag as a size.

use crate::error::{CodecError, Result};

/// Marks the end of the optional members of a slice
pub const OPTIONAL_END_MARKER: u8 = 0xFF;

/// Largest tag that fits directly in the header byte
pub const MAX_INLINE_TAG: i32 = 29;

/// Escape value for tags that do not fit in the header byte
pub(crate) const TAG_ESCAPE: u8 = 30;

/// Wire format of an optional member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OptionalFormat {
    /// One fixed byte
    F1 = 0,
    /// Two fixed bytes
    F2 = 1,
    /// Four fixed bytes
    F4 = 2,
    /// Eight fixed bytes
    F8 = 3,
    /// A size
    Size = 4,
    /// A size followed by that many bytes
    VSize = 5,
    /// A four-byte size followed by that many bytes
    FSize = 6,
    /// A class instance
    Class = 7,
}

impl TryFrom<u8> for OptionalFormat {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::F1),
            1 => Ok(Self::F2),
            2 => Ok(Self::F4),
            3 => Ok(Self::F8),
            4 => Ok(Self::Size),
            5 => Ok(Self::VSize),
            6 => Ok(Self::FSize),
            7 => Ok(Self::Class),
            _ => Err(CodecError::invalid(format!("invalid optional format {value}"))),
        }
    }
}

impl OptionalFormat {
    /// Fixed payload width, if the format has one
    #[must_use]
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Self::F1 => Some(1),
            Self::F2 => Some(2),
            Self::F4 => Some(4),
            Self::F8 => Some(8),
            _ => None,
        }
    }
}

/// Split an optional header byte into its inline tag and format.
pub(crate) fn split_header(byte: u8) -> Result<(u8, OptionalFormat)> {
    let format = OptionalFormat::try_from(byte & 0x07)?;
    Ok((byte >> 3, format))
}

/// Build the header byte for a tag that fits inline, or the escape byte.
pub(crate) fn header_byte(tag: i32, format: OptionalFormat) -> u8 {
    let inline = if tag <= MAX_INLINE_TAG {
        tag as u8
    } else {
        TAG_ESCAPE
    };
    (inline << 3) | format as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let byte = header_byte(5, OptionalFormat::VSize);
        assert_eq!(byte, (5 << 3) | 5);
        let (tag, format) = split_header(byte).unwrap();
        assert_eq!(tag, 5);
        assert_eq!(format, OptionalFormat::VSize);
    }

    #[test]
    fn test_large_tag_escapes() {
        let byte = header_byte(100, OptionalFormat::F4);
        let (tag, format) = split_header(byte).unwrap();
        assert_eq!(tag, TAG_ESCAPE);
        assert_eq!(format, OptionalFormat::F4);
    }

    #[test]
    fn test_end_marker_is_not_a_valid_tag_byte() {
        let (tag, format) = split_header(OPTIONAL_END_MARKER).unwrap();
        assert_eq!(tag, 31);
        assert_eq!(format, OptionalFormat::Class);
    }

    #[test]
    fn test_fixed_width() {
        assert_eq!(OptionalFormat::F8.fixed_width(), Some(8));
        assert_eq!(OptionalFormat::FSize.fixed_width(), None);
    }
}
