// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provides [`Guid`], laid out like the Windows `GUID` so it can be embedded
//! directly in wire structures.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A Windows-format GUID: little-endian integer fields followed by eight
/// bytes.
#[repr(C)]
#[derive(
    Copy,
    Clone,
    Default,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
#[expect(missing_docs)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

/// An error parsing a GUID string.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The string is neither 36 nor 38 characters long.
    #[error("invalid GUID length")]
    Length,
    /// Braces or dashes are missing or misplaced.
    #[error("invalid GUID format")]
    Format,
    /// A character is not a hex digit.
    #[error("invalid GUID digit")]
    Digit,
}

/// Byte positions of the hex digit pairs in the unbraced form, in field
/// order.
const DIGIT_PAIRS: [usize; 16] = [0, 2, 4, 6, 9, 11, 14, 16, 19, 21, 24, 26, 28, 30, 32, 34];

const fn hex(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl Guid {
    /// The all-zero GUID.
    pub const ZERO: Self = Self {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    };

    /// Parses a GUID constant, panicking at compile time if it is malformed.
    ///
    /// Accepts `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`, optionally in braces.
    /// Use [`FromStr`] for untrusted input.
    pub const fn from_static_str(value: &'static str) -> Self {
        match Self::parse(value.as_bytes()) {
            Ok(guid) => guid,
            Err(ParseError::Length) => panic!("invalid GUID length"),
            Err(ParseError::Format) => panic!("invalid GUID format"),
            Err(ParseError::Digit) => panic!("invalid GUID digit"),
        }
    }

    const fn parse(value: &[u8]) -> Result<Self, ParseError> {
        let base = match value.len() {
            36 => 0,
            38 => {
                if value[0] != b'{' || value[37] != b'}' {
                    return Err(ParseError::Format);
                }
                1
            }
            _ => return Err(ParseError::Length),
        };
        if value[base + 8] != b'-'
            || value[base + 13] != b'-'
            || value[base + 18] != b'-'
            || value[base + 23] != b'-'
        {
            return Err(ParseError::Format);
        }

        let mut bytes = [0u8; 16];
        let mut i = 0;
        while i < 16 {
            let at = base + DIGIT_PAIRS[i];
            let (Some(hi), Some(lo)) = (hex(value[at]), hex(value[at + 1])) else {
                return Err(ParseError::Digit);
            };
            bytes[i] = hi << 4 | lo;
            i += 1;
        }

        Ok(Self {
            data1: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_be_bytes([bytes[4], bytes[5]]),
            data3: u16::from_be_bytes([bytes[6], bytes[7]]),
            data4: [
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ],
        })
    }

    /// Returns true if this is [`Guid::ZERO`].
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl FromStr for Guid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7],
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::Guid;
    use super::ParseError;
    use zerocopy::IntoBytes;

    const STORAGE: Guid = Guid::from_static_str("ba6163d9-04a1-4d29-b605-72e2ffb1dc7f");

    #[test]
    fn parse_and_display() {
        assert_eq!(STORAGE.data1, 0xba6163d9);
        assert_eq!(STORAGE.data2, 0x04a1);
        assert_eq!(STORAGE.data4, [0xb6, 0x05, 0x72, 0xe2, 0xff, 0xb1, 0xdc, 0x7f]);
        assert_eq!(
            STORAGE.to_string(),
            "ba6163d9-04a1-4d29-b605-72e2ffb1dc7f"
        );
        let braced: Guid = "{BA6163D9-04A1-4D29-B605-72E2FFB1DC7F}".parse().unwrap();
        assert_eq!(braced, STORAGE);
    }

    #[test]
    fn wire_layout() {
        assert_eq!(
            STORAGE.as_bytes(),
            &[
                0xd9, 0x63, 0x61, 0xba, 0xa1, 0x04, 0x29, 0x4d, 0xb6, 0x05, 0x72, 0xe2, 0xff,
                0xb1, 0xdc, 0x7f
            ]
        );
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!("1234".parse::<Guid>(), Err(ParseError::Length));
        assert_eq!(
            "ba6163d9x04a1-4d29-b605-72e2ffb1dc7f".parse::<Guid>(),
            Err(ParseError::Format)
        );
        assert_eq!(
            "ba6163d9-04a1-4d29-b605-72e2ffb1dc7g".parse::<Guid>(),
            Err(ParseError::Digit)
        );
        assert!(Guid::default().is_zero());
    }
}
