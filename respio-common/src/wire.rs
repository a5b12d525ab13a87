//! # RESP Wire Markers
//!
//! Purpose: Name every RESP2/RESP3 type marker and provide the small decimal
//! helpers both the scanner and the reply parser use on header lines.
//!
//! ## Wire Grammar Overview
//!
//! ```text
//! +OK\r\n              simple string          -ERR msg\r\n       error
//! :42\r\n              integer                $5\r\nhello\r\n   bulk string
//! *2\r\n<e1><e2>       array (N children)      _\r\n              null
//! ,3.14\r\n            double                 #t\r\n             boolean
//! (1234..\r\n          big number             =7\r\ntxt:abc\r\n verbatim string
//! !5\r\nERROR\r\n      bulk error             %1\r\n<k><v>       map (2N children)
//! ~2\r\n<e1><e2>       set                    >3\r\n<...>        out-of-band push
//! |1\r\n<k><v>         attribute metadata     $?\r\n;N..;0\r\n   streamed string
//! *?\r\n<...>.\r\n     streamed aggregate (also %? ~? >? |?)
//! ```

use crate::error::ProtocolError;

/// Line terminator used by every RESP header.
pub const CRLF: &[u8; 2] = b"\r\n";

/// RESP type marker (the first byte of every element).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    SimpleString,
    Error,
    Integer,
    BulkString,
    Array,
    Null,
    Double,
    Boolean,
    BigNumber,
    VerbatimString,
    BulkError,
    Map,
    Set,
    Push,
    Attribute,
    /// `;` chunk inside a streamed string.
    StreamedChunk,
    /// `.` terminator closing a streamed aggregate.
    StreamTerminator,
}

impl Marker {
    /// Maps a raw byte to its marker.
    pub const fn from_byte(byte: u8) -> Option<Marker> {
        Some(match byte {
            b'+' => Marker::SimpleString,
            b'-' => Marker::Error,
            b':' => Marker::Integer,
            b'$' => Marker::BulkString,
            b'*' => Marker::Array,
            b'_' => Marker::Null,
            b',' => Marker::Double,
            b'#' => Marker::Boolean,
            b'(' => Marker::BigNumber,
            b'=' => Marker::VerbatimString,
            b'!' => Marker::BulkError,
            b'%' => Marker::Map,
            b'~' => Marker::Set,
            b'>' => Marker::Push,
            b'|' => Marker::Attribute,
            b';' => Marker::StreamedChunk,
            b'.' => Marker::StreamTerminator,
            _ => return None,
        })
    }

    /// Returns the wire byte for this marker.
    pub const fn as_byte(self) -> u8 {
        match self {
            Marker::SimpleString => b'+',
            Marker::Error => b'-',
            Marker::Integer => b':',
            Marker::BulkString => b'$',
            Marker::Array => b'*',
            Marker::Null => b'_',
            Marker::Double => b',',
            Marker::Boolean => b'#',
            Marker::BigNumber => b'(',
            Marker::VerbatimString => b'=',
            Marker::BulkError => b'!',
            Marker::Map => b'%',
            Marker::Set => b'~',
            Marker::Push => b'>',
            Marker::Attribute => b'|',
            Marker::StreamedChunk => b';',
            Marker::StreamTerminator => b'.',
        }
    }

    /// Markers whose header is followed by a length-prefixed payload.
    pub const fn has_payload(self) -> bool {
        matches!(
            self,
            Marker::BulkString | Marker::VerbatimString | Marker::BulkError | Marker::StreamedChunk
        )
    }

    /// Markers whose header announces child elements.
    pub const fn is_aggregate(self) -> bool {
        matches!(
            self,
            Marker::Array | Marker::Map | Marker::Set | Marker::Push | Marker::Attribute
        )
    }

    /// Children contributed per announced unit (maps and attributes hold pairs).
    pub const fn children_per_unit(self) -> i64 {
        match self {
            Marker::Map | Marker::Attribute => 2,
            _ => 1,
        }
    }
}

/// Parses a signed decimal header field such as `-1` or `42`.
pub fn parse_i64(data: &[u8]) -> Result<i64, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }
    let (negative, digits) = match data[0] {
        b'-' => (true, &data[1..]),
        b'+' => (false, &data[1..]),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as i64))
            .ok_or(ProtocolError::InvalidInteger)?;
    }

    Ok(if negative { -value } else { value })
}

/// Appends the decimal form of `value` without allocating.
pub fn push_usize(out: &mut Vec<u8>, value: usize) {
    let (buf, len) = encode_usize(value);
    out.extend_from_slice(&buf[..len]);
}

/// Encodes `value` into a stack buffer, returning the buffer and digit count.
pub fn encode_usize(mut value: usize) -> ([u8; 20], usize) {
    // Stack buffer keeps conversion allocation-free.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        return (buf, 1);
    }
    while value > 0 {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
    }
    buf[..len].reverse();
    (buf, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_roundtrips_through_byte() {
        for byte in b"+-:$*_,#(=!%~>|;.".iter().copied() {
            let marker = Marker::from_byte(byte).expect("known marker");
            assert_eq!(marker.as_byte(), byte);
        }
        assert_eq!(Marker::from_byte(b'x'), None);
    }

    #[test]
    fn maps_count_pairs() {
        assert_eq!(Marker::Map.children_per_unit(), 2);
        assert_eq!(Marker::Attribute.children_per_unit(), 2);
        assert_eq!(Marker::Array.children_per_unit(), 1);
    }

    #[test]
    fn parses_signed_fields() {
        assert_eq!(parse_i64(b"42"), Ok(42));
        assert_eq!(parse_i64(b"-1"), Ok(-1));
        assert_eq!(parse_i64(b"+7"), Ok(7));
        assert_eq!(parse_i64(b""), Err(ProtocolError::InvalidInteger));
        assert_eq!(parse_i64(b"-"), Err(ProtocolError::InvalidInteger));
        assert_eq!(parse_i64(b"1x"), Err(ProtocolError::InvalidInteger));
        assert_eq!(parse_i64(b"99999999999999999999"), Err(ProtocolError::InvalidInteger));
    }

    #[test]
    fn encodes_decimal() {
        let mut out = Vec::new();
        push_usize(&mut out, 0);
        out.push(b' ');
        push_usize(&mut out, 1234);
        assert_eq!(out, b"0 1234");
    }
}
