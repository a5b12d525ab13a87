//! # RESP Encoding and Parsing
//!
//! Purpose: The reference request formatter and response parser plugged into
//! the engine: commands go out as arrays of bulk strings, and one complete
//! RESP2/RESP3 frame comes back as a `RespValue`.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Responses are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides the line buffer to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns parse errors immediately.
//!
//! Attributes (`|`) are metadata about the value that follows; the parser
//! skips them and returns the value itself.

use std::io::{self, BufRead, Cursor};

use respio_common::{encode_usize, parse_i64, Marker, MessageError, MessageResult, CRLF};
use respio_engine::{RequestFormatter, ResponseParser};

/// RESP response value.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... and !N bulk error responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays.
    Array(Vec<RespValue>),
    /// _ (and the RESP2 null array).
    Null,
    /// ,3.14 responses.
    Double(f64),
    /// #t / #f responses.
    Boolean(bool),
    /// (12345... responses, kept as their decimal text.
    BigNumber(Vec<u8>),
    /// =N verbatim strings with their three-byte format tag.
    Verbatim { format: [u8; 3], text: Vec<u8> },
    /// %... maps, in wire order.
    Map(Vec<(RespValue, RespValue)>),
    /// ~... sets.
    Set(Vec<RespValue>),
    /// >... out-of-band pushes.
    Push(Vec<RespValue>),
}

impl RespValue {
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Returns the payload of string-like replies.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Simple(data) | RespValue::Bulk(Some(data)) => Some(data),
            RespValue::Verbatim { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// Encodes `command` plus arguments as a RESP array of bulk strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArgsFormatter;

impl<'a> RequestFormatter<[&'a [u8]]> for ArgsFormatter {
    fn format(&self, command: &str, args: &[&'a [u8]], out: &mut dyn io::Write) -> io::Result<()> {
        write_header(out, b'*', args.len() + 1)?;
        write_bulk(out, command.as_bytes())?;
        for arg in args {
            write_bulk(out, arg)?;
        }
        Ok(())
    }
}

fn write_header(out: &mut dyn io::Write, marker: u8, len: usize) -> io::Result<()> {
    // Stack buffer keeps the length allocation-free.
    let (digits, count) = encode_usize(len);
    out.write_all(&[marker])?;
    out.write_all(&digits[..count])?;
    out.write_all(CRLF)
}

fn write_bulk(out: &mut dyn io::Write, data: &[u8]) -> io::Result<()> {
    write_header(out, b'$', data.len())?;
    out.write_all(data)?;
    out.write_all(CRLF)
}

/// Parses one complete frame into a [`RespValue`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueParser;

impl ResponseParser for ValueParser {
    type Output = RespValue;

    fn parse(&self, frame: &[u8]) -> MessageResult<RespValue> {
        let mut reader = Cursor::new(frame);
        let mut line = Vec::with_capacity(64);
        read_response(&mut reader, &mut line)
    }
}

/// Reads one RESP value from the buffered reader.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> MessageResult<RespValue> {
    read_value(reader, line_buf)?.ok_or_else(|| malformed("stream terminator outside a streamed aggregate"))
}

/// Returns `None` for the `.` terminator closing a streamed aggregate.
fn read_value<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> MessageResult<Option<RespValue>> {
    read_line(reader, line_buf)?;
    let marker = line_buf
        .first()
        .copied()
        .and_then(Marker::from_byte)
        .ok_or_else(|| malformed("unknown type marker"))?;
    let header = &line_buf[1..];

    let value = match marker {
        Marker::SimpleString => RespValue::Simple(header.to_vec()),
        Marker::Error => RespValue::Error(header.to_vec()),
        Marker::Integer => RespValue::Integer(parse_len(header)?),
        Marker::Null => RespValue::Null,
        Marker::BigNumber => RespValue::BigNumber(header.to_vec()),
        Marker::Boolean => match header {
            b"t" => RespValue::Boolean(true),
            b"f" => RespValue::Boolean(false),
            _ => return Err(malformed("invalid boolean")),
        },
        Marker::Double => std::str::from_utf8(header)
            .ok()
            .and_then(|text| text.parse::<f64>().ok())
            .map(RespValue::Double)
            .ok_or_else(|| malformed("invalid double"))?,
        Marker::StreamTerminator => return Ok(None),
        Marker::StreamedChunk => return Err(malformed("chunk outside a streamed string")),
        Marker::BulkString if header == b"?" => RespValue::Bulk(Some(read_streamed_string(reader, line_buf)?)),
        Marker::BulkString => match read_payload(reader, header)? {
            Some(data) => RespValue::Bulk(Some(data)),
            None => RespValue::Bulk(None),
        },
        Marker::BulkError => RespValue::Error(read_payload(reader, header)?.unwrap_or_default()),
        Marker::VerbatimString => {
            let data = read_payload(reader, header)?.ok_or_else(|| malformed("null verbatim string"))?;
            if data.len() < 4 || data[3] != b':' {
                return Err(malformed("verbatim string without format"));
            }
            RespValue::Verbatim {
                format: [data[0], data[1], data[2]],
                text: data[4..].to_vec(),
            }
        }
        Marker::Attribute => {
            let count = aggregate_len(header)?;
            read_pairs(reader, line_buf, count)?;
            return read_value(reader, line_buf);
        }
        Marker::Array | Marker::Set | Marker::Push | Marker::Map if header.first() == Some(&b'-') => {
            // RESP2 null array.
            parse_len(header)?;
            RespValue::Null
        }
        Marker::Array | Marker::Set | Marker::Push => {
            let count = aggregate_len(header)?;
            let items = read_items(reader, line_buf, count)?;
            match marker {
                Marker::Array => RespValue::Array(items),
                Marker::Set => RespValue::Set(items),
                _ => RespValue::Push(items),
            }
        }
        Marker::Map => {
            let count = aggregate_len(header)?;
            RespValue::Map(read_pairs(reader, line_buf, count)?)
        }
    };
    Ok(Some(value))
}

/// Element count of an aggregate header; `None` for `?` (streamed).
fn aggregate_len(header: &[u8]) -> MessageResult<Option<usize>> {
    if header == b"?" {
        return Ok(None);
    }
    let len = parse_len(header)?;
    usize::try_from(len)
        .map(Some)
        .map_err(|_| malformed("negative aggregate length"))
}

/// Reads `count` values, or values up to the terminator when `count` is `None`.
fn read_items<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    count: Option<usize>,
) -> MessageResult<Vec<RespValue>> {
    match count {
        Some(count) => {
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(read_response(reader, line_buf)?);
            }
            Ok(items)
        }
        None => {
            let mut items = Vec::new();
            while let Some(item) = read_value(reader, line_buf)? {
                items.push(item);
            }
            Ok(items)
        }
    }
}

fn read_pairs<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    count: Option<usize>,
) -> MessageResult<Vec<(RespValue, RespValue)>> {
    let mut pairs = Vec::new();
    let mut read = 0;
    loop {
        if count.is_some_and(|count| read == count) {
            return Ok(pairs);
        }
        let key = match read_value(reader, line_buf)? {
            Some(key) => key,
            None if count.is_none() => return Ok(pairs),
            None => return Err(malformed("stream terminator inside a sized map")),
        };
        let value = read_response(reader, line_buf)?;
        pairs.push((key, value));
        read += 1;
    }
}

/// Concatenates `;N` chunks up to the `;0` terminator.
fn read_streamed_string<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> MessageResult<Vec<u8>> {
    let mut data = Vec::new();
    loop {
        read_line(reader, line_buf)?;
        if line_buf.first() != Some(&Marker::StreamedChunk.as_byte()) {
            return Err(malformed("expected string chunk"));
        }
        // `;0` ends the string and carries no payload.
        if &line_buf[1..] == b"0" {
            return Ok(data);
        }
        match read_payload(reader, &line_buf[1..])? {
            Some(chunk) => data.extend_from_slice(&chunk),
            None => return Err(malformed("null string chunk")),
        }
    }
}

/// Reads a length-prefixed payload and its trailing CRLF; `None` for length -1.
fn read_payload<R: BufRead>(reader: &mut R, header: &[u8]) -> MessageResult<Option<Vec<u8>>> {
    let len = parse_len(header)?;
    if len < 0 {
        return Ok(None);
    }
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).map_err(io_error)?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).map_err(io_error)?;
    if &crlf != CRLF {
        return Err(malformed("payload without CRLF"));
    }
    Ok(Some(data))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> MessageResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf).map_err(io_error)?;
    if bytes == 0 {
        return Err(malformed("truncated frame"));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(malformed("line without CRLF"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_len(data: &[u8]) -> MessageResult<i64> {
    parse_i64(data).map_err(|err| MessageError::Parse(err.to_string()))
}

fn malformed(reason: &str) -> MessageError {
    MessageError::Parse(reason.to_string())
}

fn io_error(err: io::Error) -> MessageError {
    MessageError::Parse(err.to_string())
}
