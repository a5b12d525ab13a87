//! # Frame Scanner
//!
//! Purpose: Measure the byte length of exactly one top-level RESP message
//! without building a value tree, so the read loop can hand a precise byte
//! range to the waiting message.
//!
//! ## Design Principles
//! 1. **Delta Counting**: Each element adds its arity contribution; a message
//!    is complete when the counter reaches −1 with no streaming level open.
//! 2. **Resumable**: State only advances over whole elements, so an incomplete
//!    scan picks up where it stopped once more bytes are committed.
//! 3. **No Copies**: The scanner reads through `FrameSource`, which both plain
//!    slices and multi-page committed views implement.
//! 4. **Fatal Faults**: Grammar violations are returned as `ProtocolError` and
//!    never retried.
//!
//! ## Delta Contributions
//!
//! ```text
//! scalar / null                         -1
//! aggregate of N units (map: 2 per unit) N*units - 1
//! attribute |N                          +2N   (the node itself is invisible)
//! streaming open  *? %? ~? >? |? $?     suspends counting, depth + 1
//! streaming close  .  or  ;0            depth - 1, outermost close adds -1
//! ```

use respio_common::{parse_i64, Marker, ProtocolError};

use crate::read_buffer::CommittedView;

/// Read-only byte source the scanner walks.
pub trait FrameSource {
    /// Total bytes available.
    fn len(&self) -> usize;

    /// Returns true when no bytes are available.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the byte at `index`.
    fn byte_at(&self, index: usize) -> Option<u8>;

    /// Finds the first `byte` at or after `from`.
    fn find_byte(&self, from: usize, byte: u8) -> Option<usize>;

    /// Copies bytes starting at `from` into `out`, returning the count copied.
    fn copy_range(&self, from: usize, out: &mut [u8]) -> usize;
}

impl FrameSource for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn byte_at(&self, index: usize) -> Option<u8> {
        self.get(index).copied()
    }

    fn find_byte(&self, from: usize, byte: u8) -> Option<usize> {
        self.get(from..)?
            .iter()
            .position(|&b| b == byte)
            .map(|pos| from + pos)
    }

    fn copy_range(&self, from: usize, out: &mut [u8]) -> usize {
        let Some(rest) = self.get(from..) else {
            return 0;
        };
        let take = rest.len().min(out.len());
        out[..take].copy_from_slice(&rest[..take]);
        take
    }
}

impl FrameSource for CommittedView<'_> {
    fn len(&self) -> usize {
        CommittedView::len(self)
    }

    fn byte_at(&self, index: usize) -> Option<u8> {
        CommittedView::byte_at(self, index)
    }

    fn find_byte(&self, from: usize, byte: u8) -> Option<usize> {
        CommittedView::find_byte(self, from, byte)
    }

    fn copy_range(&self, from: usize, out: &mut [u8]) -> usize {
        CommittedView::copy_range(self, from, out)
    }
}

/// Classification of a scanned message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Nothing classified yet.
    Root,
    /// RESP3 push on a regular connection.
    OutOfBand,
    /// Reply correlated with the oldest outstanding request.
    RequestResponse,
    /// Pub/sub array whose first element has not been seen yet.
    PubSubPending,
    /// Unsolicited pub/sub message.
    PubSubPush,
    /// Genuine reply on a pub/sub connection (PING answer).
    PubSubReply,
}

impl MessageKind {
    /// Returns true when the frame must not consume a pending message.
    pub fn is_out_of_band(self) -> bool {
        matches!(
            self,
            MessageKind::OutOfBand | MessageKind::PubSubPush | MessageKind::PubSubPending
        )
    }
}

/// Result of one `scan` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanProgress {
    /// More bytes are required; call `scan` again after committing more.
    Incomplete,
    /// One message of `len` bytes starts at offset zero.
    Complete { len: usize, kind: MessageKind },
}

/// Longest numeric header the scanner accepts (sign plus 20 digits).
const MAX_NUMERIC_HEADER: usize = 21;

/// One fully available element.
struct Element {
    marker: Marker,
    /// Offset just past the element (header and payload).
    end: usize,
    /// Declared count or payload length; `None` for streaming `?` headers.
    count: Option<i64>,
    /// Start and end of the inline content (simple line or bulk payload).
    content: (usize, usize),
}

/// Resumable RESP frame boundary scanner.
#[derive(Debug, Clone)]
pub struct FrameScanner {
    delta: i64,
    streaming_depth: u8,
    /// Bit `i` set when level `i` is a streamed string.
    string_levels: u64,
    /// Bit `i` set when level `i` is a streamed attribute.
    attribute_levels: u64,
    max_depth: u8,
    kind: MessageKind,
    /// Streaming depth at which the classifying element is expected.
    decide_depth: u8,
    /// Outstanding attribute children before the classifying element.
    attr_skip: i64,
    consumed: usize,
    pubsub: bool,
}

impl FrameScanner {
    /// Creates a scanner accepting `max_depth` nested streaming levels (≤ 64).
    pub fn new(max_depth: u8, pubsub: bool) -> Self {
        FrameScanner {
            delta: 0,
            streaming_depth: 0,
            string_levels: 0,
            attribute_levels: 0,
            max_depth: max_depth.clamp(1, 64),
            kind: MessageKind::Root,
            decide_depth: 0,
            attr_skip: 0,
            consumed: 0,
            pubsub,
        }
    }

    /// Returns bytes consumed by the message in progress.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Clears any partial progress.
    pub fn reset(&mut self) {
        *self = FrameScanner::new(self.max_depth, self.pubsub);
    }

    /// Scans `src` (which must start at the message's first byte).
    ///
    /// Bytes before `consumed()` must be unchanged since the previous call.
    pub fn scan<S: FrameSource + ?Sized>(&mut self, src: &S) -> Result<ScanProgress, ProtocolError> {
        loop {
            let Some(element) = self.next_element(src)? else {
                return Ok(ScanProgress::Incomplete);
            };
            self.classify(src, &element)?;
            self.account(&element)?;
            self.consumed = element.end;

            if self.delta == -1 && self.streaming_depth == 0 {
                let progress = ScanProgress::Complete {
                    len: self.consumed,
                    kind: self.kind,
                };
                self.reset();
                return Ok(progress);
            }
        }
    }

    fn next_element<S: FrameSource + ?Sized>(&self, src: &S) -> Result<Option<Element>, ProtocolError> {
        let start = self.consumed;
        let Some(byte) = src.byte_at(start) else {
            return Ok(None);
        };
        let marker = Marker::from_byte(byte).ok_or(ProtocolError::UnexpectedMarker {
            marker: byte,
            offset: start,
        })?;
        let Some(newline) = src.find_byte(start + 1, b'\n') else {
            return Ok(None);
        };
        if newline < start + 2 || src.byte_at(newline - 1) != Some(b'\r') {
            return Err(ProtocolError::Malformed {
                offset: newline,
                reason: "line feed without carriage return",
            });
        }
        let line = (start + 1, newline - 1);
        let header_end = newline + 1;

        let numeric = marker.has_payload() || marker.is_aggregate();
        if !numeric {
            if marker == Marker::StreamTerminator && line.0 != line.1 {
                return Err(ProtocolError::Malformed {
                    offset: start,
                    reason: "streaming terminator carries data",
                });
            }
            return Ok(Some(Element {
                marker,
                end: header_end,
                count: None,
                content: line,
            }));
        }

        let count = read_count(src, line, start)?;
        let mut end = header_end;
        let mut content = (header_end, header_end);
        if marker.has_payload() {
            let payload_len = match (marker, count) {
                // `;0` closes a streamed string and carries no payload.
                (Marker::StreamedChunk, Some(0)) => None,
                (Marker::StreamedChunk, Some(-1) | None) => {
                    return Err(ProtocolError::Malformed {
                        offset: start,
                        reason: "chunk without length",
                    });
                }
                (_, Some(-1) | None) => None,
                (_, Some(len)) => Some(len),
            };
            if let Some(len) = payload_len {
                let len = usize::try_from(len).map_err(|_| ProtocolError::InvalidInteger)?;
                let payload_end = header_end
                    .checked_add(len)
                    .ok_or(ProtocolError::InvalidInteger)?;
                if src.len() < payload_end + 2 {
                    return Ok(None);
                }
                if src.byte_at(payload_end) != Some(b'\r') || src.byte_at(payload_end + 1) != Some(b'\n') {
                    return Err(ProtocolError::Malformed {
                        offset: payload_end,
                        reason: "payload not terminated by CRLF",
                    });
                }
                content = (header_end, payload_end);
                end = payload_end + 2;
            }
        }

        Ok(Some(Element {
            marker,
            end,
            count,
            content,
        }))
    }

    fn classify<S: FrameSource + ?Sized>(&mut self, src: &S, element: &Element) -> Result<(), ProtocolError> {
        if !matches!(self.kind, MessageKind::Root | MessageKind::PubSubPending) {
            return Ok(());
        }
        if self.streaming_depth != self.decide_depth {
            return Ok(());
        }
        if self.attr_skip > 0 {
            self.attr_skip = overflow_checked(self.attr_skip.checked_add(children_of(element)? - 1))?;
            return Ok(());
        }
        if element.marker == Marker::Attribute {
            self.attr_skip = overflow_checked(self.attr_skip.checked_add(children_of(element)?))?;
            return Ok(());
        }

        self.kind = match self.kind {
            MessageKind::Root if self.pubsub => match element.marker {
                Marker::Push => MessageKind::PubSubPush,
                Marker::Array => match element.count {
                    Some(n) if n > 0 => MessageKind::PubSubPending,
                    None => {
                        self.decide_depth = self.streaming_depth + 1;
                        MessageKind::PubSubPending
                    }
                    _ => MessageKind::PubSubPush,
                },
                _ => MessageKind::PubSubPush,
            },
            MessageKind::Root => match element.marker {
                Marker::Push => MessageKind::OutOfBand,
                _ => MessageKind::RequestResponse,
            },
            _ => {
                let is_pong = matches!(element.marker, Marker::BulkString | Marker::SimpleString)
                    && content_eq_ignore_case(src, element.content, b"pong");
                if is_pong {
                    MessageKind::PubSubReply
                } else {
                    MessageKind::PubSubPush
                }
            }
        };
        Ok(())
    }

    fn account(&mut self, element: &Element) -> Result<(), ProtocolError> {
        let offset = self.consumed;
        let in_string = self.streaming_depth > 0 && self.level_bit(self.string_levels);

        if in_string {
            return match element.marker {
                Marker::StreamedChunk if element.count == Some(0) => {
                    self.close_level();
                    Ok(())
                }
                Marker::StreamedChunk => Ok(()),
                Marker::StreamTerminator => Err(ProtocolError::UnmatchedTerminator { offset }),
                _ => Err(ProtocolError::Malformed {
                    offset,
                    reason: "non-chunk element inside streamed string",
                }),
            };
        }

        match element.marker {
            Marker::StreamTerminator => {
                if self.streaming_depth == 0 {
                    return Err(ProtocolError::UnmatchedTerminator { offset });
                }
                self.close_level();
                return Ok(());
            }
            Marker::StreamedChunk => {
                return Err(ProtocolError::Malformed {
                    offset,
                    reason: "chunk outside streamed string",
                });
            }
            _ => {}
        }

        let streaming_open = element.count.is_none()
            && (element.marker.is_aggregate() || element.marker == Marker::BulkString);
        if streaming_open {
            return self.open_level(element.marker);
        }
        if element.count.is_none() && element.marker.has_payload() {
            return Err(ProtocolError::Malformed {
                offset,
                reason: "streaming header on unsupported type",
            });
        }

        if self.streaming_depth == 0 {
            self.delta = overflow_checked(self.delta.checked_add(contribution(element)?))?;
        }
        Ok(())
    }

    fn open_level(&mut self, marker: Marker) -> Result<(), ProtocolError> {
        if self.streaming_depth >= self.max_depth {
            return Err(ProtocolError::NestingTooDeep {
                limit: self.max_depth,
            });
        }
        let bit = 1u64 << self.streaming_depth;
        self.string_levels &= !bit;
        self.attribute_levels &= !bit;
        match marker {
            Marker::BulkString => self.string_levels |= bit,
            Marker::Attribute => self.attribute_levels |= bit,
            _ => {}
        }
        self.streaming_depth += 1;
        Ok(())
    }

    fn close_level(&mut self) {
        let attribute = self.level_bit(self.attribute_levels);
        self.streaming_depth -= 1;
        if self.streaming_depth == 0 && !attribute {
            self.delta -= 1;
        }
        if self.kind == MessageKind::PubSubPending && self.streaming_depth < self.decide_depth {
            // Streamed root closed before any element decided it.
            self.kind = MessageKind::PubSubPush;
        }
    }

    /// Tests the bit of the innermost open level.
    #[inline]
    fn level_bit(&self, bits: u64) -> bool {
        bits & (1u64 << (self.streaming_depth - 1)) != 0
    }
}

/// Net delta of one non-streaming element.
fn contribution(element: &Element) -> Result<i64, ProtocolError> {
    match (element.marker, element.count) {
        (Marker::Attribute, Some(n)) if n >= 0 => overflow_checked(n.checked_mul(2)),
        (marker, Some(n)) if marker.is_aggregate() && n >= 0 => {
            overflow_checked(n.checked_mul(marker.children_per_unit())).map(|children| children - 1)
        }
        _ => Ok(-1),
    }
}

/// Direct children announced by one element.
fn children_of(element: &Element) -> Result<i64, ProtocolError> {
    match element.count {
        Some(n) if element.marker.is_aggregate() && n > 0 => {
            overflow_checked(n.checked_mul(element.marker.children_per_unit()))
        }
        _ => Ok(0),
    }
}

/// Counts announced on the wire must not overflow the running totals.
#[inline]
fn overflow_checked(value: Option<i64>) -> Result<i64, ProtocolError> {
    value.ok_or(ProtocolError::InvalidInteger)
}

fn read_count<S: FrameSource + ?Sized>(
    src: &S,
    line: (usize, usize),
    offset: usize,
) -> Result<Option<i64>, ProtocolError> {
    let len = line.1 - line.0;
    if len == 0 || len > MAX_NUMERIC_HEADER {
        return Err(ProtocolError::InvalidInteger);
    }
    let mut buf = [0u8; MAX_NUMERIC_HEADER];
    src.copy_range(line.0, &mut buf[..len]);
    let field = &buf[..len];
    if field == b"?" {
        return Ok(None);
    }
    let value = parse_i64(field)?;
    if value < -1 {
        return Err(ProtocolError::Malformed {
            offset,
            reason: "negative length",
        });
    }
    Ok(Some(value))
}

fn content_eq_ignore_case<S: FrameSource + ?Sized>(src: &S, range: (usize, usize), expected: &[u8]) -> bool {
    if range.1 - range.0 != expected.len() {
        return false;
    }
    let mut buf = [0u8; 8];
    let copied = src.copy_range(range.0, &mut buf[..expected.len()]);
    copied == expected.len() && buf[..copied].eq_ignore_ascii_case(expected)
}

/// Measures one message at the start of `bytes`.
///
/// Returns `Ok(None)` when `bytes` holds only part of a message.
pub fn measure(bytes: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let mut scanner = FrameScanner::new(64, false);
    match scanner.scan(bytes)? {
        ScanProgress::Complete { len, .. } => Ok(Some(len)),
        ScanProgress::Incomplete => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(bytes: &[u8]) -> (usize, MessageKind) {
        let mut scanner = FrameScanner::new(64, false);
        match scanner.scan(bytes).expect("scan") {
            ScanProgress::Complete { len, kind } => (len, kind),
            ScanProgress::Incomplete => panic!("incomplete: {:?}", String::from_utf8_lossy(bytes)),
        }
    }

    fn pubsub_kind(bytes: &[u8]) -> MessageKind {
        let mut scanner = FrameScanner::new(64, true);
        match scanner.scan(bytes).expect("scan") {
            ScanProgress::Complete { kind, .. } => kind,
            ScanProgress::Incomplete => panic!("incomplete"),
        }
    }

    #[test]
    fn array_completes_only_after_all_bytes() {
        let frame = b"*2\r\n:1\r\n:2\r\n";
        assert_eq!(frame.len(), 13);
        for cut in 0..frame.len() {
            assert_eq!(measure(&frame[..cut]), Ok(None), "cut at {cut}");
        }
        assert_eq!(measure(frame), Ok(Some(13)));
    }

    #[test]
    fn scalars() {
        assert_eq!(complete(b"+OK\r\n").0, 5);
        assert_eq!(complete(b"-ERR bad\r\n").0, 10);
        assert_eq!(complete(b"$5\r\nhello\r\n").0, 11);
        assert_eq!(complete(b"$0\r\n\r\n").0, 6);
        assert_eq!(complete(b"$-1\r\n").0, 5);
        assert_eq!(complete(b"*-1\r\n").0, 5);
        assert_eq!(complete(b"_\r\n").0, 3);
        assert_eq!(complete(b",3.14\r\n").0, 7);
        assert_eq!(complete(b"#t\r\n").0, 4);
        assert_eq!(complete(b"(12345678901234567890\r\n").0, 23);
        assert_eq!(complete(b"=7\r\ntxt:abc\r\n").0, 13);
        assert_eq!(complete(b"!3\r\nERR\r\n").0, 9);
    }

    #[test]
    fn stops_at_first_message() {
        let bytes = b"+OK\r\n:1\r\n";
        assert_eq!(measure(bytes), Ok(Some(5)));
        assert_eq!(complete(b"*0\r\n+next\r\n").0, 4);
    }

    #[test]
    fn maps_count_pairs() {
        let frame = b"%2\r\n+a\r\n:1\r\n+b\r\n*1\r\n:2\r\n";
        assert_eq!(complete(frame).0, frame.len());
        assert_eq!(measure(&frame[..frame.len() - 1]), Ok(None));
    }

    #[test]
    fn oversized_counts_are_rejected_not_wrapped() {
        assert_eq!(measure(b"%9223372036854775807\r\n"), Err(ProtocolError::InvalidInteger));
        assert_eq!(measure(b"|9223372036854775807\r\n"), Err(ProtocolError::InvalidInteger));
        assert_eq!(
            measure(b"*9223372036854775807\r\n*9223372036854775807\r\n"),
            Err(ProtocolError::InvalidInteger)
        );
        // Pub/sub classification also sums attribute children.
        let mut scanner = FrameScanner::new(64, true);
        assert_eq!(
            scanner.scan(&b"|9223372036854775807\r\n"[..]),
            Err(ProtocolError::InvalidInteger)
        );
    }

    #[test]
    fn attributes_do_not_count() {
        let frame = b"|1\r\n+ttl\r\n:3\r\n+OK\r\n";
        assert_eq!(complete(frame), (frame.len(), MessageKind::RequestResponse));

        let nested = b"*2\r\n|1\r\n+k\r\n+v\r\n:1\r\n:2\r\n";
        assert_eq!(complete(nested).0, nested.len());
    }

    #[test]
    fn streaming_array_waits_for_terminator() {
        let frame = b"*?\r\n:1\r\n.\r\n";
        assert_eq!(measure(b"*?\r\n:1\r\n"), Ok(None));
        assert_eq!(complete(frame).0, frame.len());
    }

    #[test]
    fn nested_streaming() {
        let frame = b"*?\r\n%?\r\n+a\r\n:1\r\n.\r\n*2\r\n:1\r\n:2\r\n.\r\n";
        assert_eq!(complete(frame).0, frame.len());

        let inside_fixed = b"*2\r\n*?\r\n:1\r\n.\r\n:9\r\n";
        assert_eq!(complete(inside_fixed).0, inside_fixed.len());
    }

    #[test]
    fn streamed_string() {
        let frame = b"$?\r\n;4\r\nHell\r\n;1\r\no\r\n;0\r\n";
        assert_eq!(complete(frame).0, frame.len());
        assert_eq!(measure(&frame[..frame.len() - 5]), Ok(None));
    }

    #[test]
    fn streamed_attribute_then_value() {
        let frame = b"|?\r\n+k\r\n+v\r\n.\r\n:7\r\n";
        assert_eq!(complete(frame).0, frame.len());
    }

    #[test]
    fn push_is_out_of_band() {
        let frame = b">2\r\n+invalidate\r\n*1\r\n$3\r\nkey\r\n";
        assert_eq!(complete(frame), (frame.len(), MessageKind::OutOfBand));
    }

    #[test]
    fn unmatched_terminator_is_fatal() {
        assert!(matches!(
            measure(b".\r\n"),
            Err(ProtocolError::UnmatchedTerminator { offset: 0 })
        ));
        assert!(matches!(
            measure(b"$?\r\n;1\r\na\r\n.\r\n"),
            Err(ProtocolError::UnmatchedTerminator { .. })
        ));
    }

    #[test]
    fn nesting_limit() {
        let mut scanner = FrameScanner::new(2, false);
        let err = scanner.scan(&b"*?\r\n*?\r\n*?\r\n"[..]).unwrap_err();
        assert_eq!(err, ProtocolError::NestingTooDeep { limit: 2 });
    }

    #[test]
    fn malformed_input() {
        assert!(matches!(
            measure(b"?oops\r\n"),
            Err(ProtocolError::UnexpectedMarker { marker: b'?', offset: 0 })
        ));
        assert!(matches!(measure(b"+OK\n"), Err(ProtocolError::Malformed { .. })));
        assert!(matches!(measure(b"$3\r\nabcd\r\n"), Err(ProtocolError::Malformed { .. })));
        assert!(matches!(measure(b"*x\r\n"), Err(ProtocolError::InvalidInteger)));
        assert!(matches!(measure(b"$-5\r\n"), Err(ProtocolError::Malformed { .. })));
    }

    #[test]
    fn resumes_across_calls() {
        let frame = b"*3\r\n$3\r\nfoo\r\n:42\r\n+bar\r\n";
        let mut scanner = FrameScanner::new(64, false);
        let mut progress = ScanProgress::Incomplete;
        for cut in 1..=frame.len() {
            progress = scanner.scan(&frame[..cut]).expect("scan");
            if cut < frame.len() {
                assert_eq!(progress, ScanProgress::Incomplete);
            }
        }
        assert_eq!(
            progress,
            ScanProgress::Complete {
                len: frame.len(),
                kind: MessageKind::RequestResponse
            }
        );
        assert_eq!(scanner.consumed(), 0);
    }

    #[test]
    fn pubsub_classification() {
        assert_eq!(pubsub_kind(b"*2\r\n$4\r\npong\r\n$0\r\n\r\n"), MessageKind::PubSubReply);
        assert_eq!(pubsub_kind(b"*2\r\n+PONG\r\n$0\r\n\r\n"), MessageKind::PubSubReply);
        assert_eq!(
            pubsub_kind(b"*3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$2\r\nhi\r\n"),
            MessageKind::PubSubPush
        );
        assert_eq!(pubsub_kind(b">2\r\n+pong\r\n+x\r\n"), MessageKind::PubSubPush);
        assert_eq!(pubsub_kind(b"+OK\r\n"), MessageKind::PubSubPush);
        assert_eq!(
            pubsub_kind(b"|1\r\n+k\r\n+v\r\n*1\r\n|1\r\n+a\r\n*1\r\n:1\r\n$4\r\npong\r\n"),
            MessageKind::PubSubReply
        );
        assert_eq!(pubsub_kind(b"*?\r\n$4\r\npong\r\n.\r\n"), MessageKind::PubSubReply);
    }
}
