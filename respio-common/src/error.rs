//! # Error Taxonomy
//!
//! Purpose: Classify every failure the engine can surface so callers can tell
//! protocol faults, transport faults, contract misuse, and the non-error
//! cancellation/timeout outcomes apart without string matching.
//!
//! ## Design Principles
//! 1. **Fan-out Friendly**: Connection errors are `Clone` so one fault can fail
//!    every outstanding message (I/O errors are shared through `Arc`).
//! 2. **Fail Fast**: Protocol errors are fatal to the connection and never retried.
//! 3. **Precise Classification**: `FaultKind` is attached to every doomed message.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Malformed or unsupported RESP framing.
///
/// Every variant is fatal for the connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame violated the grammar at `offset` (relative to the frame start).
    #[error("malformed frame at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },
    /// A type marker byte that RESP does not define.
    #[error("unexpected marker {marker:#04x} at byte {offset}")]
    UnexpectedMarker { marker: u8, offset: usize },
    /// A streaming terminator arrived with no open streaming level to close.
    #[error("unmatched streaming terminator at byte {offset}")]
    UnmatchedTerminator { offset: usize },
    /// Streaming aggregates nested deeper than the scanner can track.
    #[error("streaming nesting deeper than {limit}")]
    NestingTooDeep { limit: u8 },
    /// A length or integer field did not contain a valid decimal number.
    #[error("invalid integer field")]
    InvalidInteger,
    /// A reply arrived while no request was outstanding.
    #[error("reply received with no outstanding request")]
    UnsolicitedReply,
}

/// Classification attached to messages failed by a doomed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The server sent bytes the scanner could not frame.
    Protocol,
    /// Reading from or writing to the transport failed.
    Transport,
    /// The server closed the stream.
    Closed,
    /// The connection was disposed locally.
    Disposed,
}

/// Errors raised by connection decorators.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// Another write is in progress on a single-writer connection.
    #[error("concurrent write on a single-writer connection")]
    ConcurrentWrite,
    /// The connection already failed; the original fault kind is preserved.
    #[error("connection is doomed ({0:?})")]
    Doomed(FaultKind),
    /// The read loop could not frame the server's reply.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Network or IO failure while reading/writing.
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),
    /// The request formatter rejected the request; nothing was queued.
    #[error("request formatting failed: {0}")]
    Format(Arc<io::Error>),
    /// The server closed the connection.
    #[error("connection closed by peer")]
    Closed,
    /// The connection (or the batch holding the message) was disposed.
    #[error("connection disposed")]
    Disposed,
    /// A batch was opened on top of another batch.
    #[error("batches cannot be nested")]
    NestedBatch,
    /// Pool is at capacity and no idle connections are available.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Address could not be parsed into a socket address.
    #[error("invalid address")]
    InvalidAddress,
}

impl ConnectionError {
    /// Returns the fault classification for this error.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            ConnectionError::Doomed(kind) => *kind,
            ConnectionError::Protocol(_) | ConnectionError::Format(_) => FaultKind::Protocol,
            ConnectionError::Closed => FaultKind::Closed,
            ConnectionError::Disposed | ConnectionError::NestedBatch => FaultKind::Disposed,
            ConnectionError::ConcurrentWrite
            | ConnectionError::Transport(_)
            | ConnectionError::PoolExhausted
            | ConnectionError::InvalidAddress => FaultKind::Transport,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::Transport(Arc::new(err))
    }
}

/// Outcome errors delivered through a message's completion path.
///
/// `Cancelled` and `TimedOut` are not faults; they share this type so that a
/// single `Result` carries every outcome a waiter can observe.
#[derive(Debug, Clone, Error)]
pub enum MessageError {
    /// The caller cancelled before a result was installed.
    #[error("message cancelled")]
    Cancelled,
    /// A blocking wait timed out before a result was installed.
    #[error("message timed out")]
    TimedOut,
    /// The connection failed while the message was outstanding.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// The response parser rejected the reply.
    #[error("parse error: {0}")]
    Parse(String),
    /// Server returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.0))]
    Server(Vec<u8>),
    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// The message was accessed before it was handed to a transport.
    #[error("message accessed before it was sent")]
    NotSent,
    /// The handle refers to a previous use of a recycled message.
    #[error("stale message token")]
    StaleToken,
    /// A blocking wait was attempted after a continuation was registered.
    #[error("blocking wait after a continuation was registered")]
    WaitAfterContinuation,
}

impl MessageError {
    /// Returns true for the cancellation outcome.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, MessageError::Cancelled)
    }

    /// Returns true for the timeout outcome.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MessageError::TimedOut)
    }
}

impl From<ProtocolError> for MessageError {
    fn from(err: ProtocolError) -> Self {
        MessageError::Connection(ConnectionError::Protocol(err))
    }
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Result type for message outcomes.
pub type MessageResult<T> = Result<T, MessageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_kind_follows_variant() {
        assert_eq!(ConnectionError::Closed.fault_kind(), FaultKind::Closed);
        assert_eq!(ConnectionError::Disposed.fault_kind(), FaultKind::Disposed);
        assert_eq!(
            ConnectionError::Protocol(ProtocolError::InvalidInteger).fault_kind(),
            FaultKind::Protocol
        );
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(ConnectionError::from(io_err).fault_kind(), FaultKind::Transport);
        assert_eq!(
            ConnectionError::Doomed(FaultKind::Protocol).fault_kind(),
            FaultKind::Protocol
        );
    }

    #[test]
    fn outcome_predicates() {
        assert!(MessageError::Cancelled.is_cancellation());
        assert!(!MessageError::Cancelled.is_timeout());
        assert!(MessageError::TimedOut.is_timeout());
        assert!(!MessageError::NotSent.is_cancellation());
    }

    #[test]
    fn server_error_renders_payload() {
        let err = MessageError::Server(b"ERR wrong type".to_vec());
        assert_eq!(err.to_string(), "server error: ERR wrong type");
    }
}
