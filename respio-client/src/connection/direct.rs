//! # Direct Connection
//!
//! Purpose: Own one duplex stream: a dedicated read loop frames replies and
//! completes the oldest outstanding message, while a single-slot writer flag
//! guards synchronous writes.
//!
//! ## Design Principles
//! 1. **Single Reader**: Exactly one thread runs the read loop; replies
//!    complete in the order their requests were written (strict FIFO).
//! 2. **Enqueue Before Write**: A message joins the pending queue before its
//!    bytes hit the wire, so a fast reply always finds its waiter.
//! 3. **Doom Once**: The first fault is recorded and fails every outstanding
//!    message; later sends fail immediately with the same classification.
//!
//! ## State Machine
//!
//! ```text
//! writer: Available --send--> Taken --ok--> Available
//!                               \--err--> Doomed   (also set by read-loop faults)
//! reader: Active --fault--> Failed
//!             \--dispose--> Completed
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::io::{self, IoSlice, Read, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use respio_common::{ConnectionError, ConnectionResult, FaultKind, ProtocolError};
use respio_engine::{
    BlockBuffer, BlockChunk, EngineContext, FrameScanner, MessageKind, MessagePool, PendingOperation,
    RequestFormatter, ScanProgress, SegmentedReadBuffer,
};
use tracing::{debug, trace, warn};

use super::{fail_all, Connection};
use crate::transport::Duplex;

const WRITER_AVAILABLE: u8 = 0;
const WRITER_TAKEN: u8 = 1;
const WRITER_DOOMED: u8 = 2;

const READER_ACTIVE: u8 = 0;
const READER_FAILED: u8 = 1;
const READER_COMPLETED: u8 = 2;

/// Receives frames that do not answer a request (RESP3 pushes, pub/sub messages).
pub type OutOfBandHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Read-loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Active,
    Failed,
    Completed,
}

/// Options for a direct connection.
#[derive(Clone, Default)]
pub struct DirectOptions {
    /// Classify replies with pub/sub rules.
    pub pubsub: bool,
    /// Handler for out-of-band frames; they are dropped when absent.
    pub out_of_band: Option<OutOfBandHandler>,
}

struct DirectShared {
    context: EngineContext,
    messages: MessagePool,
    writer_state: AtomicU8,
    reader_state: AtomicU8,
    writer: Mutex<Box<dyn Duplex>>,
    control: Box<dyn Duplex>,
    outbound: Mutex<BlockBuffer>,
    pending: Mutex<VecDeque<PendingOperation>>,
    fault: Mutex<Option<ConnectionError>>,
    options: DirectOptions,
}

/// Connection that owns one stream and its read loop.
pub struct DirectConnection {
    shared: Arc<DirectShared>,
    read_loop: Mutex<Option<JoinHandle<()>>>,
}

impl DirectConnection {
    /// Wraps `stream` and starts its read loop.
    pub fn new<S: Duplex>(stream: S, context: EngineContext, options: DirectOptions) -> ConnectionResult<Self> {
        let reader = stream.try_clone_duplex()?;
        let control = stream.try_clone_duplex()?;
        let shared = Arc::new(DirectShared {
            messages: context.message_pool(),
            outbound: Mutex::new(context.block_buffer()),
            context,
            writer_state: AtomicU8::new(WRITER_AVAILABLE),
            reader_state: AtomicU8::new(READER_ACTIVE),
            writer: Mutex::new(Box::new(stream)),
            control,
            pending: Mutex::new(VecDeque::new()),
            fault: Mutex::new(None),
            options,
        });

        let loop_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("respio-reader".to_string())
            .spawn(move || loop_shared.read_loop(reader))?;

        Ok(DirectConnection {
            shared,
            read_loop: Mutex::new(Some(handle)),
        })
    }

    /// Messages written and still awaiting a reply.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// The fault that doomed this connection, if any.
    pub fn fault(&self) -> Option<ConnectionError> {
        self.shared.fault.lock().clone()
    }

    pub fn reader_state(&self) -> ReaderState {
        match self.shared.reader_state.load(Ordering::Acquire) {
            READER_ACTIVE => ReaderState::Active,
            READER_FAILED => ReaderState::Failed,
            _ => ReaderState::Completed,
        }
    }

    /// Disposes the connection and waits for the read loop to exit.
    pub fn close(&self) {
        self.dispose();
        if let Some(handle) = self.read_loop.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Connection for DirectConnection {
    fn context(&self) -> &EngineContext {
        &self.shared.context
    }

    fn messages(&self) -> &MessagePool {
        &self.shared.messages
    }

    fn serialize<R, F>(&self, command: &str, request: &R, formatter: &F) -> ConnectionResult<BlockChunk>
    where
        R: ?Sized,
        F: RequestFormatter<R> + ?Sized,
    {
        self.shared
            .outbound
            .lock()
            .serialize(command, request, formatter)
            .map_err(|err| ConnectionError::Format(Arc::new(err)))
    }

    fn send_many(&self, ops: Vec<PendingOperation>) -> ConnectionResult<()> {
        self.shared.send_many(ops)
    }

    fn send_async(&self, ops: Vec<PendingOperation>) -> impl Future<Output = ConnectionResult<()>> + Send {
        // Socket writes are blocking and short; there is nothing to await.
        std::future::ready(self.shared.send_many(ops))
    }

    fn is_usable(&self) -> bool {
        self.shared.writer_state.load(Ordering::Acquire) != WRITER_DOOMED
    }

    fn dispose(&self) {
        self.shared.doom(ConnectionError::Disposed);
    }
}

impl Drop for DirectConnection {
    fn drop(&mut self) {
        // The read loop exits on its own once the stream is shut down.
        self.shared.doom(ConnectionError::Disposed);
    }
}

impl DirectShared {
    fn acquire_writer(&self) -> ConnectionResult<()> {
        match self.writer_state.compare_exchange(
            WRITER_AVAILABLE,
            WRITER_TAKEN,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(WRITER_TAKEN) => Err(ConnectionError::ConcurrentWrite),
            Err(_) => Err(ConnectionError::Doomed(self.fault_kind())),
        }
    }

    fn release_writer(&self) {
        let released = self
            .writer_state
            .compare_exchange(WRITER_TAKEN, WRITER_AVAILABLE, Ordering::Release, Ordering::Relaxed)
            .is_ok();
        if !released {
            // Doomed while writing: anything queued after the doom drain still waits.
            self.drain_pending();
        }
    }

    fn fault_kind(&self) -> FaultKind {
        self.fault
            .lock()
            .as_ref()
            .map_or(FaultKind::Disposed, ConnectionError::fault_kind)
    }

    fn send_many(&self, ops: Vec<PendingOperation>) -> ConnectionResult<()> {
        if let Err(err) = self.acquire_writer() {
            fail_all(&ops, &err);
            return Err(err);
        }

        let mut chunks = Vec::with_capacity(ops.len());
        {
            let mut pending = self.pending.lock();
            for op in ops {
                // Decided messages (cancelled before transmit) are skipped.
                if let Ok(Some(chunk)) = op.begin_transmit() {
                    chunks.push(chunk);
                    pending.push_back(op);
                }
            }
        }

        let written = {
            let mut writer = self.writer.lock();
            write_chunks(&mut **writer, &chunks).and_then(|()| writer.flush())
        };
        // Request payloads are released as soon as they are on the wire.
        drop(chunks);

        match written {
            Ok(()) => {
                self.release_writer();
                Ok(())
            }
            Err(err) => {
                let err = ConnectionError::from(err);
                self.doom(err.clone());
                self.release_writer();
                Err(err)
            }
        }
    }

    fn doom(&self, err: ConnectionError) {
        let first = {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                *fault = Some(err.clone());
                true
            } else {
                false
            }
        };
        self.writer_state.store(WRITER_DOOMED, Ordering::Release);
        if !first {
            self.drain_pending();
            return;
        }

        let _ = self.control.shutdown_duplex();
        let failed = self.drain_pending();
        match err {
            ConnectionError::Disposed => debug!(failed, "connection disposed"),
            _ => warn!(fault = ?err.fault_kind(), error = %err, failed, "connection doomed"),
        }
    }

    /// Fails every pending message with the recorded fault.
    fn drain_pending(&self) -> usize {
        let drained: Vec<PendingOperation> = self.pending.lock().drain(..).collect();
        if drained.is_empty() {
            return 0;
        }
        let err = self
            .fault
            .lock()
            .clone()
            .unwrap_or(ConnectionError::Disposed);
        fail_all(&drained, &err);
        drained.len()
    }

    fn read_loop(self: Arc<Self>, mut reader: Box<dyn Duplex>) {
        debug!(pubsub = self.options.pubsub, "read loop started");
        let mut buffer = self.context.read_buffer();
        let mut scanner = self.context.scanner(self.options.pubsub);
        let mut scratch = Vec::new();

        let outcome = loop {
            if self.writer_state.load(Ordering::Acquire) == WRITER_DOOMED {
                break Ok(());
            }
            let span = buffer.get_writable(0);
            match reader.read(span) {
                Ok(0) => break Err(ConnectionError::Closed),
                Ok(read) => buffer.commit(read),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(err) if is_peer_close(err.kind()) => break Err(ConnectionError::Closed),
                Err(err) => break Err(ConnectionError::from(err)),
            }
            if let Err(err) = self.drain_frames(&mut buffer, &mut scanner, &mut scratch) {
                break Err(ConnectionError::Protocol(err));
            }
        };

        let already_doomed = self.fault.lock().is_some();
        match outcome {
            Err(err) if !already_doomed => {
                self.reader_state.store(READER_FAILED, Ordering::Release);
                self.doom(err);
            }
            _ => self.reader_state.store(READER_COMPLETED, Ordering::Release),
        }
        debug!("read loop stopped");
    }

    fn drain_frames(
        &self,
        buffer: &mut SegmentedReadBuffer,
        scanner: &mut FrameScanner,
        scratch: &mut Vec<u8>,
    ) -> Result<(), ProtocolError> {
        while !buffer.is_empty() {
            let view = buffer.get_committed();
            let (len, kind) = match scanner.scan(&view)? {
                ScanProgress::Incomplete => return Ok(()),
                ScanProgress::Complete { len, kind } => (len, kind),
            };
            let frame = match view.prefix(len) {
                Some(frame) => frame,
                None => {
                    scratch.clear();
                    view.extend_prefix(len, scratch);
                    &scratch[..]
                }
            };
            self.dispatch(frame, kind)?;
            buffer.discard(len);
        }
        Ok(())
    }

    fn dispatch(&self, frame: &[u8], kind: MessageKind) -> Result<(), ProtocolError> {
        if kind.is_out_of_band() {
            match self.options.out_of_band.as_ref() {
                Some(handler) => handler(frame),
                None => trace!(len = frame.len(), ?kind, "dropping out-of-band frame"),
            }
            return Ok(());
        }
        let op = self.pending.lock().pop_front();
        match op {
            Some(op) => {
                op.complete_with_frame(frame, self.context.workers());
                Ok(())
            }
            None => Err(ProtocolError::UnsolicitedReply),
        }
    }
}

/// Writes every chunk with vectored writes.
/// Read errors that mean the peer went away rather than a transport fault.
fn is_peer_close(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::UnexpectedEof
    )
}

fn write_chunks(writer: &mut dyn Duplex, chunks: &[BlockChunk]) -> io::Result<()> {
    let mut slices: Vec<IoSlice<'_>> = chunks
        .iter()
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| IoSlice::new(chunk))
        .collect();
    let mut remaining = &mut slices[..];
    while !remaining.is_empty() {
        match writer.write_vectored(remaining) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(written) => IoSlice::advance_slices(&mut remaining, written),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::BufReader;
    use std::time::Duration;

    use respio_common::MessageError;

    use super::*;
    use crate::resp::{ArgsFormatter, RespValue, ValueParser};
    use crate::test_support::{direct_pair, read_command};

    fn execute(conn: &DirectConnection, command: &str) -> respio_engine::PendingReply<RespValue> {
        let parser = Arc::new(ValueParser);
        let args: [&[u8]; 0] = [];
        conn.execute(command, &args[..], &ArgsFormatter, &parser).expect("execute")
    }

    #[test]
    fn replies_complete_in_write_order() {
        let (conn, mut server) = direct_pair(DirectOptions::default());
        let first = execute(&conn, "PING");
        let second = execute(&conn, "ECHO");

        let mut reader = BufReader::new(server.try_clone().expect("clone"));
        assert_eq!(read_command(&mut reader).expect("first"), vec![b"PING".to_vec()]);
        assert_eq!(read_command(&mut reader).expect("second"), vec![b"ECHO".to_vec()]);
        server.write_all(b"+first\r\n$6\r\nsecond\r\n").expect("reply");

        let timeout = Some(Duration::from_secs(5));
        assert_eq!(first.wait(timeout).expect("first"), RespValue::Simple(b"first".to_vec()));
        assert_eq!(
            second.wait(timeout).expect("second"),
            RespValue::Bulk(Some(b"second".to_vec()))
        );
        assert_eq!(conn.pending_len(), 0);
    }

    #[test]
    fn reply_split_across_reads_completes_once_whole() {
        let (conn, mut server) = direct_pair(DirectOptions::default());
        let reply = execute(&conn, "GET");
        server.write_all(b"$11\r\nhello").expect("head");
        thread::sleep(Duration::from_millis(20));
        server.write_all(b" world\r\n").expect("tail");
        assert_eq!(
            reply.wait(Some(Duration::from_secs(5))).expect("reply"),
            RespValue::Bulk(Some(b"hello world".to_vec()))
        );
    }

    #[test]
    fn peer_close_dooms_outstanding_and_future_sends() {
        let (conn, server) = direct_pair(DirectOptions::default());
        let reply = execute(&conn, "GET");
        drop(server);

        let err = reply.wait(Some(Duration::from_secs(5))).unwrap_err();
        assert!(matches!(err, MessageError::Connection(ConnectionError::Closed)));
        assert!(!conn.is_usable());
        assert_eq!(conn.reader_state(), ReaderState::Failed);

        let parser = Arc::new(ValueParser);
        let args: [&[u8]; 0] = [];
        let err = conn.execute("PING", &args[..], &ArgsFormatter, &parser).err().expect("doomed");
        assert!(matches!(err, ConnectionError::Doomed(FaultKind::Closed)));
    }

    #[test]
    fn drained_then_closed_peer_is_classified_as_closed() {
        let (conn, server) = direct_pair(DirectOptions::default());
        let reply = execute(&conn, "GET");
        let mut reader = BufReader::new(server.try_clone().expect("clone"));
        assert_eq!(read_command(&mut reader).expect("request"), vec![b"GET".to_vec()]);
        server.shutdown(std::net::Shutdown::Both).expect("shutdown");

        let err = reply.wait(Some(Duration::from_secs(5))).unwrap_err();
        assert!(matches!(err, MessageError::Connection(ConnectionError::Closed)));
        assert!(matches!(conn.fault(), Some(ConnectionError::Closed)));
    }

    #[test]
    fn reset_style_read_errors_mean_peer_closed() {
        assert!(is_peer_close(io::ErrorKind::ConnectionReset));
        assert!(is_peer_close(io::ErrorKind::ConnectionAborted));
        assert!(is_peer_close(io::ErrorKind::UnexpectedEof));
        assert!(!is_peer_close(io::ErrorKind::PermissionDenied));
    }

    #[test]
    fn protocol_error_is_fatal() {
        let (conn, mut server) = direct_pair(DirectOptions::default());
        let reply = execute(&conn, "GET");
        server.write_all(b"?garbage\r\n").expect("write");
        let err = reply.wait(Some(Duration::from_secs(5))).unwrap_err();
        assert!(matches!(
            err,
            MessageError::Connection(ConnectionError::Protocol(ProtocolError::UnexpectedMarker { .. }))
        ));
        assert_eq!(conn.fault().map(|f| f.fault_kind()), Some(FaultKind::Protocol));
    }

    #[test]
    fn out_of_band_frames_skip_pending_queue() {
        let (tx, rx) = std::sync::mpsc::channel::<Vec<u8>>();
        let tx = Mutex::new(tx);
        let handler: OutOfBandHandler = Arc::new(move |frame: &[u8]| {
            let _ = tx.lock().send(frame.to_vec());
        });
        let (conn, mut server) = direct_pair(DirectOptions {
            pubsub: false,
            out_of_band: Some(handler),
        });
        let reply = execute(&conn, "GET");
        server
            .write_all(b">2\r\n+invalidate\r\n+key\r\n:7\r\n")
            .expect("write");

        assert_eq!(reply.wait(Some(Duration::from_secs(5))).expect("reply"), RespValue::Integer(7));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).expect("push"),
            b">2\r\n+invalidate\r\n+key\r\n"
        );
    }

    #[test]
    fn unsolicited_reply_dooms_connection() {
        let (conn, mut server) = direct_pair(DirectOptions::default());
        server.write_all(b"+surprise\r\n").expect("write");
        for _ in 0..500 {
            if !conn.is_usable() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(
            conn.fault(),
            Some(ConnectionError::Protocol(ProtocolError::UnsolicitedReply))
        ));
    }

    #[test]
    fn cancelled_before_send_is_skipped() {
        let (conn, mut server) = direct_pair(DirectOptions::default());
        let parser = Arc::new(ValueParser);
        let args: [&[u8]; 0] = [];
        let (skipped, skipped_reply) = conn.begin("GET", &args[..], &ArgsFormatter, &parser).expect("begin");
        let (kept, kept_reply) = conn.begin("PING", &args[..], &ArgsFormatter, &parser).expect("begin");
        assert!(skipped_reply.cancel());
        conn.send_many(vec![skipped, kept]).expect("send");
        assert_eq!(conn.pending_len(), 1);

        let mut reader = BufReader::new(server.try_clone().expect("clone"));
        assert_eq!(read_command(&mut reader).expect("request"), vec![b"PING".to_vec()]);
        server.write_all(b"+PONG\r\n").expect("reply");
        assert_eq!(
            kept_reply.wait(Some(Duration::from_secs(5))).expect("reply"),
            RespValue::Simple(b"PONG".to_vec())
        );
    }

    #[test]
    fn dispose_fails_pending_and_stops_reader() {
        let (conn, _server) = direct_pair(DirectOptions::default());
        let reply = execute(&conn, "BLPOP");
        conn.close();
        let err = reply.wait(Some(Duration::from_secs(5))).unwrap_err();
        assert!(matches!(err, MessageError::Connection(ConnectionError::Disposed)));
        assert_eq!(conn.reader_state(), ReaderState::Completed);
    }
}
