//! # Pipelined Connection
//!
//! Purpose: Let independent callers share one single-writer connection by
//! funnelling their sends through a one-slot lock, so each call's messages
//! reach the wire contiguously and in the order the slot was granted.
//!
//! ## Design Principles
//! 1. **Fast Path First**: An uncontended send takes the slot with `try_lock`
//!    and never registers a waiter.
//! 2. **Same Slot, Two Worlds**: Blocking and async senders queue on the same
//!    `tokio::sync::Mutex`, so mixing them cannot interleave writes.

use std::future::Future;

use respio_common::{ConnectionError, ConnectionResult};
use respio_engine::{BlockChunk, EngineContext, MessagePool, PendingOperation, RequestFormatter};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Mutex;
use tokio::task::block_in_place;

use super::{fail_all, Connection};

/// Serializes concurrent sends onto an inner connection.
pub struct PipelinedConnection<C> {
    inner: C,
    slot: Mutex<()>,
}

impl<C: Connection> PipelinedConnection<C> {
    pub fn new(inner: C) -> Self {
        PipelinedConnection {
            inner,
            slot: Mutex::new(()),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: Connection> Connection for PipelinedConnection<C> {
    fn context(&self) -> &EngineContext {
        self.inner.context()
    }

    fn messages(&self) -> &MessagePool {
        self.inner.messages()
    }

    fn serialize<R, F>(&self, command: &str, request: &R, formatter: &F) -> ConnectionResult<BlockChunk>
    where
        R: ?Sized,
        F: RequestFormatter<R> + ?Sized,
    {
        self.inner.serialize(command, request, formatter)
    }

    /// Blocks until the slot is free.
    ///
    /// Inside a multi-thread runtime the wait moves off the worker with
    /// `block_in_place`. A current-thread runtime cannot block without
    /// stalling the slot holder, so a contended send there fails with
    /// `ConcurrentWrite`; async code should prefer `send_async`.
    fn send_many(&self, ops: Vec<PendingOperation>) -> ConnectionResult<()> {
        let _slot = match self.slot.try_lock() {
            Ok(guard) => guard,
            Err(_) => match Handle::try_current().map(|handle| handle.runtime_flavor()) {
                Ok(RuntimeFlavor::MultiThread) => block_in_place(|| self.slot.blocking_lock()),
                Ok(_) => {
                    fail_all(&ops, &ConnectionError::ConcurrentWrite);
                    return Err(ConnectionError::ConcurrentWrite);
                }
                Err(_) => self.slot.blocking_lock(),
            },
        };
        self.inner.send_many(ops)
    }

    fn send_async(&self, ops: Vec<PendingOperation>) -> impl Future<Output = ConnectionResult<()>> + Send {
        async move {
            let _slot = match self.slot.try_lock() {
                Ok(guard) => guard,
                Err(_) => self.slot.lock().await,
            };
            self.inner.send_async(ops).await
        }
    }

    fn is_usable(&self) -> bool {
        self.inner.is_usable()
    }

    fn dispose(&self) {
        self.inner.dispose()
    }

    fn is_batch(&self) -> bool {
        self.inner.is_batch()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::connection::{execute_async, DirectConnection, DirectOptions};
    use crate::resp::{ArgsFormatter, RespValue, ValueParser};
    use crate::test_support::{direct_pair, echo_peer};

    fn pipelined() -> (Arc<PipelinedConnection<DirectConnection>>, std::os::unix::net::UnixStream) {
        let (direct, server) = direct_pair(DirectOptions::default());
        (Arc::new(PipelinedConnection::new(direct)), server)
    }

    #[test]
    fn concurrent_callers_each_get_their_own_reply() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 25;
        let (conn, server) = pipelined();
        let peer = echo_peer(server, THREADS * PER_THREAD);

        let workers: Vec<_> = (0..THREADS)
            .map(|thread_id| {
                let conn = Arc::clone(&conn);
                thread::spawn(move || {
                    let parser = Arc::new(ValueParser);
                    for seq in 0..PER_THREAD {
                        let tag = format!("{thread_id}-{seq}");
                        let args: [&[u8]; 1] = [tag.as_bytes()];
                        let reply = conn
                            .execute("ECHO", &args[..], &ArgsFormatter, &parser)
                            .expect("execute");
                        assert_eq!(
                            reply.wait(Some(Duration::from_secs(5))).expect("reply"),
                            RespValue::Bulk(Some(tag.into_bytes()))
                        );
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker");
        }
        assert_eq!(peer.join().expect("peer").len(), THREADS * PER_THREAD);
    }

    #[test]
    fn batch_of_messages_stays_contiguous_on_the_wire() {
        let (conn, server) = pipelined();
        let peer = echo_peer(server, 3);
        let parser = Arc::new(ValueParser);

        let mut ops = Vec::new();
        let mut replies = Vec::new();
        for tag in ["a", "b", "c"] {
            let args: [&[u8]; 1] = [tag.as_bytes()];
            let (op, reply) = conn.begin("ECHO", &args[..], &ArgsFormatter, &parser).expect("begin");
            ops.push(op);
            replies.push(reply);
        }
        conn.send_many(ops).expect("send");

        let values: Vec<_> = replies
            .into_iter()
            .map(|reply| reply.wait(Some(Duration::from_secs(5))).expect("reply"))
            .collect();
        assert_eq!(
            values,
            vec![
                RespValue::Bulk(Some(b"a".to_vec())),
                RespValue::Bulk(Some(b"b".to_vec())),
                RespValue::Bulk(Some(b"c".to_vec())),
            ]
        );
        assert_eq!(peer.join().expect("peer"), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_senders_share_the_slot() {
        let (conn, server) = pipelined();
        let peer = echo_peer(server, 16);
        let parser = Arc::new(ValueParser);

        let tasks: Vec<_> = (0..16)
            .map(|idx| {
                let conn = Arc::clone(&conn);
                let parser = Arc::clone(&parser);
                tokio::spawn(async move {
                    let tag = idx.to_string();
                    let args: [&[u8]; 1] = [tag.as_bytes()];
                    let reply = execute_async(&*conn, "ECHO", &args[..], &ArgsFormatter, &parser)
                        .await
                        .expect("execute");
                    assert_eq!(reply.await.expect("reply"), RespValue::Bulk(Some(tag.into_bytes())));
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("task");
        }
        assert_eq!(peer.join().expect("peer").len(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_send_inside_multi_thread_runtime_waits_for_slot() {
        let (conn, server) = pipelined();
        let peer = echo_peer(server, 1);
        let held = conn.slot.lock().await;

        let sender = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let parser = Arc::new(ValueParser);
                let args: [&[u8]; 1] = [b"later"];
                conn.execute("ECHO", &args[..], &ArgsFormatter, &parser).expect("execute")
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sender.is_finished());
        drop(held);

        let reply = sender.await.expect("sender");
        assert_eq!(reply.await.expect("reply"), RespValue::Bulk(Some(b"later".to_vec())));
        assert_eq!(peer.join().expect("peer"), vec![b"later".to_vec()]);
    }

    #[tokio::test]
    async fn contended_blocking_send_on_current_thread_runtime_fails_fast() {
        let (conn, _server) = pipelined();
        let _held = conn.slot.lock().await;

        let parser = Arc::new(ValueParser);
        let args: [&[u8]; 0] = [];
        let (op, reply) = conn.begin("PING", &args[..], &ArgsFormatter, &parser).expect("begin");
        assert!(matches!(conn.send_many(vec![op]), Err(ConnectionError::ConcurrentWrite)));
        assert!(matches!(
            reply.await,
            Err(respio_common::MessageError::Connection(ConnectionError::ConcurrentWrite))
        ));
        assert_eq!(conn.inner().pending_len(), 0);
    }
}
