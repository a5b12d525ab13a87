//! # Batched Connection
//!
//! Purpose: Collect messages without touching the wire, then hand them to the
//! inner connection as one multi-message write on `flush`.
//!
//! ## Design Principles
//! 1. **Own Outbound Block**: Batched requests are serialized into a private
//!    block buffer, so they pack contiguously and flush as one vectored write
//!    of their chunks.
//! 2. **No Silent Loss**: Disposing or dropping an unflushed batch fails every
//!    queued message with `Disposed`.
//! 3. **Flat Nesting**: Wrapping a batch in another batch is rejected.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use respio_common::{ConnectionError, ConnectionResult};
use respio_engine::{BlockBuffer, BlockChunk, EngineContext, MessagePool, PendingOperation, RequestFormatter};
use tracing::debug;

use super::{fail_all, Connection};

/// Buffers messages until an explicit flush.
pub struct Batch<C: Connection> {
    inner: C,
    outbound: Mutex<BlockBuffer>,
    queued: Mutex<Vec<PendingOperation>>,
}

impl<C: Connection> Batch<C> {
    /// Starts a batch over `inner`; fails with `NestedBatch` if `inner` is a batch.
    pub fn new(inner: C) -> ConnectionResult<Self> {
        if inner.is_batch() {
            return Err(ConnectionError::NestedBatch);
        }
        let outbound = inner.context().block_buffer();
        Ok(Batch {
            inner,
            outbound: Mutex::new(outbound),
            queued: Mutex::new(Vec::new()),
        })
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Messages waiting for the next flush.
    pub fn len(&self) -> usize {
        self.queued.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.lock().is_empty()
    }

    /// Sends every queued message as one write.
    pub fn flush(&self) -> ConnectionResult<()> {
        let ops = self.take_queued();
        if ops.is_empty() {
            return Ok(());
        }
        debug!(messages = ops.len(), "flushing batch");
        self.inner.send_many(ops)
    }

    /// Awaitable form of [`Batch::flush`].
    pub async fn flush_async(&self) -> ConnectionResult<()> {
        let ops = self.take_queued();
        if ops.is_empty() {
            return Ok(());
        }
        debug!(messages = ops.len(), "flushing batch");
        self.inner.send_async(ops).await
    }

    fn take_queued(&self) -> Vec<PendingOperation> {
        std::mem::take(&mut *self.queued.lock())
    }

    fn discard_queued(&self) -> usize {
        let ops = self.take_queued();
        fail_all(&ops, &ConnectionError::Disposed);
        ops.len()
    }
}

impl<C: Connection> Connection for Batch<C> {
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
        self.outbound
            .lock()
            .serialize(command, request, formatter)
            .map_err(|err| ConnectionError::Format(Arc::new(err)))
    }

    /// Queues without transmitting.
    fn send_many(&self, ops: Vec<PendingOperation>) -> ConnectionResult<()> {
        self.queued.lock().extend(ops);
        Ok(())
    }

    fn send_async(&self, ops: Vec<PendingOperation>) -> impl Future<Output = ConnectionResult<()>> + Send {
        std::future::ready(self.send_many(ops))
    }

    fn is_usable(&self) -> bool {
        self.inner.is_usable()
    }

    /// Fails queued messages; the inner connection is left open.
    fn dispose(&self) {
        let failed = self.discard_queued();
        if failed > 0 {
            debug!(failed, "batch disposed without flush");
        }
    }

    fn is_batch(&self) -> bool {
        true
    }
}

impl<C: Connection> Drop for Batch<C> {
    fn drop(&mut self) {
        let failed = self.discard_queued();
        if failed > 0 {
            debug!(failed, "batch dropped without flush");
        }
    }
}
