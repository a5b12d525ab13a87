//! # Connection Layering
//!
//! Purpose: Define the one contract every connection decorator shares, so
//! direct, pipelined, batched, and pooled connections compose freely.
//!
//! ## Design Principles
//! 1. **Decorator Pattern**: Each layer wraps another `Connection` and adds a
//!    single guarantee (write ordering, batching, reuse).
//! 2. **Serialize, Then Send**: Requests are formatted into pooled blocks
//!    before the write path is entered, keeping critical sections short.
//! 3. **Fail Queued Work**: A layer that cannot transmit fails the messages
//!    it was handed instead of dropping them silently.
//!
//! ## Composition
//!
//! ```text
//! PooledConnection -> PipelinedConnection -> DirectConnection -> Duplex
//!        Batch -------^  (any layer may be batched, but not twice)
//! ```

use std::future::Future;
use std::sync::Arc;

use respio_common::{ConnectionError, ConnectionResult};
use respio_engine::{
    BlockChunk, EngineContext, MessagePool, PendingOperation, PendingReply, RequestFormatter,
    ResponseParser,
};

mod batched;
mod direct;
mod pipelined;
mod pool;

pub use batched::Batch;
pub use direct::{DirectConnection, DirectOptions, OutOfBandHandler, ReaderState};
pub use pipelined::PipelinedConnection;
pub use pool::{ConnectionFactory, ConnectionPool, PooledConnection, TcpConnector};

/// Contract shared by every connection layer.
pub trait Connection: Send + Sync {
    /// Pools and workers this connection draws on.
    fn context(&self) -> &EngineContext;

    /// Free list the connection's messages are drawn from.
    fn messages(&self) -> &MessagePool;

    /// Formats one request into an outbound chunk.
    fn serialize<R, F>(&self, command: &str, request: &R, formatter: &F) -> ConnectionResult<BlockChunk>
    where
        R: ?Sized,
        F: RequestFormatter<R> + ?Sized;

    /// Transmits one message.
    fn send(&self, op: PendingOperation) -> ConnectionResult<()> {
        self.send_many(vec![op])
    }

    /// Transmits messages in order as one write.
    ///
    /// On error every message handed in has already been failed.
    fn send_many(&self, ops: Vec<PendingOperation>) -> ConnectionResult<()>;

    /// Awaitable form of `send_many`.
    fn send_async(&self, ops: Vec<PendingOperation>) -> impl Future<Output = ConnectionResult<()>> + Send;

    /// Returns false once the connection can no longer carry requests.
    fn is_usable(&self) -> bool;

    /// Fails outstanding work and closes the connection.
    fn dispose(&self);

    /// Returns true for batching layers.
    fn is_batch(&self) -> bool {
        false
    }

    /// Serializes one request into a message that has not been sent yet.
    fn begin<R, F, P>(
        &self,
        command: &str,
        request: &R,
        formatter: &F,
        parser: &Arc<P>,
    ) -> ConnectionResult<(PendingOperation, PendingReply<P::Output>)>
    where
        R: ?Sized,
        F: RequestFormatter<R> + ?Sized,
        P: ResponseParser,
    {
        let chunk = self.serialize(command, request, formatter)?;
        Ok(self.messages().begin(command, chunk, Arc::clone(parser)))
    }

    /// Serializes, sends, and returns the reply handle for one request.
    fn execute<R, F, P>(
        &self,
        command: &str,
        request: &R,
        formatter: &F,
        parser: &Arc<P>,
    ) -> ConnectionResult<PendingReply<P::Output>>
    where
        R: ?Sized,
        F: RequestFormatter<R> + ?Sized,
        P: ResponseParser,
    {
        let (op, reply) = self.begin(command, request, formatter, parser)?;
        self.send(op)?;
        Ok(reply)
    }
}

/// Awaitable form of [`Connection::execute`].
pub async fn execute_async<C, R, F, P>(
    conn: &C,
    command: &str,
    request: &R,
    formatter: &F,
    parser: &Arc<P>,
) -> ConnectionResult<PendingReply<P::Output>>
where
    C: Connection,
    R: ?Sized,
    F: RequestFormatter<R> + ?Sized,
    P: ResponseParser,
{
    let (op, reply) = conn.begin(command, request, formatter, parser)?;
    conn.send_async(vec![op]).await?;
    Ok(reply)
}

impl<C: Connection> Connection for &C {
    fn context(&self) -> &EngineContext {
        (**self).context()
    }

    fn messages(&self) -> &MessagePool {
        (**self).messages()
    }

    fn serialize<R, F>(&self, command: &str, request: &R, formatter: &F) -> ConnectionResult<BlockChunk>
    where
        R: ?Sized,
        F: RequestFormatter<R> + ?Sized,
    {
        (**self).serialize(command, request, formatter)
    }

    fn send_many(&self, ops: Vec<PendingOperation>) -> ConnectionResult<()> {
        (**self).send_many(ops)
    }

    fn send_async(&self, ops: Vec<PendingOperation>) -> impl Future<Output = ConnectionResult<()>> + Send {
        (**self).send_async(ops)
    }

    fn is_usable(&self) -> bool {
        (**self).is_usable()
    }

    fn dispose(&self) {
        (**self).dispose()
    }

    fn is_batch(&self) -> bool {
        (**self).is_batch()
    }
}

/// Fails every message with `err`.
pub(crate) fn fail_all(ops: &[PendingOperation], err: &ConnectionError) {
    for op in ops {
        op.fail(err.clone().into());
    }
}
