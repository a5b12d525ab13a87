//! # Connection Pool
//!
//! Purpose: Reuse live connections to avoid repeated handshakes and read-loop
//! start-up.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded ready queue of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections.
//! 3. **Fail Fast**: Exceeding the pool limit returns an error immediately.
//! 4. **Check Health On Return**: A connection that is no longer usable is
//!    disposed instead of being queued.

use std::collections::VecDeque;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use respio_common::{ClientConfig, ConnectionError, ConnectionResult};
use respio_engine::{BlockChunk, EngineContext, MessagePool, PendingOperation, RequestFormatter};
use tracing::debug;

use super::{Connection, DirectConnection, DirectOptions, OutOfBandHandler, PipelinedConnection};
use crate::transport::connect_tcp;

/// Opens new connections for a pool.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(&self) -> ConnectionResult<Self::Connection>;
}

/// Opens pipelined TCP connections from a client configuration.
pub struct TcpConnector {
    config: ClientConfig,
    context: EngineContext,
    out_of_band: Option<OutOfBandHandler>,
}

impl TcpConnector {
    pub fn new(config: ClientConfig, context: EngineContext) -> Self {
        TcpConnector {
            config,
            context,
            out_of_band: None,
        }
    }

    /// Routes out-of-band frames of every new connection to `handler`.
    pub fn with_out_of_band(mut self, handler: OutOfBandHandler) -> Self {
        self.out_of_band = Some(handler);
        self
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }
}

impl ConnectionFactory for TcpConnector {
    type Connection = PipelinedConnection<DirectConnection>;

    fn connect(&self) -> ConnectionResult<Self::Connection> {
        let stream = connect_tcp(&self.config)?;
        let options = DirectOptions {
            pubsub: self.config.pubsub,
            out_of_band: self.out_of_band.clone(),
        };
        let direct = DirectConnection::new(stream, self.context.clone(), options)?;
        Ok(PipelinedConnection::new(direct))
    }
}

struct PoolState<C> {
    idle: VecDeque<C>,
    total: usize,
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    max_idle: usize,
    max_total: usize,
    state: Mutex<PoolState<F::Connection>>,
}

/// Connection pool handle.
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        ConnectionPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Creates a pool keeping at most `max_idle` ready and `max_total` live connections.
    pub fn new(factory: F, max_idle: usize, max_total: usize) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                factory,
                max_idle,
                max_total,
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(max_idle),
                    total: 0,
                }),
            }),
        }
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Checks out a ready connection, or opens one while under `max_total`.
    pub fn acquire(&self) -> ConnectionResult<PooledConnection<F>> {
        while let Some(conn) = self.pop_idle() {
            if conn.is_usable() {
                return Ok(PooledConnection::new(self.clone(), conn));
            }
            debug!("discarding unusable idle connection");
            conn.dispose();
            self.release_slot();
        }

        if !self.try_reserve() {
            return Err(ConnectionError::PoolExhausted);
        }

        match self.inner.factory.connect() {
            Ok(conn) => {
                debug!(total = self.total(), "opened pooled connection");
                Ok(PooledConnection::new(self.clone(), conn))
            }
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    /// Ready connections waiting in the queue.
    pub fn idle(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Live connections, idle and checked out.
    pub fn total(&self) -> usize {
        self.inner.state.lock().total
    }

    fn pop_idle(&self) -> Option<F::Connection> {
        self.inner.state.lock().idle.pop_front()
    }

    fn try_reserve(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.total >= self.inner.max_total {
            return false;
        }
        state.total += 1;
        true
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        state.total = state.total.saturating_sub(1);
    }

    fn return_connection(&self, conn: F::Connection) {
        let rejected = {
            let mut state = self.inner.state.lock();
            if conn.is_usable() && state.idle.len() < self.inner.max_idle {
                state.idle.push_back(conn);
                None
            } else {
                state.total = state.total.saturating_sub(1);
                Some(conn)
            }
        };
        // Dispose outside the lock; it may fail outstanding messages.
        if let Some(conn) = rejected {
            debug!(usable = conn.is_usable(), "disposing returned connection");
            conn.dispose();
        }
    }
}

/// RAII checkout returning the connection to the pool on drop.
///
/// Check-in disposes a connection the ready queue has no room for, failing
/// any reply still in flight. Keep the guard until its replies are decided.
pub struct PooledConnection<F: ConnectionFactory> {
    pool: ConnectionPool<F>,
    conn: Option<F::Connection>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(pool: ConnectionPool<F>, conn: F::Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        match self.conn.as_ref() {
            Some(conn) => conn,
            // Only taken in Drop.
            None => unreachable!("pooled connection used after check-in"),
        }
    }
}

impl<F: ConnectionFactory> Connection for PooledConnection<F> {
    fn context(&self) -> &EngineContext {
        (**self).context()
    }

    fn messages(&self) -> &MessagePool {
        (**self).messages()
    }

    fn serialize<R, Fm>(&self, command: &str, request: &R, formatter: &Fm) -> ConnectionResult<BlockChunk>
    where
        R: ?Sized,
        Fm: RequestFormatter<R> + ?Sized,
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

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn);
        }
    }
}
