//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API for issuing Redis-compatible
//! commands over pooled, pipelined connections.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides pooling, framing, and completion details.
//! 2. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 3. **Fail Fast**: Protocol violations surface immediately as errors.
//! 4. **Explicit Batching**: `pipeline()` queues commands and writes them once.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use respio_common::{ClientConfig, ConfigError, ConnectionError, MessageError, MessageResult};
use respio_engine::{EngineContext, PendingReply};
use thiserror::Error;

use crate::connection::{Batch, Connection, ConnectionPool, PooledConnection, TcpConnector};
use crate::resp::{ArgsFormatter, RespValue, ValueParser};

/// Result type for the sync client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the sync client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The configuration was rejected before connecting.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Engine start-up failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The connection could not carry the request.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// The reply was an error, unparsable, or never arrived.
    #[error(transparent)]
    Message(#[from] MessageError),
}

impl ClientError {
    /// Returns the server's error text when the server rejected the command.
    pub fn server_message(&self) -> Option<&[u8]> {
        match self {
            ClientError::Message(MessageError::Server(message)) => Some(message),
            _ => None,
        }
    }
}

/// Synchronous client with connection pooling.
///
/// Each call checks out a connection, sends one command, waits for its reply,
/// and checks the connection back in.
pub struct Client {
    pool: ConnectionPool<TcpConnector>,
    parser: Arc<ValueParser>,
    timeout: Option<Duration>,
}

impl Client {
    /// Creates a client with default configuration.
    pub fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        let config = ClientConfig {
            addr: addr.into(),
            ..ClientConfig::default()
        };
        Self::with_config(config)
    }

    /// Creates a client with a custom configuration.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let context = EngineContext::new(config.engine.clone())?;
        let timeout = config.response_timeout;
        let (max_idle, max_total) = (config.max_idle, config.max_total);
        let pool = ConnectionPool::new(TcpConnector::new(config, context), max_idle, max_total);
        Ok(Client {
            pool,
            parser: Arc::new(ValueParser),
            timeout,
        })
    }

    /// Pools and workers shared by every connection of this client.
    pub fn context(&self) -> &EngineContext {
        self.pool.factory().context()
    }

    pub fn pool(&self) -> &ConnectionPool<TcpConnector> {
        &self.pool
    }

    /// Runs one command and returns the raw reply, error replies included.
    pub fn execute(&self, command: &str, args: &[&[u8]]) -> ClientResult<RespValue> {
        let conn = self.pool.acquire()?;
        let reply = conn.execute(command, args, &ArgsFormatter, &self.parser)?;
        // Check-in may dispose the connection, so hold it until the reply is decided.
        let value = reply.wait(self.timeout);
        drop(conn);
        Ok(value?)
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        match self.execute("GET", &[key])? {
            RespValue::Bulk(data) => Ok(data),
            RespValue::Null => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// Sets a value for a key without expiration.
    pub fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        match self.execute("SET", &[key, value])? {
            RespValue::Simple(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Deletes a key. Returns true when a key was removed.
    pub fn delete(&self, key: &[u8]) -> ClientResult<bool> {
        match self.execute("DEL", &[key])? {
            RespValue::Integer(count) => Ok(count > 0),
            other => Err(unexpected(other)),
        }
    }

    /// Pings the server. Returns the raw response payload.
    pub fn ping(&self, payload: Option<&[u8]>) -> ClientResult<Vec<u8>> {
        let response = match payload {
            Some(data) => self.execute("PING", &[data])?,
            None => self.execute("PING", &[])?,
        };
        match response {
            RespValue::Simple(text) => Ok(text),
            RespValue::Bulk(Some(data)) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    /// Starts a batch on one pooled connection.
    pub fn pipeline(&self) -> ClientResult<Pipeline> {
        let conn = self.pool.acquire()?;
        Ok(Pipeline {
            batch: Batch::new(conn)?,
            parser: Arc::clone(&self.parser),
            replies: Vec::new(),
            timeout: self.timeout,
        })
    }
}

/// Commands queued on one connection and written together.
pub struct Pipeline {
    batch: Batch<PooledConnection<TcpConnector>>,
    parser: Arc<ValueParser>,
    replies: Vec<PendingReply<RespValue>>,
    timeout: Option<Duration>,
}

impl Pipeline {
    /// Queues a command; nothing is written until `execute`.
    pub fn command(&mut self, command: &str, args: &[&[u8]]) -> ClientResult<&mut Self> {
        let reply = self.batch.execute(command, args, &ArgsFormatter, &self.parser)?;
        self.replies.push(reply);
        Ok(self)
    }

    /// Commands queued so far.
    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    /// Writes every queued command and waits for each reply, in order.
    ///
    /// Error replies come back as `Err(MessageError::Server)` in their slot.
    pub fn execute(mut self) -> ClientResult<Vec<MessageResult<RespValue>>> {
        self.batch.flush()?;
        let replies = std::mem::take(&mut self.replies);
        Ok(replies
            .into_iter()
            .map(|reply| match reply.wait(self.timeout) {
                Ok(RespValue::Error(message)) => Err(MessageError::Server(message)),
                other => other,
            })
            .collect())
    }
}

fn unexpected(value: RespValue) -> ClientError {
    match value {
        RespValue::Error(message) => MessageError::Server(message).into(),
        _ => MessageError::UnexpectedResponse.into(),
    }
}
