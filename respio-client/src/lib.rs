//! # respio Sync Client
//!
//! Purpose: Compose the engine's buffers, scanner, and message cores into
//! usable connections and a small blocking client.
//!
//! ## Design Principles
//! 1. **Decorator Pattern**: Direct, pipelined, batched, and pooled layers each
//!    add one guarantee on top of the same `Connection` contract.
//! 2. **Object Pool Pattern**: Reuse live connections to avoid repeated connects.
//! 3. **Pluggable Collaborators**: Requests are encoded by a `RequestFormatter`
//!    and replies decoded by a `ResponseParser`; `resp` provides the defaults.
//!
//! ## Layering
//!
//! ```text
//! Client -> ConnectionPool -> PipelinedConnection -> DirectConnection -> TcpStream
//! Pipeline -> Batch ---------^
//! ```

mod client;
pub mod connection;
pub mod resp;
pub mod transport;

#[cfg(all(test, unix))]
mod test_support;

pub use client::{Client, ClientError, ClientResult, Pipeline};
pub use connection::{
    execute_async, Batch, Connection, ConnectionFactory, ConnectionPool, DirectConnection, DirectOptions,
    OutOfBandHandler, PipelinedConnection, PooledConnection, ReaderState, TcpConnector,
};
pub use resp::{ArgsFormatter, RespValue, ValueParser};
pub use respio_common::{ClientConfig, ConnectionError, EngineConfig, FaultKind, MessageError};
pub use transport::{connect_tcp, Duplex};
