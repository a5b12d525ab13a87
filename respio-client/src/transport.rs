//! # Transport
//!
//! Purpose: Abstract the raw duplex byte stream a connection runs over, and
//! open TCP streams from a `ClientConfig`.
//!
//! ## Design Principles
//! 1. **Split Handles**: A connection clones the stream once for its read
//!    loop and once for shutdown, so the writer never contends with the reader.
//! 2. **Blocking I/O**: Streams are plain `std` sockets; the read loop owns a
//!    dedicated thread.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

use respio_common::{ClientConfig, ConnectionError, ConnectionResult};

/// Bidirectional byte stream a connection can split into handles.
pub trait Duplex: Read + Write + Send + Sync + 'static {
    /// Returns another handle to the same stream.
    fn try_clone_duplex(&self) -> io::Result<Box<dyn Duplex>>;

    /// Shuts both directions down, unblocking any pending read.
    fn shutdown_duplex(&self) -> io::Result<()>;
}

impl Duplex for TcpStream {
    fn try_clone_duplex(&self) -> io::Result<Box<dyn Duplex>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_duplex(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

#[cfg(unix)]
impl Duplex for std::os::unix::net::UnixStream {
    fn try_clone_duplex(&self) -> io::Result<Box<dyn Duplex>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_duplex(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Opens a TCP stream configured with the client's timeouts.
pub fn connect_tcp(config: &ClientConfig) -> ConnectionResult<TcpStream> {
    let addr: SocketAddr = config.addr.parse().map_err(|_| ConnectionError::InvalidAddress)?;
    let stream = match config.connect_timeout {
        Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
        None => TcpStream::connect(addr)?,
    };
    // The read loop treats a read timeout as an idle tick, not a failure.
    if let Some(timeout) = config.read_timeout {
        stream.set_read_timeout(Some(timeout))?;
    }
    if let Some(timeout) = config.write_timeout {
        stream.set_write_timeout(Some(timeout))?;
    }
    // Disable Nagle to keep request latency low for small payloads.
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unparsable_address() {
        let config = ClientConfig {
            addr: "not-an-address".to_string(),
            ..ClientConfig::default()
        };
        assert!(matches!(connect_tcp(&config), Err(ConnectionError::InvalidAddress)));
    }

    #[test]
    fn connects_to_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let config = ClientConfig {
            addr: listener.local_addr().expect("addr").to_string(),
            ..ClientConfig::default()
        };
        let stream = connect_tcp(&config).expect("connect");
        assert!(stream.nodelay().expect("nodelay"));
        let clone = stream.try_clone_duplex().expect("clone");
        clone.shutdown_duplex().expect("shutdown");
    }

    fn assert_shareable<T: Send + Sync>() {}

    #[test]
    fn boxed_duplex_is_shareable_across_threads() {
        assert_shareable::<Box<dyn Duplex>>();
        assert_shareable::<std::sync::Arc<Box<dyn Duplex>>>();
    }
}
