//! Transport abstraction: non-blocking byte pipes to cluster nodes.
//!
//! The scheduler never touches sockets directly. It drives a [`Transport`] with
//! non-blocking reads and writes, and obtains transports from a [`Connector`]
//! when a node connection is first needed. `io::ErrorKind::WouldBlock` means
//! "not ready right now"; any other error is fatal for the connection.
//!
//! [`TcpTransport`] adapts a `tokio::net::TcpStream` for hosts that run inside
//! a tokio runtime; the deterministic in-memory pair lives in [`crate::testing`].

use std::io;

use tokio::net::TcpStream;

/// A non-blocking, connection-oriented byte pipe.
pub trait Transport: Send {
  /// Write as many bytes as the pipe will take. `WouldBlock` when full.
  fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

  /// Read available bytes. `Ok(0)` means the peer closed; `WouldBlock` when empty.
  fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

  /// Whether the handshake has finished and the link is usable.
  fn is_ready(&self) -> bool {
    true
  }
}

/// Produces a transport for a node address on first need.
pub trait Connector {
  fn connect(&mut self, address: &str) -> io::Result<Box<dyn Transport>>;
}

/// Any `FnMut(&str) -> io::Result<Box<dyn Transport>>` is a connector.
impl<F> Connector for F
where
  F: FnMut(&str) -> io::Result<Box<dyn Transport>>,
{
  fn connect(&mut self, address: &str) -> io::Result<Box<dyn Transport>> {
    self(address)
  }
}

/// TCP transport over tokio. Construction is async; afterwards the stream is
/// driven with the runtime-registered `try_read`/`try_write` primitives, so it
/// fits the cooperative dispatch loop without awaiting inside the scheduler.
pub struct TcpTransport {
  stream: TcpStream,
}

impl TcpTransport {
  pub async fn connect(address: &str) -> crate::Result<Self> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    Ok(Self { stream })
  }

  /// Await readability, for hosts that want to sleep between dispatch passes.
  pub async fn readable(&self) -> io::Result<()> {
    self.stream.readable().await
  }
}

impl Transport for TcpTransport {
  fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.stream.try_write(buf)
  }

  fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.stream.try_read(buf)
  }
}
