//! Error types for the OakDB client SDK.
//!
//! The SDK splits failures into two channels. [`Error`] is the synchronous kind:
//! it is returned directly from descriptor construction and `submit`, and the only
//! scheduling-related variant is `InvalidArgument`. [`Failure`] is the asynchronous
//! kind: it is delivered through the completion callback as the status of an
//! operation that was accepted but did not succeed. Every accepted operation gets
//! exactly one terminal callback, so no `Failure` is ever silent.

use thiserror::Error;

/// Synchronous errors, surfaced directly on the calling thread.
#[derive(Error, Debug)]
pub enum Error {
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("cluster has been shut down")]
  Shutdown,
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Semantic rejection codes echoed by the server in a response status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCode {
  KeyNotFound,
  KeyExists,
  ValueTooLarge,
  NotStored,
  CasMismatch,
  Internal,
  Unknown(u16),
}

impl ServerCode {
  pub fn from_wire(raw: u16) -> Self {
    match raw {
      0x0001 => Self::KeyNotFound,
      0x0002 => Self::KeyExists,
      0x0003 => Self::ValueTooLarge,
      0x0005 => Self::NotStored,
      0x0006 => Self::CasMismatch,
      0x0084 => Self::Internal,
      other => Self::Unknown(other),
    }
  }

  pub fn to_wire(self) -> u16 {
    match self {
      Self::KeyNotFound => 0x0001,
      Self::KeyExists => 0x0002,
      Self::ValueTooLarge => 0x0003,
      Self::NotStored => 0x0005,
      Self::CasMismatch => 0x0006,
      Self::Internal => 0x0084,
      Self::Unknown(raw) => raw,
    }
  }
}

/// Asynchronous failure status, delivered through the completion callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Failure {
  /// No live node could be resolved for the routing key.
  #[error("no live node for routing key")]
  RoutingUnavailable,

  /// The connection carrying the operation went down before a response arrived.
  #[error("connection lost")]
  ConnectionLost,

  /// The operation's deadline passed before a response arrived.
  #[error("operation timed out")]
  Timeout,

  /// The caller cancelled the operation before it completed.
  #[error("operation cancelled")]
  Cancelled,

  /// The server answered, but rejected the operation semantically.
  #[error("server rejected operation: {0:?}")]
  ServerRejected(ServerCode),

  /// The response bytes could not be framed or parsed.
  #[error("protocol error: {0}")]
  ProtocolError(String),
}
