//! OakDB Rust Client SDK
//!
//! The scheduling core of a native client for OakDB, a distributed document
//! database. The SDK batches heterogeneous operations, multiplexes them onto
//! per-node connections, correlates asynchronous responses back to callers and
//! integrates with either a host event loop (cooperative mode: [`Cluster::tick`]
//! and [`Cluster::on_readable`]) or a caller-driven blocking wait
//! ([`Cluster::wait_all`] / [`Cluster::wait_for`]).
//!
//! Submission never blocks and every submitted operation produces exactly one
//! terminal callback — success, server rejection, timeout, cancellation or
//! connection loss — on the dispatch thread.
//!
//! # Example
//!
//! ```
//! use oakdb::{Cluster, ClusterOptions, CommandDescriptor};
//! use oakdb::testing::StubNet;
//!
//! // The in-memory harness stands in for a real cluster; production hosts
//! // supply a TCP connector instead.
//! let net = StubNet::new();
//! let mut cluster: Cluster<u32> = Cluster::new(ClusterOptions::default(), net.connector());
//! cluster.add_node("10.0.0.1:11210");
//!
//! cluster.install_default_handler(|result, cookie| {
//!     println!("{} ({:?}) finished, cookie {}", result.id, result.kind, cookie);
//! });
//!
//! let descriptor = CommandDescriptor::upsert("user::1001", r#"{"name":"Alice"}"#).build()?;
//! let id = cluster.submit(descriptor, 7)?;
//! cluster.wait_for(id);
//! # Ok::<(), oakdb::Error>(())
//! ```

mod cluster;
mod command;
mod dispatch;
mod error;
mod mux;
mod registry;
mod wait;

pub mod codec;
pub mod query;
pub mod testing;
pub mod transport;

pub use cluster::{Cluster, ClusterOptions, Handler, SubmitHandle};
pub use command::{
  AdminMethod, CommandBuilder, CommandDescriptor, Expiry, OperationKind, MAX_KEY_SIZE,
  RELATIVE_EXPIRY_CUTOFF,
};
pub use dispatch::{OperationResult, Outcome};
pub use error::{Error, Failure, Result, ServerCode};
pub use mux::ConnState;
pub use registry::{OpState, OperationId};
