//! Cluster handle: the public entry point of the SDK.
//!
//! A [`Cluster`] owns the operation registry, the connection multiplexer, the
//! codec and the callback table, and is driven from one logical dispatch
//! thread. Submission never blocks: `submit` resolves the target node, records
//! the pending operation and queues the descriptor, then returns. Completion,
//! whatever its shape, arrives later through the installed callbacks — see
//! [`crate::dispatch`] for the cooperative primitives and [`Cluster::wait_all`]
//! for the blocking convenience layer.
//!
//! The generic parameter `C` is the caller's cookie type: an opaque slot
//! attached to every submission, handed back (mutably) to the callback, and
//! never interpreted by the SDK.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::codec::{BinaryCodec, WireCodec};
use crate::command::{AdminMethod, CommandDescriptor, OperationKind};
use crate::dispatch::OperationResult;
use crate::error::{Error, Failure, Result};
use crate::mux::{ConnState, Multiplexer};
use crate::registry::{OpState, OperationId, Registry};
use crate::transport::Connector;

/// Per-instance tuning knobs.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
  /// Deadline applied to every submitted operation.
  pub operation_timeout: Duration,
  /// Virtual bucket count for key routing.
  pub vbuckets: u16,
  /// Instance identifier, carried in logs.
  pub client_id: Uuid,
}

impl Default for ClusterOptions {
  fn default() -> Self {
    Self {
      operation_timeout: Duration::from_millis(2500),
      vbuckets: 1024,
      client_id: Uuid::new_v4(),
    }
  }
}

impl ClusterOptions {
  pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
    self.operation_timeout = timeout;
    self
  }

  pub fn with_vbuckets(mut self, vbuckets: u16) -> Self {
    self.vbuckets = vbuckets;
    self
  }
}

/// Completion callback: receives the result (valid for the duration of the
/// call) and mutable access to the submission's cookie.
pub type Handler<C> = Box<dyn FnMut(&OperationResult, &mut C)>;

pub(crate) struct RemoteSubmit<C> {
  pub id: OperationId,
  pub descriptor: CommandDescriptor,
  pub cookie: C,
}

/// One SDK instance: scheduling, dispatch and callback state.
pub struct Cluster<C> {
  pub(crate) options: ClusterOptions,
  pub(crate) registry: Registry<C>,
  pub(crate) mux: Multiplexer,
  pub(crate) codec: Box<dyn WireCodec>,
  pub(crate) handlers: HashMap<OperationKind, Handler<C>>,
  pub(crate) default_handler: Option<Handler<C>>,
  /// Locally-failed submissions awaiting their asynchronous callback.
  pub(crate) parked: VecDeque<(OperationId, Failure)>,
  pub(crate) remote_rx: mpsc::UnboundedReceiver<RemoteSubmit<C>>,
  remote_tx: mpsc::UnboundedSender<RemoteSubmit<C>>,
  counter: Arc<AtomicU64>,
  pub(crate) shut_down: bool,
}

impl<C> Cluster<C> {
  /// Create an instance with the default binary codec.
  pub fn new(options: ClusterOptions, connector: Box<dyn Connector>) -> Self {
    Self::with_codec(options, connector, Box::new(BinaryCodec))
  }

  /// Create an instance with a caller-supplied wire codec.
  pub fn with_codec(
    options: ClusterOptions,
    connector: Box<dyn Connector>,
    codec: Box<dyn WireCodec>,
  ) -> Self {
    debug!(client_id = %options.client_id, "cluster instance created");
    let counter = Arc::new(AtomicU64::new(1));
    let (remote_tx, remote_rx) = mpsc::unbounded_channel();
    Self {
      mux: Multiplexer::new(connector, options.vbuckets),
      registry: Registry::new(Arc::clone(&counter)),
      codec,
      handlers: HashMap::new(),
      default_handler: None,
      parked: VecDeque::new(),
      remote_rx,
      remote_tx,
      counter,
      shut_down: false,
      options,
    }
  }

  /// Add a node to the topology. Its connection is established on first need.
  pub fn add_node(&mut self, address: impl Into<String>) -> usize {
    self.mux.add_node(address)
  }

  /// Gracefully remove a node: in-flight operations finish, nothing new is
  /// routed to it.
  pub fn remove_node(&mut self, node: usize) {
    self.mux.remove_node(node);
  }

  pub fn node_state(&self, node: usize) -> ConnState {
    self.mux.state(node)
  }

  /// Install the callback for one operation kind.
  pub fn install_handler(
    &mut self,
    kind: OperationKind,
    handler: impl FnMut(&OperationResult, &mut C) + 'static,
  ) {
    self.handlers.insert(kind, Box::new(handler));
  }

  /// Install the fallback callback for kinds without a specific handler.
  /// With neither installed, completions for that kind are dropped — that is
  /// the caller's responsibility, not an error.
  pub fn install_default_handler(
    &mut self,
    handler: impl FnMut(&OperationResult, &mut C) + 'static,
  ) {
    self.default_handler = Some(Box::new(handler));
  }

  /// Schedule an operation. Never blocks; returns as soon as the descriptor is
  /// queued (or parked for an asynchronous routing failure). Exactly one
  /// callback will eventually fire for the returned identifier.
  pub fn submit(&mut self, descriptor: CommandDescriptor, cookie: C) -> Result<OperationId> {
    if self.shut_down {
      return Err(Error::Shutdown);
    }
    let deadline = Instant::now() + self.options.operation_timeout;
    match self.mux.route(descriptor.key()) {
      Some(node) => {
        let id = self.registry.register(descriptor, cookie, Some(node), deadline);
        self.mux.enqueue(node, id);
        Ok(id)
      }
      None => {
        // Uniform completion contract: the local failure still consumes an
        // identifier and is reported through the callback channel.
        let id = self.registry.register(descriptor, cookie, None, deadline);
        self.parked.push_back((id, Failure::RoutingUnavailable));
        Ok(id)
      }
    }
  }

  /// Administrative request, reusing the key-value submit/complete/callback
  /// mechanics rather than a separate code path.
  pub fn admin_request(
    &mut self,
    method: AdminMethod,
    path: impl Into<Bytes>,
    body: Option<Bytes>,
    cookie: C,
  ) -> Result<OperationId> {
    let descriptor = CommandDescriptor::admin(method, path, body).build()?;
    self.submit(descriptor, cookie)
  }

  /// A cloneable cross-thread submission handle. Descriptors submitted through
  /// it are marshalled onto the dispatch thread and admitted on the next
  /// [`Cluster::tick`].
  pub fn handle(&self) -> SubmitHandle<C> {
    SubmitHandle {
      tx: self.remote_tx.clone(),
      counter: Arc::clone(&self.counter),
    }
  }

  /// Number of operations not yet in a terminal state.
  pub fn pending(&self) -> usize {
    self.registry.len()
  }

  /// Lifecycle state of one operation; `None` once it is terminal.
  pub fn operation_state(&self, id: OperationId) -> Option<OpState> {
    self.registry.lookup(id).map(|p| p.state)
  }
}

/// Cross-thread submission handle (see [`Cluster::handle`]).
///
/// Allocates the operation identifier locally from the shared counter so the
/// caller learns it synchronously, then hands the descriptor to the dispatch
/// thread. Callbacks still run on the dispatch thread only.
pub struct SubmitHandle<C> {
  tx: mpsc::UnboundedSender<RemoteSubmit<C>>,
  counter: Arc<AtomicU64>,
}

impl<C> Clone for SubmitHandle<C> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
      counter: Arc::clone(&self.counter),
    }
  }
}

impl<C: Send> SubmitHandle<C> {
  pub fn submit(&self, descriptor: CommandDescriptor, cookie: C) -> Result<OperationId> {
    let id = OperationId::from_raw(self.counter.fetch_add(1, Ordering::Relaxed));
    self
      .tx
      .send(RemoteSubmit {
        id,
        descriptor,
        cookie,
      })
      .map_err(|_| Error::Shutdown)?;
    Ok(id)
  }
}
