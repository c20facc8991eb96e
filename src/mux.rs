//! Connection multiplexer: routes descriptors to nodes and batches them onto
//! the wire.
//!
//! One [`NodeConnection`] per cluster node, created on first need through the
//! [`Connector`] and torn down on removal or fatal I/O error. Routing is a pure
//! function of the routing key and the current topology snapshot: CRC32 of the
//! key picks a virtual bucket, the bucket maps onto the first admitting node.
//! Queued descriptors for a node are coalesced into a single write buffer per
//! drain cycle, preserving submission order per node (FIFO). Response ordering
//! is the dispatcher's concern, not ours.
//!
//! The multiplexer holds operation identifiers only; descriptors and cookies
//! live in the registry.

use std::collections::{HashSet, VecDeque};

use bytes::{Buf, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use tracing::{debug, trace, warn};

use crate::codec::WireCodec;
use crate::registry::{OpState, OperationId, Registry};
use crate::transport::Connector;

/// IEEE CRC32, the routing checksum of the modeled protocol.
const KEY_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Liveness state of one node connection.
///
/// `Connecting → Ready` on handshake, `Ready → Draining` on graceful removal,
/// anything `→ Down` on fatal error or shutdown. `Down` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
  Connecting,
  Ready,
  Draining,
  Down,
}

pub(crate) struct NodeConnection {
  pub address: String,
  pub state: ConnState,
  pub transport: Option<Box<dyn crate::transport::Transport>>,
  /// Accepted but not yet encoded, in submission order.
  pub outbox: VecDeque<OperationId>,
  /// Encoded bytes not yet accepted by the transport.
  pub write_buf: BytesMut,
  /// Bytes received but not yet framed.
  pub read_buf: BytesMut,
  /// Transmitted (or handed to the wire path) and awaiting a response.
  pub inflight: HashSet<OperationId>,
}

impl NodeConnection {
  fn new(address: String) -> Self {
    Self {
      address,
      state: ConnState::Connecting,
      transport: None,
      outbox: VecDeque::new(),
      write_buf: BytesMut::new(),
      read_buf: BytesMut::new(),
      inflight: HashSet::new(),
    }
  }

  /// Whether new submissions may be routed here. Draining and Down nodes
  /// accept nothing; Connecting nodes queue until the handshake finishes.
  fn admits(&self) -> bool {
    matches!(self.state, ConnState::Connecting | ConnState::Ready)
  }

  /// Every identifier this connection is responsible for, queued or in flight.
  fn take_all_ids(&mut self) -> Vec<OperationId> {
    let mut ids: Vec<OperationId> = self.outbox.drain(..).collect();
    ids.extend(self.inflight.drain());
    ids.sort();
    ids
  }
}

/// Outcome of one flush pass.
pub(crate) struct FlushReport {
  pub work: usize,
  /// Connections that failed mid-flush, with the identifiers they stranded.
  pub failed: Vec<(usize, Vec<OperationId>)>,
}

/// Outcome of pulling bytes off one connection.
pub(crate) enum ReadEvent {
  /// Bytes were appended to the connection's read buffer.
  Data(usize),
  Idle,
  /// The connection died; these identifiers were stranded on it.
  Closed(Vec<OperationId>),
}

pub(crate) struct Multiplexer {
  nodes: Vec<NodeConnection>,
  connector: Box<dyn Connector>,
  vbuckets: u16,
}

impl Multiplexer {
  pub fn new(connector: Box<dyn Connector>, vbuckets: u16) -> Self {
    Self {
      nodes: Vec::new(),
      connector,
      vbuckets: vbuckets.max(1),
    }
  }

  /// Add a node to the topology. The connection is established lazily, on the
  /// first flush that finds work for it.
  pub fn add_node(&mut self, address: impl Into<String>) -> usize {
    let address = address.into();
    debug!(node = self.nodes.len(), %address, "node added");
    self.nodes.push(NodeConnection::new(address));
    self.nodes.len() - 1
  }

  /// Graceful removal: in-flight operations finish, nothing new is admitted.
  pub fn remove_node(&mut self, node: usize) {
    if let Some(conn) = self.nodes.get_mut(node) {
      if !matches!(conn.state, ConnState::Down) {
        debug!(node, address = %conn.address, "node draining");
        conn.state = ConnState::Draining;
      }
    }
  }

  /// Hard failure: the connection is torn down and every identifier it was
  /// responsible for is returned for abandonment. Nothing is silently dropped.
  pub fn fail_node(&mut self, node: usize) -> Vec<OperationId> {
    let Some(conn) = self.nodes.get_mut(node) else {
      return Vec::new();
    };
    if !matches!(conn.state, ConnState::Down) {
      warn!(node, address = %conn.address, "node down");
    }
    conn.state = ConnState::Down;
    conn.transport = None;
    conn.write_buf.clear();
    conn.read_buf.clear();
    conn.take_all_ids()
  }

  pub fn node_count(&self) -> usize {
    self.nodes.len()
  }

  pub fn state(&self, node: usize) -> ConnState {
    self.nodes.get(node).map_or(ConnState::Down, |c| c.state)
  }

  pub fn conn_mut(&mut self, node: usize) -> Option<&mut NodeConnection> {
    self.nodes.get_mut(node)
  }

  /// Resolve the target node for a routing key against the current topology
  /// snapshot. Pure: same key, same topology, same answer.
  pub fn route(&self, key: &[u8]) -> Option<usize> {
    if self.nodes.is_empty() {
      return None;
    }
    let vbucket = (KEY_CRC.checksum(key) % u32::from(self.vbuckets)) as usize;
    let start = vbucket % self.nodes.len();
    (0..self.nodes.len())
      .map(|i| (start + i) % self.nodes.len())
      .find(|&idx| self.nodes[idx].admits())
  }

  pub fn enqueue(&mut self, node: usize, id: OperationId) {
    trace!(%id, node, "queued");
    self.nodes[node].outbox.push_back(id);
  }

  /// One drain cycle: connect pending nodes, coalesce each node's outbox into
  /// its write buffer in FIFO order, and push bytes until the transport blocks.
  pub fn flush<C>(&mut self, registry: &mut Registry<C>, codec: &dyn WireCodec) -> FlushReport {
    let mut report = FlushReport {
      work: 0,
      failed: Vec::new(),
    };

    for idx in 0..self.nodes.len() {
      match self.nodes[idx].state {
        ConnState::Down => continue,
        ConnState::Connecting => {
          if self.nodes[idx].transport.is_none() {
            let address = self.nodes[idx].address.clone();
            match self.connector.connect(&address) {
              Ok(t) => {
                self.nodes[idx].transport = Some(t);
                report.work += 1;
              }
              Err(e) => {
                warn!(node = idx, %address, error = %e, "connect failed");
                report.failed.push((idx, self.fail_node(idx)));
                continue;
              }
            }
          }
          let handshaken = self.nodes[idx].transport.as_ref().is_some_and(|t| t.is_ready());
          if !handshaken {
            continue;
          }
          self.nodes[idx].state = ConnState::Ready;
          debug!(node = idx, address = %self.nodes[idx].address, "connection ready");
          report.work += 1;
        }
        ConnState::Ready | ConnState::Draining => {}
      }

      let conn = &mut self.nodes[idx];

      // Coalesce: everything queued for this node goes into one write buffer,
      // in submission order. Entries missing from the registry were cancelled
      // or timed out while queued and are skipped.
      while let Some(id) = conn.outbox.pop_front() {
        match registry.get_mut(id) {
          Some(pending) => {
            codec.encode(id, &pending.descriptor, &mut conn.write_buf);
            pending.state = OpState::InFlight;
            conn.inflight.insert(id);
            report.work += 1;
            trace!(%id, node = idx, "encoded");
          }
          None => trace!(%id, node = idx, "skipped terminal entry in outbox"),
        }
      }

      let mut broken = false;
      if let Some(transport) = conn.transport.as_mut() {
        while !conn.write_buf.is_empty() {
          match transport.try_write(&conn.write_buf) {
            Ok(0) => {
              broken = true;
              break;
            }
            Ok(n) => {
              conn.write_buf.advance(n);
              report.work += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
              warn!(node = idx, error = %e, "write failed");
              broken = true;
              break;
            }
          }
        }
      }
      if broken {
        report.failed.push((idx, self.fail_node(idx)));
        continue;
      }

      // A draining node with nothing left owed goes quietly terminal.
      let conn = &self.nodes[idx];
      if conn.state == ConnState::Draining
        && conn.outbox.is_empty()
        && conn.inflight.is_empty()
        && conn.write_buf.is_empty()
      {
        debug!(node = idx, address = %conn.address, "drained");
        self.nodes[idx].state = ConnState::Down;
      }
    }

    report
  }

  /// Pull whatever the transport has buffered into the connection's read
  /// buffer. Framing and completion are the dispatcher's job.
  pub fn pump_reads(&mut self, node: usize) -> ReadEvent {
    let Some(conn) = self.nodes.get_mut(node) else {
      return ReadEvent::Idle;
    };
    if !matches!(conn.state, ConnState::Ready | ConnState::Draining) {
      return ReadEvent::Idle;
    }
    let Some(transport) = conn.transport.as_mut() else {
      return ReadEvent::Idle;
    };

    let mut scratch = [0u8; 8192];
    let mut total = 0usize;
    let mut closed = false;
    loop {
      match transport.try_read(&mut scratch) {
        Ok(0) => {
          closed = true;
          break;
        }
        Ok(n) => {
          conn.read_buf.extend_from_slice(&scratch[..n]);
          total += n;
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
        Err(e) => {
          warn!(node, error = %e, "read failed");
          closed = true;
          break;
        }
      }
    }

    if closed {
      ReadEvent::Closed(self.fail_node(node))
    } else if total == 0 {
      ReadEvent::Idle
    } else {
      ReadEvent::Data(total)
    }
  }

}
