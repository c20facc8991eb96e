//! Completion dispatcher: the event-loop integration point.
//!
//! Two ways to drive it, one set of semantics. A host with its own event loop
//! calls [`Cluster::on_readable`] when a node's socket has bytes and
//! [`Cluster::tick`] when its timer fires; each call does exactly the work
//! implied by that event and returns without blocking or looping. Hosts without
//! an event loop use the blocking adapter in [`crate::wait`], which drives these
//! same primitives internally.
//!
//! Callbacks are invoked synchronously on the dispatch thread, in wire-arrival
//! order per node. Requests go out in submission order per node, but the server
//! may answer out of order; the dispatcher never reorders responses.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::cluster::Cluster;
use crate::codec::Decoded;
use crate::command::OperationKind;
use crate::error::{Failure, ServerCode};
use crate::mux::ReadEvent;
use crate::registry::{OperationId, PendingOperation};

/// What an operation ultimately (or, for query rows, incrementally) produced.
#[derive(Debug, Clone)]
pub enum Outcome {
  /// Normal completion. `value` is present for fetch-style responses.
  Ok {
    cas: u64,
    value: Option<Bytes>,
    format: u32,
  },
  /// One query row. Non-terminal: the operation stays pending and more
  /// invocations follow, ending with `Ok` or `Failed`.
  Row { payload: Bytes },
  /// Terminal failure, local or remote.
  Failed(Failure),
}

impl Outcome {
  pub fn is_ok(&self) -> bool {
    !matches!(self, Self::Failed(_))
  }

  pub fn failure(&self) -> Option<&Failure> {
    match self {
      Self::Failed(f) => Some(f),
      _ => None,
    }
  }
}

/// The uniform result handed to callbacks. Valid for the duration of the
/// callback invocation; copy out whatever must outlive it.
#[derive(Debug, Clone)]
pub struct OperationResult {
  pub id: OperationId,
  pub kind: OperationKind,
  pub outcome: Outcome,
}

impl<C> Cluster<C> {
  /// One cooperative dispatch pass: admit cross-thread submissions, report
  /// parked local failures, flush outbound queues, sweep deadlines. Returns a
  /// count of work items handled (zero means the pass was idle). Never blocks.
  pub fn tick(&mut self) -> usize {
    self.tick_at(Instant::now())
  }

  pub(crate) fn tick_at(&mut self, now: Instant) -> usize {
    if self.shut_down {
      return 0;
    }
    let mut work = 0;
    work += self.drain_remote(now);
    work += self.report_parked();

    let report = self.mux.flush(&mut self.registry, &*self.codec);
    work += report.work;
    for (_, ids) in report.failed {
      work += self.abandon_all(ids, Failure::ConnectionLost);
    }

    work += self.sweep_deadlines(now);
    work
  }

  /// Handle readability of one node: pull buffered bytes, frame as many
  /// complete responses as arrived, and complete each matching operation,
  /// invoking its callback before returning. Does exactly the work implied by
  /// this one event.
  pub fn on_readable(&mut self, node: usize) -> usize {
    let mut work = 0;
    match self.mux.pump_reads(node) {
      ReadEvent::Closed(ids) => return self.abandon_all(ids, Failure::ConnectionLost),
      ReadEvent::Idle | ReadEvent::Data(_) => {}
    }

    let mut frames = Vec::new();
    let mut malformed = None;
    if let Some(conn) = self.mux.conn_mut(node) {
      loop {
        match self.codec.decode(&mut conn.read_buf) {
          Decoded::Frame(frame) => frames.push(frame),
          Decoded::Incomplete => break,
          Decoded::Malformed(msg) => {
            malformed = Some(msg);
            break;
          }
        }
      }
    }

    for frame in frames {
      work += self.process_frame(node, frame);
    }

    // Broken framing poisons the connection: correlation can no longer be
    // trusted, so everything stranded on it is abandoned.
    if let Some(msg) = malformed {
      warn!(node, %msg, "malformed response");
      let ids = self.mux.fail_node(node);
      work += self.abandon_all(ids, Failure::ProtocolError(msg));
    }
    work
  }

  /// Cancel a not-yet-completed operation. Its callback fires with
  /// [`Failure::Cancelled`] before this returns. Once the operation is
  /// terminal this is a no-op returning `false` — never a double callback.
  pub fn cancel(&mut self, id: OperationId) -> bool {
    match self.registry.abandon(id) {
      Some(pending) => {
        if let Some(node) = pending.node {
          if let Some(conn) = self.mux.conn_mut(node) {
            conn.inflight.remove(&id);
          }
        }
        debug!(%id, "cancelled");
        self.fire_terminal(pending, Outcome::Failed(Failure::Cancelled));
        true
      }
      None => false,
    }
  }

  /// Tear down one node immediately, abandoning everything assigned to it
  /// (queued and in flight) with [`Failure::ConnectionLost`]. Used by hosts
  /// that learn about node failure out of band.
  pub fn node_down(&mut self, node: usize) -> usize {
    let ids = self.mux.fail_node(node);
    self.abandon_all(ids, Failure::ConnectionLost)
  }

  /// Shut the instance down: every connection goes `Down`, every pending
  /// operation (including cross-thread submissions not yet admitted) gets its
  /// terminal [`Failure::ConnectionLost`] callback. Further submissions fail
  /// synchronously with [`crate::Error::Shutdown`].
  pub fn shutdown(&mut self) {
    if self.shut_down {
      return;
    }
    debug!(client_id = %self.options.client_id, "shutting down");
    self.shut_down = true;
    self.remote_rx.close();

    let now = Instant::now();
    while let Ok(msg) = self.remote_rx.try_recv() {
      let pending = PendingOperation {
        id: msg.id,
        descriptor: msg.descriptor,
        cookie: msg.cookie,
        submitted_at: now,
        deadline: now,
        node: None,
        state: crate::registry::OpState::Queued,
      };
      self.fire_terminal(pending, Outcome::Failed(Failure::ConnectionLost));
    }

    self.parked.clear();
    for node in 0..self.mux.node_count() {
      let ids = self.mux.fail_node(node);
      self.abandon_all(ids, Failure::ConnectionLost);
    }
    let remaining = self.registry.all_ids();
    self.abandon_all(remaining, Failure::ConnectionLost);
  }

  fn drain_remote(&mut self, now: Instant) -> usize {
    let mut work = 0;
    while let Ok(msg) = self.remote_rx.try_recv() {
      let deadline = now + self.options.operation_timeout;
      match self.mux.route(msg.descriptor.key()) {
        Some(node) => {
          self
            .registry
            .register_with_id(msg.id, msg.descriptor, msg.cookie, Some(node), deadline);
          self.mux.enqueue(node, msg.id);
        }
        None => {
          self
            .registry
            .register_with_id(msg.id, msg.descriptor, msg.cookie, None, deadline);
          self.parked.push_back((msg.id, Failure::RoutingUnavailable));
        }
      }
      work += 1;
    }
    work
  }

  fn report_parked(&mut self) -> usize {
    let mut work = 0;
    while let Some((id, failure)) = self.parked.pop_front() {
      // The entry may already be terminal (cancelled before this pass ran).
      if let Some(pending) = self.registry.abandon(id) {
        self.fire_terminal(pending, Outcome::Failed(failure));
        work += 1;
      }
    }
    work
  }

  /// The only non-I/O completion source: abandon operations past deadline.
  fn sweep_deadlines(&mut self, now: Instant) -> usize {
    let mut work = 0;
    for id in self.registry.expired(now) {
      if let Some(pending) = self.registry.abandon(id) {
        if let Some(node) = pending.node {
          if let Some(conn) = self.mux.conn_mut(node) {
            conn.inflight.remove(&id);
          }
        }
        debug!(%id, waited = ?now.duration_since(pending.submitted_at), "deadline exceeded");
        self.fire_terminal(pending, Outcome::Failed(Failure::Timeout));
        work += 1;
      }
    }
    work
  }

  fn abandon_all(&mut self, ids: Vec<OperationId>, failure: Failure) -> usize {
    let mut work = 0;
    for id in ids {
      if let Some(pending) = self.registry.abandon(id) {
        self.fire_terminal(pending, Outcome::Failed(failure.clone()));
        work += 1;
      }
    }
    work
  }

  fn process_frame(&mut self, node: usize, frame: crate::codec::ResponseFrame) -> usize {
    let id = OperationId::from_raw(frame.correlation_id);

    if frame.partial {
      // Query row: the operation stays pending, the cookie stays registered.
      let result = OperationResult {
        id,
        kind: OperationKind::Query,
        outcome: Outcome::Row {
          payload: frame.payload,
        },
      };
      let Some(cookie) = self.registry.cookie_mut(id) else {
        trace!(%id, "row for unknown or terminal operation");
        return 0;
      };
      match self.handlers.get_mut(&result.kind) {
        Some(handler) => handler(&result, cookie),
        None => match self.default_handler.as_mut() {
          Some(handler) => handler(&result, cookie),
          None => trace!(%id, "no handler installed; row dropped"),
        },
      }
      return 1;
    }

    let Some(pending) = self.registry.complete(id) else {
      // Late response after timeout/cancel/abandon. Exactly-once means we
      // must not surface it a second time.
      trace!(%id, "response for unknown or terminal operation");
      return 0;
    };
    if let Some(conn) = self.mux.conn_mut(node) {
      conn.inflight.remove(&id);
    }

    let outcome = if frame.status == 0 {
      Outcome::Ok {
        cas: frame.cas,
        value: (!frame.payload.is_empty()).then(|| frame.payload.clone()),
        format: frame.format,
      }
    } else {
      Outcome::Failed(Failure::ServerRejected(ServerCode::from_wire(frame.status)))
    };
    trace!(%id, status = frame.status, "completed");
    self.fire_terminal(pending, outcome);
    1
  }

  pub(crate) fn fire_terminal(&mut self, mut pending: PendingOperation<C>, outcome: Outcome) {
    let result = OperationResult {
      id: pending.id,
      kind: pending.descriptor.kind(),
      outcome,
    };
    match self.handlers.get_mut(&result.kind) {
      Some(handler) => handler(&result, &mut pending.cookie),
      None => match self.default_handler.as_mut() {
        Some(handler) => handler(&result, &mut pending.cookie),
        None => trace!(id = %result.id, "no handler installed; notification dropped"),
      },
    }
    // `pending` drops here: buffers and cookie are released immediately after
    // the terminal callback returns.
  }
}
