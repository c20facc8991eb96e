//! Operation registry: pending-completion state for every in-flight operation.
//!
//! The registry is the sole owner of pending operations. The multiplexer and the
//! dispatcher hold operation identifiers only, never references, so nothing can
//! dangle once an entry reaches a terminal transition and is destroyed. `complete`
//! and `abandon` are both implemented as removal, which makes them mutually
//! exclusive and exactly-once by construction.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::command::CommandDescriptor;

/// Unique identifier of a submitted operation, also used as the wire
/// correlation identifier. Monotonically assigned, never reused while the
/// instance lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
  pub fn raw(self) -> u64 {
    self.0
  }

  pub(crate) fn from_raw(raw: u64) -> Self {
    Self(raw)
  }
}

impl fmt::Display for OperationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "op#{}", self.0)
  }
}

/// Pre-terminal lifecycle states. Terminal transitions (completed, abandoned)
/// destroy the entry, so they never appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
  /// Accepted, sitting in a node's outbound queue.
  Queued,
  /// Handed to the wire path; awaiting a response.
  InFlight,
}

/// One registered operation, owned exclusively by the registry.
pub(crate) struct PendingOperation<C> {
  pub id: OperationId,
  pub descriptor: CommandDescriptor,
  /// Opaque caller context, passed through unmodified and never inspected.
  pub cookie: C,
  pub submitted_at: Instant,
  pub deadline: Instant,
  /// Target node index, `None` for submissions that failed routing locally.
  pub node: Option<usize>,
  pub state: OpState,
}

pub(crate) struct Registry<C> {
  ops: HashMap<OperationId, PendingOperation<C>>,
  counter: Arc<AtomicU64>,
}

impl<C> Registry<C> {
  /// The counter is shared with [`crate::cluster::SubmitHandle`] so identifiers
  /// stay unique across threads.
  pub fn new(counter: Arc<AtomicU64>) -> Self {
    Self {
      ops: HashMap::new(),
      counter,
    }
  }

  pub fn allocate(&self) -> OperationId {
    OperationId(self.counter.fetch_add(1, Ordering::Relaxed))
  }

  pub fn register(
    &mut self,
    descriptor: CommandDescriptor,
    cookie: C,
    node: Option<usize>,
    deadline: Instant,
  ) -> OperationId {
    let id = self.allocate();
    self.register_with_id(id, descriptor, cookie, node, deadline);
    id
  }

  /// Register under a pre-allocated identifier (cross-thread submission path).
  pub fn register_with_id(
    &mut self,
    id: OperationId,
    descriptor: CommandDescriptor,
    cookie: C,
    node: Option<usize>,
    deadline: Instant,
  ) {
    let prior = self.ops.insert(
      id,
      PendingOperation {
        id,
        descriptor,
        cookie,
        submitted_at: Instant::now(),
        deadline,
        node,
        state: OpState::Queued,
      },
    );
    // Counter wraparound with a live holder would hand two operations the same
    // identifier. Unreachable at u64 width; fail fatally rather than corrupt.
    assert!(prior.is_none(), "operation identifier {id} reused while live");
  }

  /// Terminal transition for a normally-answered operation. `None` if the
  /// entry already reached a terminal state.
  pub fn complete(&mut self, id: OperationId) -> Option<PendingOperation<C>> {
    self.ops.remove(&id)
  }

  /// Terminal transition for timeout, cancellation or connection loss.
  /// Idempotent: `None` once the operation is already terminal.
  pub fn abandon(&mut self, id: OperationId) -> Option<PendingOperation<C>> {
    self.ops.remove(&id)
  }

  pub fn lookup(&self, id: OperationId) -> Option<&PendingOperation<C>> {
    self.ops.get(&id)
  }

  pub fn get_mut(&mut self, id: OperationId) -> Option<&mut PendingOperation<C>> {
    self.ops.get_mut(&id)
  }

  /// Mutable access to the caller cookie of a still-pending operation,
  /// used for non-terminal row deliveries.
  pub fn cookie_mut(&mut self, id: OperationId) -> Option<&mut C> {
    self.ops.get_mut(&id).map(|p| &mut p.cookie)
  }

  pub fn contains(&self, id: OperationId) -> bool {
    self.ops.contains_key(&id)
  }

  pub fn is_empty(&self) -> bool {
    self.ops.is_empty()
  }

  pub fn len(&self) -> usize {
    self.ops.len()
  }

  /// Identifiers whose deadline has passed, oldest first.
  pub fn expired(&self, now: Instant) -> Vec<OperationId> {
    let mut out: Vec<OperationId> = self
      .ops
      .values()
      .filter(|p| p.deadline <= now)
      .map(|p| p.id)
      .collect();
    out.sort();
    out
  }

  pub fn all_ids(&self) -> Vec<OperationId> {
    let mut out: Vec<OperationId> = self.ops.keys().copied().collect();
    out.sort();
    out
  }
}
