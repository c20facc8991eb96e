//! Blocking wait adapter.
//!
//! A convenience composition over the cooperative dispatcher for callers that
//! do not run their own event loop: the same `tick`/`on_readable` primitives
//! are driven in a tight loop on the calling thread until the target condition
//! holds. Callback semantics and ordering are identical to cooperative mode.
//! These are the only calls in the SDK that may block.

use std::time::Duration;

use crate::cluster::Cluster;
use crate::mux::ConnState;
use crate::registry::OperationId;

impl<C> Cluster<C> {
  /// Block until no tracked operation remains. Every deadline is finite, so
  /// this terminates even if the cluster never answers.
  pub fn wait_all(&mut self) {
    self.wait_until(|c| c.registry.is_empty());
  }

  /// Block until the given operation reaches a terminal state. Returns
  /// immediately if it already has.
  pub fn wait_for(&mut self, id: OperationId) {
    self.wait_until(move |c| !c.registry.contains(id));
  }

  fn wait_until(&mut self, done: impl Fn(&Cluster<C>) -> bool) {
    loop {
      // Always run one dispatch pass before checking: cross-thread submissions
      // sit in the handoff queue until a tick admits them, so the registry
      // alone cannot prove an identifier terminal.
      let mut work = self.tick();
      for node in 0..self.mux.node_count() {
        if matches!(self.mux.state(node), ConnState::Ready | ConnState::Draining) {
          work += self.on_readable(node);
        }
      }
      if done(self) {
        return;
      }
      if work == 0 {
        // Idle pass: nothing readable, nothing expired yet. Back off briefly
        // instead of spinning until the next deadline.
        std::thread::sleep(Duration::from_millis(1));
      }
    }
  }
}
