//! Confirm-pairing buffer.
//!
//! A `callConfirm` event is not actionable on its own: the client needs the
//! run state that follows it. Confirm events for a run other than the last
//! released one are held back, together with everything after them, until an
//! event for the most recently buffered run arrives. The whole deferred
//! sequence is then released in arrival order.

use clicky_core::Event;

/// Reordering state for one event stream. Owned by the single consumer.
#[derive(Debug, Default)]
pub struct ConfirmBuffer {
    pending: Vec<Event>,
    last_run_id: String,
}

impl ConfirmBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event; returns the events released by this step, in order.
    pub fn push(&mut self, event: Event) -> Vec<Event> {
        let hold = (!self.pending.is_empty() || event.is_confirm())
            && event.run_id != self.last_run_id;
        self.last_run_id.clone_from(&event.run_id);

        if hold {
            self.pending.push(event);
            return Vec::new();
        }

        let mut released = std::mem::take(&mut self.pending);
        released.push(event);
        released
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// End of input. Returns the events that never found a correlated
    /// follower; the caller discards them.
    pub fn finish(self) -> Vec<Event> {
        self.pending
    }
}
