//! Request ID translation.
//!
//! Clients pick their own `messageId`s, which may collide across clients.
//! The relay replaces them with internal IDs drawn from a wrapping counter
//! in `[0, MAX_MESSAGE_ID)` and remembers who asked, so the upstream reply
//! can be routed back and the caller's ID restored.
//!
//! The counter does not skip IDs that are still pending. A request that
//! stays unanswered while `MAX_MESSAGE_ID` newer requests are admitted has
//! its entry overwritten; [`IdTranslator::register_pending`] hands the
//! evicted entry back so the caller can tell the orphaned client.

use super::connection::WeakConnection;
use serde_json::Value;
use std::collections::HashMap;

/// Size of the internal ID window.
pub const MAX_MESSAGE_ID: u32 = 100;

/// A command forwarded upstream and awaiting its reply.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub internal_id: u32,
    /// The caller's own `messageId`, if it sent one.
    pub requester_id: Option<Value>,
    pub downstream: WeakConnection,
}

/// Wrapping ID counter plus the table of pending requests.
#[derive(Debug)]
pub struct IdTranslator {
    next: u32,
    window: u32,
    pending: HashMap<u32, PendingRequest>,
}

impl Default for IdTranslator {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_ID)
    }
}

impl IdTranslator {
    pub fn new(window: u32) -> Self {
        Self {
            next: 0,
            window: window.max(1),
            pending: HashMap::new(),
        }
    }

    /// Return the current counter value, then advance it modulo the window.
    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next = (self.next + 1) % self.window;
        id
    }

    /// Record a pending request under `id`, returning any entry it replaced.
    pub fn register_pending(
        &mut self,
        id: u32,
        downstream: WeakConnection,
        requester_id: Option<Value>,
    ) -> Option<PendingRequest> {
        self.pending.insert(
            id,
            PendingRequest {
                internal_id: id,
                requester_id,
                downstream,
            },
        )
    }

    /// Remove and return the pending request for `id`.
    pub fn take_pending(&mut self, id: u32) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    #[cfg(test)]
    pub fn is_pending(&self, id: u32) -> bool {
        self.pending.contains_key(&id)
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
