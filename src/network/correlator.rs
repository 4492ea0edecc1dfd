//! Reply correlation for outstanding requests
//!
//! Every pending request lives in a concurrent map keyed by its message id.
//! Resolution always starts by removing the entry, so whichever path removes
//! it first (matching reply, send failure, channel close) owns the single
//! callback invocation and every later attempt finds nothing.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

use super::channel::{ChannelError, ReplyCallback};
use super::message::Message;

/// An outstanding request awaiting exactly one resolution
pub struct PendingRequest {
    message_id: String,
    original: Message,
    callback: ReplyCallback,
    registered_at: Instant,
}

impl PendingRequest {
    /// Wrap an outbound request, assigning it an id if it has none
    pub fn new(mut original: Message, callback: ReplyCallback) -> Self {
        let message_id = original.ensure_id().to_string();
        Self {
            message_id,
            original,
            callback,
            registered_at: Instant::now(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn original(&self) -> &Message {
        &self.original
    }

    /// Time since registration
    pub fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }

    /// Consume the request, delivering the reply
    pub fn resolve(self, reply: Message) {
        (self.callback)(self.original, Some(reply), None);
    }

    /// Consume the request, delivering an error
    pub fn fail(self, error: ChannelError) {
        (self.callback)(self.original, None, Some(error));
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("message_id", &self.message_id)
            .field("message_type", &self.original.message_type)
            .field("age", &self.age())
            .finish()
    }
}

/// Maps pending request ids to their callbacks
#[derive(Debug, Default)]
pub struct ReplyCorrelator {
    pending: DashMap<String, PendingRequest>,
}

impl ReplyCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request
    ///
    /// Returns the request unchanged if its id is already pending, so the
    /// caller can fail it instead of silently replacing the older entry.
    pub fn register(&self, request: PendingRequest) -> Result<(), PendingRequest> {
        match self.pending.entry(request.message_id.clone()) {
            Entry::Occupied(_) => Err(request),
            Entry::Vacant(slot) => {
                slot.insert(request);
                Ok(())
            }
        }
    }

    /// Take the request answered by `reply`
    ///
    /// `None` for messages that are not replies, late duplicates and replies
    /// to requests that were already resolved.
    pub fn take_for_reply(&self, reply: &Message) -> Option<PendingRequest> {
        let reply_to = reply.reply_message_id.as_deref()?;
        let taken = self.take(reply_to);
        if taken.is_none() {
            debug!(reply_to = %reply_to, "Dropping reply without pending request");
        }
        taken
    }

    /// Take the request registered under `message_id`
    pub fn take(&self, message_id: &str) -> Option<PendingRequest> {
        self.pending.remove(message_id).map(|(_, request)| request)
    }

    /// Take every pending request
    ///
    /// Each entry is removed individually, so a reply racing with the drain
    /// gets either the entry or nothing, never both outcomes.
    pub fn drain(&self) -> Vec<PendingRequest> {
        let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter_map(|id| self.take(id)).collect()
    }

    /// Take the requests registered at least `max_age` ago
    pub fn take_expired(&self, max_age: Duration) -> Vec<PendingRequest> {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().age() >= max_age)
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter()
            .filter_map(|id| {
                self.pending
                    .remove_if(id, |_, request| request.age() >= max_age)
                    .map(|(_, request)| request)
            })
            .collect()
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
