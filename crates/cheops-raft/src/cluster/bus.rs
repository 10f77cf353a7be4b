//! In-process delivery of committed replies to waiting submitters.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use cheops_core::ReplyDocument;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::types::GroupId;

type BusKey = (GroupId, String);

struct Slot {
    tx: mpsc::UnboundedSender<ReplyDocument>,
    rx: Option<mpsc::UnboundedReceiver<ReplyDocument>>,
    created_at: Instant,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            created_at: Instant::now(),
        }
    }
}

/// Channels keyed by `(GroupId, RequestId)`.
///
/// A slot is created by whichever side asks first: the submitter subscribing
/// or the dispatcher delivering a reply. Replies delivered before the
/// subscription are buffered in the slot.
#[derive(Default)]
pub struct ReplyBus {
    slots: Mutex<HashMap<BusKey, Slot>>,
}

impl ReplyBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the receiving end for `request_id` in `group_id`.
    ///
    /// Returns `None` when another caller already subscribed.
    pub fn subscribe(
        &self,
        group_id: GroupId,
        request_id: &str,
    ) -> Option<mpsc::UnboundedReceiver<ReplyDocument>> {
        self.slots
            .lock()
            .entry((group_id, request_id.to_string()))
            .or_insert_with(Slot::new)
            .rx
            .take()
    }

    /// Hand a committed reply to whoever waits for it.
    pub fn deliver(&self, group_id: GroupId, reply: ReplyDocument) {
        let mut slots = self.slots.lock();
        let slot = slots
            .entry((group_id, reply.request_id.clone()))
            .or_insert_with(Slot::new);
        if slot.tx.send(reply).is_err() {
            tracing::trace!(group_id, "reply dropped, waiter already gone");
        }
    }

    /// Drop the slot of a served or abandoned request.
    pub fn release(&self, group_id: GroupId, request_id: &str) {
        self.slots.lock().remove(&(group_id, request_id.to_string()));
    }

    /// Drop slots nobody subscribed to within `ttl`, and slots whose
    /// subscriber went away. Returns how many were dropped.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| {
            let unclaimed = slot.rx.is_some() && slot.created_at.elapsed() >= ttl;
            !unclaimed && !slot.tx.is_closed()
        });
        before - slots.len()
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the bus holds no slot.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
