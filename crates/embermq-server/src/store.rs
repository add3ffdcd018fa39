//! Process-wide message store.
//!
//! Every published payload lives here exactly once, wrapped in an
//! `Rc<StoredMessage>`. The store's index holds one reference; each
//! session queue entry and each retained slot holds a clone, so the
//! strong count *is* the reference count and a message is unreachable
//! exactly when only the index still points at it. `compact` sweeps
//! those.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use ahash::AHashSet;
use bytes::Bytes;

use embermq_core::packet::{PublishProperties, QoS};

/// An immutable message as accepted from a publisher (or synthesized
/// from a will).
#[derive(Debug)]
pub struct StoredMessage {
    /// Monotone identifier assigned at insertion, unique for the process
    /// lifetime.
    pub db_id: u64,
    pub topic: String,
    pub payload: Bytes,
    /// Originating QoS; each recipient's delivery QoS is capped by its
    /// subscription and session.
    pub qos: QoS,
    pub retain: bool,
    /// Publisher identity, kept for ACL rechecks on session takeover.
    pub source_id: String,
    pub source_username: Option<String>,
    /// The publisher's packet identifier (0 for QoS 0), used to match
    /// inbound QoS 2 retransmissions.
    pub source_mid: u16,
    pub properties: Option<PublishProperties>,
    /// Absolute wall time in seconds; 0 means no expiry.
    pub expiry_time: u64,
    /// Client ids this message has already been targeted at, for
    /// duplicate-delivery suppression across overlapping subscriptions.
    dest_ids: RefCell<AHashSet<String>>,
}

impl StoredMessage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        source_id: String,
        source_username: Option<String>,
        source_mid: u16,
        properties: Option<PublishProperties>,
        expiry_time: u64,
    ) -> Self {
        Self {
            db_id: 0,
            topic,
            payload,
            qos,
            retain,
            source_id,
            source_username,
            source_mid,
            properties,
            expiry_time,
            dest_ids: RefCell::new(AHashSet::new()),
        }
    }

    #[inline]
    pub fn is_expired(&self, now_wall: u64) -> bool {
        self.expiry_time != 0 && now_wall > self.expiry_time
    }

    /// Seconds of expiry interval left, for re-encoding the property on
    /// delivery. `None` when the message never expires.
    pub fn remaining_expiry(&self, now_wall: u64) -> Option<u32> {
        if self.expiry_time == 0 {
            None
        } else {
            Some(self.expiry_time.saturating_sub(now_wall) as u32)
        }
    }

    pub fn already_sent_to(&self, client_id: &str) -> bool {
        self.dest_ids.borrow().contains(client_id)
    }

    pub fn mark_sent_to(&self, client_id: &str) {
        self.dest_ids.borrow_mut().insert(client_id.to_string());
    }
}

/// The store itself: `db_id` → message, enumerable in insertion order.
#[derive(Default)]
pub struct MessageStore {
    messages: BTreeMap<u64, Rc<StoredMessage>>,
    last_db_id: u64,
    bytes: usize,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message, assigning its `db_id`. The returned `Rc` is the
    /// caller's reference; the store keeps its own.
    pub fn insert(&mut self, mut msg: StoredMessage) -> Rc<StoredMessage> {
        self.last_db_id += 1;
        msg.db_id = self.last_db_id;
        self.bytes += msg.payload.len();
        let msg = Rc::new(msg);
        self.messages.insert(msg.db_id, Rc::clone(&msg));
        msg
    }

    /// Drop every entry no queue or retained slot references any more.
    /// Returns how many were freed.
    pub fn compact(&mut self) -> usize {
        let before = self.messages.len();
        let mut freed_bytes = 0usize;
        self.messages.retain(|_, msg| {
            if Rc::strong_count(msg) > 1 {
                true
            } else {
                freed_bytes += msg.payload.len();
                false
            }
        });
        self.bytes -= freed_bytes;
        before - self.messages.len()
    }

    /// Number of live references to `msg` outside the store.
    pub fn ref_count(msg: &Rc<StoredMessage>) -> usize {
        Rc::strong_count(msg) - 1
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, payload: &[u8]) -> StoredMessage {
        StoredMessage::new(
            topic.into(),
            Bytes::copy_from_slice(payload),
            QoS::AtLeastOnce,
            false,
            "src".into(),
            None,
            1,
            None,
            0,
        )
    }

    #[test]
    fn test_insert_assigns_monotone_ids() {
        let mut store = MessageStore::new();
        let a = store.insert(message("a", b"1"));
        let b = store.insert(message("b", b"22"));
        assert!(b.db_id > a.db_id);
        assert_eq!(store.len(), 2);
        assert_eq!(store.bytes(), 3);
    }

    #[test]
    fn test_compact_frees_unreferenced() {
        let mut store = MessageStore::new();
        let keep = store.insert(message("keep", b"xx"));
        {
            let _drop = store.insert(message("drop", b"yyy"));
        }
        assert_eq!(store.len(), 2);
        assert_eq!(store.compact(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.bytes(), 2);
        assert_eq!(MessageStore::ref_count(&keep), 1);
    }

    #[test]
    fn test_ref_count_tracks_holders() {
        let mut store = MessageStore::new();
        let a = store.insert(message("a", b"1"));
        assert_eq!(MessageStore::ref_count(&a), 1);
        let b = Rc::clone(&a);
        assert_eq!(MessageStore::ref_count(&a), 2);
        drop(b);
        assert_eq!(MessageStore::ref_count(&a), 1);
        drop(a);
        assert_eq!(store.compact(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_expiry() {
        let mut msg = message("t", b"p");
        msg.expiry_time = 100;
        assert!(!msg.is_expired(100));
        assert!(msg.is_expired(101));
        assert_eq!(msg.remaining_expiry(40), Some(60));

        let never = message("t", b"p");
        assert!(!never.is_expired(u64::MAX));
        assert_eq!(never.remaining_expiry(40), None);
    }

    #[test]
    fn test_dest_ids() {
        let msg = message("t", b"p");
        assert!(!msg.already_sent_to("a"));
        msg.mark_sent_to("a");
        assert!(msg.already_sent_to("a"));
        assert!(!msg.already_sent_to("b"));
    }
}
