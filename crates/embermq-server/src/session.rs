//! Per-client session state.
//!
//! A session exists from accept until disconnect, and past disconnect
//! for as long as its expiry interval keeps it alive. It owns the two
//! message-data blocks (inbound and outbound), each split into an
//! in-flight window and an overflow queue, plus the identity and
//! flow-control fields negotiated at CONNECT.

use std::collections::VecDeque;
use std::rc::Rc;

use ahash::AHashMap;

use embermq_core::error::{Error, Result};
use embermq_core::packet::{encode_packet, Packet, Protocol, QoS};

use crate::store::StoredMessage;
use crate::will::PendingWill;
use crate::write_buffer::WriteBuffer;

/// Broker-assigned connection key. Stable for the life of the session,
/// including across the disconnected-but-persistent phase; a takeover
/// moves state to the new key.
pub type SessionId = u64;

/// Connection-level lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket accepted, CONNECT not yet seen.
    New,
    /// CONNECT seen, v5 extended auth in progress.
    Authenticating,
    /// CONNACK sent, normal traffic.
    Active,
    /// Displaced by a takeover; about to be torn down.
    Duplicate,
    /// Close requested, pending cleanup.
    Disconnecting,
    /// Socket gone, state retained until session expiry.
    Disconnected,
}

/// Message direction relative to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Per-message QoS state. Invalid transitions are unrepresentable: each
/// handler matches on exactly the states its packet may arrive in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgState {
    /// Waiting for in-flight window space.
    Queued,
    /// Outbound, ready to emit PUBLISH.
    PublishQos0,
    PublishQos1,
    PublishQos2,
    /// Outbound QoS 1, PUBLISH emitted.
    WaitForPuback,
    /// Outbound QoS 2, PUBLISH emitted.
    WaitForPubrec,
    /// Outbound QoS 2 after reconnect: the PUBREL must be repeated.
    ResendPubrel,
    /// Outbound QoS 2, PUBREL emitted.
    WaitForPubcomp,
    /// Inbound QoS 2, ready to emit PUBREC.
    SendPubrec,
    /// Inbound QoS 2, PUBREC emitted.
    WaitForPubrel,
}

impl MsgState {
    /// The "ready to emit PUBLISH" state for an outbound QoS.
    pub fn publish_for(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => MsgState::PublishQos0,
            QoS::AtLeastOnce => MsgState::PublishQos1,
            QoS::ExactlyOnce => MsgState::PublishQos2,
        }
    }

    /// Is this one of the publish-pending states?
    pub fn is_publish(self) -> bool {
        matches!(
            self,
            MsgState::PublishQos0 | MsgState::PublishQos1 | MsgState::PublishQos2
        )
    }
}

/// One message referenced by one session in one direction.
#[derive(Debug, Clone)]
pub struct ClientMsg {
    pub store: Rc<StoredMessage>,
    /// Packet identifier; 0 for QoS 0.
    pub mid: u16,
    /// Effective delivery QoS for this recipient.
    pub qos: QoS,
    pub state: MsgState,
    pub direction: Direction,
    pub dup: bool,
    pub retain: bool,
    /// Monotonic seconds of the last state transition.
    pub timestamp: u64,
    /// Recipient-specific v5 subscription identifier.
    pub subscription_id: Option<u32>,
}

/// One direction's in-flight window and overflow queue, with the
/// accounting totals the admission tests run on.
#[derive(Debug, Default)]
pub struct MsgData {
    pub inflight: VecDeque<ClientMsg>,
    pub queued: VecDeque<ClientMsg>,
    /// Window size cap; 0 = unlimited.
    pub inflight_maximum: u16,
    /// Remaining window slots for QoS>0 traffic.
    pub inflight_quota: u16,
    /// Messages across both lists.
    pub msg_count: usize,
    /// Payload bytes across both lists.
    pub msg_bytes: usize,
    /// QoS 1/2 messages across both lists.
    pub msg_count12: usize,
    /// QoS 1/2 payload bytes across both lists.
    pub msg_bytes12: usize,
}

impl MsgData {
    pub fn new(inflight_maximum: u16) -> Self {
        Self {
            inflight_maximum,
            inflight_quota: inflight_maximum,
            ..Default::default()
        }
    }

    /// Change the window cap before any traffic has been admitted.
    pub fn set_maximum(&mut self, maximum: u16) {
        self.inflight_maximum = maximum;
        self.inflight_quota = maximum;
    }

    fn account_add(&mut self, msg: &ClientMsg) {
        self.msg_count += 1;
        self.msg_bytes += msg.store.payload.len();
        if msg.qos != QoS::AtMostOnce {
            self.msg_count12 += 1;
            self.msg_bytes12 += msg.store.payload.len();
        }
    }

    fn account_remove(&mut self, msg: &ClientMsg) {
        self.msg_count -= 1;
        self.msg_bytes -= msg.store.payload.len();
        if msg.qos != QoS::AtMostOnce {
            self.msg_count12 -= 1;
            self.msg_bytes12 -= msg.store.payload.len();
        }
    }

    fn consume_quota(&mut self) {
        if self.inflight_maximum != 0 && self.inflight_quota > 0 {
            self.inflight_quota -= 1;
        }
    }

    fn release_quota(&mut self) {
        if self.inflight_maximum != 0 && self.inflight_quota < self.inflight_maximum {
            self.inflight_quota += 1;
        }
    }

    /// Admit a message straight into the in-flight window.
    pub fn push_inflight(&mut self, msg: ClientMsg) {
        self.account_add(&msg);
        if msg.qos != QoS::AtMostOnce {
            self.consume_quota();
        }
        self.inflight.push_back(msg);
    }

    /// Admit a message to the overflow queue.
    pub fn push_queued(&mut self, msg: ClientMsg) {
        self.account_add(&msg);
        self.queued.push_back(msg);
    }

    /// Remove an in-flight entry, releasing its window slot.
    pub fn remove_inflight(&mut self, idx: usize) -> ClientMsg {
        let msg = self.inflight.remove(idx).expect("inflight index in range");
        self.account_remove(&msg);
        if msg.qos != QoS::AtMostOnce {
            self.release_quota();
        }
        msg
    }

    pub fn remove_queued(&mut self, idx: usize) -> ClientMsg {
        let msg = self.queued.remove(idx).expect("queued index in range");
        self.account_remove(&msg);
        msg
    }

    /// Move the head of the queue into the in-flight window. The caller
    /// has already set the entry's state and timestamp.
    pub fn dequeue_first(&mut self) {
        if let Some(msg) = self.queued.pop_front() {
            if msg.qos != QoS::AtMostOnce {
                self.consume_quota();
            }
            self.inflight.push_back(msg);
        }
    }

    /// Recompute totals and quota from the lists. Used after a takeover
    /// moves the block wholesale.
    pub fn recount(&mut self) {
        self.msg_count = 0;
        self.msg_bytes = 0;
        self.msg_count12 = 0;
        self.msg_bytes12 = 0;
        self.inflight_quota = self.inflight_maximum;
        let mut inflight12 = 0u16;
        for msg in self.inflight.iter().chain(self.queued.iter()) {
            self.msg_count += 1;
            self.msg_bytes += msg.store.payload.len();
            if msg.qos != QoS::AtMostOnce {
                self.msg_count12 += 1;
                self.msg_bytes12 += msg.store.payload.len();
            }
        }
        for msg in self.inflight.iter() {
            if msg.qos != QoS::AtMostOnce {
                inflight12 += 1;
            }
        }
        if self.inflight_maximum != 0 {
            self.inflight_quota = self.inflight_maximum.saturating_sub(inflight12);
        }
    }

    /// Drop everything, releasing the message-store references.
    pub fn clear(&mut self) {
        self.inflight.clear();
        self.queued.clear();
        self.msg_count = 0;
        self.msg_bytes = 0;
        self.msg_count12 = 0;
        self.msg_bytes12 = 0;
        self.inflight_quota = self.inflight_maximum;
    }
}

/// Per-client session.
pub struct Session {
    pub id: SessionId,
    /// Empty until CONNECT is accepted.
    pub client_id: String,
    pub protocol: Protocol,
    pub state: SessionState,
    pub clean_start: bool,
    /// Seconds; `u32::MAX` means "until explicit cleanup" (the v3.x
    /// `clean_start=false` mapping).
    pub session_expiry_interval: u32,
    /// Negotiated keepalive, seconds; 0 = disabled.
    pub keep_alive: u16,
    pub max_qos: QoS,
    /// Filters this session holds subscription leaves for. The trie owns
    /// the leaves; these handles are what teardown walks.
    pub subscriptions: Vec<String>,
    pub msgs_in: MsgData,
    pub msgs_out: MsgData,
    pub will: Option<PendingWill>,
    /// Wall time at which a delayed will fires, when scheduled.
    pub will_due_at: Option<u64>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub auth_method: Option<String>,
    /// Last packet identifier assigned outbound.
    last_mid: u16,
    /// Set while this session is in the backpressure "dropping" state;
    /// the transition into it is logged once.
    pub is_dropping: bool,
    /// The broker generated this session's client id.
    pub assigned_id: bool,
    pub is_bridge: bool,
    /// Peer's stated maximum packet size; 0 = no limit.
    pub max_packet_size: u32,
    /// Inbound topic aliases established by the peer (v5).
    pub aliases_in: AHashMap<u16, String>,
    /// Encoded outbound bytes awaiting the socket.
    pub out: WriteBuffer,
    /// Socket presence. Distinct from `state`: a session in
    /// `Disconnected` keeps queueing with zero in-flight allowance.
    pub connected: bool,
    /// A terminal DISCONNECT has been queued; suppress further ones.
    pub disconnect_sent: bool,
    /// Monotonic seconds of last inbound activity, for keepalive.
    pub last_activity: u64,
    /// Wall time at which this disconnected session's state is dropped.
    /// `None` while connected or when expiry is "never".
    pub expire_at: Option<u64>,
}

impl Session {
    pub fn new(id: SessionId, max_inflight: u16, now_mono: u64) -> Self {
        Self {
            id,
            client_id: String::new(),
            protocol: Protocol::V311,
            state: SessionState::New,
            clean_start: true,
            session_expiry_interval: 0,
            keep_alive: 0,
            max_qos: QoS::ExactlyOnce,
            subscriptions: Vec::new(),
            msgs_in: MsgData::new(max_inflight),
            msgs_out: MsgData::new(max_inflight),
            will: None,
            will_due_at: None,
            username: None,
            password: None,
            auth_method: None,
            last_mid: 0,
            is_dropping: false,
            assigned_id: false,
            is_bridge: false,
            max_packet_size: 0,
            aliases_in: AHashMap::new(),
            out: WriteBuffer::new(),
            connected: true,
            disconnect_sent: false,
            last_activity: now_mono,
            expire_at: None,
        }
    }

    /// Allocate the next outbound packet identifier, wrapping past
    /// 65535 and skipping 0.
    pub fn next_mid(&mut self) -> u16 {
        self.last_mid = if self.last_mid == 65_535 {
            1
        } else {
            self.last_mid + 1
        };
        self.last_mid
    }

    pub fn last_mid(&self) -> u16 {
        self.last_mid
    }

    pub fn set_last_mid(&mut self, mid: u16) {
        self.last_mid = mid;
    }

    /// Encode and buffer a packet, enforcing the peer's maximum packet
    /// size. Bypasses the soft limit: protocol packets must not be
    /// dropped for backpressure.
    pub fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let mut buf = Vec::new();
        encode_packet(packet, &mut buf);
        if self.max_packet_size != 0 && buf.len() > self.max_packet_size as usize {
            return Err(Error::OversizePacket {
                size: buf.len(),
                max: self.max_packet_size as usize,
            });
        }
        self.out.push(&buf)?;
        Ok(())
    }

    /// May a publish be scheduled into the write buffer right now?
    pub fn can_write_publish(&self) -> bool {
        self.connected && self.out.writable()
    }

    /// Locate an inbound QoS 2 message by the publisher's packet id.
    /// The scan window is bounded by `inflight_maximum`.
    pub fn find_inbound_by_source_mid(&self, mid: u16) -> Option<&ClientMsg> {
        self.msgs_in
            .inflight
            .iter()
            .chain(self.msgs_in.queued.iter())
            .find(|m| m.store.source_mid == mid)
    }

    pub fn record_activity(&mut self, now_mono: u64) {
        self.last_activity = now_mono;
    }

    /// Has the keepalive allowance (1.5x) been exceeded?
    pub fn keepalive_expired(&self, now_mono: u64) -> bool {
        self.keep_alive != 0
            && self.connected
            && now_mono.saturating_sub(self.last_activity) > self.keep_alive as u64 * 3 / 2
    }
}
