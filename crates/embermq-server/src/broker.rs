//! The broker context: session table, subscription trie, message store
//! and the delivery scheduler, grouped into one value so tests can
//! construct isolated instances.
//!
//! Everything here runs on the event-loop thread. The broker never
//! touches a socket; inbound packets arrive through `handle_packet` and
//! outbound bytes accumulate in each session's write buffer for the
//! loop to flush.

use std::rc::Rc;

use ahash::AHashMap;
use log::{info, warn};

use embermq_core::error::{Error, ProtocolError, Result};
use embermq_core::packet::{Ack, Packet, QoS};

use crate::auth::{Access, AllowAll, AuthProvider};
use crate::config::Config;
use crate::handlers;
use crate::metrics::BrokerMetrics;
use crate::platform::{Platform, SystemPlatform};
use crate::queue::{self, InsertOutcome};
use crate::session::{Direction, MsgState, Session, SessionId, SessionState};
use crate::store::{MessageStore, StoredMessage};
use crate::subscription::{Subscriber, SubscriptionTrie};
use crate::will::PendingWill;

pub struct Broker {
    pub cfg: Config,
    pub platform: Box<dyn Platform>,
    pub auth: Box<dyn AuthProvider>,
    pub sessions: AHashMap<SessionId, Session>,
    pub(crate) by_client_id: AHashMap<String, SessionId>,
    next_session_id: SessionId,
    pub store: MessageStore,
    pub subs: SubscriptionTrie,
    pub metrics: BrokerMetrics,
    /// Reusable fanout scratch.
    recipients: Vec<Subscriber>,
}

impl Broker {
    pub fn new(cfg: Config, auth: Box<dyn AuthProvider>, platform: Box<dyn Platform>) -> Self {
        Self {
            cfg,
            platform,
            auth,
            sessions: AHashMap::new(),
            by_client_id: AHashMap::new(),
            next_session_id: 0,
            store: MessageStore::new(),
            subs: SubscriptionTrie::new(),
            metrics: BrokerMetrics::new(),
            recipients: Vec::with_capacity(64),
        }
    }

    /// Broker with anonymous auth and the system clock.
    pub fn with_defaults(cfg: Config) -> Self {
        Self::new(cfg, Box::new(AllowAll), Box::new(SystemPlatform::new()))
    }

    pub fn now_mono(&self) -> u64 {
        self.platform.now_mono()
    }

    pub fn now_wall(&self) -> u64 {
        self.platform.now_wall()
    }

    /// Register a freshly accepted connection.
    pub fn create_session(&mut self) -> SessionId {
        self.next_session_id += 1;
        let id = self.next_session_id;
        let session = Session::new(id, self.cfg.limits.max_inflight_messages, self.now_mono());
        self.sessions.insert(id, session);
        self.metrics.clients_connected += 1;
        id
    }

    pub fn session(&self, sid: SessionId) -> Result<&Session> {
        self.sessions.get(&sid).ok_or(Error::NotFound)
    }

    pub fn session_mut(&mut self, sid: SessionId) -> Result<&mut Session> {
        self.sessions.get_mut(&sid).ok_or(Error::NotFound)
    }

    /// Should the event loop flush and close this connection?
    pub fn session_should_close(&self, sid: SessionId) -> bool {
        match self.sessions.get(&sid) {
            None => true,
            Some(s) => matches!(
                s.state,
                SessionState::Duplicate | SessionState::Disconnecting
            ),
        }
    }

    /// Dispatch one decoded packet from a connection.
    pub fn handle_packet(&mut self, sid: SessionId, packet: Packet) -> Result<()> {
        self.metrics.msgs_received += 1;
        let now_mono = self.now_mono();
        let session = self.session_mut(sid)?;
        session.record_activity(now_mono);
        let state = session.state;

        match packet {
            Packet::Connect(connect) => handlers::connect::handle_connect(self, sid, connect),
            Packet::Auth(auth) => handlers::connect::handle_auth(self, sid, auth),
            _ if state == SessionState::New => Err(ProtocolError::FirstPacketNotConnect.into()),
            _ if state != SessionState::Active => {
                Err(ProtocolError::UnexpectedPacket("packet during authentication").into())
            }
            Packet::Publish(publish) => handlers::publish::handle_publish(self, sid, publish),
            Packet::Puback(ack) => handlers::qos::handle_puback(self, sid, ack),
            Packet::Pubrec(ack) => handlers::qos::handle_pubrec(self, sid, ack),
            Packet::Pubrel(ack) => handlers::qos::handle_pubrel(self, sid, ack),
            Packet::Pubcomp(ack) => handlers::qos::handle_pubcomp(self, sid, ack),
            Packet::Subscribe(sub) => handlers::subscribe::handle_subscribe(self, sid, sub),
            Packet::Unsubscribe(unsub) => handlers::subscribe::handle_unsubscribe(self, sid, unsub),
            Packet::Pingreq => {
                let session = self.session_mut(sid)?;
                session.send_packet(&Packet::Pingresp)?;
                self.metrics.msgs_sent += 1;
                Ok(())
            }
            Packet::Disconnect(disconnect) => {
                handlers::disconnect::handle_disconnect(self, sid, disconnect)
            }
            Packet::Connack(_) | Packet::Suback(_) | Packet::Unsuback(_) | Packet::Pingresp => {
                Err(ProtocolError::UnexpectedPacket("server-side packet from client").into())
            }
        }
    }

    /// Fan a stored message out to every matching subscriber. Returns
    /// how many sessions accepted it (in flight or queued).
    pub(crate) fn route_stored(
        &mut self,
        source: Option<SessionId>,
        stored: &Rc<StoredMessage>,
    ) -> usize {
        let mut recipients = std::mem::take(&mut self.recipients);
        self.subs.collect(&stored.topic, &mut recipients);
        let now_mono = self.now_mono();
        let now_wall = self.now_wall();

        let mut delivered = 0;
        for sub in recipients.drain(..) {
            if sub.options.no_local && Some(sub.session) == source {
                continue;
            }
            // Stale leaves can linger briefly after a session is freed.
            let Some(session) = self.sessions.get_mut(&sub.session) else {
                continue;
            };
            let qos = stored.qos.min(sub.qos);
            // Live deliveries clear the retain flag unless the
            // subscription asked for retain-as-published; a message
            // queued for an offline session keeps it, since the client
            // sees it the way it would see a retained catch-up.
            let retain_out = if session.connected {
                sub.options.retain_as_published && stored.retain
            } else {
                stored.retain
            };
            let mid = if qos != QoS::AtMostOnce {
                session.next_mid()
            } else {
                0
            };
            match queue::message_insert(
                &self.cfg,
                &mut self.metrics,
                session,
                mid,
                Direction::Out,
                qos,
                retain_out,
                Rc::clone(stored),
                sub.subscription_id,
                true,
                now_mono,
                now_wall,
            ) {
                Ok(InsertOutcome::Inserted | InsertOutcome::Queued) => delivered += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "client {}: delivery failed, closing: {}",
                        session.client_id, e
                    );
                    session.state = SessionState::Disconnecting;
                }
            }
        }
        self.recipients = recipients;
        delivered
    }

    /// Publish a will through the normal publish path.
    pub(crate) fn publish_will(
        &mut self,
        source_id: String,
        source_username: Option<String>,
        will: PendingWill,
    ) -> Result<()> {
        if !self.auth.acl_check(
            &source_id,
            source_username.as_deref(),
            &will.topic,
            &will.payload,
            will.qos,
            will.retain,
            Access::Write,
        ) {
            info!("will for client {} denied by ACL", source_id);
            return Ok(());
        }

        let now_wall = self.now_wall();
        let retain = will.retain && self.cfg.mqtt.retain_available;
        let expiry_time = will
            .message_expiry_interval
            .map(|i| now_wall + i as u64)
            .unwrap_or(0);
        let msg = StoredMessage::new(
            will.topic,
            will.payload,
            will.qos,
            retain,
            source_id,
            source_username,
            0,
            will.properties,
            expiry_time,
        );
        let stored = self.store.insert(msg);
        if retain {
            if stored.payload.is_empty() {
                self.subs.clear_retained(&stored.topic);
            } else {
                self.subs.set_retained(&stored.topic, Rc::clone(&stored));
            }
        }
        self.route_stored(None, &stored);
        Ok(())
    }

    /// Run the per-session write cycle: pending in-flight, then promote
    /// queued into the window, then pending in-flight again.
    pub fn drain(&mut self, sid: SessionId) -> Result<()> {
        let now_mono = self.now_mono();
        let now_wall = self.now_wall();
        let Some(session) = self.sessions.get_mut(&sid) else {
            return Ok(());
        };
        if session.state != SessionState::Active || !session.connected {
            return Ok(());
        }
        queue::write_inflight_out_all(&mut self.metrics, session, now_mono, now_wall)?;
        queue::write_queued_out(session, now_mono);
        queue::write_inflight_out_all(&mut self.metrics, session, now_mono, now_wall)?;
        queue::write_queued_in(session, now_mono)?;
        Ok(())
    }

    /// The connection's socket is gone (error, EOF, keepalive timeout).
    /// Abnormal closure: the will is activated.
    pub fn connection_closed(&mut self, sid: SessionId) {
        let Some(session) = self.sessions.get(&sid) else {
            return;
        };
        if !session.connected {
            return;
        }
        self.finish_disconnect(sid, true);
    }

    /// Common teardown for every way a connection ends. `activate_will`
    /// distinguishes abnormal closure (and DISCONNECT-with-will) from a
    /// graceful DISCONNECT.
    pub(crate) fn finish_disconnect(&mut self, sid: SessionId, activate_will: bool) {
        let now_wall = self.now_wall();
        let Some(session) = self.sessions.get_mut(&sid) else {
            return;
        };

        if session.connected {
            session.connected = false;
            self.metrics.clients_connected = self.metrics.clients_connected.saturating_sub(1);
        }

        let expiry = session.session_expiry_interval;
        let discard = session.clean_start && !session.protocol.is_v5()
            || session.protocol.is_v5() && expiry == 0
            || session.state == SessionState::Duplicate
            || session.state == SessionState::New
            || session.state == SessionState::Authenticating;

        let mut fire_will = None;
        if !activate_will {
            session.will = None;
            session.will_due_at = None;
        } else if let Some(will) = session.will.take() {
            if will.delay_interval > 0 && !discard {
                // Delayed will: due at the delay, or at session expiry,
                // whichever comes first.
                let delay = (will.delay_interval as u64).min(if expiry == u32::MAX {
                    u64::MAX - now_wall
                } else {
                    expiry as u64
                });
                session.will_due_at = Some(now_wall + delay);
                session.will = Some(will);
            } else {
                fire_will = Some((session.client_id.clone(), session.username.clone(), will));
            }
        }

        if discard {
            self.remove_session(sid);
        } else {
            let session = self.sessions.get_mut(&sid).expect("session still present");
            session.state = SessionState::Disconnected;
            session.aliases_in.clear();
            session.expire_at = if expiry == u32::MAX {
                None
            } else {
                Some(now_wall + expiry as u64)
            };
        }

        if let Some((client_id, username, will)) = fire_will {
            if let Err(e) = self.publish_will(client_id, username, will) {
                warn!("failed to publish will: {}", e);
            }
        }
    }

    /// Remove a session completely: leaves, queues, identity.
    pub(crate) fn remove_session(&mut self, sid: SessionId) {
        let Some(session) = self.sessions.remove(&sid) else {
            return;
        };
        if session.connected {
            self.metrics.clients_connected = self.metrics.clients_connected.saturating_sub(1);
        }
        for filter in &session.subscriptions {
            self.subs.unsubscribe(filter, sid);
        }
        if self.by_client_id.get(&session.client_id) == Some(&sid) {
            self.by_client_id.remove(&session.client_id);
        }
        // Dropping the session drops its queue entries, returning their
        // store references.
    }

    /// Periodic work: keepalive enforcement, delayed wills, session
    /// expiry, the scheduler pass, and store compaction.
    pub fn tick(&mut self) {
        let now_mono = self.now_mono();
        let now_wall = self.now_wall();

        let timed_out: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.keepalive_expired(now_mono))
            .map(|s| s.id)
            .collect();
        for sid in timed_out {
            if let Some(session) = self.sessions.get_mut(&sid) {
                info!(
                    "client {} exceeded keepalive, disconnecting",
                    session.client_id
                );
                session.state = SessionState::Disconnecting;
            }
            self.connection_closed(sid);
        }

        let wills_due: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.will_due_at.is_some_and(|due| due <= now_wall))
            .map(|s| s.id)
            .collect();
        for sid in wills_due {
            let Some(session) = self.sessions.get_mut(&sid) else {
                continue;
            };
            session.will_due_at = None;
            if let Some(will) = session.will.take() {
                let client_id = session.client_id.clone();
                let username = session.username.clone();
                if let Err(e) = self.publish_will(client_id, username, will) {
                    warn!("failed to publish delayed will: {}", e);
                }
            }
        }

        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| !s.connected && s.expire_at.is_some_and(|at| at <= now_wall))
            .map(|s| s.id)
            .collect();
        for sid in expired {
            if let Some(session) = self.sessions.get_mut(&sid) {
                info!("expiring session for client {}", session.client_id);
                // An unfired will goes out no later than session expiry.
                if let Some(will) = session.will.take() {
                    let client_id = session.client_id.clone();
                    let username = session.username.clone();
                    if let Err(e) = self.publish_will(client_id, username, will) {
                        warn!("failed to publish will at session expiry: {}", e);
                    }
                }
            }
            self.remove_session(sid);
            self.metrics.clients_expired += 1;
        }

        let active: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.connected && s.state == SessionState::Active)
            .map(|s| s.id)
            .collect();
        for sid in active {
            if let Err(e) = self.drain(sid) {
                if let Some(session) = self.sessions.get_mut(&sid) {
                    warn!("client {}: write cycle failed: {}", session.client_id, e);
                    session.state = SessionState::Disconnecting;
                }
            }
        }

        self.store.compact();
        self.metrics.store_count = self.store.len() as u64;
        self.metrics.store_bytes = self.store.bytes() as u64;
    }

    /// Drain a session's buffered output. Test support; the event loop
    /// flushes buffers straight to sockets.
    pub fn take_output(&mut self, sid: SessionId) -> Vec<u8> {
        match self.sessions.get_mut(&sid) {
            Some(session) => session.out.drain_all(),
            None => Vec::new(),
        }
    }

    /// Send a v5 DISCONNECT carrying `reason` if the session speaks v5;
    /// 3.x clients are closed silently.
    pub fn send_disconnect_reason(&mut self, sid: SessionId, reason: u8) {
        if let Some(session) = self.sessions.get_mut(&sid) {
            if session.protocol.is_v5() && session.connected && !session.disconnect_sent {
                session.disconnect_sent = true;
                let _ = session.send_packet(&Packet::Disconnect(
                    embermq_core::packet::Disconnect {
                        reason_code: reason,
                        session_expiry_interval: None,
                    },
                ));
            }
        }
    }

    /// PUBREL helper shared by the qos handlers: ack an inbound QoS 2
    /// release, routing the message exactly once.
    pub(crate) fn release_incoming(&mut self, sid: SessionId, mid: u16) -> Result<()> {
        let now_mono = self.now_mono();

        let session = self.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
        let idx = session
            .msgs_in
            .inflight
            .iter()
            .position(|m| m.mid == mid && m.state == MsgState::WaitForPubrel);

        match idx {
            Some(idx) => {
                let entry = session.msgs_in.remove_inflight(idx);
                self.route_stored(Some(sid), &entry.store);
                self.metrics.msgs_sent += 1;
                let session = self.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
                session.send_packet(&Packet::Pubcomp(Ack::new(mid)))?;
                queue::write_queued_in(session, now_mono)?;
            }
            None => {
                let rc = if session.protocol.is_v5() {
                    embermq_core::packet::reason_code::PACKET_IDENTIFIER_NOT_FOUND
                } else {
                    0
                };
                session.send_packet(&Packet::Pubcomp(Ack {
                    packet_id: mid,
                    reason_code: rc,
                }))?;
                self.metrics.msgs_sent += 1;
            }
        }
        Ok(())
    }
}
