//! Per-session message queueing, flow control and write scheduling.
//!
//! A message offered to a session lands in one of three places: the
//! in-flight window (emitted immediately), the overflow queue (window
//! full, queue has room), or nowhere (dropped, counted, and logged once
//! per transition into the dropping state). Window space freed by an
//! ack, a drop or an expiry pulls the head of the queue forward.

use std::rc::Rc;

use log::{debug, info};

use embermq_core::error::{Error, ProtocolError, Result};
use embermq_core::packet::{Ack, Packet, Publish, PublishProperties, QoS};

use crate::config::Config;
use crate::metrics::BrokerMetrics;
use crate::session::{ClientMsg, Direction, MsgState, Session};
use crate::store::StoredMessage;

/// Where an offered message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Admitted to the in-flight window.
    Inserted,
    /// Admitted to the overflow queue.
    Queued,
    /// Rejected by the admission tests.
    Dropped,
    /// Skipped: this client already received the message through an
    /// overlapping subscription.
    Suppressed,
}

fn flight_ready(cfg: &Config, msgs: &crate::session::MsgData, qos: QoS) -> bool {
    let limits = &cfg.limits;

    if msgs.inflight_maximum == 0 && limits.max_inflight_bytes == 0 {
        return true;
    }

    if qos == QoS::AtMostOnce {
        // QoS 0 is either in flight or dropped; there is no queueing
        // option for a connected client.
        if limits.max_queued_messages == 0 && limits.max_inflight_bytes == 0 {
            return true;
        }
        let valid_bytes = (msgs.msg_bytes as isize - limits.max_inflight_bytes as isize)
            < limits.max_queued_bytes as isize;
        let valid_count = (msgs.msg_count as isize - msgs.inflight_maximum as isize)
            < limits.max_queued_messages as isize;

        if limits.max_queued_messages == 0 {
            return valid_bytes;
        }
        if limits.max_queued_bytes == 0 {
            return valid_count;
        }
        valid_bytes && valid_count
    } else {
        let valid_bytes = (msgs.msg_bytes12 as isize) < limits.max_inflight_bytes as isize;
        let valid_count = msgs.inflight_quota > 0;

        if msgs.inflight_maximum == 0 {
            return valid_bytes;
        }
        if limits.max_inflight_bytes == 0 {
            return valid_count;
        }
        valid_bytes && valid_count
    }
}

fn queue_ready(cfg: &Config, msgs: &crate::session::MsgData, connected: bool, qos: QoS) -> bool {
    let limits = &cfg.limits;

    if limits.max_queued_messages == 0 && limits.max_queued_bytes == 0 {
        return true;
    }
    // QoS 0 only queues for offline sessions, and only when enabled;
    // the connected case was already decided by the flight test.
    if qos == QoS::AtMostOnce && !limits.queue_qos0_messages {
        return false;
    }

    // An offline session has nothing in flight, so the whole allowance
    // counts against the queue caps.
    let (adjust_bytes, adjust_count) = if connected {
        (
            limits.max_inflight_bytes as isize,
            msgs.inflight_maximum as isize,
        )
    } else {
        (0, 0)
    };

    let valid_bytes = (msgs.msg_bytes as isize - adjust_bytes) < limits.max_queued_bytes as isize;
    let valid_count = (msgs.msg_count as isize - adjust_count) < limits.max_queued_messages as isize;

    if limits.max_queued_bytes == 0 {
        return valid_count;
    }
    if limits.max_queued_messages == 0 {
        return valid_bytes;
    }
    valid_bytes && valid_count
}

/// May this message enter the in-flight window right now?
pub fn ready_for_flight(cfg: &Config, session: &Session, dir: Direction, qos: QoS) -> bool {
    let msgs = match dir {
        Direction::Out => &session.msgs_out,
        Direction::In => &session.msgs_in,
    };
    flight_ready(cfg, msgs, qos)
}

/// May this message be queued, given that the window is full?
pub fn ready_for_queue(cfg: &Config, session: &Session, dir: Direction, qos: QoS) -> bool {
    let msgs = match dir {
        Direction::Out => &session.msgs_out,
        Direction::In => &session.msgs_in,
    };
    queue_ready(cfg, msgs, session.connected, qos)
}

/// Offer a stored message to a session in one direction.
///
/// Decides admission, creates the client-message entry, updates the
/// accounting, and (for outbound inserts with `update`) drives the
/// write scheduler so the message goes out immediately when possible.
#[allow(clippy::too_many_arguments)]
pub fn message_insert(
    cfg: &Config,
    metrics: &mut BrokerMetrics,
    session: &mut Session,
    mid: u16,
    dir: Direction,
    qos: QoS,
    retain: bool,
    stored: Rc<StoredMessage>,
    subscription_id: Option<u32>,
    update: bool,
    now_mono: u64,
    now_wall: u64,
) -> Result<InsertOutcome> {
    // A session torn down mid-operation has no identity left.
    if session.client_id.is_empty() {
        return Ok(InsertOutcome::Suppressed);
    }

    // Duplicate-delivery suppression across overlapping subscriptions.
    // A retained delivery is sent regardless: the client asked for it.
    if dir == Direction::Out
        && !session.protocol.is_v5()
        && !cfg.mqtt.allow_duplicate_messages
        && !retain
        && stored.already_sent_to(&session.client_id)
    {
        return Ok(InsertOutcome::Suppressed);
    }

    let qos = qos.min(session.max_qos);

    if !session.connected && qos == QoS::AtMostOnce && !cfg.limits.queue_qos0_messages {
        return Ok(InsertOutcome::Dropped);
    }

    let (state, outcome) = if session.connected {
        if flight_ready(cfg, direction_of(session, dir), qos) {
            let state = match dir {
                Direction::Out => MsgState::publish_for(qos),
                Direction::In => {
                    if qos == QoS::ExactlyOnce {
                        MsgState::WaitForPubrel
                    } else {
                        // Inbound QoS 0/1 are delivered immediately and
                        // never create a session entry.
                        return Err(Error::InvalidArgument(
                            "inbound QoS<2 messages are not stored",
                        ));
                    }
                }
            };
            (state, InsertOutcome::Inserted)
        } else if qos != QoS::AtMostOnce && queue_ready(cfg, direction_of(session, dir), true, qos)
        {
            (MsgState::Queued, InsertOutcome::Queued)
        } else {
            return Ok(drop_for_backpressure(metrics, session));
        }
    } else if queue_ready(cfg, direction_of(session, dir), false, qos) {
        (MsgState::Queued, InsertOutcome::Queued)
    } else {
        return Ok(drop_for_backpressure(metrics, session));
    };

    // A successful admission ends the dropping condition; the next
    // failure will log again.
    session.is_dropping = false;

    if dir == Direction::Out && !cfg.mqtt.allow_duplicate_messages && !retain {
        stored.mark_sent_to(&session.client_id);
    }

    let msg = ClientMsg {
        store: stored,
        mid,
        qos,
        state,
        direction: dir,
        dup: false,
        retain,
        timestamp: now_mono,
        subscription_id,
    };

    let msgs = direction_of_mut(session, dir);
    if state == MsgState::Queued {
        msgs.push_queued(msg);
    } else {
        msgs.push_inflight(msg);
    }

    if update && dir == Direction::Out {
        write_inflight_out_latest(metrics, session, now_mono, now_wall)?;
        write_queued_out(session, now_mono);
        write_inflight_out_latest(metrics, session, now_mono, now_wall)?;
    }

    Ok(outcome)
}

fn direction_of(session: &Session, dir: Direction) -> &crate::session::MsgData {
    match dir {
        Direction::Out => &session.msgs_out,
        Direction::In => &session.msgs_in,
    }
}

fn direction_of_mut(session: &mut Session, dir: Direction) -> &mut crate::session::MsgData {
    match dir {
        Direction::Out => &mut session.msgs_out,
        Direction::In => &mut session.msgs_in,
    }
}

fn drop_for_backpressure(metrics: &mut BrokerMetrics, session: &mut Session) -> InsertOutcome {
    metrics.message_dropped();
    if !session.is_dropping {
        session.is_dropping = true;
        info!(
            "outgoing messages are being dropped for client {}",
            session.client_id
        );
    }
    InsertOutcome::Dropped
}

/// Complete an outbound QoS 1/2 flow: PUBACK removes a
/// `WaitForPuback` entry, PUBCOMP a `WaitForPubcomp` entry. Frees the
/// window slot and pulls queued messages forward.
///
/// Returns whether an entry was found; an unknown packet id is not an
/// error (the ack may race a takeover), but a QoS or state mismatch is.
pub fn delete_outgoing(
    metrics: &mut BrokerMetrics,
    session: &mut Session,
    mid: u16,
    expect_state: MsgState,
    qos: QoS,
    now_mono: u64,
    now_wall: u64,
) -> Result<bool> {
    let mut found = false;
    if let Some(idx) = session.msgs_out.inflight.iter().position(|m| m.mid == mid) {
        let msg = &session.msgs_out.inflight[idx];
        if msg.qos != qos {
            return Err(ProtocolError::MalformedPacket(format!(
                "ack QoS mismatch for mid {}",
                mid
            ))
            .into());
        }
        if qos == QoS::ExactlyOnce && msg.state != expect_state {
            return Err(ProtocolError::MalformedPacket(format!(
                "unexpected ack state for mid {}",
                mid
            ))
            .into());
        }
        session.msgs_out.remove_inflight(idx);
        found = true;
    } else {
        debug!(
            "client {}: ack for unknown mid {}",
            session.client_id, mid
        );
    }

    write_queued_out(session, now_mono);
    write_inflight_out_latest(metrics, session, now_mono, now_wall)?;
    Ok(found)
}

/// PUBREC received: emit PUBREL and move to `WaitForPubcomp`.
///
/// Unknown packet ids still get a PUBREL (with the v5 not-found reason)
/// so the peer's flow can terminate.
pub fn pubrec_received(session: &mut Session, mid: u16, now_mono: u64) -> Result<()> {
    let entry = session
        .msgs_out
        .inflight
        .iter_mut()
        .find(|m| m.mid == mid);

    match entry {
        Some(msg) => {
            if msg.qos != QoS::ExactlyOnce
                || !matches!(msg.state, MsgState::WaitForPubrec | MsgState::ResendPubrel)
            {
                return Err(ProtocolError::MalformedPacket(format!(
                    "PUBREC for mid {} in unexpected state",
                    mid
                ))
                .into());
            }
            msg.state = MsgState::WaitForPubcomp;
            msg.timestamp = now_mono;
            session.send_packet(&Packet::Pubrel(Ack::new(mid)))?;
        }
        None => {
            let rc = if session.protocol.is_v5() {
                embermq_core::packet::reason_code::PACKET_IDENTIFIER_NOT_FOUND
            } else {
                0
            };
            session.send_packet(&Packet::Pubrel(Ack {
                packet_id: mid,
                reason_code: rc,
            }))?;
        }
    }
    Ok(())
}

/// PUBREC carried an error reason (v5): the receiver refuses the
/// message, so drop it from the window.
pub fn pubrec_rejected(session: &mut Session, mid: u16) {
    if let Some(idx) = session.msgs_out.inflight.iter().position(|m| m.mid == mid) {
        session.msgs_out.remove_inflight(idx);
    }
}

/// Reset message state for a session that is being resumed by a new
/// connection: recount the totals, set every surviving outbound entry
/// to its retransmission state, and discard inbound QoS 0/1 (the
/// client will retransmit them). Inbound QoS 2 entries survive so the
/// packet identifier keeps rejecting duplicates.
pub fn reconnect_reset(cfg: &Config, session: &mut Session, now_mono: u64) {
    let out = &mut session.msgs_out;
    out.recount();
    for msg in out.inflight.iter_mut() {
        msg.timestamp = now_mono;
        msg.state = match msg.qos {
            QoS::AtMostOnce => MsgState::PublishQos0,
            QoS::AtLeastOnce => MsgState::PublishQos1,
            QoS::ExactlyOnce => {
                if matches!(msg.state, MsgState::WaitForPubcomp | MsgState::ResendPubrel) {
                    MsgState::ResendPubrel
                } else {
                    MsgState::PublishQos2
                }
            }
        };
    }
    // Promote queued outbound into the window so reconnect delivery
    // happens in order rather than waiting for new traffic.
    loop {
        let Some(front_qos) = session.msgs_out.queued.front().map(|m| m.qos) else {
            break;
        };
        if !flight_ready(cfg, &session.msgs_out, front_qos) {
            break;
        }
        if let Some(head) = session.msgs_out.queued.front_mut() {
            head.state = MsgState::publish_for(head.qos);
            head.timestamp = now_mono;
        }
        session.msgs_out.dequeue_first();
    }

    let inbound = &mut session.msgs_in;
    inbound.recount();
    let mut i = 0;
    while i < inbound.inflight.len() {
        if inbound.inflight[i].qos != QoS::ExactlyOnce {
            inbound.remove_inflight(i);
        } else {
            i += 1;
        }
    }
}

/// Build the wire PUBLISH for an in-flight entry. Properties are only
/// attached for v5 peers; the message-expiry interval is re-encoded
/// with the time already spent deducted.
fn build_outbound_publish(session: &Session, msg: &ClientMsg, now_wall: u64) -> Publish {
    // A v5 PUBLISH always carries a property section, even when empty.
    let properties = if session.protocol.is_v5() {
        let mut props = match &msg.store.properties {
            Some(p) => PublishProperties {
                topic_alias: None,
                subscription_identifiers: Vec::new(),
                ..p.clone()
            },
            None => PublishProperties::default(),
        };
        props.message_expiry_interval = msg.store.remaining_expiry(now_wall);
        if let Some(id) = msg.subscription_id {
            props.subscription_identifiers.push(id);
        }
        Some(props)
    } else {
        None
    };

    Publish {
        dup: msg.dup,
        qos: msg.qos,
        retain: msg.retain,
        topic: msg.store.topic.clone(),
        packet_id: if msg.qos != QoS::AtMostOnce {
            Some(msg.mid)
        } else {
            None
        },
        properties,
        payload: msg.store.payload.clone(),
    }
}

fn write_inflight_out_range(
    metrics: &mut BrokerMetrics,
    session: &mut Session,
    start: usize,
    now_mono: u64,
    now_wall: u64,
) -> Result<()> {
    let mut i = start;
    while i < session.msgs_out.inflight.len() {
        let state = session.msgs_out.inflight[i].state;
        match state {
            MsgState::PublishQos0 | MsgState::PublishQos1 | MsgState::PublishQos2 => {
                if !session.can_write_publish() {
                    // Would block: the entry keeps its state and is
                    // retried on the next writable notification.
                    break;
                }
                if session.msgs_out.inflight[i].store.is_expired(now_wall) {
                    session.msgs_out.remove_inflight(i);
                    continue;
                }
                let publish = build_outbound_publish(session, &session.msgs_out.inflight[i], now_wall);
                match session.send_packet(&Packet::Publish(publish)) {
                    Ok(()) => {
                        metrics.msgs_sent += 1;
                        metrics.pub_msgs_sent += 1;
                        match state {
                            MsgState::PublishQos0 => {
                                session.msgs_out.remove_inflight(i);
                                continue;
                            }
                            MsgState::PublishQos1 => {
                                let msg = &mut session.msgs_out.inflight[i];
                                msg.timestamp = now_mono;
                                msg.dup = true; // any retry is a duplicate
                                msg.state = MsgState::WaitForPuback;
                            }
                            _ => {
                                let msg = &mut session.msgs_out.inflight[i];
                                msg.timestamp = now_mono;
                                msg.dup = true;
                                msg.state = MsgState::WaitForPubrec;
                            }
                        }
                        i += 1;
                    }
                    Err(Error::OversizePacket { size, max }) => {
                        // The peer will never observe this message.
                        debug!(
                            "client {}: dropping publish of {} bytes over peer maximum {}",
                            session.client_id, size, max
                        );
                        metrics.message_dropped();
                        session.msgs_out.remove_inflight(i);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            MsgState::ResendPubrel => {
                let mid = session.msgs_out.inflight[i].mid;
                session.send_packet(&Packet::Pubrel(Ack::new(mid)))?;
                let msg = &mut session.msgs_out.inflight[i];
                msg.state = MsgState::WaitForPubcomp;
                msg.timestamp = now_mono;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(())
}

/// Retry every in-flight outbound message. Used on reconnect.
pub fn write_inflight_out_all(
    metrics: &mut BrokerMetrics,
    session: &mut Session,
    now_mono: u64,
    now_wall: u64,
) -> Result<()> {
    if !session.connected {
        return Ok(());
    }
    write_inflight_out_range(metrics, session, 0, now_mono, now_wall)
}

/// Emit only the trailing contiguous run of publish-state messages, so
/// steady-state sends don't re-traverse older entries waiting on acks.
pub fn write_inflight_out_latest(
    metrics: &mut BrokerMetrics,
    session: &mut Session,
    now_mono: u64,
    now_wall: u64,
) -> Result<()> {
    if !session.connected || session.msgs_out.inflight.is_empty() {
        return Ok(());
    }
    let inflight = &session.msgs_out.inflight;
    let mut start = inflight.len();
    while start > 0 && inflight[start - 1].state.is_publish() {
        start -= 1;
    }
    if start == inflight.len() {
        return Ok(());
    }
    write_inflight_out_range(metrics, session, start, now_mono, now_wall)
}

/// Promote queued outbound messages into the in-flight window, up to
/// the quota. Emission happens on the next inflight write pass.
pub fn write_queued_out(session: &mut Session, now_mono: u64) {
    loop {
        if session.msgs_out.queued.is_empty() {
            break;
        }
        if session.msgs_out.inflight_maximum != 0 && session.msgs_out.inflight_quota == 0 {
            break;
        }
        if let Some(head) = session.msgs_out.queued.front_mut() {
            head.state = MsgState::publish_for(head.qos);
            head.timestamp = now_mono;
        }
        session.msgs_out.dequeue_first();
    }
}

/// Promote queued inbound QoS 2 messages as receive-window space
/// appears, emitting the deferred PUBRECs.
pub fn write_queued_in(session: &mut Session, now_mono: u64) -> Result<()> {
    loop {
        if session.msgs_in.queued.is_empty() {
            break;
        }
        if session.msgs_in.inflight_maximum != 0 && session.msgs_in.inflight_quota == 0 {
            break;
        }
        if let Some(head) = session.msgs_in.queued.front_mut() {
            head.state = MsgState::SendPubrec;
            head.timestamp = now_mono;
        }
        session.msgs_in.dequeue_first();
        let mid = match session.msgs_in.inflight.back() {
            Some(msg) => msg.mid,
            None => break,
        };
        session.send_packet(&Packet::Pubrec(Ack::new(mid)))?;
        if let Some(msg) = session.msgs_in.inflight.back_mut() {
            msg.state = MsgState::WaitForPubrel;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use embermq_core::packet::Protocol;

    fn test_config(max_inflight: u16, max_queued: usize) -> Config {
        let mut cfg = Config::default();
        cfg.limits.max_inflight_messages = max_inflight;
        cfg.limits.max_queued_messages = max_queued;
        cfg
    }

    fn test_session(cfg: &Config) -> Session {
        let mut s = Session::new(1, cfg.limits.max_inflight_messages, 0);
        s.client_id = "c".into();
        s.state = crate::session::SessionState::Active;
        s
    }

    fn stored(topic: &str, payload: &[u8], qos: QoS) -> Rc<StoredMessage> {
        Rc::new(StoredMessage::new(
            topic.into(),
            Bytes::copy_from_slice(payload),
            qos,
            false,
            "src".into(),
            None,
            0,
            None,
            0,
        ))
    }

    fn insert(
        cfg: &Config,
        metrics: &mut BrokerMetrics,
        session: &mut Session,
        qos: QoS,
    ) -> InsertOutcome {
        let mid = if qos == QoS::AtMostOnce {
            0
        } else {
            session.next_mid()
        };
        message_insert(
            cfg,
            metrics,
            session,
            mid,
            Direction::Out,
            qos,
            false,
            stored("t", b"payload", qos),
            None,
            false,
            0,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_insert_within_window() {
        let cfg = test_config(5, 10);
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);
        assert_eq!(insert(&cfg, &mut metrics, &mut s, QoS::AtLeastOnce), InsertOutcome::Inserted);
        assert_eq!(s.msgs_out.inflight.len(), 1);
        assert_eq!(s.msgs_out.inflight_quota, 4);
    }

    #[test]
    fn test_window_overflow_queues_then_drops() {
        let cfg = test_config(2, 3);
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);

        for _ in 0..2 {
            assert_eq!(insert(&cfg, &mut metrics, &mut s, QoS::AtLeastOnce), InsertOutcome::Inserted);
        }
        for _ in 0..3 {
            assert_eq!(insert(&cfg, &mut metrics, &mut s, QoS::AtLeastOnce), InsertOutcome::Queued);
        }
        assert_eq!(insert(&cfg, &mut metrics, &mut s, QoS::AtLeastOnce), InsertOutcome::Dropped);
        assert!(s.is_dropping);
        assert_eq!(metrics.pub_msgs_dropped, 1);
    }

    #[test]
    fn test_offline_qos0_dropped_without_queueing_option() {
        let cfg = test_config(5, 10);
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);
        s.connected = false;
        assert_eq!(insert(&cfg, &mut metrics, &mut s, QoS::AtMostOnce), InsertOutcome::Dropped);
        // This drop is silent: the session never entered "dropping".
        assert!(!s.is_dropping);
        assert_eq!(metrics.pub_msgs_dropped, 0);
    }

    #[test]
    fn test_offline_qos0_queued_when_enabled() {
        let mut cfg = test_config(5, 10);
        cfg.limits.queue_qos0_messages = true;
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);
        s.connected = false;
        assert_eq!(insert(&cfg, &mut metrics, &mut s, QoS::AtMostOnce), InsertOutcome::Queued);
    }

    #[test]
    fn test_offline_queue_cap_scenario() {
        // 10000 offered to an offline session with max_queued=100:
        // exactly 100 admitted, 9900 dropped, one dropping log.
        let cfg = test_config(20, 100);
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);
        s.connected = false;

        let mut queued = 0;
        for _ in 0..10_000 {
            match insert(&cfg, &mut metrics, &mut s, QoS::AtLeastOnce) {
                InsertOutcome::Queued => queued += 1,
                InsertOutcome::Dropped => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(queued, 100);
        assert_eq!(metrics.pub_msgs_dropped, 9_900);
        assert_eq!(s.msgs_out.queued.len(), 100);
        assert!(s.is_dropping);
    }

    #[test]
    fn test_dropping_flag_clears_on_successful_admission() {
        let cfg = test_config(1, 1);
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);

        assert_eq!(insert(&cfg, &mut metrics, &mut s, QoS::AtLeastOnce), InsertOutcome::Inserted);
        assert_eq!(insert(&cfg, &mut metrics, &mut s, QoS::AtLeastOnce), InsertOutcome::Queued);
        assert_eq!(insert(&cfg, &mut metrics, &mut s, QoS::AtLeastOnce), InsertOutcome::Dropped);
        assert!(s.is_dropping);

        // Ack the in-flight message; the queued one takes its place.
        delete_outgoing(
            &mut metrics,
            &mut s,
            1,
            MsgState::WaitForPuback,
            QoS::AtLeastOnce,
            0,
            0,
        )
        .unwrap();
        assert_eq!(insert(&cfg, &mut metrics, &mut s, QoS::AtLeastOnce), InsertOutcome::Queued);
        assert!(!s.is_dropping);
    }

    #[test]
    fn test_duplicate_delivery_suppressed_for_v3() {
        let cfg = test_config(5, 10);
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);
        let msg = stored("t", b"x", QoS::AtLeastOnce);

        let first = message_insert(
            &cfg, &mut metrics, &mut s, 1, Direction::Out, QoS::AtLeastOnce, false,
            Rc::clone(&msg), None, false, 0, 0,
        )
        .unwrap();
        assert_eq!(first, InsertOutcome::Inserted);

        let second = message_insert(
            &cfg, &mut metrics, &mut s, 2, Direction::Out, QoS::AtLeastOnce, false,
            Rc::clone(&msg), None, false, 0, 0,
        )
        .unwrap();
        assert_eq!(second, InsertOutcome::Suppressed);
    }

    #[test]
    fn test_duplicate_delivery_allowed_for_v5() {
        let cfg = test_config(5, 10);
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);
        s.protocol = Protocol::V5;
        let msg = stored("t", b"x", QoS::AtLeastOnce);

        for mid in 1..=2 {
            let outcome = message_insert(
                &cfg, &mut metrics, &mut s, mid, Direction::Out, QoS::AtLeastOnce, false,
                Rc::clone(&msg), None, false, 0, 0,
            )
            .unwrap();
            assert_eq!(outcome, InsertOutcome::Inserted);
        }
    }

    #[test]
    fn test_qos_capped_by_session_max() {
        let cfg = test_config(5, 10);
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);
        s.max_qos = QoS::AtLeastOnce;
        message_insert(
            &cfg, &mut metrics, &mut s, 1, Direction::Out, QoS::ExactlyOnce, false,
            stored("t", b"x", QoS::ExactlyOnce), None, false, 0, 0,
        )
        .unwrap();
        assert_eq!(s.msgs_out.inflight[0].qos, QoS::AtLeastOnce);
    }

    #[test]
    fn test_write_emits_and_advances_state() {
        let cfg = test_config(5, 10);
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);
        insert(&cfg, &mut metrics, &mut s, QoS::AtLeastOnce);

        write_inflight_out_latest(&mut metrics, &mut s, 0, 0).unwrap();
        assert_eq!(s.msgs_out.inflight[0].state, MsgState::WaitForPuback);
        assert!(s.msgs_out.inflight[0].dup); // marked for any retry
        assert!(!s.out.is_empty());

        // The emitted packet had dup=0.
        let bytes = s.out.drain_all();
        assert_eq!(bytes[0] & 0x08, 0);
    }

    #[test]
    fn test_qos0_removed_after_emit() {
        let cfg = test_config(5, 10);
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);
        insert(&cfg, &mut metrics, &mut s, QoS::AtMostOnce);
        write_inflight_out_latest(&mut metrics, &mut s, 0, 0).unwrap();
        assert!(s.msgs_out.inflight.is_empty());
        assert_eq!(s.msgs_out.msg_count, 0);
        assert!(!s.out.is_empty());
    }

    #[test]
    fn test_expired_message_dropped_at_write() {
        let cfg = test_config(5, 10);
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);
        message_insert(
            &cfg,
            &mut metrics,
            &mut s,
            1,
            Direction::Out,
            QoS::AtLeastOnce,
            false,
            {
                let mut m = StoredMessage::new(
                    "t".into(),
                    Bytes::from_static(b"x"),
                    QoS::AtLeastOnce,
                    false,
                    "src".into(),
                    None,
                    0,
                    None,
                    0,
                );
                m.expiry_time = 100;
                Rc::new(m)
            },
            None,
            false,
            0,
            0,
        )
        .unwrap();
        assert_eq!(s.msgs_out.inflight_quota, 4);

        write_inflight_out_latest(&mut metrics, &mut s, 0, 500).unwrap();
        assert!(s.msgs_out.inflight.is_empty());
        assert!(s.out.is_empty());
        // Freed slot restored the quota.
        assert_eq!(s.msgs_out.inflight_quota, 5);
    }

    #[test]
    fn test_oversize_publish_removed_and_quota_restored() {
        let cfg = test_config(5, 10);
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);
        s.max_packet_size = 8; // tiny peer limit
        insert(&cfg, &mut metrics, &mut s, QoS::AtLeastOnce);
        assert_eq!(s.msgs_out.inflight_quota, 4);

        write_inflight_out_latest(&mut metrics, &mut s, 0, 0).unwrap();
        assert!(s.msgs_out.inflight.is_empty());
        assert!(s.out.is_empty());
        assert_eq!(s.msgs_out.inflight_quota, 5);
        assert_eq!(metrics.pub_msgs_dropped, 1);
    }

    #[test]
    fn test_latest_skips_waiting_prefix() {
        let cfg = test_config(5, 10);
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);

        insert(&cfg, &mut metrics, &mut s, QoS::AtLeastOnce);
        write_inflight_out_latest(&mut metrics, &mut s, 0, 0).unwrap();
        s.out.drain_all();
        assert_eq!(s.msgs_out.inflight[0].state, MsgState::WaitForPuback);

        // New message behind the waiting one: only it is emitted.
        insert(&cfg, &mut metrics, &mut s, QoS::AtLeastOnce);
        write_inflight_out_latest(&mut metrics, &mut s, 0, 0).unwrap();
        let bytes = s.out.drain_all();
        let (packet, _) =
            embermq_core::packet::decode_packet(&bytes, Some(Protocol::V311), 0)
                .unwrap()
                .unwrap();
        match packet {
            Packet::Publish(p) => assert_eq!(p.packet_id, Some(2)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reconnect_reset_states() {
        let cfg = test_config(5, 10);
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);

        insert(&cfg, &mut metrics, &mut s, QoS::ExactlyOnce);
        insert(&cfg, &mut metrics, &mut s, QoS::AtLeastOnce);
        write_inflight_out_latest(&mut metrics, &mut s, 0, 0).unwrap();
        // Simulate the QoS 2 flow reaching WaitForPubcomp.
        pubrec_received(&mut s, 1, 0).unwrap();
        s.out.drain_all();

        reconnect_reset(&cfg, &mut s, 5);
        assert_eq!(s.msgs_out.inflight[0].state, MsgState::ResendPubrel);
        assert_eq!(s.msgs_out.inflight[1].state, MsgState::PublishQos1);
        assert_eq!(s.msgs_out.inflight_quota, 3);
    }

    #[test]
    fn test_reconnect_reset_drops_inbound_qos1() {
        let cfg = test_config(5, 10);
        let mut s = test_session(&cfg);
        // Hand-place an inbound QoS 2 and an (artificial) QoS 1 entry.
        s.msgs_in.push_inflight(ClientMsg {
            store: stored("t", b"a", QoS::ExactlyOnce),
            mid: 1,
            qos: QoS::ExactlyOnce,
            state: MsgState::WaitForPubrel,
            direction: Direction::In,
            dup: false,
            retain: false,
            timestamp: 0,
            subscription_id: None,
        });
        s.msgs_in.push_inflight(ClientMsg {
            store: stored("t", b"b", QoS::AtLeastOnce),
            mid: 2,
            qos: QoS::AtLeastOnce,
            state: MsgState::WaitForPubrel,
            direction: Direction::In,
            dup: false,
            retain: false,
            timestamp: 0,
            subscription_id: None,
        });

        reconnect_reset(&cfg, &mut s, 0);
        assert_eq!(s.msgs_in.inflight.len(), 1);
        assert_eq!(s.msgs_in.inflight[0].qos, QoS::ExactlyOnce);
        assert_eq!(s.msgs_in.inflight[0].state, MsgState::WaitForPubrel);
    }

    #[test]
    fn test_would_block_leaves_state() {
        let cfg = test_config(5, 10);
        let mut metrics = BrokerMetrics::new();
        let mut s = test_session(&cfg);
        // Saturate the write buffer past the soft limit.
        s.out
            .push(&vec![0u8; crate::write_buffer::SOFT_LIMIT + 1])
            .unwrap();
        insert(&cfg, &mut metrics, &mut s, QoS::AtLeastOnce);
        write_inflight_out_latest(&mut metrics, &mut s, 0, 0).unwrap();
        // Still waiting in the publish state, untouched.
        assert_eq!(s.msgs_out.inflight[0].state, MsgState::PublishQos1);
        assert!(!s.msgs_out.inflight[0].dup);
    }

    #[test]
    fn test_write_queued_in_emits_pubrec() {
        let cfg = test_config(1, 10);
        let mut s = test_session(&cfg);
        for mid in [11u16, 12] {
            let mut msg = ClientMsg {
                store: stored("t", b"p", QoS::ExactlyOnce),
                mid,
                qos: QoS::ExactlyOnce,
                state: MsgState::Queued,
                direction: Direction::In,
                dup: false,
                retain: false,
                timestamp: 0,
                subscription_id: None,
            };
            if mid == 11 {
                msg.state = MsgState::WaitForPubrel;
                s.msgs_in.push_inflight(msg);
            } else {
                s.msgs_in.push_queued(msg);
            }
        }
        // Window full: nothing promoted.
        write_queued_in(&mut s, 0).unwrap();
        assert_eq!(s.msgs_in.queued.len(), 1);
        assert!(s.out.is_empty());

        // Release the window and promote.
        s.msgs_in.remove_inflight(0);
        write_queued_in(&mut s, 0).unwrap();
        assert!(s.msgs_in.queued.is_empty());
        assert_eq!(s.msgs_in.inflight[0].state, MsgState::WaitForPubrel);
        let bytes = s.out.drain_all();
        assert_eq!(bytes[0] >> 4, 5); // PUBREC
    }
}
