//! PUBLISH handling: validation, topic-alias resolution, retained
//! storage, and fanout (QoS 0/1 immediately, QoS 2 on PUBREL).

use std::rc::Rc;

use log::debug;

use embermq_core::error::{Error, ProtocolError, Result};
use embermq_core::packet::{reason_code, Ack, Packet, Publish, PublishProperties, QoS};
use embermq_core::topic;

use crate::auth::Access;
use crate::broker::Broker;
use crate::queue::{self, InsertOutcome};
use crate::session::{Direction, MsgState, SessionId};
use crate::store::StoredMessage;

/// Why an otherwise well-formed publish is not being routed.
enum Refusal {
    Oversize,
    Denied,
}

pub fn handle_publish(broker: &mut Broker, sid: SessionId, mut publish: Publish) -> Result<()> {
    broker.metrics.pub_msgs_received += 1;
    let now_wall = broker.now_wall();
    let now_mono = broker.now_mono();

    let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
    let v5 = session.protocol.is_v5();

    // A client must not send subscription identifiers.
    if let Some(props) = &publish.properties {
        if !props.subscription_identifiers.is_empty() {
            broker.send_disconnect_reason(sid, reason_code::PROTOCOL_ERROR);
            return Err(
                ProtocolError::UnexpectedPacket("subscription identifier from client").into(),
            );
        }
    }

    // Topic alias resolution (v5).
    if let Some(alias) = publish.properties.as_ref().and_then(|p| p.topic_alias) {
        if alias > broker.cfg.limits.max_topic_alias {
            broker.send_disconnect_reason(sid, reason_code::TOPIC_ALIAS_INVALID);
            return Err(ProtocolError::MalformedPacket(format!(
                "topic alias {} above maximum",
                alias
            ))
            .into());
        }
        let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
        if publish.topic.is_empty() {
            match session.aliases_in.get(&alias) {
                Some(topic) => publish.topic = topic.clone(),
                None => {
                    broker.send_disconnect_reason(sid, reason_code::TOPIC_ALIAS_INVALID);
                    return Err(ProtocolError::MalformedPacket(format!(
                        "unknown topic alias {}",
                        alias
                    ))
                    .into());
                }
            }
        } else {
            session.aliases_in.insert(alias, publish.topic.clone());
        }
    }

    topic::valid_publish_topic(&publish.topic)?;
    if let Some(mount) = &broker.cfg.server.mount_point {
        publish.topic = format!("{}{}", mount, publish.topic);
    }

    if publish.qos as u8 > broker.cfg.mqtt.max_qos {
        broker.send_disconnect_reason(sid, reason_code::QOS_NOT_SUPPORTED);
        return Err(Error::NotSupported("QoS above configured maximum"));
    }
    if publish.retain && !broker.cfg.mqtt.retain_available {
        broker.send_disconnect_reason(sid, reason_code::RETAIN_NOT_SUPPORTED);
        return Err(Error::NotSupported("retain"));
    }

    let mid = publish.packet_id.unwrap_or(0);

    // Inbound QoS 2 retransmission: the entry is still held, so the
    // message must not be routed again. Re-acknowledge and stop.
    if publish.qos == QoS::ExactlyOnce {
        let session = broker.sessions.get(&sid).ok_or(Error::NotFound)?;
        if let Some(existing) = session.find_inbound_by_source_mid(mid) {
            let resend_pubrec = existing.state == MsgState::WaitForPubrel;
            let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
            if resend_pubrec {
                session.send_packet(&Packet::Pubrec(Ack::new(mid)))?;
                broker.metrics.msgs_sent += 1;
            }
            return Ok(());
        }
    }

    let limit = broker.cfg.limits.message_size_limit;
    let refusal = if limit != 0 && publish.payload.len() > limit as usize {
        Some(Refusal::Oversize)
    } else {
        let session = broker.sessions.get(&sid).ok_or(Error::NotFound)?;
        let allowed = broker.auth.acl_check(
            &session.client_id,
            session.username.as_deref(),
            &publish.topic,
            &publish.payload,
            publish.qos,
            publish.retain,
            Access::Write,
        );
        if allowed {
            None
        } else {
            Some(Refusal::Denied)
        }
    };

    if let Some(refusal) = refusal {
        return refuse_publish(broker, sid, &publish, refusal, v5);
    }

    // Store the message. Aliases never travel further than this hop.
    let properties = publish.properties.take().map(|p| PublishProperties {
        topic_alias: None,
        ..p
    });
    let expiry_time = properties
        .as_ref()
        .and_then(|p| p.message_expiry_interval)
        .map(|i| now_wall + i as u64)
        .unwrap_or(0);

    let (source_id, source_username) = {
        let session = broker.sessions.get(&sid).ok_or(Error::NotFound)?;
        (session.client_id.clone(), session.username.clone())
    };
    let msg = StoredMessage::new(
        publish.topic.clone(),
        publish.payload.clone(),
        publish.qos,
        publish.retain,
        source_id,
        source_username,
        mid,
        properties,
        expiry_time,
    );
    let stored = broker.store.insert(msg);

    // Retained slot update: an empty payload clears the slot, anything
    // else replaces it.
    if publish.retain {
        if stored.payload.is_empty() {
            broker.subs.clear_retained(&stored.topic);
            debug!("cleared retained message at {}", stored.topic);
        } else {
            broker.subs.set_retained(&stored.topic, Rc::clone(&stored));
        }
    }

    match publish.qos {
        QoS::AtMostOnce => {
            broker.route_stored(Some(sid), &stored);
            Ok(())
        }
        QoS::AtLeastOnce => {
            let delivered = broker.route_stored(Some(sid), &stored);
            let rc = if v5 && delivered == 0 {
                reason_code::NO_MATCHING_SUBSCRIBERS
            } else {
                reason_code::SUCCESS
            };
            let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
            session.send_packet(&Packet::Puback(Ack {
                packet_id: mid,
                reason_code: rc,
            }))?;
            broker.metrics.msgs_sent += 1;
            Ok(())
        }
        QoS::ExactlyOnce => {
            let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
            let outcome = queue::message_insert(
                &broker.cfg,
                &mut broker.metrics,
                session,
                mid,
                Direction::In,
                QoS::ExactlyOnce,
                publish.retain,
                Rc::clone(&stored),
                None,
                false,
                now_mono,
                now_wall,
            )?;
            match outcome {
                InsertOutcome::Inserted => {
                    session.send_packet(&Packet::Pubrec(Ack::new(mid)))?;
                    broker.metrics.msgs_sent += 1;
                    Ok(())
                }
                // The PUBREC goes out once receive-window space frees.
                InsertOutcome::Queued => Ok(()),
                InsertOutcome::Dropped | InsertOutcome::Suppressed => {
                    broker.send_disconnect_reason(sid, reason_code::RECEIVE_MAXIMUM_EXCEEDED);
                    Err(ProtocolError::UnexpectedPacket("receive maximum exceeded").into())
                }
            }
        }
    }
}

/// Terminate the QoS flow of a publish that is not being routed, so the
/// client does not retransmit forever. v5 peers learn why.
fn refuse_publish(
    broker: &mut Broker,
    sid: SessionId,
    publish: &Publish,
    refusal: Refusal,
    v5: bool,
) -> Result<()> {
    let rc = if !v5 {
        reason_code::SUCCESS
    } else {
        match refusal {
            Refusal::Oversize => reason_code::PACKET_TOO_LARGE,
            Refusal::Denied => reason_code::NOT_AUTHORIZED,
        }
    };
    let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
    debug!(
        "client {}: publish to {} refused",
        session.client_id, publish.topic
    );
    let mid = publish.packet_id.unwrap_or(0);
    match publish.qos {
        QoS::AtMostOnce => {}
        QoS::AtLeastOnce => {
            session.send_packet(&Packet::Puback(Ack {
                packet_id: mid,
                reason_code: rc,
            }))?;
            broker.metrics.msgs_sent += 1;
        }
        QoS::ExactlyOnce => {
            // No entry is created; a later PUBREL completes through the
            // unknown-id path.
            session.send_packet(&Packet::Pubrec(Ack {
                packet_id: mid,
                reason_code: rc,
            }))?;
            broker.metrics.msgs_sent += 1;
        }
    }
    Ok(())
}
