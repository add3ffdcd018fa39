//! SUBSCRIBE and UNSUBSCRIBE handling, including retained-message
//! delivery for new subscriptions.

use log::debug;

use embermq_core::error::{Error, Result};
use embermq_core::packet::{
    reason_code, Packet, QoS, Suback, Subscribe, SubscriptionOptions, Unsuback, Unsubscribe,
};
use embermq_core::topic;

use crate::auth::Access;
use crate::broker::Broker;
use crate::queue;
use crate::session::{Direction, SessionId};
use crate::subscription::{SubscribeOutcome, Subscriber, SubscriptionTrie};

/// Failure code for a single filter: 0x87 for v5, the generic 0x80 for
/// 3.1.1 (3.1 has no failure code, but the same byte is what the
/// ecosystem expects).
fn failure_code(v5: bool, v5_code: u8) -> u8 {
    if v5 {
        v5_code
    } else {
        reason_code::UNSPECIFIED_ERROR
    }
}

/// Apply the listener mount point inside a filter, preserving any
/// `$share/{group}/` prefix.
fn mounted_filter(mount: Option<&str>, filter: &str) -> String {
    let Some(mount) = mount else {
        return filter.to_string();
    };
    match SubscriptionTrie::parse_shared(filter) {
        Some((group, inner)) => format!("$share/{}/{}{}", group, mount, inner),
        None => format!("{}{}", mount, filter),
    }
}

pub fn handle_subscribe(broker: &mut Broker, sid: SessionId, packet: Subscribe) -> Result<()> {
    let now_mono = broker.now_mono();
    let now_wall = broker.now_wall();
    let (v5, client_id, username) = {
        let session = broker.sessions.get(&sid).ok_or(Error::NotFound)?;
        (
            session.protocol.is_v5(),
            session.client_id.clone(),
            session.username.clone(),
        )
    };

    let mut reason_codes = Vec::with_capacity(packet.filters.len());
    // (filter, granted QoS) queued for the retained pass after the
    // SUBACK goes out.
    let mut retained_pass: Vec<(String, QoS)> = Vec::new();

    for (filter, options) in &packet.filters {
        let shared = SubscriptionTrie::parse_shared(filter);

        if shared.is_some() && (!v5 || !broker.cfg.mqtt.shared_subscriptions) {
            reason_codes.push(failure_code(v5, reason_code::SHARED_SUBSCRIPTIONS_NOT_SUPPORTED));
            continue;
        }

        // A malformed filter is a protocol violation, not a per-filter
        // failure.
        let inner = shared.map(|(_, f)| f).unwrap_or(filter.as_str());
        topic::valid_filter(inner)?;

        if !broker.auth.acl_check(
            &client_id,
            username.as_deref(),
            inner,
            b"",
            options.qos,
            false,
            Access::Subscribe,
        ) {
            debug!("client {}: subscription to {} denied", client_id, filter);
            reason_codes.push(failure_code(v5, reason_code::NOT_AUTHORIZED));
            continue;
        }

        let granted = match broker.cfg.mqtt.max_qos {
            0 => QoS::AtMostOnce,
            1 => options.qos.min(QoS::AtLeastOnce),
            _ => options.qos,
        };
        let full_filter = mounted_filter(broker.cfg.server.mount_point.as_deref(), filter);

        let outcome = broker.subs.subscribe(
            &full_filter,
            Subscriber {
                session: sid,
                qos: granted,
                options: SubscriptionOptions {
                    qos: granted,
                    ..*options
                },
                subscription_id: packet.subscription_id,
            },
        );
        if outcome == SubscribeOutcome::New {
            let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
            session.subscriptions.push(full_filter.clone());
        }
        reason_codes.push(granted as u8);

        // Retained messages never flow to shared subscriptions.
        // Retain-handling 2 suppresses them, 1 only for fresh
        // subscriptions.
        let send_retained = shared.is_none()
            && options.retain_handling != 2
            && !(options.retain_handling == 1 && outcome == SubscribeOutcome::Replaced);
        if send_retained {
            retained_pass.push((full_filter, granted));
        }
    }

    {
        let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
        session.send_packet(&Packet::Suback(Suback {
            packet_id: packet.packet_id,
            reason_codes,
            v5,
        }))?;
        broker.metrics.msgs_sent += 1;
    }

    // Retained deliveries go out after the SUBACK and before any
    // subsequent live publish on these filters.
    let mut retained = Vec::new();
    for (filter, granted) in retained_pass {
        broker.subs.retained_for(&filter, &mut retained);
        for stored in retained.drain(..) {
            if stored.is_expired(now_wall) {
                continue;
            }
            if !broker.auth.acl_check(
                &client_id,
                username.as_deref(),
                &stored.topic,
                &stored.payload,
                stored.qos,
                true,
                Access::Read,
            ) {
                continue;
            }
            let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
            let qos = stored.qos.min(granted);
            let mid = if qos != QoS::AtMostOnce {
                session.next_mid()
            } else {
                0
            };
            queue::message_insert(
                &broker.cfg,
                &mut broker.metrics,
                session,
                mid,
                Direction::Out,
                qos,
                true,
                stored,
                packet.subscription_id,
                true,
                now_mono,
                now_wall,
            )?;
        }
    }

    Ok(())
}

pub fn handle_unsubscribe(broker: &mut Broker, sid: SessionId, packet: Unsubscribe) -> Result<()> {
    let v5 = {
        let session = broker.sessions.get(&sid).ok_or(Error::NotFound)?;
        session.protocol.is_v5()
    };

    let mut reason_codes = Vec::with_capacity(packet.filters.len());
    for filter in &packet.filters {
        let full_filter = mounted_filter(broker.cfg.server.mount_point.as_deref(), filter);
        let removed = broker.subs.unsubscribe(&full_filter, sid);
        if removed {
            let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
            session.subscriptions.retain(|f| f != &full_filter);
            reason_codes.push(reason_code::SUCCESS);
        } else {
            reason_codes.push(reason_code::NO_SUBSCRIPTION_EXISTED);
        }
    }

    let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
    session.send_packet(&Packet::Unsuback(Unsuback {
        packet_id: packet.packet_id,
        reason_codes,
        v5,
    }))?;
    broker.metrics.msgs_sent += 1;
    Ok(())
}
