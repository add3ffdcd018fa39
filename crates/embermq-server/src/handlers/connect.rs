//! CONNECT and AUTH handling: validation, client-id assignment,
//! authentication, session takeover, and the CONNACK/queue-drain that
//! brings a session to `Active`.

use std::fmt::Write as _;

use log::{debug, info, warn};

use embermq_core::error::{Error, ProtocolError, Result};
use embermq_core::packet::{
    reason_code, Auth, Connack, ConnackCode, ConnackProperties, Connect, Packet, Protocol, QoS,
};

use crate::auth::{Access, AuthContext, AuthResult};
use crate::broker::Broker;
use crate::queue;
use crate::session::{Direction, SessionId, SessionState};
use crate::will::PendingWill;

/// Send a CONNACK refusal in the shape the client's dialect expects.
fn send_refusal(broker: &mut Broker, sid: SessionId, v3_code: ConnackCode, v5_code: u8) {
    let Some(session) = broker.sessions.get_mut(&sid) else {
        return;
    };
    let connack = if session.protocol.is_v5() {
        Connack {
            session_present: false,
            code: ConnackCode::Accepted,
            reason_code: Some(v5_code),
            properties: Some(ConnackProperties::default()),
        }
    } else {
        Connack {
            session_present: false,
            code: v3_code,
            reason_code: None,
            properties: None,
        }
    };
    if let Err(e) = session.send_packet(&Packet::Connack(connack)) {
        debug!("failed to send CONNACK refusal: {}", e);
    }
}

/// Generate a client identifier: configured prefix plus a UUID-shaped
/// hex string.
fn generate_client_id(broker: &Broker) -> String {
    let mut rnd = [0u8; 16];
    broker.platform.random_bytes(&mut rnd);

    let mut id = String::with_capacity(broker.cfg.mqtt.auto_id_prefix.len() + 36);
    id.push_str(&broker.cfg.mqtt.auto_id_prefix);
    for (i, byte) in rnd.iter().enumerate() {
        let _ = write!(id, "{:02x}", byte);
        if matches!(i, 3 | 5 | 7 | 9) {
            id.push('-');
        }
    }
    id
}

pub fn handle_connect(broker: &mut Broker, sid: SessionId, connect: Connect) -> Result<()> {
    {
        let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
        if session.state != SessionState::New {
            warn!(
                "client {} sent multiple CONNECT packets",
                session.client_id
            );
            return Err(ProtocolError::UnexpectedPacket("second CONNECT").into());
        }
        // Record the dialect first so any refusal below is well-formed.
        session.protocol = connect.protocol;
        session.is_bridge = connect.is_bridge;
    }
    let v5 = connect.protocol.is_v5();

    if let Some(will) = &connect.will {
        if will.retain && !broker.cfg.mqtt.retain_available {
            send_refusal(
                broker,
                sid,
                ConnackCode::NotAuthorized,
                reason_code::RETAIN_NOT_SUPPORTED,
            );
            return Err(Error::NotSupported("will retain"));
        }
        if will.qos as u8 > broker.cfg.mqtt.max_qos {
            send_refusal(
                broker,
                sid,
                ConnackCode::NotAuthorized,
                reason_code::QOS_NOT_SUPPORTED,
            );
            return Err(Error::NotSupported("will QoS"));
        }
        let limit = broker.cfg.limits.message_size_limit;
        if limit != 0 && will.payload.len() > limit as usize {
            debug!("client connected with too large will payload");
            send_refusal(
                broker,
                sid,
                ConnackCode::NotAuthorized,
                reason_code::PACKET_TOO_LARGE,
            );
            return Err(Error::OversizePacket {
                size: will.payload.len(),
                max: limit as usize,
            });
        }
    }

    // Client identifier rules (MQTT-3.1.3-7 and the v5 assignment path).
    let mut assigned_id = false;
    let client_id = if connect.client_id.is_empty() {
        let allow_zero = broker.cfg.mqtt.allow_zero_length_clientid;
        match connect.protocol {
            Protocol::V31 => {
                send_refusal(broker, sid, ConnackCode::IdentifierRejected, 0);
                return Err(ProtocolError::MalformedPacket("empty v3.1 client id".into()).into());
            }
            Protocol::V311 if !connect.clean_start => {
                send_refusal(broker, sid, ConnackCode::IdentifierRejected, 0);
                return Err(ProtocolError::MalformedPacket(
                    "empty client id with clean session disabled".into(),
                )
                .into());
            }
            _ if !allow_zero => {
                send_refusal(
                    broker,
                    sid,
                    ConnackCode::IdentifierRejected,
                    reason_code::UNSPECIFIED_ERROR,
                );
                return Err(ProtocolError::MalformedPacket("empty client id".into()).into());
            }
            _ => {
                assigned_id = true;
                generate_client_id(broker)
            }
        }
    } else {
        connect.client_id.clone()
    };

    if let Some(prefix) = &broker.cfg.mqtt.clientid_prefixes {
        if !client_id.starts_with(prefix.as_str()) {
            send_refusal(
                broker,
                sid,
                ConnackCode::NotAuthorized,
                reason_code::NOT_AUTHORIZED,
            );
            return Err(Error::NotAuthorized);
        }
    }

    let will = match connect.will {
        Some(w) => Some(PendingWill::from_connect(
            w,
            broker.cfg.server.mount_point.as_deref(),
        )?),
        None => None,
    };

    // Apply the negotiated parameters to the session.
    let max_expiry = broker.cfg.session.max_session_expiry_interval;
    let (auth_method, auth_data) = {
        let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
        session.clean_start = connect.clean_start;
        session.keep_alive = connect.keep_alive;
        session.client_id = client_id.clone();
        session.assigned_id = assigned_id;
        session.will = will;
        session.username = connect.username;
        session.password = connect.password;
        session.session_expiry_interval = if v5 {
            connect
                .properties
                .as_ref()
                .and_then(|p| p.session_expiry_interval)
                .unwrap_or(0)
                .min(max_expiry)
        } else if connect.clean_start {
            0
        } else {
            // v3.x persistent sessions survive until explicit cleanup.
            u32::MAX
        };

        let mut auth_method = None;
        let mut auth_data = None;
        if let Some(props) = &connect.properties {
            if let Some(rm) = props.receive_maximum {
                let cfg_max = session.msgs_out.inflight_maximum;
                let effective = if cfg_max == 0 { rm } else { rm.min(cfg_max) };
                session.msgs_out.set_maximum(effective);
            }
            session.max_packet_size = props.maximum_packet_size.unwrap_or(0);
            auth_method = props.authentication_method.clone();
            auth_data = props.authentication_data.clone();
        }
        session.auth_method = auth_method.clone();
        (auth_method, auth_data)
    };

    authenticate_session(broker, sid, auth_method, auth_data)
}

/// v5 AUTH packet: a step in an extended authentication exchange.
pub fn handle_auth(broker: &mut Broker, sid: SessionId, auth: Auth) -> Result<()> {
    let (state, method) = {
        let session = broker.sessions.get(&sid).ok_or(Error::NotFound)?;
        if !session.protocol.is_v5() {
            return Err(ProtocolError::UnexpectedPacket("AUTH from non-v5 client").into());
        }
        (session.state, session.auth_method.clone())
    };
    if state != SessionState::Authenticating {
        return Err(ProtocolError::UnexpectedPacket("AUTH outside authentication").into());
    }
    // The method must not change mid-exchange.
    if auth.method.is_some() && auth.method != method {
        send_refusal(
            broker,
            sid,
            ConnackCode::BadUsernamePassword,
            reason_code::BAD_AUTHENTICATION_METHOD,
        );
        return Err(Error::NotAuthorized);
    }

    authenticate_session(broker, sid, method, auth.data)
}

/// Run one authentication step and continue to CONNACK on success.
fn authenticate_session(
    broker: &mut Broker,
    sid: SessionId,
    auth_method: Option<String>,
    auth_data: Option<Vec<u8>>,
) -> Result<()> {
    let (client_id, username, password, v5) = {
        let session = broker.sessions.get(&sid).ok_or(Error::NotFound)?;
        (
            session.client_id.clone(),
            session.username.clone(),
            session.password.clone(),
            session.protocol.is_v5(),
        )
    };

    let ctx = AuthContext {
        client_id: &client_id,
        username: username.as_deref(),
        password: password.as_deref(),
        auth_method: auth_method.as_deref(),
        auth_data: auth_data.as_deref(),
    };

    match broker.auth.authenticate(&ctx) {
        AuthResult::Allow => connect_on_authorized(broker, sid),
        AuthResult::Continue(data) => {
            if !v5 {
                send_refusal(broker, sid, ConnackCode::NotAuthorized, 0);
                return Err(Error::NotAuthorized);
            }
            let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
            session.state = SessionState::Authenticating;
            session.send_packet(&Packet::Auth(Auth {
                reason_code: reason_code::CONTINUE_AUTHENTICATION,
                method: auth_method,
                data: Some(data),
            }))?;
            broker.metrics.msgs_sent += 1;
            Ok(())
        }
        AuthResult::Deny => {
            send_refusal(
                broker,
                sid,
                ConnackCode::NotAuthorized,
                reason_code::NOT_AUTHORIZED,
            );
            Err(Error::NotAuthorized)
        }
        AuthResult::NotSupported => {
            send_refusal(
                broker,
                sid,
                ConnackCode::BadUsernamePassword,
                reason_code::BAD_AUTHENTICATION_METHOD,
            );
            Err(Error::NotSupported("authentication method"))
        }
    }
}

/// Everything after a successful authentication: takeover, ACL
/// re-filtering of carried queues, session-table insert, keepalive
/// policy, CONNACK, and the initial queue drain.
fn connect_on_authorized(broker: &mut Broker, sid: SessionId) -> Result<()> {
    let now_mono = broker.now_mono();
    let now_wall = broker.now_wall();

    let (client_id, clean_start, protocol, assigned_id, auth_method) = {
        let session = broker.sessions.get(&sid).ok_or(Error::NotFound)?;
        (
            session.client_id.clone(),
            session.clean_start,
            session.protocol,
            session.assigned_id,
            session.auth_method.clone(),
        )
    };
    let v5 = protocol.is_v5();

    // Session takeover: a prior session under the same identifier is
    // displaced, and (unless clean start applies) its state moves to
    // this handle.
    let mut session_present = false;
    let old_sid = broker.by_client_id.get(&client_id).copied();
    if let Some(old_sid) = old_sid.filter(|&old| old != sid && broker.sessions.contains_key(&old)) {
        session_present = takeover(broker, sid, old_sid, clean_start, now_mono)?;
    }

    // The authenticated identity may differ from the one that queued the
    // carried-over messages; re-check everything against the ACL.
    acl_filter_queues(broker, sid);

    broker.by_client_id.insert(client_id.clone(), sid);

    // Keepalive ceiling.
    let max_keepalive = broker.cfg.session.max_keepalive;
    let mut server_keep_alive = None;
    {
        let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
        if max_keepalive != 0 && (session.keep_alive > max_keepalive || session.keep_alive == 0) {
            if v5 {
                session.keep_alive = max_keepalive;
                server_keep_alive = Some(max_keepalive);
            } else {
                send_refusal(broker, sid, ConnackCode::IdentifierRejected, 0);
                return Err(Error::InvalidArgument("keepalive above configured maximum"));
            }
        }
    }

    {
        let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
        session.max_qos = match broker.cfg.mqtt.max_qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        };
        session.state = SessionState::Active;
        session.is_dropping = false;
        session.record_activity(now_mono);

        if let Some(username) = &session.username {
            info!(
                "new client connected as {} (p{}, c{}, k{}, u'{}')",
                session.client_id,
                session.protocol.level(),
                session.clean_start as u8,
                session.keep_alive,
                username
            );
        } else {
            info!(
                "new client connected as {} (p{}, c{}, k{})",
                session.client_id,
                session.protocol.level(),
                session.clean_start as u8,
                session.keep_alive
            );
        }
    }

    // CONNACK, then drain queued and retry in-flight.
    let connack = build_success_connack(
        broker,
        session_present && matches!(protocol, Protocol::V311 | Protocol::V5),
        assigned_id.then(|| client_id.clone()),
        server_keep_alive,
        auth_method,
        v5,
    );
    let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
    session.send_packet(&Packet::Connack(connack))?;
    broker.metrics.msgs_sent += 1;

    let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
    queue::write_queued_out(session, now_mono);
    queue::write_inflight_out_all(&mut broker.metrics, session, now_mono, now_wall)?;
    queue::write_queued_in(session, now_mono)?;
    Ok(())
}

/// Displace the session previously registered under this client id.
/// Returns whether prior state was carried into the new handle.
fn takeover(
    broker: &mut Broker,
    sid: SessionId,
    old_sid: SessionId,
    clean_start: bool,
    now_mono: u64,
) -> Result<bool> {
    let (old_connected, old_expiry, old_clean, old_v5) = {
        let old = broker.sessions.get(&old_sid).ok_or(Error::NotFound)?;
        (
            old.connected,
            old.session_expiry_interval,
            old.clean_start,
            old.protocol.is_v5(),
        )
    };
    if old_connected {
        info!("client already connected, closing old connection");
    }

    let resume = !clean_start && old_expiry > 0;
    let mut session_present = false;

    if resume {
        session_present = true;

        // Move the message blocks and subscriptions wholesale,
        // preserving the window sizes the new connection negotiated.
        let (mut msgs_in, mut msgs_out, filters, last_mid) = {
            let old = broker.sessions.get_mut(&old_sid).ok_or(Error::NotFound)?;
            (
                std::mem::take(&mut old.msgs_in),
                std::mem::take(&mut old.msgs_out),
                std::mem::take(&mut old.subscriptions),
                old.last_mid(),
            )
        };
        {
            let new = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
            msgs_in.inflight_maximum = new.msgs_in.inflight_maximum;
            msgs_out.inflight_maximum = new.msgs_out.inflight_maximum;
            new.msgs_in = msgs_in;
            new.msgs_out = msgs_out;
            new.subscriptions = filters;
            new.set_last_mid(last_mid);
            queue::reconnect_reset(&broker.cfg, new, now_mono);
        }
        // Rewrite every leaf back-pointer to the new handle.
        let filters = {
            let new = broker.sessions.get(&sid).ok_or(Error::NotFound)?;
            new.subscriptions.clone()
        };
        for filter in &filters {
            broker.subs.rewrite_session(filter, old_sid, sid);
        }
    } else {
        // Clean start (requested by either side): discard the old
        // session's subscriptions and queues.
        let filters = {
            let old = broker.sessions.get_mut(&old_sid).ok_or(Error::NotFound)?;
            old.msgs_in.clear();
            old.msgs_out.clear();
            std::mem::take(&mut old.subscriptions)
        };
        for filter in &filters {
            broker.subs.unsubscribe(filter, old_sid);
        }
    }

    // The displaced session's will fires only when it would have fired
    // anyway (its state is gone) or the new handshake demands it.
    let fire_will = (old_v5 && old_expiry == 0) || (!old_v5 && old_clean) || clean_start;
    let will_info = {
        let old = broker.sessions.get_mut(&old_sid).ok_or(Error::NotFound)?;
        old.will_due_at = None;
        let will = old.will.take();
        if fire_will {
            will.map(|w| (old.client_id.clone(), old.username.clone(), w))
        } else {
            None
        }
    };

    // Retire the old handle. If it still has a socket, the event loop
    // flushes the DISCONNECT and closes it; otherwise drop it now.
    {
        let old = broker.sessions.get_mut(&old_sid).ok_or(Error::NotFound)?;
        old.clean_start = true;
        old.session_expiry_interval = 0;
        old.state = SessionState::Duplicate;
        if old_v5 && old.connected {
            if let Err(e) = old.send_packet(&Packet::Disconnect(embermq_core::packet::Disconnect {
                reason_code: reason_code::SESSION_TAKEN_OVER,
                session_expiry_interval: None,
            })) {
                debug!("failed to notify displaced session: {}", e);
            }
        }
    }
    if !old_connected {
        broker.remove_session(old_sid);
    }

    if let Some((source_id, source_username, will)) = will_info {
        broker.publish_will(source_id, source_username, will)?;
    }

    Ok(session_present)
}

/// Drop carried-over queue entries the (re)authenticated identity is no
/// longer allowed to send or receive.
fn acl_filter_queues(broker: &mut Broker, sid: SessionId) {
    let auth = &broker.auth;
    let Some(session) = broker.sessions.get_mut(&sid) else {
        return;
    };
    let client_id = session.client_id.clone();
    let username = session.username.clone();

    for dir in [Direction::Out, Direction::In] {
        let access = match dir {
            Direction::Out => Access::Read,
            Direction::In => Access::Write,
        };
        let msgs = match dir {
            Direction::Out => &mut session.msgs_out,
            Direction::In => &mut session.msgs_in,
        };
        let mut i = 0;
        while i < msgs.inflight.len() {
            let allowed = {
                let m = &msgs.inflight[i];
                auth.acl_check(
                    &client_id,
                    username.as_deref(),
                    &m.store.topic,
                    &m.store.payload,
                    m.store.qos,
                    m.store.retain,
                    access,
                )
            };
            if allowed {
                i += 1;
            } else {
                msgs.remove_inflight(i);
            }
        }
        let mut i = 0;
        while i < msgs.queued.len() {
            let allowed = {
                let m = &msgs.queued[i];
                auth.acl_check(
                    &client_id,
                    username.as_deref(),
                    &m.store.topic,
                    &m.store.payload,
                    m.store.qos,
                    m.store.retain,
                    access,
                )
            };
            if allowed {
                i += 1;
            } else {
                msgs.remove_queued(i);
            }
        }
    }
}

/// CONNACK for an accepted connection, advertising server capabilities
/// to v5 clients.
fn build_success_connack(
    broker: &Broker,
    session_present: bool,
    assigned_client_id: Option<String>,
    server_keep_alive: Option<u16>,
    auth_method: Option<String>,
    v5: bool,
) -> Connack {
    if !v5 {
        return Connack {
            session_present,
            code: ConnackCode::Accepted,
            reason_code: None,
            properties: None,
        };
    }

    let cfg = &broker.cfg;
    let mut props = ConnackProperties {
        assigned_client_identifier: assigned_client_id,
        server_keep_alive,
        authentication_method: auth_method,
        ..Default::default()
    };
    if cfg.limits.max_topic_alias > 0 {
        props.topic_alias_maximum = Some(cfg.limits.max_topic_alias);
    }
    if cfg.limits.max_inflight_messages > 0 {
        props.receive_maximum = Some(cfg.limits.max_inflight_messages);
    }
    if cfg.limits.max_packet_size > 0 {
        props.maximum_packet_size = Some(cfg.limits.max_packet_size);
    }
    if cfg.mqtt.max_qos < 2 {
        props.maximum_qos = Some(cfg.mqtt.max_qos);
    }
    if !cfg.mqtt.retain_available {
        props.retain_available = Some(false);
    }
    if !cfg.mqtt.shared_subscriptions {
        props.shared_subscription_available = Some(false);
    }

    Connack {
        session_present,
        code: ConnackCode::Accepted,
        reason_code: Some(reason_code::SUCCESS),
        properties: Some(props),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_generate_client_id_shape() {
        let broker = Broker::with_defaults(Config::default());
        let id = generate_client_id(&broker);
        assert!(id.starts_with("auto-"));
        let uuid = &id["auto-".len()..];
        assert_eq!(uuid.len(), 36);
        assert_eq!(uuid.matches('-').count(), 4);
    }

    #[test]
    fn test_success_connack_v3_has_no_properties() {
        let broker = Broker::with_defaults(Config::default());
        let connack = build_success_connack(&broker, true, None, None, None, false);
        assert!(connack.session_present);
        assert!(connack.reason_code.is_none());
        assert!(connack.properties.is_none());
    }

    #[test]
    fn test_success_connack_v5_advertises_limits() {
        let mut cfg = Config::default();
        cfg.mqtt.max_qos = 1;
        cfg.mqtt.retain_available = false;
        let broker = Broker::with_defaults(cfg);
        let connack =
            build_success_connack(&broker, false, Some("auto-x".into()), Some(120), None, true);
        let props = connack.properties.unwrap();
        assert_eq!(props.assigned_client_identifier.as_deref(), Some("auto-x"));
        assert_eq!(props.server_keep_alive, Some(120));
        assert_eq!(props.maximum_qos, Some(1));
        assert_eq!(props.retain_available, Some(false));
        assert_eq!(props.receive_maximum, Some(20));
    }
}
