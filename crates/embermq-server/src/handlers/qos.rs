//! QoS acknowledgment handlers: PUBACK, PUBREC, PUBREL, PUBCOMP.

use embermq_core::error::{Error, Result};
use embermq_core::packet::{reason_code, Ack, QoS};

use crate::broker::Broker;
use crate::queue;
use crate::session::MsgState;

/// PUBACK: the peer acknowledged a QoS 1 PUBLISH.
pub fn handle_puback(broker: &mut Broker, sid: crate::session::SessionId, ack: Ack) -> Result<()> {
    let now_mono = broker.now_mono();
    let now_wall = broker.now_wall();
    let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
    queue::delete_outgoing(
        &mut broker.metrics,
        session,
        ack.packet_id,
        MsgState::WaitForPuback,
        QoS::AtLeastOnce,
        now_mono,
        now_wall,
    )?;
    Ok(())
}

/// PUBREC: the peer received a QoS 2 PUBLISH; answer with PUBREL, or
/// drop the message if the peer refused it.
pub fn handle_pubrec(broker: &mut Broker, sid: crate::session::SessionId, ack: Ack) -> Result<()> {
    let now_mono = broker.now_mono();
    let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
    if ack.reason_code >= reason_code::UNSPECIFIED_ERROR {
        queue::pubrec_rejected(session, ack.packet_id);
        return Ok(());
    }
    queue::pubrec_received(session, ack.packet_id, now_mono)?;
    broker.metrics.msgs_sent += 1;
    Ok(())
}

/// PUBREL: the publisher released an inbound QoS 2 message; deliver it
/// to subscribers and complete with PUBCOMP.
pub fn handle_pubrel(broker: &mut Broker, sid: crate::session::SessionId, ack: Ack) -> Result<()> {
    broker.release_incoming(sid, ack.packet_id)
}

/// PUBCOMP: the peer completed a QoS 2 flow.
pub fn handle_pubcomp(broker: &mut Broker, sid: crate::session::SessionId, ack: Ack) -> Result<()> {
    let now_mono = broker.now_mono();
    let now_wall = broker.now_wall();
    let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
    queue::delete_outgoing(
        &mut broker.metrics,
        session,
        ack.packet_id,
        MsgState::WaitForPubcomp,
        QoS::ExactlyOnce,
        now_mono,
        now_wall,
    )?;
    Ok(())
}
