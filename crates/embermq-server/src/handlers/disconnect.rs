//! DISCONNECT handling.

use log::debug;

use embermq_core::error::{Error, ProtocolError, Result};
use embermq_core::packet::{reason_code, Disconnect};

use crate::broker::Broker;
use crate::session::SessionId;

/// Graceful DISCONNECT from the client.
///
/// Reason 0x00 discards the will; the v5 "disconnect with will" reason
/// activates it. A v5 client may also revise its session expiry here,
/// but only if it announced a non-zero expiry at CONNECT.
pub fn handle_disconnect(broker: &mut Broker, sid: SessionId, packet: Disconnect) -> Result<()> {
    let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
    let v5 = session.protocol.is_v5();

    if v5 {
        if let Some(expiry) = packet.session_expiry_interval {
            if session.session_expiry_interval == 0 && expiry != 0 {
                broker.send_disconnect_reason(sid, reason_code::PROTOCOL_ERROR);
                return Err(ProtocolError::UnexpectedPacket(
                    "session expiry revised after connecting with expiry 0",
                )
                .into());
            }
            let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
            session.session_expiry_interval =
                expiry.min(broker.cfg.session.max_session_expiry_interval);
        }
    }

    let session = broker.sessions.get_mut(&sid).ok_or(Error::NotFound)?;
    debug!("client {} disconnected", session.client_id);
    let with_will = v5 && packet.reason_code == reason_code::DISCONNECT_WITH_WILL;
    broker.finish_disconnect(sid, with_will);
    Ok(())
}
