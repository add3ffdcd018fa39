//! MQTT packet types and codec for MQTT 3.1, 3.1.1 and 5.0.
//!
//! Decoding is cursor-based over an in-memory buffer: a short read is an
//! `IncompletePacket` error from the cursor, and `decode_packet` turns a
//! buffer that simply ends too early into `Ok(None)` ("need more bytes").
//! Encoding appends to a `Vec<u8>`.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::varint;

/// MQTT control packet types (upper four bits of the fixed header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            15 => Ok(PacketType::Auth),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedPacket(format!("invalid QoS: {}", value))),
        }
    }
}

/// Negotiated protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// MQTT 3.1 ("MQIsdp", level 3).
    V31,
    /// MQTT 3.1.1 ("MQTT", level 4).
    V311,
    /// MQTT 5.0 ("MQTT", level 5).
    V5,
}

impl Protocol {
    /// The protocol level byte carried in CONNECT.
    pub fn level(self) -> u8 {
        match self {
            Protocol::V31 => 3,
            Protocol::V311 => 4,
            Protocol::V5 => 5,
        }
    }

    pub fn is_v5(self) -> bool {
        matches!(self, Protocol::V5)
    }
}

/// CONNACK return codes (MQTT 3.x).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

/// MQTT 5 reason codes. Constants rather than an enum because several
/// values repeat with packet-dependent meanings.
pub mod reason_code {
    pub const SUCCESS: u8 = 0x00;
    pub const NORMAL_DISCONNECTION: u8 = 0x00;
    pub const GRANTED_QOS_0: u8 = 0x00;
    pub const GRANTED_QOS_1: u8 = 0x01;
    pub const GRANTED_QOS_2: u8 = 0x02;
    pub const DISCONNECT_WITH_WILL: u8 = 0x04;
    pub const NO_MATCHING_SUBSCRIBERS: u8 = 0x10;
    pub const NO_SUBSCRIPTION_EXISTED: u8 = 0x11;
    pub const CONTINUE_AUTHENTICATION: u8 = 0x18;
    pub const RE_AUTHENTICATE: u8 = 0x19;
    pub const UNSPECIFIED_ERROR: u8 = 0x80;
    pub const MALFORMED_PACKET: u8 = 0x81;
    pub const PROTOCOL_ERROR: u8 = 0x82;
    pub const IMPLEMENTATION_SPECIFIC_ERROR: u8 = 0x83;
    pub const UNSUPPORTED_PROTOCOL_VERSION: u8 = 0x84;
    pub const CLIENT_IDENTIFIER_NOT_VALID: u8 = 0x85;
    pub const BAD_USER_NAME_OR_PASSWORD: u8 = 0x86;
    pub const NOT_AUTHORIZED: u8 = 0x87;
    pub const SERVER_UNAVAILABLE: u8 = 0x88;
    pub const SERVER_BUSY: u8 = 0x89;
    pub const BAD_AUTHENTICATION_METHOD: u8 = 0x8C;
    pub const KEEP_ALIVE_TIMEOUT: u8 = 0x8D;
    pub const SESSION_TAKEN_OVER: u8 = 0x8E;
    pub const TOPIC_FILTER_INVALID: u8 = 0x8F;
    pub const TOPIC_NAME_INVALID: u8 = 0x90;
    pub const PACKET_IDENTIFIER_IN_USE: u8 = 0x91;
    pub const PACKET_IDENTIFIER_NOT_FOUND: u8 = 0x92;
    pub const RECEIVE_MAXIMUM_EXCEEDED: u8 = 0x93;
    pub const TOPIC_ALIAS_INVALID: u8 = 0x94;
    pub const PACKET_TOO_LARGE: u8 = 0x95;
    pub const QUOTA_EXCEEDED: u8 = 0x97;
    pub const ADMINISTRATIVE_ACTION: u8 = 0x98;
    pub const PAYLOAD_FORMAT_INVALID: u8 = 0x99;
    pub const RETAIN_NOT_SUPPORTED: u8 = 0x9A;
    pub const QOS_NOT_SUPPORTED: u8 = 0x9B;
    pub const SHARED_SUBSCRIPTIONS_NOT_SUPPORTED: u8 = 0x9E;
    pub const SUBSCRIPTION_IDENTIFIERS_NOT_SUPPORTED: u8 = 0xA1;
    pub const WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED: u8 = 0xA2;
}

// === Property identifiers (MQTT 5 §2.2.2) ===

mod prop {
    pub const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
    pub const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
    pub const CONTENT_TYPE: u8 = 0x03;
    pub const RESPONSE_TOPIC: u8 = 0x08;
    pub const CORRELATION_DATA: u8 = 0x09;
    pub const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
    pub const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
    pub const SERVER_KEEP_ALIVE: u8 = 0x13;
    pub const AUTHENTICATION_METHOD: u8 = 0x15;
    pub const AUTHENTICATION_DATA: u8 = 0x16;
    pub const REQUEST_PROBLEM_INFORMATION: u8 = 0x17;
    pub const WILL_DELAY_INTERVAL: u8 = 0x18;
    pub const REQUEST_RESPONSE_INFORMATION: u8 = 0x19;
    pub const REASON_STRING: u8 = 0x1F;
    pub const RECEIVE_MAXIMUM: u8 = 0x21;
    pub const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
    pub const TOPIC_ALIAS: u8 = 0x23;
    pub const MAXIMUM_QOS: u8 = 0x24;
    pub const RETAIN_AVAILABLE: u8 = 0x25;
    pub const USER_PROPERTY: u8 = 0x26;
    pub const MAXIMUM_PACKET_SIZE: u8 = 0x27;
    pub const WILDCARD_SUBSCRIPTION_AVAILABLE: u8 = 0x28;
    pub const SUBSCRIPTION_IDENTIFIERS_AVAILABLE: u8 = 0x29;
    pub const SHARED_SUBSCRIPTION_AVAILABLE: u8 = 0x2A;
}

/// MQTT 5 CONNECT properties.
#[derive(Debug, Clone, Default)]
pub struct ConnectProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_packet_size: Option<u32>,
    pub topic_alias_maximum: Option<u16>,
    pub request_response_information: bool,
    pub request_problem_information: bool,
    pub user_properties: Vec<(String, String)>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Vec<u8>>,
}

/// MQTT 5 Will properties.
#[derive(Debug, Clone, Default)]
pub struct WillProperties {
    pub will_delay_interval: Option<u32>,
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
}

/// MQTT 5 CONNACK properties.
#[derive(Debug, Clone, Default)]
pub struct ConnackProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<bool>,
    pub maximum_packet_size: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub topic_alias_maximum: Option<u16>,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
    pub wildcard_subscription_available: Option<bool>,
    pub subscription_identifiers_available: Option<bool>,
    pub shared_subscription_available: Option<bool>,
    pub server_keep_alive: Option<u16>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Vec<u8>>,
}

/// MQTT 5 PUBLISH properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub topic_alias: Option<u16>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
    /// May repeat on outbound server publishes (one per matching
    /// subscription that carried an identifier).
    pub subscription_identifiers: Vec<u32>,
    pub content_type: Option<String>,
}

impl PublishProperties {
    /// True when nothing would be encoded.
    pub fn is_empty(&self) -> bool {
        self.payload_format_indicator.is_none()
            && self.message_expiry_interval.is_none()
            && self.topic_alias.is_none()
            && self.response_topic.is_none()
            && self.correlation_data.is_none()
            && self.user_properties.is_empty()
            && self.subscription_identifiers.is_empty()
            && self.content_type.is_none()
    }
}

/// MQTT 5 subscription options byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    /// 0 = send retained, 1 = send retained only for new subscriptions,
    /// 2 = never send retained.
    pub retain_handling: u8,
}

impl SubscriptionOptions {
    /// Parse a SUBSCRIBE options byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        if byte & 0xC0 != 0 {
            return Err(
                ProtocolError::MalformedPacket("reserved subscription option bits set".into())
                    .into(),
            );
        }
        let retain_handling = (byte >> 4) & 0x03;
        if retain_handling == 3 {
            return Err(ProtocolError::MalformedPacket("invalid retain handling".into()).into());
        }
        Ok(Self {
            qos: QoS::try_from(byte & 0x03)?,
            no_local: byte & 0x04 != 0,
            retain_as_published: byte & 0x08 != 0,
            retain_handling,
        })
    }

    pub fn to_byte(self) -> u8 {
        self.qos as u8
            | if self.no_local { 0x04 } else { 0 }
            | if self.retain_as_published { 0x08 } else { 0 }
            | (self.retain_handling << 4)
    }
}

/// A decoded MQTT control packet.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback(Ack),
    Pubrec(Ack),
    Pubrel(Ack),
    Pubcomp(Ack),
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback(Unsuback),
    Pingreq,
    Pingresp,
    Disconnect(Disconnect),
    Auth(Auth),
}

/// CONNECT packet data.
#[derive(Debug, Clone)]
pub struct Connect {
    pub protocol: Protocol,
    /// High bit of the protocol level byte (v3.x only).
    pub is_bridge: bool,
    pub clean_start: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub properties: Option<ConnectProperties>,
}

/// Will message as carried in CONNECT.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Option<WillProperties>,
}

/// CONNACK packet data.
#[derive(Debug, Clone)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
    /// MQTT 5 reason code (used instead of `code` when set).
    pub reason_code: Option<u8>,
    pub properties: Option<ConnackProperties>,
}

/// PUBLISH packet data.
#[derive(Debug, Clone)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub properties: Option<PublishProperties>,
    pub payload: Bytes,
}

/// PUBACK/PUBREC/PUBREL/PUBCOMP data.
#[derive(Debug, Clone, Copy)]
pub struct Ack {
    pub packet_id: u16,
    /// 0x00 for v3.x packets.
    pub reason_code: u8,
}

impl Ack {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: reason_code::SUCCESS,
        }
    }
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, SubscriptionOptions)>,
    /// MQTT 5 subscription identifier for every filter in this packet.
    pub subscription_id: Option<u32>,
}

/// SUBACK packet data.
#[derive(Debug, Clone)]
pub struct Suback {
    pub packet_id: u16,
    pub reason_codes: Vec<u8>,
    pub v5: bool,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// UNSUBACK packet data.
#[derive(Debug, Clone)]
pub struct Unsuback {
    pub packet_id: u16,
    /// One per filter, v5 only; v3.x UNSUBACK has no payload.
    pub reason_codes: Vec<u8>,
    pub v5: bool,
}

/// DISCONNECT packet data.
#[derive(Debug, Clone, Copy)]
pub struct Disconnect {
    pub reason_code: u8,
    /// v5: the client may revise its session expiry at disconnect time.
    pub session_expiry_interval: Option<u32>,
}

impl Disconnect {
    pub fn normal() -> Self {
        Self {
            reason_code: reason_code::NORMAL_DISCONNECTION,
            session_expiry_interval: None,
        }
    }
}

/// AUTH packet data (MQTT 5 extended authentication).
#[derive(Debug, Clone)]
pub struct Auth {
    pub reason_code: u8,
    pub method: Option<String>,
    pub data: Option<Vec<u8>>,
}

// === Decoding ===

/// Cursor over a packet body.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 }.into());
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            }
            .into());
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Length-prefixed UTF-8 string. Embedded NUL is rejected
    /// (MQTT-1.5.3-2), as is invalid UTF-8.
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        if bytes.contains(&0u8) {
            return Err(
                ProtocolError::MalformedPacket("string contains NUL character".into()).into(),
            );
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    /// Length-prefixed binary data.
    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    fn read_varint(&mut self) -> Result<u32> {
        match varint::decode(&self.buf[self.pos..])? {
            Some((value, consumed)) => {
                self.pos += consumed;
                Ok(value)
            }
            None => Err(ProtocolError::IncompletePacket { needed: 1, have: 0 }.into()),
        }
    }

    /// Set a single-valued property, failing on a repeat of the same
    /// identifier.
    fn set_once<T>(slot: &mut Option<T>, id: u8, value: T) -> Result<()> {
        if slot.is_some() {
            return Err(ProtocolError::DuplicateProperty(id).into());
        }
        *slot = Some(value);
        Ok(())
    }

    fn read_connect_properties(&mut self) -> Result<ConnectProperties> {
        let len = self.read_varint()? as usize;
        let end = self.pos + len;
        let mut props = ConnectProperties::default();
        let mut seen_rri = false;
        let mut seen_rpi = false;

        while self.pos < end {
            let id = self.read_u8()?;
            match id {
                prop::SESSION_EXPIRY_INTERVAL => {
                    let v = self.read_u32()?;
                    Self::set_once(&mut props.session_expiry_interval, id, v)?;
                }
                prop::RECEIVE_MAXIMUM => {
                    let v = self.read_u16()?;
                    if v == 0 {
                        return Err(
                            ProtocolError::MalformedPacket("receive maximum of 0".into()).into()
                        );
                    }
                    Self::set_once(&mut props.receive_maximum, id, v)?;
                }
                prop::MAXIMUM_PACKET_SIZE => {
                    let v = self.read_u32()?;
                    if v == 0 {
                        return Err(
                            ProtocolError::MalformedPacket("maximum packet size of 0".into())
                                .into(),
                        );
                    }
                    Self::set_once(&mut props.maximum_packet_size, id, v)?;
                }
                prop::TOPIC_ALIAS_MAXIMUM => {
                    let v = self.read_u16()?;
                    Self::set_once(&mut props.topic_alias_maximum, id, v)?;
                }
                prop::REQUEST_RESPONSE_INFORMATION => {
                    if seen_rri {
                        return Err(ProtocolError::DuplicateProperty(id).into());
                    }
                    seen_rri = true;
                    props.request_response_information = self.read_u8()? != 0;
                }
                prop::REQUEST_PROBLEM_INFORMATION => {
                    if seen_rpi {
                        return Err(ProtocolError::DuplicateProperty(id).into());
                    }
                    seen_rpi = true;
                    props.request_problem_information = self.read_u8()? != 0;
                }
                prop::USER_PROPERTY => {
                    let key = self.read_string()?;
                    let value = self.read_string()?;
                    props.user_properties.push((key, value));
                }
                prop::AUTHENTICATION_METHOD => {
                    let v = self.read_string()?;
                    Self::set_once(&mut props.authentication_method, id, v)?;
                }
                prop::AUTHENTICATION_DATA => {
                    let v = self.read_binary()?;
                    Self::set_once(&mut props.authentication_data, id, v)?;
                }
                _ => {
                    return Err(ProtocolError::InvalidProperty {
                        property: id,
                        packet: "CONNECT",
                    }
                    .into())
                }
            }
        }

        Ok(props)
    }

    fn read_will_properties(&mut self) -> Result<WillProperties> {
        let len = self.read_varint()? as usize;
        let end = self.pos + len;
        let mut props = WillProperties::default();

        while self.pos < end {
            let id = self.read_u8()?;
            match id {
                prop::WILL_DELAY_INTERVAL => {
                    let v = self.read_u32()?;
                    Self::set_once(&mut props.will_delay_interval, id, v)?;
                }
                prop::PAYLOAD_FORMAT_INDICATOR => {
                    let v = self.read_u8()?;
                    Self::set_once(&mut props.payload_format_indicator, id, v)?;
                }
                prop::MESSAGE_EXPIRY_INTERVAL => {
                    let v = self.read_u32()?;
                    Self::set_once(&mut props.message_expiry_interval, id, v)?;
                }
                prop::CONTENT_TYPE => {
                    let v = self.read_string()?;
                    Self::set_once(&mut props.content_type, id, v)?;
                }
                prop::RESPONSE_TOPIC => {
                    let v = self.read_string()?;
                    Self::set_once(&mut props.response_topic, id, v)?;
                }
                prop::CORRELATION_DATA => {
                    let v = self.read_binary()?;
                    Self::set_once(&mut props.correlation_data, id, v)?;
                }
                prop::USER_PROPERTY => {
                    let key = self.read_string()?;
                    let value = self.read_string()?;
                    props.user_properties.push((key, value));
                }
                _ => {
                    return Err(ProtocolError::InvalidProperty {
                        property: id,
                        packet: "will",
                    }
                    .into())
                }
            }
        }

        Ok(props)
    }

    fn read_publish_properties(&mut self) -> Result<PublishProperties> {
        let len = self.read_varint()? as usize;
        let end = self.pos + len;
        let mut props = PublishProperties::default();

        while self.pos < end {
            let id = self.read_u8()?;
            match id {
                prop::PAYLOAD_FORMAT_INDICATOR => {
                    let v = self.read_u8()?;
                    Self::set_once(&mut props.payload_format_indicator, id, v)?;
                }
                prop::MESSAGE_EXPIRY_INTERVAL => {
                    let v = self.read_u32()?;
                    Self::set_once(&mut props.message_expiry_interval, id, v)?;
                }
                prop::TOPIC_ALIAS => {
                    let v = self.read_u16()?;
                    if v == 0 {
                        return Err(ProtocolError::MalformedPacket("topic alias of 0".into()).into());
                    }
                    Self::set_once(&mut props.topic_alias, id, v)?;
                }
                prop::RESPONSE_TOPIC => {
                    let v = self.read_string()?;
                    Self::set_once(&mut props.response_topic, id, v)?;
                }
                prop::CORRELATION_DATA => {
                    let v = self.read_binary()?;
                    Self::set_once(&mut props.correlation_data, id, v)?;
                }
                prop::USER_PROPERTY => {
                    let key = self.read_string()?;
                    let value = self.read_string()?;
                    props.user_properties.push((key, value));
                }
                prop::SUBSCRIPTION_IDENTIFIER => {
                    let v = self.read_varint()?;
                    if v == 0 {
                        return Err(ProtocolError::MalformedPacket(
                            "subscription identifier of 0".into(),
                        )
                        .into());
                    }
                    props.subscription_identifiers.push(v);
                }
                prop::CONTENT_TYPE => {
                    let v = self.read_string()?;
                    Self::set_once(&mut props.content_type, id, v)?;
                }
                _ => {
                    return Err(ProtocolError::InvalidProperty {
                        property: id,
                        packet: "PUBLISH",
                    }
                    .into())
                }
            }
        }

        Ok(props)
    }

    /// Skip a property list, validating only its framing. Used for ack
    /// packets where the broker does not act on reason strings.
    fn skip_properties(&mut self) -> Result<()> {
        let len = self.read_varint()? as usize;
        self.read_bytes(len)?;
        Ok(())
    }
}

/// Decode the remaining-length field. `None` means more bytes needed.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    Ok(varint::decode(buf)?.map(|(v, n)| (v as usize, n)))
}

/// Try to decode one complete packet from the front of `buf`.
///
/// `version` is the session's negotiated protocol, or `None` before
/// CONNECT has been seen. `max_packet_size` of 0 means unlimited.
/// Returns `Ok(None)` when the buffer does not yet hold a full packet.
pub fn decode_packet(
    buf: &[u8],
    version: Option<Protocol>,
    max_packet_size: u32,
) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed_header = buf[0];
    let packet_type_raw = fixed_header >> 4;
    let flags = fixed_header & 0x0F;

    let Some((remaining_len, len_bytes)) = decode_remaining_length(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;

    if max_packet_size > 0 && total_len > max_packet_size as usize {
        return Err(ProtocolError::PacketTooLarge {
            size: total_len,
            max: max_packet_size as usize,
        }
        .into());
    }

    if buf.len() < total_len {
        return Ok(None);
    }

    let packet_type = PacketType::try_from(packet_type_raw)?;
    let body = &buf[header_len..total_len];
    let v5 = version.map(Protocol::is_v5).unwrap_or(false);

    // Fixed-header flag rules: SUBSCRIBE/UNSUBSCRIBE/PUBREL carry 0b0010,
    // everything except PUBLISH carries zero.
    match packet_type {
        PacketType::Subscribe | PacketType::Unsubscribe | PacketType::Pubrel => {
            if flags != 0x02 {
                return Err(ProtocolError::MalformedPacket(format!(
                    "{:?} fixed header flags must be 0x02, got {:#04x}",
                    packet_type, flags
                ))
                .into());
            }
        }
        PacketType::Publish => {}
        _ => {
            if flags != 0 {
                return Err(ProtocolError::MalformedPacket(format!(
                    "{:?} fixed header flags must be 0, got {:#04x}",
                    packet_type, flags
                ))
                .into());
            }
        }
    }

    let packet = match packet_type {
        PacketType::Connect => decode_connect(body)?,
        PacketType::Connack => decode_connack(body, v5)?,
        PacketType::Publish => decode_publish(flags, body, v5)?,
        PacketType::Puback => Packet::Puback(decode_ack(body, v5)?),
        PacketType::Pubrec => Packet::Pubrec(decode_ack(body, v5)?),
        PacketType::Pubrel => Packet::Pubrel(decode_ack(body, v5)?),
        PacketType::Pubcomp => Packet::Pubcomp(decode_ack(body, v5)?),
        PacketType::Subscribe => decode_subscribe(body, v5)?,
        PacketType::Suback => decode_suback(body, v5)?,
        PacketType::Unsubscribe => decode_unsubscribe(body, v5)?,
        PacketType::Unsuback => decode_unsuback(body, v5)?,
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => decode_disconnect(body, v5)?,
        PacketType::Auth => decode_auth(body)?,
    };

    Ok(Some((packet, total_len)))
}

fn decode_connect(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);

    let protocol_name = dec.read_string()?;
    let level_byte = dec.read_u8()?;
    let level = level_byte & 0x7F;
    let bridge_bit = level_byte & 0x80 != 0;

    let protocol = match (protocol_name.as_str(), level) {
        ("MQIsdp", 3) => Protocol::V31,
        ("MQTT", 4) => Protocol::V311,
        ("MQTT", 5) => Protocol::V5,
        ("MQIsdp", _) | ("MQTT", _) => {
            return Err(ProtocolError::UnsupportedProtocolVersion(level).into())
        }
        _ => return Err(ProtocolError::InvalidProtocolName(protocol_name).into()),
    };
    // The bridge marker exists only in the 3.x dialects.
    if bridge_bit && protocol.is_v5() {
        return Err(ProtocolError::UnsupportedProtocolVersion(level_byte).into());
    }

    let flags = dec.read_u8()?;
    if protocol != Protocol::V31 && flags & 0x01 != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }
    let clean_start = flags & 0x02 != 0;
    let will_flag = flags & 0x04 != 0;
    let will_qos_raw = (flags >> 3) & 0x03;
    let will_retain = flags & 0x20 != 0;
    let password_flag = flags & 0x40 != 0;
    let username_flag = flags & 0x80 != 0;

    // Will QoS of 3 is invalid; without the will flag, QoS and retain
    // must be zero (MQTT-3.1.2-11/13/15).
    let will_qos = QoS::try_from(will_qos_raw)?;
    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }
    // MQTT-3.1.2-22: password needs username in 3.x; v5 allows it alone.
    if !protocol.is_v5() && !username_flag && password_flag {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }

    let keep_alive = dec.read_u16()?;

    let properties = if protocol.is_v5() {
        Some(dec.read_connect_properties()?)
    } else {
        None
    };

    let client_id = dec.read_string()?;

    let will = if will_flag {
        let will_properties = if protocol.is_v5() {
            Some(dec.read_will_properties()?)
        } else {
            None
        };
        let topic = dec.read_string()?;
        let payload = Bytes::from(dec.read_binary()?);
        Some(Will {
            topic,
            payload,
            qos: will_qos,
            retain: will_retain,
            properties: will_properties,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };
    let password = if password_flag {
        Some(dec.read_binary()?)
    } else {
        None
    };

    if dec.remaining() != 0 {
        return Err(ProtocolError::MalformedPacket("surplus data after CONNECT".into()).into());
    }

    Ok(Packet::Connect(Connect {
        protocol,
        is_bridge: bridge_bit,
        clean_start,
        keep_alive,
        client_id,
        will,
        username,
        password,
        properties,
    }))
}

fn decode_connack(body: &[u8], v5: bool) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let ack_flags = dec.read_u8()?;
    let session_present = ack_flags & 0x01 != 0;
    let code_raw = dec.read_u8()?;

    if v5 {
        dec.skip_properties()?;
        Ok(Packet::Connack(Connack {
            session_present,
            code: ConnackCode::Accepted,
            reason_code: Some(code_raw),
            properties: None,
        }))
    } else {
        let code = match code_raw {
            0 => ConnackCode::Accepted,
            1 => ConnackCode::UnacceptableProtocolVersion,
            2 => ConnackCode::IdentifierRejected,
            3 => ConnackCode::ServerUnavailable,
            4 => ConnackCode::BadUsernamePassword,
            5 => ConnackCode::NotAuthorized,
            _ => {
                return Err(
                    ProtocolError::MalformedPacket(format!("CONNACK code {}", code_raw)).into(),
                )
            }
        };
        Ok(Packet::Connack(Connack {
            session_present,
            code,
            reason_code: None,
            properties: None,
        }))
    }
}

fn decode_publish(flags: u8, body: &[u8], v5: bool) -> Result<Packet> {
    let dup = flags & 0x08 != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = flags & 0x01 != 0;

    // MQTT-3.3.1-2: DUP is always 0 for QoS 0.
    if dup && qos == QoS::AtMostOnce {
        return Err(ProtocolError::MalformedPacket("DUP set on QoS 0 PUBLISH".into()).into());
    }

    let mut dec = Decoder::new(body);
    let topic = dec.read_string()?;

    let packet_id = if qos != QoS::AtMostOnce {
        let id = dec.read_u16()?;
        if id == 0 {
            return Err(ProtocolError::MalformedPacket("packet identifier of 0".into()).into());
        }
        Some(id)
    } else {
        None
    };

    let properties = if v5 {
        let props = dec.read_publish_properties()?;
        if props.is_empty() {
            None
        } else {
            Some(props)
        }
    } else {
        None
    };

    let payload = Bytes::copy_from_slice(dec.read_bytes(dec.remaining())?);

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        properties,
        payload,
    }))
}

fn decode_ack(body: &[u8], v5: bool) -> Result<Ack> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;
    if packet_id == 0 {
        return Err(ProtocolError::MalformedPacket("packet identifier of 0".into()).into());
    }

    // v5 acks may append a reason code and properties; a two-byte body
    // means success in both dialects.
    let reason_code = if v5 && dec.remaining() > 0 {
        let rc = dec.read_u8()?;
        if dec.remaining() > 0 {
            dec.skip_properties()?;
        }
        rc
    } else {
        reason_code::SUCCESS
    };

    Ok(Ack {
        packet_id,
        reason_code,
    })
}

fn decode_subscribe(body: &[u8], v5: bool) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut subscription_id = None;
    if v5 {
        let len = dec.read_varint()? as usize;
        let end = dec.pos + len;
        while dec.pos < end {
            let id = dec.read_u8()?;
            match id {
                prop::SUBSCRIPTION_IDENTIFIER => {
                    let v = dec.read_varint()?;
                    // MQTT-3.8.2-1: 1..=268,435,455.
                    if v == 0 {
                        return Err(ProtocolError::MalformedPacket(
                            "subscription identifier of 0".into(),
                        )
                        .into());
                    }
                    Decoder::set_once(&mut subscription_id, id, v)?;
                }
                prop::USER_PROPERTY => {
                    dec.read_string()?;
                    dec.read_string()?;
                }
                _ => {
                    return Err(ProtocolError::InvalidProperty {
                        property: id,
                        packet: "SUBSCRIBE",
                    }
                    .into())
                }
            }
        }
    }

    let mut filters = Vec::new();
    while dec.remaining() > 0 {
        let filter = dec.read_string()?;
        if filter.is_empty() {
            return Err(ProtocolError::MalformedPacket("empty topic filter".into()).into());
        }
        let options = SubscriptionOptions::from_byte(dec.read_u8()?)?;
        filters.push((filter, options));
    }

    if filters.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no filters".into()).into());
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        filters,
        subscription_id,
    }))
}

fn decode_suback(body: &[u8], v5: bool) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;
    if v5 {
        dec.skip_properties()?;
    }
    let reason_codes = dec.read_bytes(dec.remaining())?.to_vec();
    Ok(Packet::Suback(Suback {
        packet_id,
        reason_codes,
        v5,
    }))
}

fn decode_unsubscribe(body: &[u8], v5: bool) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    if v5 {
        dec.skip_properties()?;
    }

    let mut filters = Vec::new();
    while dec.remaining() > 0 {
        let filter = dec.read_string()?;
        if filter.is_empty() {
            return Err(ProtocolError::MalformedPacket("empty topic filter".into()).into());
        }
        filters.push(filter);
    }

    if filters.is_empty() {
        return Err(ProtocolError::MalformedPacket("UNSUBSCRIBE with no filters".into()).into());
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

fn decode_unsuback(body: &[u8], v5: bool) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;
    let reason_codes = if v5 {
        dec.skip_properties()?;
        dec.read_bytes(dec.remaining())?.to_vec()
    } else {
        Vec::new()
    };
    Ok(Packet::Unsuback(Unsuback {
        packet_id,
        reason_codes,
        v5,
    }))
}

fn decode_disconnect(body: &[u8], v5: bool) -> Result<Packet> {
    if !v5 || body.is_empty() {
        return Ok(Packet::Disconnect(Disconnect::normal()));
    }

    let mut dec = Decoder::new(body);
    let rc = dec.read_u8()?;
    let mut session_expiry_interval = None;

    if dec.remaining() > 0 {
        let len = dec.read_varint()? as usize;
        let end = dec.pos + len;
        while dec.pos < end {
            let id = dec.read_u8()?;
            match id {
                prop::SESSION_EXPIRY_INTERVAL => {
                    let v = dec.read_u32()?;
                    Decoder::set_once(&mut session_expiry_interval, id, v)?;
                }
                prop::REASON_STRING => {
                    dec.read_string()?;
                }
                prop::USER_PROPERTY => {
                    dec.read_string()?;
                    dec.read_string()?;
                }
                _ => {
                    return Err(ProtocolError::InvalidProperty {
                        property: id,
                        packet: "DISCONNECT",
                    }
                    .into())
                }
            }
        }
    }

    Ok(Packet::Disconnect(Disconnect {
        reason_code: rc,
        session_expiry_interval,
    }))
}

fn decode_auth(body: &[u8]) -> Result<Packet> {
    if body.is_empty() {
        return Ok(Packet::Auth(Auth {
            reason_code: reason_code::SUCCESS,
            method: None,
            data: None,
        }));
    }

    let mut dec = Decoder::new(body);
    let rc = dec.read_u8()?;
    let mut method = None;
    let mut data = None;

    if dec.remaining() > 0 {
        let len = dec.read_varint()? as usize;
        let end = dec.pos + len;
        while dec.pos < end {
            let id = dec.read_u8()?;
            match id {
                prop::AUTHENTICATION_METHOD => {
                    let v = dec.read_string()?;
                    Decoder::set_once(&mut method, id, v)?;
                }
                prop::AUTHENTICATION_DATA => {
                    let v = dec.read_binary()?;
                    Decoder::set_once(&mut data, id, v)?;
                }
                prop::REASON_STRING => {
                    dec.read_string()?;
                }
                prop::USER_PROPERTY => {
                    dec.read_string()?;
                    dec.read_string()?;
                }
                _ => {
                    return Err(ProtocolError::InvalidProperty {
                        property: id,
                        packet: "AUTH",
                    }
                    .into())
                }
            }
        }
    }

    Ok(Packet::Auth(Auth {
        reason_code: rc,
        method,
        data,
    }))
}

// === Encoding ===

fn push_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn push_binary(buf: &mut Vec<u8>, b: &[u8]) {
    buf.extend_from_slice(&(b.len() as u16).to_be_bytes());
    buf.extend_from_slice(b);
}

fn push_fixed_header(buf: &mut Vec<u8>, first_byte: u8, remaining: usize) {
    buf.push(first_byte);
    varint::encode(remaining as u32, buf);
}

/// Encode any server-emitted packet into `buf`.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) {
    match packet {
        Packet::Connect(p) => encode_connect(p, buf),
        Packet::Connack(p) => encode_connack(p, buf),
        Packet::Publish(p) => encode_publish(p, buf),
        Packet::Puback(a) => encode_ack(PacketType::Puback, *a, buf),
        Packet::Pubrec(a) => encode_ack(PacketType::Pubrec, *a, buf),
        Packet::Pubrel(a) => encode_ack(PacketType::Pubrel, *a, buf),
        Packet::Pubcomp(a) => encode_ack(PacketType::Pubcomp, *a, buf),
        Packet::Subscribe(p) => encode_subscribe(p, buf),
        Packet::Suback(p) => encode_suback(p, buf),
        Packet::Unsubscribe(p) => encode_unsubscribe(p, buf),
        Packet::Unsuback(p) => encode_unsuback(p, buf),
        Packet::Pingreq => push_fixed_header(buf, (PacketType::Pingreq as u8) << 4, 0),
        Packet::Pingresp => push_fixed_header(buf, (PacketType::Pingresp as u8) << 4, 0),
        Packet::Disconnect(p) => encode_disconnect(p, buf),
        Packet::Auth(p) => encode_auth(p, buf),
    }
}

fn encode_connect_properties(props: &ConnectProperties, buf: &mut Vec<u8>) {
    let mut p = Vec::new();
    if let Some(v) = props.session_expiry_interval {
        p.push(prop::SESSION_EXPIRY_INTERVAL);
        p.extend_from_slice(&v.to_be_bytes());
    }
    if let Some(v) = props.receive_maximum {
        p.push(prop::RECEIVE_MAXIMUM);
        p.extend_from_slice(&v.to_be_bytes());
    }
    if let Some(v) = props.maximum_packet_size {
        p.push(prop::MAXIMUM_PACKET_SIZE);
        p.extend_from_slice(&v.to_be_bytes());
    }
    if let Some(v) = props.topic_alias_maximum {
        p.push(prop::TOPIC_ALIAS_MAXIMUM);
        p.extend_from_slice(&v.to_be_bytes());
    }
    if let Some(ref v) = props.authentication_method {
        p.push(prop::AUTHENTICATION_METHOD);
        push_string(&mut p, v);
    }
    if let Some(ref v) = props.authentication_data {
        p.push(prop::AUTHENTICATION_DATA);
        push_binary(&mut p, v);
    }
    for (key, value) in &props.user_properties {
        p.push(prop::USER_PROPERTY);
        push_string(&mut p, key);
        push_string(&mut p, value);
    }
    varint::encode(p.len() as u32, buf);
    buf.extend_from_slice(&p);
}

fn encode_will_properties(props: &WillProperties, buf: &mut Vec<u8>) {
    let mut p = Vec::new();
    if let Some(v) = props.will_delay_interval {
        p.push(prop::WILL_DELAY_INTERVAL);
        p.extend_from_slice(&v.to_be_bytes());
    }
    if let Some(v) = props.payload_format_indicator {
        p.push(prop::PAYLOAD_FORMAT_INDICATOR);
        p.push(v);
    }
    if let Some(v) = props.message_expiry_interval {
        p.push(prop::MESSAGE_EXPIRY_INTERVAL);
        p.extend_from_slice(&v.to_be_bytes());
    }
    if let Some(ref v) = props.content_type {
        p.push(prop::CONTENT_TYPE);
        push_string(&mut p, v);
    }
    if let Some(ref v) = props.response_topic {
        p.push(prop::RESPONSE_TOPIC);
        push_string(&mut p, v);
    }
    if let Some(ref v) = props.correlation_data {
        p.push(prop::CORRELATION_DATA);
        push_binary(&mut p, v);
    }
    for (key, value) in &props.user_properties {
        p.push(prop::USER_PROPERTY);
        push_string(&mut p, key);
        push_string(&mut p, value);
    }
    varint::encode(p.len() as u32, buf);
    buf.extend_from_slice(&p);
}

/// Encode a CONNECT packet (used by tests and bridge-side callers).
pub fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) {
    let mut body = Vec::new();

    match connect.protocol {
        Protocol::V31 => push_string(&mut body, "MQIsdp"),
        _ => push_string(&mut body, "MQTT"),
    }
    let mut level = connect.protocol.level();
    if connect.is_bridge {
        level |= 0x80;
    }
    body.push(level);

    let mut flags = 0u8;
    if connect.clean_start {
        flags |= 0x02;
    }
    if let Some(ref will) = connect.will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.push(flags);

    body.extend_from_slice(&connect.keep_alive.to_be_bytes());

    if connect.protocol.is_v5() {
        match connect.properties {
            Some(ref props) => encode_connect_properties(props, &mut body),
            None => body.push(0),
        }
    }

    push_string(&mut body, &connect.client_id);

    if let Some(ref will) = connect.will {
        if connect.protocol.is_v5() {
            match will.properties {
                Some(ref props) => encode_will_properties(props, &mut body),
                None => body.push(0),
            }
        }
        push_string(&mut body, &will.topic);
        push_binary(&mut body, &will.payload);
    }

    if let Some(ref username) = connect.username {
        push_string(&mut body, username);
    }
    if let Some(ref password) = connect.password {
        push_binary(&mut body, password);
    }

    push_fixed_header(buf, (PacketType::Connect as u8) << 4, body.len());
    buf.extend_from_slice(&body);
}

fn encode_connack_properties(props: &ConnackProperties, buf: &mut Vec<u8>) {
    let mut p = Vec::new();
    if let Some(v) = props.session_expiry_interval {
        p.push(prop::SESSION_EXPIRY_INTERVAL);
        p.extend_from_slice(&v.to_be_bytes());
    }
    if let Some(v) = props.receive_maximum {
        p.push(prop::RECEIVE_MAXIMUM);
        p.extend_from_slice(&v.to_be_bytes());
    }
    if let Some(v) = props.maximum_qos {
        p.push(prop::MAXIMUM_QOS);
        p.push(v);
    }
    if let Some(v) = props.retain_available {
        p.push(prop::RETAIN_AVAILABLE);
        p.push(v as u8);
    }
    if let Some(v) = props.maximum_packet_size {
        p.push(prop::MAXIMUM_PACKET_SIZE);
        p.extend_from_slice(&v.to_be_bytes());
    }
    if let Some(ref v) = props.assigned_client_identifier {
        p.push(prop::ASSIGNED_CLIENT_IDENTIFIER);
        push_string(&mut p, v);
    }
    if let Some(v) = props.topic_alias_maximum {
        p.push(prop::TOPIC_ALIAS_MAXIMUM);
        p.extend_from_slice(&v.to_be_bytes());
    }
    if let Some(ref v) = props.reason_string {
        p.push(prop::REASON_STRING);
        push_string(&mut p, v);
    }
    for (key, value) in &props.user_properties {
        p.push(prop::USER_PROPERTY);
        push_string(&mut p, key);
        push_string(&mut p, value);
    }
    if let Some(v) = props.wildcard_subscription_available {
        p.push(prop::WILDCARD_SUBSCRIPTION_AVAILABLE);
        p.push(v as u8);
    }
    if let Some(v) = props.subscription_identifiers_available {
        p.push(prop::SUBSCRIPTION_IDENTIFIERS_AVAILABLE);
        p.push(v as u8);
    }
    if let Some(v) = props.shared_subscription_available {
        p.push(prop::SHARED_SUBSCRIPTION_AVAILABLE);
        p.push(v as u8);
    }
    if let Some(v) = props.server_keep_alive {
        p.push(prop::SERVER_KEEP_ALIVE);
        p.extend_from_slice(&v.to_be_bytes());
    }
    if let Some(ref v) = props.authentication_method {
        p.push(prop::AUTHENTICATION_METHOD);
        push_string(&mut p, v);
    }
    if let Some(ref v) = props.authentication_data {
        p.push(prop::AUTHENTICATION_DATA);
        push_binary(&mut p, v);
    }
    varint::encode(p.len() as u32, buf);
    buf.extend_from_slice(&p);
}

fn encode_connack(connack: &Connack, buf: &mut Vec<u8>) {
    let v5 = connack.reason_code.is_some() || connack.properties.is_some();

    if v5 {
        let mut body = Vec::new();
        body.push(connack.session_present as u8);
        body.push(connack.reason_code.unwrap_or(0));
        match connack.properties {
            Some(ref props) => encode_connack_properties(props, &mut body),
            None => body.push(0),
        }
        push_fixed_header(buf, (PacketType::Connack as u8) << 4, body.len());
        buf.extend_from_slice(&body);
    } else {
        push_fixed_header(buf, (PacketType::Connack as u8) << 4, 2);
        buf.push(connack.session_present as u8);
        buf.push(connack.code as u8);
    }
}

fn encode_publish_properties(props: &PublishProperties, buf: &mut Vec<u8>) {
    let mut p = Vec::new();
    if let Some(v) = props.payload_format_indicator {
        p.push(prop::PAYLOAD_FORMAT_INDICATOR);
        p.push(v);
    }
    if let Some(v) = props.message_expiry_interval {
        p.push(prop::MESSAGE_EXPIRY_INTERVAL);
        p.extend_from_slice(&v.to_be_bytes());
    }
    if let Some(v) = props.topic_alias {
        p.push(prop::TOPIC_ALIAS);
        p.extend_from_slice(&v.to_be_bytes());
    }
    if let Some(ref v) = props.response_topic {
        p.push(prop::RESPONSE_TOPIC);
        push_string(&mut p, v);
    }
    if let Some(ref v) = props.correlation_data {
        p.push(prop::CORRELATION_DATA);
        push_binary(&mut p, v);
    }
    for (key, value) in &props.user_properties {
        p.push(prop::USER_PROPERTY);
        push_string(&mut p, key);
        push_string(&mut p, value);
    }
    for &id in &props.subscription_identifiers {
        p.push(prop::SUBSCRIPTION_IDENTIFIER);
        varint::encode(id, &mut p);
    }
    if let Some(ref v) = props.content_type {
        p.push(prop::CONTENT_TYPE);
        push_string(&mut p, v);
    }
    varint::encode(p.len() as u32, buf);
    buf.extend_from_slice(&p);
}

/// Encode a PUBLISH packet. Properties are emitted only for v5 sessions;
/// the caller strips them for 3.x peers.
pub fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) {
    let mut first = (PacketType::Publish as u8) << 4;
    if publish.dup {
        first |= 0x08;
    }
    first |= (publish.qos as u8) << 1;
    if publish.retain {
        first |= 0x01;
    }

    let mut props_buf = Vec::new();
    if let Some(ref props) = publish.properties {
        encode_publish_properties(props, &mut props_buf);
    }

    let packet_id_len = if publish.qos != QoS::AtMostOnce { 2 } else { 0 };
    let remaining =
        2 + publish.topic.len() + packet_id_len + props_buf.len() + publish.payload.len();

    push_fixed_header(buf, first, remaining);
    push_string(buf, &publish.topic);
    if let Some(id) = publish.packet_id {
        buf.extend_from_slice(&id.to_be_bytes());
    }
    buf.extend_from_slice(&props_buf);
    buf.extend_from_slice(&publish.payload);
}

fn encode_ack(packet_type: PacketType, ack: Ack, buf: &mut Vec<u8>) {
    let mut first = (packet_type as u8) << 4;
    if packet_type == PacketType::Pubrel {
        first |= 0x02;
    }
    if ack.reason_code == reason_code::SUCCESS {
        push_fixed_header(buf, first, 2);
        buf.extend_from_slice(&ack.packet_id.to_be_bytes());
    } else {
        push_fixed_header(buf, first, 3);
        buf.extend_from_slice(&ack.packet_id.to_be_bytes());
        buf.push(ack.reason_code);
    }
}

/// Encode a SUBSCRIBE packet (used by tests and bridge-side callers).
pub fn encode_subscribe(subscribe: &Subscribe, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(&subscribe.packet_id.to_be_bytes());

    if let Some(id) = subscribe.subscription_id {
        let mut p = Vec::new();
        p.push(prop::SUBSCRIPTION_IDENTIFIER);
        varint::encode(id, &mut p);
        varint::encode(p.len() as u32, &mut body);
        body.extend_from_slice(&p);
    }

    for (filter, options) in &subscribe.filters {
        push_string(&mut body, filter);
        body.push(options.to_byte());
    }

    push_fixed_header(buf, ((PacketType::Subscribe as u8) << 4) | 0x02, body.len());
    buf.extend_from_slice(&body);
}

fn encode_suback(suback: &Suback, buf: &mut Vec<u8>) {
    let remaining = 2 + if suback.v5 { 1 } else { 0 } + suback.reason_codes.len();
    push_fixed_header(buf, (PacketType::Suback as u8) << 4, remaining);
    buf.extend_from_slice(&suback.packet_id.to_be_bytes());
    if suback.v5 {
        buf.push(0); // property length
    }
    buf.extend_from_slice(&suback.reason_codes);
}

/// Encode an UNSUBSCRIBE packet (used by tests and bridge-side callers).
pub fn encode_unsubscribe(unsubscribe: &Unsubscribe, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());
    for filter in &unsubscribe.filters {
        push_string(&mut body, filter);
    }
    push_fixed_header(
        buf,
        ((PacketType::Unsubscribe as u8) << 4) | 0x02,
        body.len(),
    );
    buf.extend_from_slice(&body);
}

fn encode_unsuback(unsuback: &Unsuback, buf: &mut Vec<u8>) {
    if unsuback.v5 {
        let remaining = 2 + 1 + unsuback.reason_codes.len();
        push_fixed_header(buf, (PacketType::Unsuback as u8) << 4, remaining);
        buf.extend_from_slice(&unsuback.packet_id.to_be_bytes());
        buf.push(0); // property length
        buf.extend_from_slice(&unsuback.reason_codes);
    } else {
        push_fixed_header(buf, (PacketType::Unsuback as u8) << 4, 2);
        buf.extend_from_slice(&unsuback.packet_id.to_be_bytes());
    }
}

fn encode_disconnect(disconnect: &Disconnect, buf: &mut Vec<u8>) {
    if disconnect.reason_code == 0 && disconnect.session_expiry_interval.is_none() {
        push_fixed_header(buf, (PacketType::Disconnect as u8) << 4, 0);
        return;
    }

    let mut body = vec![disconnect.reason_code];
    if let Some(v) = disconnect.session_expiry_interval {
        let mut p = Vec::new();
        p.push(prop::SESSION_EXPIRY_INTERVAL);
        p.extend_from_slice(&v.to_be_bytes());
        varint::encode(p.len() as u32, &mut body);
        body.extend_from_slice(&p);
    }
    push_fixed_header(buf, (PacketType::Disconnect as u8) << 4, body.len());
    buf.extend_from_slice(&body);
}

fn encode_auth(auth: &Auth, buf: &mut Vec<u8>) {
    if auth.reason_code == 0 && auth.method.is_none() && auth.data.is_none() {
        push_fixed_header(buf, (PacketType::Auth as u8) << 4, 0);
        return;
    }

    let mut body = vec![auth.reason_code];
    let mut p = Vec::new();
    if let Some(ref v) = auth.method {
        p.push(prop::AUTHENTICATION_METHOD);
        push_string(&mut p, v);
    }
    if let Some(ref v) = auth.data {
        p.push(prop::AUTHENTICATION_DATA);
        push_binary(&mut p, v);
    }
    varint::encode(p.len() as u32, &mut body);
    body.extend_from_slice(&p);
    push_fixed_header(buf, (PacketType::Auth as u8) << 4, body.len());
    buf.extend_from_slice(&body);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(buf: &[u8], version: Option<Protocol>) -> Packet {
        let (packet, consumed) = decode_packet(buf, version, 0).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        packet
    }

    fn roundtrip(packet: &Packet, version: Option<Protocol>) -> Packet {
        let mut buf = Vec::new();
        encode_packet(packet, &mut buf);
        decode_one(&buf, version)
    }

    #[test]
    fn test_connect_roundtrip_v311() {
        let connect = Connect {
            protocol: Protocol::V311,
            is_bridge: false,
            clean_start: true,
            keep_alive: 60,
            client_id: "client-1".into(),
            will: None,
            username: Some("user".into()),
            password: Some(b"pass".to_vec()),
            properties: None,
        };
        let Packet::Connect(decoded) = roundtrip(&Packet::Connect(connect), None) else {
            panic!("expected CONNECT");
        };
        assert_eq!(decoded.protocol, Protocol::V311);
        assert!(decoded.clean_start);
        assert_eq!(decoded.keep_alive, 60);
        assert_eq!(decoded.client_id, "client-1");
        assert_eq!(decoded.username.as_deref(), Some("user"));
        assert_eq!(decoded.password.as_deref(), Some(b"pass".as_slice()));
    }

    #[test]
    fn test_connect_roundtrip_v5_with_will() {
        let connect = Connect {
            protocol: Protocol::V5,
            is_bridge: false,
            clean_start: false,
            keep_alive: 30,
            client_id: "c".into(),
            will: Some(Will {
                topic: "will/topic".into(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtLeastOnce,
                retain: true,
                properties: Some(WillProperties {
                    will_delay_interval: Some(10),
                    ..Default::default()
                }),
            }),
            username: None,
            password: None,
            properties: Some(ConnectProperties {
                session_expiry_interval: Some(3600),
                receive_maximum: Some(20),
                ..Default::default()
            }),
        };
        let Packet::Connect(decoded) = roundtrip(&Packet::Connect(connect), None) else {
            panic!("expected CONNECT");
        };
        assert_eq!(decoded.protocol, Protocol::V5);
        let will = decoded.will.unwrap();
        assert_eq!(will.topic, "will/topic");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
        assert_eq!(will.properties.unwrap().will_delay_interval, Some(10));
        let props = decoded.properties.unwrap();
        assert_eq!(props.session_expiry_interval, Some(3600));
        assert_eq!(props.receive_maximum, Some(20));
    }

    #[test]
    fn test_connect_v31_protocol_name() {
        let connect = Connect {
            protocol: Protocol::V31,
            is_bridge: false,
            clean_start: true,
            keep_alive: 0,
            client_id: "old".into(),
            will: None,
            username: None,
            password: None,
            properties: None,
        };
        let Packet::Connect(decoded) = roundtrip(&Packet::Connect(connect), None) else {
            panic!("expected CONNECT");
        };
        assert_eq!(decoded.protocol, Protocol::V31);
    }

    #[test]
    fn test_connect_bridge_bit() {
        let connect = Connect {
            protocol: Protocol::V311,
            is_bridge: true,
            clean_start: true,
            keep_alive: 0,
            client_id: "bridge".into(),
            will: None,
            username: None,
            password: None,
            properties: None,
        };
        let Packet::Connect(decoded) = roundtrip(&Packet::Connect(connect), None) else {
            panic!("expected CONNECT");
        };
        assert!(decoded.is_bridge);
    }

    #[test]
    fn test_connect_reserved_flag_rejected() {
        let mut buf = Vec::new();
        encode_connect(
            &Connect {
                protocol: Protocol::V311,
                is_bridge: false,
                clean_start: true,
                keep_alive: 0,
                client_id: "x".into(),
                will: None,
                username: None,
                password: None,
                properties: None,
            },
            &mut buf,
        );
        // Flip the reserved bit of the connect flags byte. Body layout:
        // 2 + 4 name, 1 level, then flags.
        let flags_at = 2 + 2 + 4 + 1;
        buf[flags_at] |= 0x01;
        assert!(decode_packet(&buf, None, 0).is_err());
    }

    #[test]
    fn test_connect_password_without_username_v311() {
        let mut buf = Vec::new();
        encode_connect(
            &Connect {
                protocol: Protocol::V311,
                is_bridge: false,
                clean_start: true,
                keep_alive: 0,
                client_id: "x".into(),
                will: None,
                username: None,
                password: None,
                properties: None,
            },
            &mut buf,
        );
        let flags_at = 2 + 2 + 4 + 1;
        buf[flags_at] |= 0x40; // password flag alone
        assert!(decode_packet(&buf, None, 0).is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut buf = Vec::new();
        encode_connect(
            &Connect {
                protocol: Protocol::V311,
                is_bridge: false,
                clean_start: true,
                keep_alive: 0,
                client_id: "x".into(),
                will: None,
                username: None,
                password: None,
                properties: None,
            },
            &mut buf,
        );
        buf[2 + 2 + 4] = 9; // protocol level
        let err = decode_packet(&buf, None, 0).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Protocol(ProtocolError::UnsupportedProtocolVersion(9))
        ));
    }

    #[test]
    fn test_publish_roundtrip() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "a/b".into(),
            packet_id: Some(42),
            properties: None,
            payload: Bytes::from_static(b"hello"),
        };
        let Packet::Publish(decoded) = roundtrip(&Packet::Publish(publish), Some(Protocol::V311))
        else {
            panic!("expected PUBLISH");
        };
        assert_eq!(decoded.topic, "a/b");
        assert_eq!(decoded.packet_id, Some(42));
        assert_eq!(decoded.payload.as_ref(), b"hello");
        assert!(decoded.retain);
    }

    #[test]
    fn test_publish_v5_properties_roundtrip() {
        let publish = Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: "t".into(),
            packet_id: Some(7),
            properties: Some(PublishProperties {
                message_expiry_interval: Some(120),
                subscription_identifiers: vec![3],
                user_properties: vec![("k".into(), "v".into())],
                ..Default::default()
            }),
            payload: Bytes::from_static(b"p"),
        };
        let Packet::Publish(decoded) = roundtrip(&Packet::Publish(publish), Some(Protocol::V5))
        else {
            panic!("expected PUBLISH");
        };
        let props = decoded.properties.unwrap();
        assert_eq!(props.message_expiry_interval, Some(120));
        assert_eq!(props.subscription_identifiers, vec![3]);
        assert_eq!(props.user_properties, vec![("k".into(), "v".into())]);
    }

    #[test]
    fn test_publish_qos0_with_packet_id_is_not_read() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "t".into(),
            packet_id: None,
            properties: None,
            payload: Bytes::new(),
        };
        let Packet::Publish(decoded) = roundtrip(&Packet::Publish(publish), Some(Protocol::V311))
        else {
            panic!("expected PUBLISH");
        };
        assert_eq!(decoded.packet_id, None);
    }

    #[test]
    fn test_publish_dup_qos0_rejected() {
        // 0x38: PUBLISH, dup=1, qos=0
        let buf = [0x38, 0x03, 0x00, 0x01, b't'];
        assert!(decode_packet(&buf, Some(Protocol::V311), 0).is_err());
    }

    #[test]
    fn test_publish_qos3_rejected() {
        let buf = [0x36, 0x03, 0x00, 0x01, b't'];
        assert!(decode_packet(&buf, Some(Protocol::V311), 0).is_err());
    }

    #[test]
    fn test_ack_roundtrips() {
        for (make, name) in [
            (Packet::Puback as fn(Ack) -> Packet, "puback"),
            (Packet::Pubrec, "pubrec"),
            (Packet::Pubrel, "pubrel"),
            (Packet::Pubcomp, "pubcomp"),
        ] {
            let decoded = roundtrip(&make(Ack::new(9)), Some(Protocol::V311));
            let id = match decoded {
                Packet::Puback(a) | Packet::Pubrec(a) | Packet::Pubrel(a) | Packet::Pubcomp(a) => {
                    a.packet_id
                }
                other => panic!("{}: unexpected {:?}", name, other),
            };
            assert_eq!(id, 9, "{}", name);
        }
    }

    #[test]
    fn test_ack_v5_reason_code() {
        let ack = Ack {
            packet_id: 11,
            reason_code: reason_code::PACKET_IDENTIFIER_NOT_FOUND,
        };
        let Packet::Pubcomp(decoded) = roundtrip(&Packet::Pubcomp(ack), Some(Protocol::V5)) else {
            panic!("expected PUBCOMP");
        };
        assert_eq!(decoded.packet_id, 11);
        assert_eq!(decoded.reason_code, reason_code::PACKET_IDENTIFIER_NOT_FOUND);
    }

    #[test]
    fn test_pubrel_flags_enforced() {
        // PUBREL with flags 0 instead of 2.
        let buf = [0x60, 0x02, 0x00, 0x01];
        assert!(decode_packet(&buf, Some(Protocol::V311), 0).is_err());
    }

    #[test]
    fn test_subscribe_roundtrip() {
        let subscribe = Subscribe {
            packet_id: 3,
            filters: vec![
                (
                    "a/+".into(),
                    SubscriptionOptions {
                        qos: QoS::AtLeastOnce,
                        ..Default::default()
                    },
                ),
                (
                    "b/#".into(),
                    SubscriptionOptions {
                        qos: QoS::ExactlyOnce,
                        no_local: true,
                        retain_as_published: true,
                        retain_handling: 2,
                    },
                ),
            ],
            subscription_id: Some(99),
        };
        let Packet::Subscribe(decoded) =
            roundtrip(&Packet::Subscribe(subscribe), Some(Protocol::V5))
        else {
            panic!("expected SUBSCRIBE");
        };
        assert_eq!(decoded.packet_id, 3);
        assert_eq!(decoded.subscription_id, Some(99));
        assert_eq!(decoded.filters.len(), 2);
        assert_eq!(decoded.filters[0].0, "a/+");
        assert_eq!(decoded.filters[1].1.retain_handling, 2);
        assert!(decoded.filters[1].1.no_local);
    }

    #[test]
    fn test_subscribe_empty_rejected() {
        // SUBSCRIBE with only a packet id.
        let buf = [0x82, 0x02, 0x00, 0x01];
        assert!(decode_packet(&buf, Some(Protocol::V311), 0).is_err());
    }

    #[test]
    fn test_suback_roundtrip() {
        let suback = Suback {
            packet_id: 5,
            reason_codes: vec![0x01, 0x80],
            v5: true,
        };
        let Packet::Suback(decoded) = roundtrip(&Packet::Suback(suback), Some(Protocol::V5)) else {
            panic!("expected SUBACK");
        };
        assert_eq!(decoded.packet_id, 5);
        assert_eq!(decoded.reason_codes, vec![0x01, 0x80]);
    }

    #[test]
    fn test_unsubscribe_roundtrip() {
        let unsubscribe = Unsubscribe {
            packet_id: 8,
            filters: vec!["x".into(), "y/#".into()],
        };
        let Packet::Unsubscribe(decoded) =
            roundtrip(&Packet::Unsubscribe(unsubscribe), Some(Protocol::V311))
        else {
            panic!("expected UNSUBSCRIBE");
        };
        assert_eq!(decoded.packet_id, 8);
        assert_eq!(decoded.filters, vec!["x".to_string(), "y/#".to_string()]);
    }

    #[test]
    fn test_disconnect_roundtrip() {
        let Packet::Disconnect(normal) =
            roundtrip(&Packet::Disconnect(Disconnect::normal()), Some(Protocol::V5))
        else {
            panic!("expected DISCONNECT");
        };
        assert_eq!(normal.reason_code, 0);

        let with_will = Disconnect {
            reason_code: reason_code::DISCONNECT_WITH_WILL,
            session_expiry_interval: Some(60),
        };
        let Packet::Disconnect(decoded) =
            roundtrip(&Packet::Disconnect(with_will), Some(Protocol::V5))
        else {
            panic!("expected DISCONNECT");
        };
        assert_eq!(decoded.reason_code, reason_code::DISCONNECT_WITH_WILL);
        assert_eq!(decoded.session_expiry_interval, Some(60));
    }

    #[test]
    fn test_auth_roundtrip() {
        let auth = Auth {
            reason_code: reason_code::CONTINUE_AUTHENTICATION,
            method: Some("SCRAM-SHA-1".into()),
            data: Some(vec![1, 2, 3]),
        };
        let Packet::Auth(decoded) = roundtrip(&Packet::Auth(auth), Some(Protocol::V5)) else {
            panic!("expected AUTH");
        };
        assert_eq!(decoded.reason_code, reason_code::CONTINUE_AUTHENTICATION);
        assert_eq!(decoded.method.as_deref(), Some("SCRAM-SHA-1"));
        assert_eq!(decoded.data.as_deref(), Some([1, 2, 3].as_slice()));
    }

    #[test]
    fn test_pingreq_pingresp() {
        assert!(matches!(
            decode_one(&[0xC0, 0x00], Some(Protocol::V311)),
            Packet::Pingreq
        ));
        assert!(matches!(
            decode_one(&[0xD0, 0x00], Some(Protocol::V311)),
            Packet::Pingresp
        ));
    }

    #[test]
    fn test_incomplete_returns_none() {
        let mut buf = Vec::new();
        encode_publish(
            &Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: "topic".into(),
                packet_id: None,
                properties: None,
                payload: Bytes::from_static(b"payload"),
            },
            &mut buf,
        );
        for cut in 0..buf.len() {
            assert!(
                decode_packet(&buf[..cut], Some(Protocol::V311), 0)
                    .unwrap()
                    .is_none(),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_max_packet_size_enforced() {
        let mut buf = Vec::new();
        encode_publish(
            &Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: "t".into(),
                packet_id: None,
                properties: None,
                payload: Bytes::from(vec![0u8; 128]),
            },
            &mut buf,
        );
        assert!(decode_packet(&buf, Some(Protocol::V311), 16).is_err());
        assert!(decode_packet(&buf, Some(Protocol::V311), 0).unwrap().is_some());
    }

    #[test]
    fn test_duplicate_property_rejected() {
        // Hand-build a v5 PUBLISH with the message expiry property twice.
        let mut body = Vec::new();
        push_string(&mut body, "t");
        let mut props = Vec::new();
        for _ in 0..2 {
            props.push(prop::MESSAGE_EXPIRY_INTERVAL);
            props.extend_from_slice(&10u32.to_be_bytes());
        }
        varint::encode(props.len() as u32, &mut body);
        body.extend_from_slice(&props);

        let mut buf = Vec::new();
        push_fixed_header(&mut buf, 0x30, body.len());
        buf.extend_from_slice(&body);

        let err = decode_packet(&buf, Some(Protocol::V5), 0).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Protocol(ProtocolError::DuplicateProperty(_))
        ));
    }

    #[test]
    fn test_invalid_property_for_packet_rejected() {
        // CONNECT with a topic-alias property, which belongs to PUBLISH.
        let mut body = Vec::new();
        push_string(&mut body, "MQTT");
        body.push(5);
        body.push(0x02); // clean start
        body.extend_from_slice(&0u16.to_be_bytes());
        let mut props = Vec::new();
        props.push(prop::TOPIC_ALIAS);
        props.extend_from_slice(&1u16.to_be_bytes());
        varint::encode(props.len() as u32, &mut body);
        body.extend_from_slice(&props);
        push_string(&mut body, "id");

        let mut buf = Vec::new();
        push_fixed_header(&mut buf, 0x10, body.len());
        buf.extend_from_slice(&body);

        let err = decode_packet(&buf, None, 0).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Protocol(ProtocolError::InvalidProperty { .. })
        ));
    }

    #[test]
    fn test_string_with_nul_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&3u16.to_be_bytes());
        body.extend_from_slice(b"a\0b");
        let mut buf = Vec::new();
        push_fixed_header(&mut buf, 0x30, body.len());
        buf.extend_from_slice(&body);
        assert!(decode_packet(&buf, Some(Protocol::V311), 0).is_err());
    }
}
