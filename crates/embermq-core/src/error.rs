//! Error types for embermq.

use std::io;

use thiserror::Error;

/// Top-level error type.
///
/// `Protocol` wraps everything the decoder or a packet handler can object
/// to; the remaining variants are resource and lifecycle failures that the
/// broker maps onto connection closure rather than a wire response.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("not authorized")]
    NotAuthorized,

    #[error("outbound packet of {size} bytes exceeds peer maximum of {max}")]
    OversizePacket { size: usize, max: usize },

    #[error("out of memory")]
    NoMemory,

    #[error("not found")]
    NotFound,

    #[error("connection lost")]
    ConnectionLost,
}

/// MQTT protocol and decoder errors.
///
/// Decoder-level failures (`MalformedPacket` and friends) are distinct
/// from semantic protocol errors (wrong sequence, reserved bits) because
/// MQTT 5 assigns them different reason codes.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("incomplete packet: need {needed} bytes, have {have}")]
    IncompletePacket { needed: usize, have: usize },

    #[error("invalid protocol name: {0:?}")]
    InvalidProtocolName(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("invalid connect flags: {0:#04x}")]
    InvalidConnectFlags(u8),

    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("duplicate property: {0:#04x}")]
    DuplicateProperty(u8),

    #[error("property {property:#04x} not valid for {packet}")]
    InvalidProperty { property: u8, packet: &'static str },

    #[error("packet of {size} bytes exceeds maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("topic of {len} bytes exceeds maximum of {max}")]
    TopicTooLong { len: usize, max: usize },

    #[error("topic has {levels} levels, maximum is {max}")]
    TopicTooDeep { levels: usize, max: usize },

    #[error("invalid topic: {0}")]
    InvalidTopic(&'static str),

    #[error("invalid topic filter: {0}")]
    InvalidFilter(&'static str),

    #[error("first packet must be CONNECT")]
    FirstPacketNotConnect,

    #[error("unexpected packet: {0}")]
    UnexpectedPacket(&'static str),
}

impl ProtocolError {
    /// MQTT 5 reason code for this error, for DISCONNECT/CONNACK replies.
    pub fn reason_code(&self) -> u8 {
        use crate::packet::reason_code as rc;
        match self {
            ProtocolError::InvalidPacketType(_)
            | ProtocolError::InvalidRemainingLength
            | ProtocolError::IncompletePacket { .. }
            | ProtocolError::InvalidUtf8
            | ProtocolError::MalformedPacket(_)
            | ProtocolError::DuplicateProperty(_)
            | ProtocolError::InvalidProperty { .. } => rc::MALFORMED_PACKET,
            ProtocolError::UnsupportedProtocolVersion(_) => rc::UNSUPPORTED_PROTOCOL_VERSION,
            ProtocolError::PacketTooLarge { .. } => rc::PACKET_TOO_LARGE,
            ProtocolError::TopicTooLong { .. }
            | ProtocolError::TopicTooDeep { .. }
            | ProtocolError::InvalidTopic(_) => rc::TOPIC_NAME_INVALID,
            ProtocolError::InvalidFilter(_) => rc::TOPIC_FILTER_INVALID,
            _ => rc::PROTOCOL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
