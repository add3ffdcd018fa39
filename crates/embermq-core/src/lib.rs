//! embermq-core - MQTT wire types shared by the broker.
//!
//! This crate holds everything that is protocol-level rather than
//! broker-level: the packet codec for MQTT 3.1, 3.1.1 and 5.0, the
//! remaining-length varint, topic name/filter validation and matching,
//! and the error taxonomy surfaced by all of the above.

pub mod error;
pub mod packet;
pub mod topic;
pub mod varint;

pub use error::{Error, ProtocolError, Result};
pub use packet::*;
