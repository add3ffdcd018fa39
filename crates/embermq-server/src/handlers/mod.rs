//! Per-packet handlers, dispatched from `Broker::handle_packet`.

pub mod connect;
pub mod disconnect;
pub mod publish;
pub mod qos;
pub mod subscribe;
