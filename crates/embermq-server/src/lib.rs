//! embermq - an MQTT 3.1/3.1.1/5.0 broker.
//!
//! The crate splits into the I/O-free engine (`broker` and the modules
//! it composes: sessions, queues, the subscription trie, the message
//! store) and the thin mio front-end (`server`) that moves bytes
//! between sockets and the engine.

pub mod auth;
pub mod broker;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod platform;
pub mod queue;
pub mod server;
pub mod session;
pub mod store;
pub mod subscription;
pub mod will;
pub mod write_buffer;

pub use broker::Broker;
pub use config::Config;
pub use server::Server;
