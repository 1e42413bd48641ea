//! # lanlink-net
//!
//! Thread-based networking on top of the `lanlink-core` codec:
//!
//! - [`Connection`] – one framed TCP stream with a send worker and an
//!   on-demand receive worker.
//! - [`Client`] – at most one outgoing connection, replaced on reconnect.
//! - [`Server`] – a listener plus a concurrent map of accepted connections,
//!   with broadcast helpers.
//! - [`DiscoveryService`] – UDP probe / response on a fixed port.
//! - [`MessageDispatcher`] – moves message handling onto a single thread.
//!
//! All sockets are blocking; every worker is a named OS thread.  Lifecycle
//! notifications flow through each manager's [`EventHub`].
//!
//! # Example
//!
//! ```rust,no_run
//! use lanlink_net::{Client, ConnectionConfig, Server};
//! use lanlink_core::OutgoingMessage;
//!
//! let server = Server::new(ConnectionConfig::default());
//! let addr = server.start_listener(Some("127.0.0.1:6695".parse().unwrap()), 10).unwrap();
//!
//! let client = Client::new(ConnectionConfig::default());
//! client.connect(addr).unwrap();
//!
//! let mut msg = OutgoingMessage::data();
//! msg.write_str("hello");
//! client.send(&msg.finish().unwrap());
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod local_addr;
pub mod log;
mod queue;
mod server;
mod shared;

pub use client::Client;
pub use config::{
    AddressFamily, ConfigError, ConnectionConfig, DiscoveryConfig, NetConfig, ServerConfig,
};
pub use connection::{
    Connection, ConnectionStats, ConnectionStatus, MessageHandler, ReceivedMessage,
    StatusHandler,
};
pub use discovery::{DiscoveryService, ResponseAction};
pub use dispatch::MessageDispatcher;
pub use error::{ErrorCode, NetError};
pub use events::{EventHandler, EventHub, NetEvent, SubscriptionId};
pub use local_addr::{FixedAddressResolver, LocalAddressResolver, RoutedAddressResolver};
pub use log::{default_log_sink, silent_log_sink, LogSink};
pub use server::Server;

pub use lanlink_core::{ConnectionId, DiscoveryRole};
