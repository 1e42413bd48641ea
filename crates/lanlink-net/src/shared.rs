//! State and helpers common to [`Client`](crate::Client) and
//! [`Server`](crate::Server).

use std::net::TcpStream;
use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionStatus, StatusHandler};
use crate::error::NetError;
use crate::events::{EventHub, NetEvent};
use crate::log::{report, LogSink};
use lanlink_core::ConnectionId;

pub(crate) struct ManagerCore {
    pub(crate) config: ConnectionConfig,
    pub(crate) events: EventHub,
    pub(crate) log: LogSink,
}

impl ManagerCore {
    pub(crate) fn new(config: ConnectionConfig, log: LogSink) -> Self {
        Self {
            config,
            events: EventHub::new(),
            log,
        }
    }

    pub(crate) fn log(&self, line: &str) {
        (self.log)(line);
    }

    pub(crate) fn report(&self, err: &NetError) {
        report(&self.log, err);
    }

    /// Wraps `stream` in a [`Connection`] using this manager's settings.
    pub(crate) fn open(
        &self,
        stream: TcpStream,
        on_status: StatusHandler,
    ) -> Result<Arc<Connection>, NetError> {
        Connection::new(stream, &self.config, Arc::clone(&self.log), on_status)
    }

    pub(crate) fn publish_status(&self, status: ConnectionStatus, id: ConnectionId) {
        self.events
            .emit(&NetEvent::ConnectionStatusChanged { status, id });
    }

    /// Announces a newly tracked connection, then starts its receiver when
    /// configured to.  Subscribers therefore see `ConnectionAdded` before
    /// the first message can arrive.
    pub(crate) fn publish_added(&self, connection: &Arc<Connection>) {
        self.events
            .emit(&NetEvent::ConnectionAdded(Arc::clone(connection)));
        if self.config.auto_start_receiver {
            connection.start_receiver();
        }
    }

    pub(crate) fn publish_removed(&self, id: ConnectionId) {
        self.events.emit(&NetEvent::ConnectionRemoved(id));
    }
}
