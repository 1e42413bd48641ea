//! Client-side connection manager: at most one outgoing connection at a time.
//!
//! Calling [`Client::connect`] while connected disposes the current connection
//! first.  The status handler installed on each connection checks the
//! identifier against the *current* connection before clearing it, so a late
//! `Disconnected` from a replaced connection can never clear its successor.

use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Weak};

use lanlink_core::{ConnectionId, Frame};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionStatus, StatusHandler};
use crate::error::NetError;
use crate::events::EventHub;
use crate::log::{default_log_sink, LogSink};
use crate::shared::ManagerCore;

pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    core: ManagerCore,
    current: Mutex<Option<Arc<Connection>>>,
    /// Serializes whole `connect` calls.
    connect_lock: Mutex<()>,
}

impl Client {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_log_sink(config, default_log_sink())
    }

    pub fn with_log_sink(config: ConnectionConfig, log: LogSink) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                core: ManagerCore::new(config, log),
                current: Mutex::new(None),
                connect_lock: Mutex::new(()),
            }),
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.inner.core.events
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.core.config
    }

    /// Opens a blocking TCP connection to `addr`, replacing any current one.
    ///
    /// On success fires `ConnectionStatusChanged(Connected)` then
    /// `ConnectionAdded`, and starts the receiver if configured to.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::SocketCreate`] or [`NetError::Connect`]; the same
    /// error is also written to the log sink.  A failed attempt leaves the
    /// current connection untouched.
    pub fn connect(&self, addr: SocketAddr) -> Result<ConnectionId, NetError> {
        let inner = &self.inner;
        let _serial = inner.connect_lock.lock();

        let stream = match open_stream(addr, inner.core.config.no_delay) {
            Ok(stream) => stream,
            Err(e) => {
                inner.core.report(&e);
                return Err(e);
            }
        };

        if let Some(previous) = self.connection() {
            debug!("replacing connection {}", previous.id());
            previous.dispose();
        }

        let weak = Arc::downgrade(inner);
        let on_status: StatusHandler =
            Arc::new(move |status, id| ClientInner::handle_status(&weak, status, id));
        let connection = match inner.core.open(stream, on_status) {
            Ok(connection) => connection,
            Err(e) => {
                inner.core.report(&e);
                return Err(e);
            }
        };

        *inner.current.lock() = Some(Arc::clone(&connection));
        inner.core.publish_added(&connection);
        Ok(connection.id())
    }

    /// Disposes the current connection, if any.
    pub fn disconnect(&self) {
        if let Some(connection) = self.connection() {
            connection.dispose();
        }
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.current.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection()
            .is_some_and(|c| c.status() == ConnectionStatus::Connected)
    }

    /// Queues `frame` on the current connection.  Returns `false` when there
    /// is none.
    pub fn send(&self, frame: &Frame) -> bool {
        match self.connection() {
            Some(connection) => {
                connection.send(frame);
                true
            }
            None => false,
        }
    }
}

impl ClientInner {
    fn handle_status(weak: &Weak<ClientInner>, status: ConnectionStatus, id: ConnectionId) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner
            .core
            .log(&format!("Connection status changed: {status}"));
        inner.core.publish_status(status, id);

        if status != ConnectionStatus::Disconnected {
            return;
        }
        let released = {
            let mut current = inner.current.lock();
            if current.as_ref().is_some_and(|c| c.id() == id) {
                current.take()
            } else {
                None
            }
        };
        if released.is_some() {
            inner.core.publish_removed(id);
        } else {
            debug!("ignoring disconnect of stale connection {id}");
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn open_stream(addr: SocketAddr, no_delay: bool) -> Result<TcpStream, NetError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|source| NetError::SocketCreate { source })?;
    if let Err(e) = socket.set_nodelay(no_delay) {
        debug!("failed to set TCP_NODELAY: {e}");
    }
    socket
        .connect(&addr.into())
        .map_err(|source| NetError::Connect { addr, source })?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NetEvent;
    use crate::log::silent_log_sink;
    use std::net::TcpListener;

    fn quiet_client() -> Client {
        Client::with_log_sink(ConnectionConfig::default(), silent_log_sink())
    }

    #[test]
    fn test_connect_to_closed_port_fails_and_logs() {
        // Arrange: bind then drop to find a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let captured = Arc::clone(&lines);
        let client = Client::with_log_sink(
            ConnectionConfig::default(),
            Arc::new(move |l: &str| captured.lock().push(l.to_string())),
        );

        // Act
        let result = client.connect(addr);

        // Assert
        assert!(matches!(result, Err(NetError::Connect { .. })));
        assert!(client.connection().is_none());
        assert!(lines.lock()[0].starts_with("Error #0001: ClientConnect"));
    }

    #[test]
    fn test_connect_publishes_status_then_added() {
        // Arrange
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = quiet_client();
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&events);
        client.events().subscribe(move |e| {
            let tag = match e {
                NetEvent::ConnectionStatusChanged { status, .. } => format!("status:{status}"),
                NetEvent::ConnectionAdded(_) => "added".to_string(),
                NetEvent::ConnectionRemoved(_) => "removed".to_string(),
                NetEvent::ListenerStatusChanged { .. } => "listener".to_string(),
            };
            captured.lock().push(tag);
        });

        // Act
        let id = client.connect(listener.local_addr().unwrap()).unwrap();
        let _accepted = listener.accept().unwrap();
        client.disconnect();

        // Assert
        assert_eq!(
            *events.lock(),
            vec!["status:Connected", "added", "status:Disconnected", "removed"]
        );
        assert!(client.connection().is_none());
        assert_ne!(id, ConnectionId::nil());
    }

    #[test]
    fn test_reconnect_replaces_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = quiet_client();

        let first = client.connect(addr).unwrap();
        let first_conn = client.connection().unwrap();
        let second = client.connect(addr).unwrap();

        assert_ne!(first, second);
        assert!(first_conn.is_disposed());
        assert_eq!(client.connection().unwrap().id(), second);
        assert!(client.is_connected());
    }

    #[test]
    fn test_stale_disconnect_does_not_clear_current() {
        // Arrange
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = quiet_client();
        client.connect(addr).unwrap();
        let current = client.connect(addr).unwrap();

        // Act: a late notification for a connection that is no longer current.
        ClientInner::handle_status(
            &Arc::downgrade(&client.inner),
            ConnectionStatus::Disconnected,
            ConnectionId::new_v4(),
        );

        // Assert
        assert_eq!(client.connection().unwrap().id(), current);
    }

    #[test]
    fn test_send_without_connection_returns_false() {
        let client = quiet_client();
        assert!(!client.send(&Frame::empty(lanlink_core::MessageKind::IsAlive)));
        assert!(!client.is_connected());
    }
}
