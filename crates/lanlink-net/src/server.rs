//! Server-side connection manager: one listener, many tracked connections.
//!
//! Accepted connections live in a concurrent map keyed by identifier.  A
//! connection removes itself from the map through its status handler when it
//! disconnects, so the map only ever holds live connections (I/O in flight
//! aside).
//!
//! Bulk operations (`send_to_all`, `disconnect_all`, `check_connections`)
//! iterate over a snapshot of the map.  Disposing a connection re-enters the
//! map from the status handler, which would deadlock on a shard lock if done
//! during iteration.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lanlink_core::{ConnectionId, Frame, MessageKind};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, trace};

use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionStatus, StatusHandler};
use crate::error::NetError;
use crate::events::{EventHub, NetEvent};
use crate::local_addr::{LocalAddressResolver, RoutedAddressResolver};
use crate::log::{default_log_sink, LogSink};
use crate::shared::ManagerCore;

const WAKE_TIMEOUT: Duration = Duration::from_millis(250);

pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    core: ManagerCore,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    listener: Mutex<Option<ListenerHandle>>,
    resolver: Arc<dyn LocalAddressResolver>,
}

struct ListenerHandle {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    /// Duplicate of the accepting socket, used to interrupt `accept`.
    socket: TcpListener,
    worker: JoinHandle<()>,
}

impl Server {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_dependencies(config, default_log_sink(), Arc::new(RoutedAddressResolver))
    }

    pub fn with_dependencies(
        config: ConnectionConfig,
        log: LogSink,
        resolver: Arc<dyn LocalAddressResolver>,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                core: ManagerCore::new(config, log),
                connections: DashMap::new(),
                listener: Mutex::new(None),
                resolver,
            }),
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.inner.core.events
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.core.config
    }

    /// Binds a listener and starts the accept worker, stopping any previous
    /// listener first.
    ///
    /// With `endpoint == None` the listener binds an ephemeral port on the
    /// address the resolver picks for the configured family.  Returns the
    /// bound address.
    ///
    /// # Errors
    ///
    /// [`NetError::LocalAddressNotFound`], [`NetError::ListenerCreate`],
    /// [`NetError::Bind`], or [`NetError::Spawn`].  Each is also written to
    /// the log sink.
    pub fn start_listener(
        &self,
        endpoint: Option<SocketAddr>,
        backlog: i32,
    ) -> Result<SocketAddr, NetError> {
        self.stop_listener();
        let result = self.inner.bind_and_spawn(endpoint, backlog);
        if let Err(e) = &result {
            self.inner.core.report(e);
        }
        result
    }

    /// Stops the accept worker and closes the listening socket.  Tracked
    /// connections are unaffected.
    pub fn stop_listener(&self) {
        let Some(handle) = self.inner.listener.lock().take() else {
            return;
        };
        handle.running.store(false, Ordering::Release);
        if let Err(e) = SockRef::from(&handle.socket).shutdown(std::net::Shutdown::Both) {
            trace!("listener shutdown: {e}");
        }
        // Platforms where shutdown does not interrupt accept need a
        // connection to wake it.
        let _ = TcpStream::connect_timeout(&wake_address(handle.local_addr), WAKE_TIMEOUT);
        drop(handle.socket);

        if handle.worker.thread().id() != thread::current().id() {
            let _ = handle.worker.join();
        }
    }

    pub fn is_listening(&self) -> bool {
        self.inner
            .listener
            .lock()
            .as_ref()
            .is_some_and(|h| !h.worker.is_finished())
    }

    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().as_ref().map(|h| h.local_addr)
    }

    /// Disposes every tracked connection.
    pub fn disconnect_all(&self) {
        for connection in self.connections() {
            connection.dispose();
        }
    }

    /// Queues an `IsAlive` probe on every tracked connection.  A dead peer is
    /// detected when the write fails, which disposes the connection.
    pub fn check_connections(&self) {
        let probe = Frame::empty(MessageKind::IsAlive);
        let connections = self.connections();
        debug!("probing {} connections", connections.len());
        for connection in connections {
            connection.send(&probe);
        }
    }

    pub fn send_to_all(&self, frame: &Frame) {
        for connection in self.connections() {
            connection.send(frame);
        }
    }

    pub fn send_to_all_except(&self, frame: &Frame, except: ConnectionId) {
        for connection in self.connections() {
            if connection.id() != except {
                connection.send(frame);
            }
        }
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.connections.get(&id).map(|c| Arc::clone(c.value()))
    }

    /// Snapshot of all tracked connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner
            .connections
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Stops the listener and disposes every connection.
    pub fn shutdown(&self) {
        self.stop_listener();
        self.disconnect_all();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ServerInner {
    fn bind_and_spawn(
        self: &Arc<Self>,
        endpoint: Option<SocketAddr>,
        backlog: i32,
    ) -> Result<SocketAddr, NetError> {
        let bind_addr = match endpoint {
            Some(addr) => addr,
            None => {
                let family = self.core.config.address_family;
                let ip = self
                    .resolver
                    .local_address(family)
                    .ok_or(NetError::LocalAddressNotFound { family })?;
                SocketAddr::new(ip, 0)
            }
        };

        let socket = Socket::new(Domain::for_address(bind_addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|source| NetError::ListenerCreate { source })?;
        socket
            .bind(&bind_addr.into())
            .and_then(|()| socket.listen(backlog))
            .map_err(|source| NetError::Bind {
                addr: bind_addr,
                source,
            })?;
        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr()?;
        let interrupt = listener.try_clone()?;
        self.core
            .log(&format!("Listener socket bound to {local_addr}"));

        let running = Arc::new(AtomicBool::new(true));
        self.core
            .events
            .emit(&NetEvent::ListenerStatusChanged { active: true });

        let inner = Arc::clone(self);
        let flag = Arc::clone(&running);
        let worker = thread::Builder::new()
            .name("lanlink-accept".to_string())
            .spawn(move || inner.accept_loop(listener, flag))
            .map_err(|source| {
                self.core
                    .events
                    .emit(&NetEvent::ListenerStatusChanged { active: false });
                NetError::Spawn {
                    worker: "accept",
                    source,
                }
            })?;

        *self.listener.lock() = Some(ListenerHandle {
            local_addr,
            running,
            socket: interrupt,
            worker,
        });
        Ok(local_addr)
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener, running: Arc<AtomicBool>) {
        self.core.log("Waiting for incoming connections...");
        loop {
            let (stream, peer) = match listener.accept() {
                Ok(pair) => pair,
                Err(e)
                    if running.load(Ordering::Acquire)
                        && matches!(
                            e.kind(),
                            io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                        ) =>
                {
                    continue
                }
                Err(e) => {
                    debug!("accept loop ending: {e}");
                    break;
                }
            };
            if !running.load(Ordering::Acquire) {
                break;
            }
            self.admit(stream, peer);
        }
        self.core.log("Connection accepter shut down.");
        self.core
            .events
            .emit(&NetEvent::ListenerStatusChanged { active: false });
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(self.core.config.no_delay) {
            debug!("failed to set TCP_NODELAY for {peer}: {e}");
        }

        let weak = Arc::downgrade(self);
        let on_status: StatusHandler =
            Arc::new(move |status, id| ServerInner::handle_status(&weak, status, id));
        let connection = match self.core.open(stream, on_status) {
            Ok(connection) => connection,
            Err(e) => {
                self.core.report(&e);
                return;
            }
        };

        let id = connection.id();
        let inserted = match self.connections.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&connection));
                true
            }
        };
        if !inserted {
            self.core.report(&NetError::DuplicateConnection(id));
            connection.dispose();
            return;
        }

        self.core
            .log(&format!("Client connected: {peer} ({id})"));
        self.core.publish_added(&connection);
    }

    fn handle_status(weak: &Weak<ServerInner>, status: ConnectionStatus, id: ConnectionId) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.core.publish_status(status, id);
        if status != ConnectionStatus::Disconnected {
            return;
        }
        match inner.connections.remove(&id) {
            Some(_) => {
                inner.core.log(&format!("Connection removed: {id}"));
                inner.core.publish_removed(id);
            }
            None => inner.core.report(&NetError::ConnectionNotTracked(id)),
        }
    }
}

/// Address to connect to in order to wake a blocked `accept`.
fn wake_address(bound: SocketAddr) -> SocketAddr {
    let ip = match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, bound.port())
}
