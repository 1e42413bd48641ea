//! UDP LAN discovery service.
//!
//! A [`DiscoveryService`] plays one [`DiscoveryRole`].  It can:
//!
//! 1. **Send** its own 16-byte datagram to an endpoint, or broadcast it when
//!    no endpoint is given ([`DiscoveryService::send_discovery_message`]).
//! 2. **Respond**: bind the discovery port and run a worker that validates
//!    every incoming datagram against the *opposite* role's validator and
//!    invokes the response action for each accepted one.
//!
//! # Response action
//!
//! | Payload        | Action argument                          |
//! |----------------|------------------------------------------|
//! | `0`            | `None`                                   |
//! | `1..=65535`    | `Some(sender_ip:payload)`                |
//! | anything else  | ignored                                  |
//!
//! Without a user-supplied action the service answers by sending its own
//! datagram back to that endpoint (or broadcasting it for `None`).  A server
//! whose `message_data` is its TCP port therefore answers a client's probe
//! with its own port, and the client's action receives the server endpoint.
//!
//! # Read timeout
//!
//! The worker's socket uses a read timeout of `poll_interval_ms`.  On each
//! timeout it re-checks its running flag, so stopping takes at most one poll
//! interval.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use lanlink_core::protocol::discovery::{validate, DiscoveryDatagram, DiscoveryRole};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::config::{AddressFamily, DiscoveryConfig};
use crate::error::NetError;
use crate::log::{default_log_sink, report, LogSink};

/// Receives the endpoint an accepted datagram points at.
pub type ResponseAction = Arc<dyn Fn(Option<SocketAddr>) + Send + Sync>;

const RECV_BUFFER_SIZE: usize = 64;

pub struct DiscoveryService {
    inner: Arc<DiscoveryInner>,
}

struct DiscoveryInner {
    role: DiscoveryRole,
    family: AddressFamily,
    config: DiscoveryConfig,
    message_data: AtomicI32,
    /// Send lock.  `None` only if socket creation failed.
    socket: Mutex<Option<Socket>>,
    /// Service lock.
    worker: Mutex<Option<ResponseWorker>>,
    action: ResponseAction,
    log: LogSink,
}

struct ResponseWorker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl DiscoveryService {
    /// Creates an idle service with an unbound socket.
    ///
    /// `action == None` installs the default action described in the module
    /// docs.
    pub fn new(role: DiscoveryRole, config: DiscoveryConfig, action: Option<ResponseAction>) -> Self {
        Self::with_options(role, config, AddressFamily::Ipv4, action, default_log_sink())
    }

    pub fn with_options(
        role: DiscoveryRole,
        config: DiscoveryConfig,
        family: AddressFamily,
        action: Option<ResponseAction>,
        log: LogSink,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<DiscoveryInner>| {
            let action = action.unwrap_or_else(|| default_action(weak.clone()));
            let socket = match create_socket(family) {
                Ok(socket) => Some(socket),
                Err(source) => {
                    report(
                        &log,
                        &NetError::DiscoveryStart {
                            port: config.port,
                            source,
                        },
                    );
                    None
                }
            };
            DiscoveryInner {
                role,
                family,
                message_data: AtomicI32::new(config.message_data),
                config,
                socket: Mutex::new(socket),
                worker: Mutex::new(None),
                action,
                log,
            }
        });
        Self { inner }
    }

    pub fn role(&self) -> DiscoveryRole {
        self.inner.role
    }

    pub fn message_data(&self) -> i32 {
        self.inner.message_data.load(Ordering::Acquire)
    }

    /// Changes the payload stamped on subsequently sent datagrams.
    pub fn set_message_data(&self, value: i32) {
        self.inner.message_data.store(value, Ordering::Release);
    }

    /// Binds the discovery port on the unspecified address and starts the
    /// response worker, restarting it if already running.
    ///
    /// # Errors
    ///
    /// [`NetError::DiscoveryStart`] if the socket cannot be created, bound, or
    /// configured, [`NetError::Spawn`] if the worker cannot be started.  Both
    /// are also written to the log sink.
    pub fn start_response_service(&self) -> Result<(), NetError> {
        let mut slot = self.inner.worker.lock();
        if slot.is_some() {
            self.inner.stop_worker(&mut slot);
        }
        let result = self.inner.spawn_worker();
        match result {
            Ok(worker) => {
                *slot = Some(worker);
                Ok(())
            }
            Err(e) => {
                report(&self.inner.log, &e);
                Err(e)
            }
        }
    }

    /// Stops the response worker and replaces the bound socket with a fresh,
    /// unbound one.  No-op when not running.
    pub fn stop_response_service(&self) {
        let mut slot = self.inner.worker.lock();
        self.inner.stop_worker(&mut slot);
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Sends this service's datagram to `endpoint`, or broadcasts it to the
    /// discovery port when `endpoint` is `None`.
    ///
    /// # Errors
    ///
    /// [`NetError::DiscoverySend`]; also written to the log sink.
    pub fn send_discovery_message(&self, endpoint: Option<SocketAddr>) -> Result<(), NetError> {
        let result = self.inner.send_datagram(endpoint);
        if let Err(e) = &result {
            report(&self.inner.log, e);
        }
        result
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        let mut slot = self.inner.worker.lock();
        if let Some(worker) = slot.take() {
            worker.running.store(false, Ordering::Release);
            if worker.handle.thread().id() != thread::current().id() {
                let _ = worker.handle.join();
            }
        }
    }
}

impl DiscoveryInner {
    fn spawn_worker(self: &Arc<Self>) -> Result<ResponseWorker, NetError> {
        let port = self.config.port;
        let start_error = |source: io::Error| NetError::DiscoveryStart { port, source };

        let receiver: UdpSocket = {
            let mut guard = self.socket.lock();
            if guard.is_none() {
                *guard = Some(create_socket(self.family).map_err(start_error)?);
            }
            let socket = guard
                .as_ref()
                .ok_or_else(|| start_error(io::ErrorKind::NotConnected.into()))?;
            let bind_addr = SocketAddr::new(self.family.unspecified(), port);
            socket.bind(&bind_addr.into()).map_err(start_error)?;
            let clone = socket.try_clone().map_err(start_error)?;
            clone.into()
        };
        receiver
            .set_read_timeout(Some(self.config.poll_interval()))
            .map_err(start_error)?;

        let running = Arc::new(AtomicBool::new(true));
        let inner = Arc::clone(self);
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("lanlink-discovery".to_string())
            .spawn(move || inner.response_loop(receiver, flag))
            .map_err(|source| NetError::Spawn {
                worker: "discovery",
                source,
            })?;

        (self.log)(&format!("Running discovery response service on port {port}..."));
        Ok(ResponseWorker { running, handle })
    }

    fn stop_worker(&self, slot: &mut Option<ResponseWorker>) {
        let Some(worker) = slot.take() else {
            return;
        };
        worker.running.store(false, Ordering::Release);
        self.socket.lock().take();
        if worker.handle.thread().id() != thread::current().id() {
            let _ = worker.handle.join();
        }

        match create_socket(self.family) {
            Ok(socket) => *self.socket.lock() = Some(socket),
            Err(source) => report(
                &self.log,
                &NetError::DiscoveryStart {
                    port: self.config.port,
                    source,
                },
            ),
        }
    }

    fn response_loop(self: Arc<Self>, socket: UdpSocket, running: Arc<AtomicBool>) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let expected = self.role.opposite().validator();

        while running.load(Ordering::Acquire) {
            let (len, src) = match socket.recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e) if is_timeout_error(&e) => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    if running.load(Ordering::Acquire) {
                        warn!("discovery recv error: {e}");
                    }
                    break;
                }
            };
            if !running.load(Ordering::Acquire) {
                break;
            }

            match validate(
                &buf[..len],
                self.config.application_id,
                self.config.approval_number,
                expected,
            ) {
                Ok(payload) => self.respond(payload, src),
                Err(rejection) => {
                    trace!("rejected discovery datagram from {src}: {rejection}");
                    if self.config.log_validation_issues {
                        report(&self.log, &NetError::DiscoveryRejected(rejection));
                    }
                }
            }
        }
        (self.log)("Discovery response service shut down.");
    }

    fn respond(&self, payload: i32, src: SocketAddr) {
        match payload {
            0 => (self.action)(None),
            1..=65535 => {
                let endpoint = SocketAddr::new(src.ip(), payload as u16);
                debug!("discovery datagram from {src} points at {endpoint}");
                (self.action)(Some(endpoint));
            }
            other => debug!("ignoring discovery payload {other} from {src}"),
        }
    }

    fn send_datagram(&self, endpoint: Option<SocketAddr>) -> Result<(), NetError> {
        let target = endpoint.unwrap_or_else(|| broadcast_target(self.family, self.config.port));
        let datagram = DiscoveryDatagram::new(
            self.role,
            self.config.application_id,
            self.config.approval_number,
            self.message_data.load(Ordering::Acquire),
        )
        .encode();

        let guard = self.socket.lock();
        let socket = guard.as_ref().ok_or_else(|| NetError::DiscoverySend {
            addr: target,
            source: io::ErrorKind::NotConnected.into(),
        })?;
        socket
            .send_to(&datagram, &target.into())
            .map(|_| ())
            .map_err(|source| NetError::DiscoverySend {
                addr: target,
                source,
            })
    }
}

fn default_action(service: Weak<DiscoveryInner>) -> ResponseAction {
    Arc::new(move |endpoint| {
        if let Some(inner) = service.upgrade() {
            if let Err(e) = inner.send_datagram(endpoint) {
                report(&inner.log, &e);
            }
        }
    })
}

fn create_socket(family: AddressFamily) -> io::Result<Socket> {
    let domain = match family {
        AddressFamily::Ipv4 => Domain::IPV4,
        AddressFamily::Ipv6 => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if family == AddressFamily::Ipv4 {
        socket.set_broadcast(true)?;
    }
    Ok(socket)
}

/// Limited broadcast for IPv4; the all-nodes link-local group for IPv6.
fn broadcast_target(family: AddressFamily, port: u16) -> SocketAddr {
    let ip = match family {
        AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::BROADCAST),
        AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1)),
    };
    SocketAddr::new(ip, port)
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
fn is_timeout_error(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
