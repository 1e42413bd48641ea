//! A single framed TCP connection.
//!
//! Each [`Connection`] owns a connected stream and two background threads:
//!
//! - **send worker** – pops finished frames off an unbounded FIFO and writes
//!   them under the send lock.  Started at construction.
//! - **receive worker** – reads into a fixed-size buffer, feeds a
//!   [`FrameAssembler`], and hands every complete message to the message
//!   handler.  Started on demand by [`Connection::start_receiver`].
//!
//! Workers hold only a `Weak` reference to the connection, so dropping the
//! last `Arc` disposes it.
//!
//! # Disposal
//!
//! [`Connection::dispose`] runs its body exactly once no matter how many
//! threads call it or how often: it marks the connection `Disconnected`,
//! fires the status handler, shuts the socket down in both directions, and
//! halts the send worker.  Every transport failure (EOF, I/O error, malformed
//! frame header) funnels into it.
//!
//! Lock order: the send lock is always released before `dispose` is called,
//! and `dispose` never takes the send lock while holding any other lock.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use std::thread;

use lanlink_core::{ConnectionId, Frame, FrameAssembler, IncomingMessage};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::NetError;
use crate::log::{report, LogSink};
use crate::queue::WorkQueue;

/// Lifecycle state of a connection.
///
/// `Unknown` exists only while the connection is being constructed; callers
/// never observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Unknown,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Unknown => f.write_str("Unknown"),
            ConnectionStatus::Connected => f.write_str("Connected"),
            ConnectionStatus::Disconnected => f.write_str("Disconnected"),
        }
    }
}

/// A complete message together with the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message: IncomingMessage,
    pub connection_id: ConnectionId,
}

/// Invoked on the receive worker thread for every complete message.
pub type MessageHandler = Arc<dyn Fn(ReceivedMessage) + Send + Sync>;

/// Invoked on every status transition, including the final `Disconnected`.
pub type StatusHandler = Arc<dyn Fn(ConnectionStatus, ConnectionId) + Send + Sync>;

/// Point-in-time traffic counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct TrafficCounters {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl TrafficCounters {
    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

pub struct Connection {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    status: RwLock<ConnectionStatus>,
    disposed: AtomicBool,
    receiver_started: AtomicBool,
    /// Handle used only to shut the socket down during disposal.
    control: Mutex<Option<TcpStream>>,
    /// Send lock.  Held for the whole of one frame write.
    writer: Mutex<Option<TcpStream>>,
    /// Read half, taken by the receive worker when it starts.
    reader: Mutex<Option<TcpStream>>,
    outbox: Arc<WorkQueue<Frame>>,
    on_status: StatusHandler,
    on_message: RwLock<Option<MessageHandler>>,
    log: LogSink,
    receive_buffer_size: usize,
    max_payload_size: usize,
    counters: TrafficCounters,
}

impl Connection {
    /// Wraps a connected stream, starts the send worker, and fires
    /// `on_status(Connected, id)`.
    ///
    /// The receive worker is not started; call [`start_receiver`](Self::start_receiver).
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Io`] if the stream cannot be duplicated and
    /// [`NetError::Spawn`] if the send worker cannot be started.  No status
    /// notification fires in either case.
    pub fn new(
        stream: TcpStream,
        config: &ConnectionConfig,
        log: LogSink,
        on_status: StatusHandler,
    ) -> Result<Arc<Self>, NetError> {
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let id = Uuid::new_v4();

        let connection = Arc::new(Self {
            id,
            remote_addr: stream.peer_addr().ok(),
            local_addr: stream.local_addr().ok(),
            status: RwLock::new(ConnectionStatus::Unknown),
            disposed: AtomicBool::new(false),
            receiver_started: AtomicBool::new(false),
            control: Mutex::new(Some(control)),
            writer: Mutex::new(Some(stream)),
            reader: Mutex::new(Some(reader)),
            outbox: Arc::new(WorkQueue::new()),
            on_status,
            on_message: RwLock::new(None),
            log,
            receive_buffer_size: config.receive_buffer_size.max(1),
            max_payload_size: config.max_payload_size,
            counters: TrafficCounters::default(),
        });

        let weak = Arc::downgrade(&connection);
        let outbox = Arc::clone(&connection.outbox);
        let spawned = thread::Builder::new()
            .name(format!("lanlink-send-{}", short_id(&id)))
            .spawn(move || send_loop(weak, outbox));
        if let Err(source) = spawned {
            // Never announced, so tear down silently.
            connection.disposed.store(true, Ordering::Release);
            connection.release_socket();
            return Err(NetError::Spawn {
                worker: "send",
                source,
            });
        }

        *connection.status.write() = ConnectionStatus::Connected;
        (connection.on_status)(ConnectionStatus::Connected, id);
        debug!(
            "connection {id} established ({:?} -> {:?})",
            connection.local_addr, connection.remote_addr
        );
        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ConnectionStats {
        self.counters.snapshot()
    }

    /// Installs the callback that receives complete messages.
    ///
    /// Messages that arrive while no handler is installed are dropped.
    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.on_message.write() = Some(handler);
    }

    /// Starts the receive worker.  No-op once disconnected or if the worker
    /// is already running.
    pub fn start_receiver(self: &Arc<Self>) {
        if self.status() == ConnectionStatus::Disconnected {
            return;
        }
        if self.receiver_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(stream) = self.reader.lock().take() else {
            return;
        };

        let weak = Arc::downgrade(self);
        let buffer_size = self.receive_buffer_size;
        let max_payload = self.max_payload_size;
        let spawned = thread::Builder::new()
            .name(format!("lanlink-recv-{}", short_id(&self.id)))
            .spawn(move || receive_loop(weak, stream, buffer_size, max_payload));
        if let Err(source) = spawned {
            report(
                &self.log,
                &NetError::Spawn {
                    worker: "receive",
                    source,
                },
            );
            self.dispose();
        }
    }

    /// Queues a frame for the send worker.  Silently dropped once disposed.
    pub fn send(&self, frame: &Frame) {
        if self.is_disposed() {
            return;
        }
        self.outbox.push(frame.clone());
    }

    /// Writes a frame on the calling thread, bypassing the queue.
    ///
    /// Returns `false` if the connection is disposed or the write failed (in
    /// which case the connection is now disposed).
    pub fn send_now(&self, frame: &Frame) -> bool {
        self.write_frame(frame)
    }

    /// Tears the connection down.  Idempotent and safe to call concurrently.
    pub fn dispose(&self) {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        *self.status.write() = ConnectionStatus::Disconnected;
        (self.on_status)(ConnectionStatus::Disconnected, self.id);
        self.release_socket();
        debug!("connection {} disposed", self.id);
    }

    fn release_socket(&self) {
        if let Some(control) = self.control.lock().take() {
            if let Err(e) = control.shutdown(Shutdown::Both) {
                trace!("shutdown of connection {} socket: {e}", self.id);
            }
        }
        self.outbox.halt();
        self.outbox.clear();
        self.writer.lock().take();
        self.reader.lock().take();
    }

    fn write_frame(&self, frame: &Frame) -> bool {
        let result = {
            let mut writer = self.writer.lock();
            if self.is_disposed() {
                return false;
            }
            match writer.as_mut() {
                Some(stream) => stream.write_all(frame.as_bytes()),
                None => return false,
            }
        };

        match result {
            Ok(()) => {
                self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_sent
                    .fetch_add(frame.as_bytes().len() as u64, Ordering::Relaxed);
                true
            }
            Err(e) => {
                debug!("send on connection {} failed: {e}", self.id);
                (self.log)("Connection lost.");
                self.dispose();
                false
            }
        }
    }

    fn deliver(&self, message: IncomingMessage) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        let handler = self.on_message.read().clone();
        match handler {
            Some(handler) => handler(ReceivedMessage {
                message,
                connection_id: self.id,
            }),
            None => trace!("connection {} dropped a {:?} frame: no handler", self.id, message.kind()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

// ── Workers ───────────────────────────────────────────────────────────────────

fn send_loop(connection: Weak<Connection>, outbox: Arc<WorkQueue<Frame>>) {
    while let Some(frame) = outbox.pop() {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        if !connection.write_frame(&frame) {
            break;
        }
    }
    trace!("send worker exiting");
}

fn receive_loop(
    connection: Weak<Connection>,
    mut stream: TcpStream,
    buffer_size: usize,
    max_payload: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    let mut assembler = FrameAssembler::new().with_max_payload(max_payload);

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                trace!("peer closed the stream");
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                trace!("receive failed: {e}");
                break;
            }
        };

        let Some(conn) = connection.upgrade() else {
            return;
        };
        if conn.is_disposed() {
            return;
        }
        conn.counters
            .bytes_received
            .fetch_add(n as u64, Ordering::Relaxed);
        if let Err(e) = assembler.push(&buf[..n], |message| conn.deliver(message)) {
            warn!("connection {} sent a malformed frame: {e}", conn.id);
            (conn.log)("Connection lost.");
            conn.dispose();
            return;
        }
    }

    if let Some(conn) = connection.upgrade() {
        conn.dispose();
    }
}

fn short_id(id: &ConnectionId) -> String {
    id.simple().to_string()[..8].to_string()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::silent_log_sink;
    use lanlink_core::{MessageKind, OutgoingMessage};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    /// Returns a connected `(client, server)` stream pair on loopback.
    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn recording_status() -> (StatusHandler, Arc<Mutex<Vec<ConnectionStatus>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let handler: StatusHandler = Arc::new(move |status, _| captured.lock().push(status));
        (handler, seen)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    fn text_frame(text: &str) -> Frame {
        let mut msg = OutgoingMessage::data();
        msg.write_str(text);
        msg.finish().unwrap()
    }

    #[test]
    fn test_new_fires_connected_once() {
        // Arrange
        let (stream, _peer) = stream_pair();
        let (handler, seen) = recording_status();

        // Act
        let conn = Connection::new(stream, &ConnectionConfig::default(), silent_log_sink(), handler)
            .unwrap();

        // Assert
        assert_eq!(conn.status(), ConnectionStatus::Connected);
        assert_eq!(*seen.lock(), vec![ConnectionStatus::Connected]);
        assert!(conn.remote_addr().is_some());
    }

    #[test]
    fn test_dispose_is_idempotent_across_threads() {
        // Arrange
        let (stream, _peer) = stream_pair();
        let (handler, seen) = recording_status();
        let conn = Connection::new(stream, &ConnectionConfig::default(), silent_log_sink(), handler)
            .unwrap();

        // Act
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let conn = Arc::clone(&conn);
                thread::spawn(move || conn.dispose())
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        conn.dispose();

        // Assert
        let disconnects = seen
            .lock()
            .iter()
            .filter(|s| **s == ConnectionStatus::Disconnected)
            .count();
        assert_eq!(disconnects, 1);
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert!(conn.is_disposed());
    }

    #[test]
    fn test_send_after_dispose_is_ignored() {
        let (stream, _peer) = stream_pair();
        let (handler, _) = recording_status();
        let conn = Connection::new(stream, &ConnectionConfig::default(), silent_log_sink(), handler)
            .unwrap();

        conn.dispose();
        conn.send(&text_frame("late"));

        assert!(!conn.send_now(&text_frame("late")));
        assert_eq!(conn.stats().frames_sent, 0);
    }

    #[test]
    fn test_queued_frames_arrive_in_order() {
        // Arrange
        let (a, b) = stream_pair();
        let (status_a, _) = recording_status();
        let (status_b, _) = recording_status();
        let sender = Connection::new(a, &ConnectionConfig::default(), silent_log_sink(), status_a)
            .unwrap();
        let receiver = Connection::new(b, &ConnectionConfig::default(), silent_log_sink(), status_b)
            .unwrap();
        let (tx, rx) = mpsc::channel();
        receiver.set_message_handler(Arc::new(move |m: ReceivedMessage| {
            let _ = tx.send(m);
        }));
        receiver.start_receiver();

        // Act
        for i in 0..50 {
            sender.send(&text_frame(&format!("msg-{i}")));
        }

        // Assert
        for i in 0..50 {
            let mut m = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(m.connection_id, receiver.id());
            assert_eq!(m.message.read_string().unwrap(), format!("msg-{i}"));
        }
        assert!(wait_until(|| sender.stats().frames_sent == 50));
    }

    #[test]
    fn test_send_now_interleaves_only_at_frame_boundaries() {
        // Arrange
        const BULK_LEN: usize = 400 * 1024;
        const ROUNDS: u8 = 20;
        let (a, b) = stream_pair();
        let (status_a, _) = recording_status();
        let (status_b, _) = recording_status();
        let sender = Connection::new(a, &ConnectionConfig::default(), silent_log_sink(), status_a)
            .unwrap();
        let receiver = Connection::new(b, &ConnectionConfig::default(), silent_log_sink(), status_b)
            .unwrap();
        let (tx, rx) = mpsc::channel();
        receiver.set_message_handler(Arc::new(move |m: ReceivedMessage| {
            let _ = tx.send(m);
        }));
        receiver.start_receiver();

        // Act
        let direct = {
            let sender = Arc::clone(&sender);
            thread::spawn(move || {
                (0..ROUNDS)
                    .filter(|_| sender.send_now(&text_frame("sync")))
                    .count()
            })
        };
        for fill in 0..ROUNDS {
            let mut msg = OutgoingMessage::data();
            msg.write_bytes(&vec![fill; BULK_LEN]);
            sender.send(&msg.finish().unwrap());
        }
        let direct_sent = direct.join().unwrap();

        // Assert
        assert_eq!(direct_sent, usize::from(ROUNDS));
        let (mut bulk, mut sync) = (Vec::new(), 0);
        for _ in 0..(2 * usize::from(ROUNDS)) {
            let mut m = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            if m.message.payload().len() == BULK_LEN {
                let fill = m.message.payload()[0];
                assert!(m.message.payload().iter().all(|b| *b == fill));
                bulk.push(fill);
            } else {
                assert_eq!(m.message.read_string().unwrap(), "sync");
                sync += 1;
            }
        }
        assert_eq!(bulk, (0..ROUNDS).collect::<Vec<_>>());
        assert_eq!(sync, usize::from(ROUNDS));
        assert!(!receiver.is_disposed());
    }

    #[test]
    fn test_write_failure_disposes_connection() {
        // Arrange
        let (local, remote) = stream_pair();
        let (handler, seen) = recording_status();
        let conn = Connection::new(local, &ConnectionConfig::default(), silent_log_sink(), handler)
            .unwrap();
        drop(remote);

        // Act
        let frame = text_frame("into the void");
        let disposed = wait_until(|| {
            conn.send(&frame);
            conn.is_disposed()
        });

        // Assert
        assert!(disposed);
        let disconnects = seen
            .lock()
            .iter()
            .filter(|s| **s == ConnectionStatus::Disconnected)
            .count();
        assert_eq!(disconnects, 1);
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_peer_close_disposes_receiver() {
        // Arrange
        let (local, remote) = stream_pair();
        let (handler, seen) = recording_status();
        let conn = Connection::new(local, &ConnectionConfig::default(), silent_log_sink(), handler)
            .unwrap();
        conn.start_receiver();

        // Act
        drop(remote);

        // Assert
        assert!(wait_until(|| conn.is_disposed()));
        assert_eq!(
            *seen.lock(),
            vec![ConnectionStatus::Connected, ConnectionStatus::Disconnected]
        );
    }

    #[test]
    fn test_negative_frame_length_disposes_connection() {
        // Arrange
        let (local, mut remote) = stream_pair();
        let (handler, _) = recording_status();
        let conn = Connection::new(local, &ConnectionConfig::default(), silent_log_sink(), handler)
            .unwrap();
        conn.start_receiver();

        // Act
        remote
            .write_all(&lanlink_core::encode_header(MessageKind::Data, -5))
            .unwrap();

        // Assert
        assert!(wait_until(|| conn.is_disposed()));
    }

    #[test]
    fn test_messages_without_handler_are_dropped() {
        let (local, mut remote) = stream_pair();
        let (handler, _) = recording_status();
        let conn = Connection::new(local, &ConnectionConfig::default(), silent_log_sink(), handler)
            .unwrap();
        conn.start_receiver();

        remote.write_all(Frame::empty(MessageKind::IsAlive).as_bytes()).unwrap();

        assert!(wait_until(|| conn.stats().frames_received == 1));
        assert!(!conn.is_disposed());
    }

    #[test]
    fn test_start_receiver_after_dispose_is_noop() {
        let (stream, _peer) = stream_pair();
        let (handler, _) = recording_status();
        let conn = Connection::new(stream, &ConnectionConfig::default(), silent_log_sink(), handler)
            .unwrap();

        conn.dispose();
        conn.start_receiver();

        assert!(!conn.receiver_started.load(Ordering::Acquire));
    }

    #[test]
    fn test_dropping_last_reference_disposes() {
        let (stream, _peer) = stream_pair();
        let (handler, seen) = recording_status();
        let conn = Connection::new(stream, &ConnectionConfig::default(), silent_log_sink(), handler)
            .unwrap();

        drop(conn);

        assert_eq!(seen.lock().last(), Some(&ConnectionStatus::Disconnected));
    }
}
