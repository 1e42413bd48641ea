//! Error types for the networking layer.
//!
//! Public setup operations (`connect`, `start_listener`, discovery start and
//! send) return these errors *and* report them through the log sink, so an
//! application that only watches the log still sees every failure.
//! Transport failures on an established connection never surface here; they
//! dispose the connection instead.

use std::fmt;
use std::net::SocketAddr;

use lanlink_core::{ConnectionId, DiscoveryRejection};
use thiserror::Error;

use crate::config::AddressFamily;

/// Stable numeric code attached to every reportable failure.
///
/// Rendered as `Error #NNNN: Name` in log output so operators can grep for a
/// specific failure without depending on message wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    ClientSocketCreate = 0,
    ClientConnect = 1,
    ServerConnectionAdd = 2,
    ServerConnectionRemove = 3,
    ServerLocalAddressNotFound = 4,
    ServerListenerBind = 5,
    ServerListenerCreate = 6,
    DiscoveryApplicationId = 7,
    DiscoveryApprovalNumber = 8,
    DiscoveryValidation = 9,
    DiscoveryTruncated = 10,
    DiscoveryStart = 11,
    DiscoverySend = 12,
    WorkerSpawn = 13,
    Io = 14,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error #{:04}: {:?}", *self as u16, self)
    }
}

/// Errors produced by the networking layer.
#[derive(Debug, Error)]
pub enum NetError {
    /// A TCP socket for an outgoing connection could not be created.
    #[error("failed to create connection socket: {source}")]
    SocketCreate {
        #[source]
        source: std::io::Error,
    },

    /// The blocking connect attempt failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The listener socket could not be created.
    #[error("failed to create listener socket: {source}")]
    ListenerCreate {
        #[source]
        source: std::io::Error,
    },

    /// No usable local address was found for automatic listener binding.
    #[error("no local {family} address found")]
    LocalAddressNotFound { family: AddressFamily },

    /// Binding or listening on the listener socket failed.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A freshly accepted connection collided with a tracked identifier.
    #[error("failed to track connection {0}: identifier already present")]
    DuplicateConnection(ConnectionId),

    /// A disconnected connection was not present in the tracking map.
    #[error("failed to remove connection {0}: not tracked")]
    ConnectionNotTracked(ConnectionId),

    /// The discovery socket could not be created or bound.
    #[error("failed to start discovery response service on port {port}: {source}")]
    DiscoveryStart {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// A discovery datagram could not be sent.
    #[error("failed to send discovery message to {addr}: {source}")]
    DiscoverySend {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A received discovery datagram failed validation.
    #[error("{0}")]
    DiscoveryRejected(DiscoveryRejection),

    /// A worker thread could not be spawned.
    #[error("failed to spawn {worker} worker: {source}")]
    Spawn {
        worker: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    pub fn code(&self) -> ErrorCode {
        match self {
            NetError::SocketCreate { .. } => ErrorCode::ClientSocketCreate,
            NetError::Connect { .. } => ErrorCode::ClientConnect,
            NetError::ListenerCreate { .. } => ErrorCode::ServerListenerCreate,
            NetError::LocalAddressNotFound { .. } => ErrorCode::ServerLocalAddressNotFound,
            NetError::Bind { .. } => ErrorCode::ServerListenerBind,
            NetError::DuplicateConnection(_) => ErrorCode::ServerConnectionAdd,
            NetError::ConnectionNotTracked(_) => ErrorCode::ServerConnectionRemove,
            NetError::DiscoveryStart { .. } => ErrorCode::DiscoveryStart,
            NetError::DiscoverySend { .. } => ErrorCode::DiscoverySend,
            NetError::DiscoveryRejected(r) => match r {
                DiscoveryRejection::ApplicationId => ErrorCode::DiscoveryApplicationId,
                DiscoveryRejection::ApprovalNumber => ErrorCode::DiscoveryApprovalNumber,
                DiscoveryRejection::Validator => ErrorCode::DiscoveryValidation,
                DiscoveryRejection::Truncated => ErrorCode::DiscoveryTruncated,
            },
            NetError::Spawn { .. } => ErrorCode::WorkerSpawn,
            NetError::Io(_) => ErrorCode::Io,
        }
    }

    /// The line written to the log sink for this error.
    pub fn report_line(&self) -> String {
        format!("{}: {self}", self.code())
    }
}
