//! Fixed 16-byte UDP discovery datagram.
//!
//! ```text
//! [application_id:4][approval_number:4][validator:4][payload:4]
//! ```
//! All fields are little-endian signed 32-bit integers.
//!
//! The validator encodes which role sent the datagram: a server sends 792, a
//! client sends 348.  A receiver checks incoming datagrams against the
//! validator of the *opposite* role, so a server never mistakes another
//! server's announcement for a client probe and vice versa.
//!
//! The payload is typically the sender's TCP port, or 0 meaning "acknowledge
//! only, no endpoint".

use thiserror::Error;

/// Exact size of a discovery datagram in bytes.
pub const DATAGRAM_SIZE: usize = 16;

/// Default UDP port used for discovery.
pub const DEFAULT_DISCOVERY_PORT: u16 = 4356;

/// Sample application id.  Override per application to avoid collisions.
pub const DEFAULT_APPLICATION_ID: i32 = 42;

/// Sample approval number.  Override per protocol-incompatible release.
pub const DEFAULT_APPROVAL_NUMBER: i32 = 111;

const SERVER_VALIDATOR: i32 = 792;
const CLIENT_VALIDATOR: i32 = 348;

/// Which side of the discovery exchange a participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryRole {
    Server,
    Client,
}

impl DiscoveryRole {
    /// The validator constant this role stamps on datagrams it sends.
    pub fn validator(self) -> i32 {
        match self {
            DiscoveryRole::Server => SERVER_VALIDATOR,
            DiscoveryRole::Client => CLIENT_VALIDATOR,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            DiscoveryRole::Server => DiscoveryRole::Client,
            DiscoveryRole::Client => DiscoveryRole::Server,
        }
    }
}

/// Why a received datagram was ignored.
///
/// Checks run in declaration order; the first mismatch wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DiscoveryRejection {
    #[error("discovery datagram has a different application id")]
    ApplicationId,
    #[error("discovery datagram has a different approval number")]
    ApprovalNumber,
    #[error("discovery datagram failed role validation")]
    Validator,
    #[error("discovery datagram is shorter than 16 bytes")]
    Truncated,
}

impl DiscoveryRejection {
    /// Distinct negative sentinel for each rejection.
    pub fn code(self) -> i32 {
        match self {
            DiscoveryRejection::ApplicationId => -1,
            DiscoveryRejection::ApprovalNumber => -2,
            DiscoveryRejection::Validator => -3,
            DiscoveryRejection::Truncated => -4,
        }
    }
}

/// A decoded discovery datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryDatagram {
    pub application_id: i32,
    pub approval_number: i32,
    pub validator: i32,
    pub payload: i32,
}

impl DiscoveryDatagram {
    /// Builds the datagram `role` sends.
    pub fn new(role: DiscoveryRole, application_id: i32, approval_number: i32, payload: i32) -> Self {
        Self {
            application_id,
            approval_number,
            validator: role.validator(),
            payload,
        }
    }

    pub fn encode(&self) -> [u8; DATAGRAM_SIZE] {
        let mut out = [0u8; DATAGRAM_SIZE];
        out[0..4].copy_from_slice(&self.application_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.approval_number.to_le_bytes());
        out[8..12].copy_from_slice(&self.validator.to_le_bytes());
        out[12..16].copy_from_slice(&self.payload.to_le_bytes());
        out
    }

    /// Decodes the first 16 bytes of `bytes`; `None` if fewer are available.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DATAGRAM_SIZE {
            return None;
        }
        let field = |i: usize| i32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Some(Self {
            application_id: field(0),
            approval_number: field(4),
            validator: field(8),
            payload: field(12),
        })
    }
}

/// Validates a received datagram and returns its payload.
///
/// # Errors
///
/// Returns the first failing check as a [`DiscoveryRejection`].
///
/// # Examples
///
/// ```rust
/// use lanlink_core::protocol::discovery::{validate, DiscoveryDatagram, DiscoveryRole};
///
/// let probe = DiscoveryDatagram::new(DiscoveryRole::Client, 42, 111, 0).encode();
/// // A server checks probes against the client validator.
/// assert_eq!(validate(&probe, 42, 111, DiscoveryRole::Client.validator()), Ok(0));
/// ```
pub fn validate(
    bytes: &[u8],
    application_id: i32,
    approval_number: i32,
    expected_validator: i32,
) -> Result<i32, DiscoveryRejection> {
    let datagram = DiscoveryDatagram::decode(bytes).ok_or(DiscoveryRejection::Truncated)?;
    if datagram.application_id != application_id {
        Err(DiscoveryRejection::ApplicationId)
    } else if datagram.approval_number != approval_number {
        Err(DiscoveryRejection::ApprovalNumber)
    } else if datagram.validator != expected_validator {
        Err(DiscoveryRejection::Validator)
    } else {
        Ok(datagram.payload)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
