//! # lanlink-core
//!
//! Shared protocol library for LanLink: the framed TCP message codec, the
//! receive-side frame reassembly state machine, and the fixed-size UDP
//! discovery datagram.
//!
//! This crate performs no I/O and spawns no threads.  Everything here is a
//! pure transformation between bytes and typed values, which keeps it easy to
//! test and benchmark in isolation.  Sockets, workers, and lifecycle live in
//! `lanlink-net`.
//!
//! # Wire format overview
//!
//! ```text
//! TCP frame:       [kind:1][payload_len:4 LE i32][payload:N]
//! UDP discovery:   [app_id:4][approval:4][validator:4][payload:4]   (all LE i32)
//! ```

pub mod protocol;

pub use protocol::assembler::FrameAssembler;
pub use protocol::discovery::{DiscoveryDatagram, DiscoveryRejection, DiscoveryRole};
pub use protocol::frame::{
    decode_header, encode_header, Frame, FrameHeader, IncomingMessage, MessageKind,
    OutgoingMessage, ProtocolError, HEADER_SIZE,
};

/// Identifier assigned to every connection at construction.
///
/// A random (v4) 128-bit UUID, stable for the lifetime of the connection.
pub type ConnectionId = uuid::Uuid;
