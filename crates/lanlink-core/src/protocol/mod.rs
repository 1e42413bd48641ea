//! Protocol module containing the frame codec, reassembly, and discovery datagrams.

pub mod assembler;
pub mod discovery;
pub mod frame;

pub use assembler::FrameAssembler;
pub use discovery::{DiscoveryDatagram, DiscoveryRejection, DiscoveryRole};
pub use frame::*;
