//! # cantp
//!
//! `cantp` is a user-space Rust implementation of the ISO 15765-2 (ISO-TP)
//! transport protocol over CAN and CAN FD. ISO-TP carries payloads of up to
//! 2^32 - 1 bytes across 8-byte (classical CAN) or 64-byte (CAN FD) frames
//! by segmenting them on the sender, reassembling them on the receiver and
//! pacing the two sides through a flow-control handshake.
//!
//! ## Architecture
//!
//! The crate is organized around the transport core and its collaborators:
//!
//! - Addressing: the seven ISO-TP addressing modes over 11 and 29-bit IDs
//! - PDU codec: Single Frame, First Frame, Consecutive Frame, Flow Control
//! - Transport layer: the two coupled Rx/Tx state machines, protocol
//!   timers, queues and the worker/relay threads driving them
//! - Rate limiter: optional sliding-window cap on the outbound bitrate
//! - Link traits: the two callbacks connecting the stack to any CAN driver
//!
//! ## Features
//!
//! - Full ISO 15765-2:2016 wire format, including the CAN FD escape forms
//! - Normal, extended and mixed addressing, plus asymmetric pairs
//! - Threaded operation with adaptive sleeping, or explicit polling
//! - Blocking and non-blocking sends, lazy payload sources
//! - Strong type safety and structured error reporting
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use cantp::{Address, CanMessage, Params, TransportLayer};
//!
//! # fn read_can_frame(_timeout: Duration) -> cantp::Result<Option<CanMessage>> { Ok(None) }
//! # fn write_can_frame(_msg: &CanMessage) -> cantp::Result<()> { Ok(()) }
//! // 1. Describe how to reach the peer
//! let address = Address::normal_11bits(0x7E0, 0x7E8)?;
//!
//! // 2. Wire the stack to the CAN driver through two callbacks
//! let mut layer = TransportLayer::new(
//!     |timeout: Duration| read_can_frame(timeout),
//!     |msg: &CanMessage| write_can_frame(msg),
//!     address,
//!     Some(Box::new(|error| eprintln!("isotp error: {error}"))),
//!     Params::default(),
//! )?;
//!
//! // 3. Exchange payloads
//! layer.start()?;
//! layer.send(vec![0x3E, 0x00])?;
//! let _response = layer.recv_timeout(Duration::from_secs(1));
//! layer.stop()?;
//! # Ok::<(), cantp::IsoTpError>(())
//! ```

/// Addressing modes and arbitration ID handling
pub mod address;
/// Common error types and error handling functionality
pub mod error;
/// Contract between the transport layer and the CAN driver
pub mod link;
/// Transport layer configuration record
pub mod params;
/// Protocol data unit codec
pub mod pdu;
/// Outbound bitrate limiting
pub mod rate_limiter;
/// Monotonic protocol timers
pub mod timer;
/// The ISO-TP transport layer itself
pub mod transport;
/// Common types used across the library
pub mod types;

// Re-exports for convenience
pub use address::{
    Address, AddressConfig, AddressingMode, AsymmetricAddress, TargetAddressType, TransportAddress,
};
pub use error::{IsoTpError, Result};
pub use link::{FrameReceiver, FrameSender};
pub use params::Params;
pub use pdu::{FlowStatus, Pdu};
pub use transport::{ErrorHandler, PayloadSource, ProcessStats, TransportLayer};
pub use types::{CanId, CanMessage};

/// Current version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_valid() {
        assert!(!VERSION.is_empty());
    }
}
