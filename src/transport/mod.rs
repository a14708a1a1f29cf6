//! ISO-TP (ISO 15765-2) transport layer implementation.
//!
//! The transport layer is responsible for:
//! - Segmentation and reassembly of payloads of up to 2^32 - 1 bytes
//! - The flow-control handshake pacing the sender (block size, STmin)
//! - Protocol timers (N_Bs, N_Cr) and error recovery
//! - End-to-end payload delivery through thread-safe queues
//!
//! Two coupled state machines run inside [`TransportLayer`], one per
//! direction. They are driven either by a dedicated worker thread
//! ([`TransportLayer::start`]) or by periodic calls to
//! [`TransportLayer::process`] in single-threaded setups.
//!
//! # Examples
//!
//! ```no_run
//! use std::time::Duration;
//! use cantp::{Address, CanMessage, Params, TransportLayer};
//!
//! # fn read_can_frame(_timeout: Duration) -> cantp::Result<Option<CanMessage>> { Ok(None) }
//! # fn write_can_frame(_msg: &CanMessage) -> cantp::Result<()> { Ok(()) }
//! let address = Address::normal_11bits(0x456, 0x123)?;
//! let mut layer = TransportLayer::new(
//!     |timeout: Duration| read_can_frame(timeout),
//!     |msg: &CanMessage| write_can_frame(msg),
//!     address,
//!     None,
//!     Params::default(),
//! )?;
//!
//! layer.start()?;
//! layer.send([0x22, 0xF1, 0x90])?; // UDS read data by ID
//! if let Some(response) = layer.recv_timeout(Duration::from_secs(1)) {
//!     println!("ECU answered {} bytes", response.len());
//! }
//! layer.stop()?;
//! # Ok::<(), cantp::IsoTpError>(())
//! ```

mod core;
mod payload;
mod worker;

pub use self::core::{ErrorHandler, ProcessStats};
pub use payload::PayloadSource;
pub use worker::TransportLayer;
