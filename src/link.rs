//! Contract between the transport layer and the CAN driver underneath.
//!
//! The transport never talks to hardware directly; it consumes one object
//! that reads frames and one that writes them. Both traits have blanket
//! impls for closures, so a captured bus handle works without a newtype:
//!
//! ```
//! use std::sync::mpsc;
//! use std::time::Duration;
//! use cantp::{CanMessage, FrameReceiver, FrameSender};
//!
//! let (bus_tx, bus_rx) = mpsc::channel::<CanMessage>();
//! let mut receiver = move |timeout: Duration| -> cantp::Result<Option<CanMessage>> {
//!     Ok(bus_rx.recv_timeout(timeout).ok())
//! };
//! let mut sender = move |msg: &CanMessage| {
//!     bus_tx.send(msg.clone()).map_err(|e| cantp::IsoTpError::Link(e.to_string()))
//! };
//! let _ = FrameReceiver::receive(&mut receiver, Duration::from_millis(1));
//! let _ = FrameSender::send(&mut sender, &CanMessage::default());
//! ```

use std::time::Duration;

use crate::error::Result;
use crate::types::CanMessage;

/// Blocking read of one CAN frame.
///
/// Returns `Ok(None)` when no frame arrived within `timeout`. A
/// non-blocking implementation may return immediately, at the cost of
/// degraded timing. Errors are dispatched to the error handler; they never
/// kill the transport.
pub trait FrameReceiver: Send {
    fn receive(&mut self, timeout: Duration) -> Result<Option<CanMessage>>;
}

/// Synchronous write of one CAN frame.
pub trait FrameSender: Send {
    fn send(&mut self, msg: &CanMessage) -> Result<()>;
}

impl<F> FrameReceiver for F
where
    F: FnMut(Duration) -> Result<Option<CanMessage>> + Send,
{
    fn receive(&mut self, timeout: Duration) -> Result<Option<CanMessage>> {
        self(timeout)
    }
}

impl FrameReceiver for Box<dyn FrameReceiver> {
    fn receive(&mut self, timeout: Duration) -> Result<Option<CanMessage>> {
        (**self).receive(timeout)
    }
}

impl FrameSender for Box<dyn FrameSender> {
    fn send(&mut self, msg: &CanMessage) -> Result<()> {
        (**self).send(msg)
    }
}

impl<F> FrameSender for F
where
    F: FnMut(&CanMessage) -> Result<()> + Send,
{
    fn send(&mut self, msg: &CanMessage) -> Result<()> {
        self(msg)
    }
}
