//! Error types reported by the transport layer.
//!
//! Protocol and timing errors detected while the stack is running are not
//! returned to the caller; they are logged, handed to the user-supplied
//! error handler and the affected state machine is reset. Only
//! configuration errors and the blocking-send family are raised
//! synchronously.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IsoTpError {
    /// The peer failed to send a Flow Control frame before the N_Bs timeout.
    #[error("reception of flow control timed out, stopping transmission")]
    FlowControlTimeout,

    /// The peer failed to send a Consecutive Frame before the N_Cr timeout.
    #[error("reception of consecutive frame timed out")]
    ConsecutiveFrameTimeout,

    /// A CAN frame that cannot be decoded as a valid PDU was received.
    #[error("received invalid CAN frame: {0}")]
    InvalidCanData(String),

    /// A Flow Control frame was received while no transmission was pending.
    #[error("received a flow control while transmission was idle, ignoring")]
    UnexpectedFlowControl,

    /// A Consecutive Frame was received while reception was idle.
    #[error("received a consecutive frame while reception was idle, ignoring")]
    UnexpectedConsecutiveFrame,

    /// A multi-frame reception was interrupted by a new Single Frame.
    #[error("reception interrupted with a new single frame")]
    ReceptionInterruptedWithSingleFrame,

    /// A multi-frame reception was interrupted by a new First Frame.
    #[error("reception interrupted with a new first frame")]
    ReceptionInterruptedWithFirstFrame,

    /// A Consecutive Frame was received with an out-of-order sequence number.
    #[error("wrong sequence number: expected {expected:#04x}, received {received:#04x}")]
    WrongSequenceNumber { expected: u8, received: u8 },

    /// A Flow Control requesting to wait was received while `wftmax` is 0.
    #[error("received a flow control requesting to wait, but wftmax is set to 0")]
    UnsupportedWaitFrame,

    /// More wait frames than `wftmax` were received during one transmission.
    #[error("received {count} wait frames, the maximum allowed by wftmax")]
    MaximumWaitFrameReached { count: u32 },

    /// A Single Frame longer than 8 bytes did not use the escape sequence,
    /// or a First Frame used the 32-bit escape on a classical-width frame.
    #[error("frame length requires the CAN FD escape sequence encoding")]
    MissingEscapeSequence,

    /// A Consecutive Frame arrived with a data length different from the
    /// one established by the First Frame, without being the last frame.
    #[error("consecutive frame RX_DL changed: expected {expected}, received {received}")]
    ChangingInvalidRxDl { expected: usize, received: usize },

    /// A First Frame was received with a data length that is not a valid
    /// CAN FD size.
    #[error("first frame received with invalid RX_DL of {rx_dl}")]
    InvalidCanFdFirstFrameRxDl { rx_dl: usize },

    /// A First Frame declared more data than `max_frame_size` allows.
    #[error("first frame declares {length} bytes but max_frame_size is {max}")]
    FrameTooLong { length: u32, max: u32 },

    /// The peer signalled a buffer overflow (FlowStatus = 2).
    #[error("peer signalled an overflow, stopping transmission")]
    Overflow,

    /// A lazy payload source misbehaved while the transmitter pulled data.
    #[error("payload source error: {0}")]
    BadGenerator(String),

    /// A blocking send did not complete successfully.
    #[error("blocking send failed")]
    BlockingSendFailure,

    /// A blocking send did not complete within the requested timeout.
    #[error("blocking send timed out")]
    BlockingSendTimeout,

    /// Invalid address, parameter or argument. Raised at call time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The transmit queue cannot accept more payloads.
    #[error("transmit queue is full")]
    TxQueueFull,

    /// Failure reported by the underlying CAN link.
    #[error("CAN link error: {0}")]
    Link(String),
}

impl IsoTpError {
    /// True for the blocking-send error family (`BlockingSendTimeout` is a
    /// refinement of `BlockingSendFailure`).
    pub fn is_blocking_send_failure(&self) -> bool {
        matches!(
            self,
            IsoTpError::BlockingSendFailure | IsoTpError::BlockingSendTimeout
        )
    }
}

pub type Result<T> = std::result::Result<T, IsoTpError>;
