//! Payload data sources for transmission.
//!
//! A payload is either a byte buffer handed over up front, or a
//! [`PayloadSource`] that the transmitter pulls from on demand, so large
//! transmissions do not need to be materialized in memory. The total length
//! must be known up front in both cases since ISO-TP announces it in the
//! First Frame.

use crate::error::{IsoTpError, Result};

/// Lazily produces the bytes of one payload.
pub trait PayloadSource: Send {
    /// Returns up to `max` more bytes. Returning an empty buffer before the
    /// declared payload length has been produced aborts the transmission
    /// with a [`IsoTpError::BadGenerator`] error.
    fn pull(&mut self, max: usize) -> Result<Vec<u8>>;
}

impl<F> PayloadSource for F
where
    F: FnMut(usize) -> Result<Vec<u8>> + Send,
{
    fn pull(&mut self, max: usize) -> Result<Vec<u8>> {
        self(max)
    }
}

/// The data of one queued transmission.
pub(crate) enum TxPayload {
    Owned(Vec<u8>),
    Streamed {
        source: Box<dyn PayloadSource>,
        length: usize,
    },
}

impl TxPayload {
    pub(crate) fn total_length(&self) -> usize {
        match self {
            TxPayload::Owned(data) => data.len(),
            TxPayload::Streamed { length, .. } => *length,
        }
    }
}

/// Buffer feeding the Tx state machine, pulling from a lazy source when the
/// stashed bytes run below the next frame size.
pub(crate) struct TxBuffer {
    stash: Vec<u8>,
    source: Option<Box<dyn PayloadSource>>,
    total_length: usize,
    delivered: usize,
    pulled: usize,
}

impl TxBuffer {
    pub(crate) fn new(payload: TxPayload) -> Self {
        match payload {
            TxPayload::Owned(data) => {
                let total_length = data.len();
                Self {
                    stash: data,
                    source: None,
                    total_length,
                    delivered: 0,
                    pulled: total_length,
                }
            }
            TxPayload::Streamed { source, length } => Self {
                stash: Vec::new(),
                source: Some(source),
                total_length: length,
                delivered: 0,
                pulled: 0,
            },
        }
    }

    pub(crate) fn total_length(&self) -> usize {
        self.total_length
    }

    /// Bytes not yet handed to a frame.
    pub(crate) fn remaining(&self) -> usize {
        self.total_length - self.delivered
    }

    /// Removes and returns the next `min(len, remaining)` bytes, pulling
    /// from the source as needed.
    pub(crate) fn take(&mut self, len: usize) -> Result<Vec<u8>> {
        let want = len.min(self.remaining());
        while self.stash.len() < want {
            let source = self
                .source
                .as_mut()
                .expect("stash shorter than remaining length without a source");
            let asked = want - self.stash.len();
            let chunk = source
                .pull(asked)
                .map_err(|e| IsoTpError::BadGenerator(e.to_string()))?;
            if chunk.is_empty() {
                return Err(IsoTpError::BadGenerator(format!(
                    "payload source ran out of data after {} of {} bytes",
                    self.pulled, self.total_length
                )));
            }
            if chunk.len() > asked {
                return Err(IsoTpError::BadGenerator(format!(
                    "payload source returned {} bytes when asked for {asked}",
                    chunk.len()
                )));
            }
            self.pulled += chunk.len();
            if self.pulled > self.total_length {
                return Err(IsoTpError::BadGenerator(
                    "payload source produced more data than the declared length".into(),
                ));
            }
            self.stash.extend_from_slice(&chunk);
        }
        self.delivered += want;
        Ok(self.stash.drain(..want).collect())
    }
}
