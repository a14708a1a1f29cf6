//! Common types shared across the transport layer.

use crate::error::{IsoTpError, Result};

/// CAN arbitration identifier, 11 or 29 bits.
pub type CanId = u32;

/// Data sizes a CAN FD frame may carry beyond the classical 0-8 range.
pub const CAN_FD_SIZES: [usize; 8] = [8, 12, 16, 20, 24, 32, 48, 64];

/// A CAN message (ISO 11898), classical or FD.
///
/// On the wire, `data.len()` is one of the sizes representable by a DLC
/// (0-8 for classical CAN, plus 12/16/20/24/32/48/64 for CAN FD).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanMessage {
    /// The arbitration ID. 11 bits value, or 29 bits when `is_extended_id` is set.
    pub arbitration_id: CanId,
    /// Data Length Code of the frame (0-15).
    pub dlc: u8,
    /// The data field, up to 64 bytes.
    pub data: Vec<u8>,
    /// When true, the arbitration ID stands on 29 bits. 11 bits otherwise.
    pub is_extended_id: bool,
    /// When true, the message is carried in a CAN FD frame.
    pub is_fd: bool,
    /// CAN FD bitrate switch flag.
    pub bitrate_switch: bool,
}

impl CanMessage {
    /// Builds a classical message from an ID and data field. The DLC is
    /// derived by rounding up to the nearest representable size.
    pub fn new(arbitration_id: CanId, data: Vec<u8>, is_extended_id: bool) -> Result<Self> {
        let dlc = dlc_for_payload_len(data.len())?;
        Ok(Self {
            arbitration_id,
            dlc,
            data,
            is_extended_id,
            is_fd: false,
            bitrate_switch: false,
        })
    }
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            arbitration_id: 0,
            dlc: 0,
            data: Vec::new(),
            is_extended_id: false,
            is_fd: false,
            bitrate_switch: false,
        }
    }
}

/// Rounds a payload size up to the nearest data length a CAN frame can carry.
pub fn nearest_can_fd_size(size: usize) -> Result<usize> {
    if size <= 8 {
        return Ok(size);
    }
    for fd_size in CAN_FD_SIZES {
        if size <= fd_size {
            return Ok(fd_size);
        }
    }
    Err(IsoTpError::Config(format!(
        "impossible data size for CAN FD: {size}"
    )))
}

/// Computes the DLC encoding a data field of `len` bytes.
pub fn dlc_for_payload_len(len: usize) -> Result<u8> {
    let dlc = match nearest_can_fd_size(len)? {
        n @ 0..=8 => n as u8,
        12 => 9,
        16 => 10,
        20 => 11,
        24 => 12,
        32 => 13,
        48 => 14,
        64 => 15,
        _ => unreachable!(),
    };
    Ok(dlc)
}

/// Number of data bytes encoded by a DLC value.
pub fn payload_len_for_dlc(dlc: u8) -> Result<usize> {
    match dlc {
        0..=8 => Ok(dlc as usize),
        9 => Ok(12),
        10 => Ok(16),
        11 => Ok(20),
        12 => Ok(24),
        13 => Ok(32),
        14 => Ok(48),
        15 => Ok(64),
        _ => Err(IsoTpError::Config(format!("invalid DLC value: {dlc}"))),
    }
}

/// Hex rendition of a data field, for frame traces.
pub(crate) fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlc_round_trips_all_sizes() {
        for len in 0..=8usize {
            assert_eq!(dlc_for_payload_len(len).unwrap(), len as u8);
            assert_eq!(payload_len_for_dlc(len as u8).unwrap(), len);
        }
        for (len, dlc) in [(12, 9), (16, 10), (20, 11), (24, 12), (32, 13), (48, 14), (64, 15)] {
            assert_eq!(dlc_for_payload_len(len).unwrap(), dlc);
            assert_eq!(payload_len_for_dlc(dlc).unwrap(), len);
        }
    }

    #[test]
    fn odd_sizes_round_up() {
        assert_eq!(nearest_can_fd_size(9).unwrap(), 12);
        assert_eq!(nearest_can_fd_size(33).unwrap(), 48);
        assert_eq!(nearest_can_fd_size(49).unwrap(), 64);
        assert!(nearest_can_fd_size(65).is_err());
    }

    #[test]
    fn message_derives_dlc() {
        let msg = CanMessage::new(0x123, vec![0; 10], false).unwrap();
        assert_eq!(msg.dlc, 9);
        assert_eq!(payload_len_for_dlc(msg.dlc).unwrap(), 12);
    }
}
