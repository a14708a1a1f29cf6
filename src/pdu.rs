//! Decoding of CAN data fields into ISO-TP protocol data units.
//!
//! The four PDU kinds are discriminated by the top nibble of the first
//! payload byte, after the addressing prefix has been stripped:
//! `0x0` Single Frame, `0x1` First Frame, `0x2` Consecutive Frame,
//! `0x3` Flow Control.

use std::time::Duration;

use crate::error::{IsoTpError, Result};
use crate::types::CanMessage;

/// Flow status carried in the low nibble of a Flow Control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    ContinueToSend = 0,
    Wait = 1,
    Overflow = 2,
}

/// A decoded ISO-TP protocol data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    SingleFrame {
        data: Vec<u8>,
        /// True when the CAN FD escape form (length in byte #1) was used.
        escape_sequence: bool,
    },
    FirstFrame {
        /// Full length of the segmented payload (FF_DL).
        length: u32,
        data: Vec<u8>,
        /// True when the 32-bit escape form was used.
        escape_sequence: bool,
    },
    ConsecutiveFrame {
        seqnum: u8,
        data: Vec<u8>,
    },
    FlowControl {
        flow_status: FlowStatus,
        blocksize: u8,
        /// Raw STmin byte, as received.
        stmin: u8,
        /// Decoded STmin, reserved values substituted with 127 ms.
        stmin_duration: Duration,
    },
}

impl Pdu {
    /// Decodes the data field of `msg`, skipping `prefix_size` address bytes.
    pub fn parse(msg: &CanMessage, prefix_size: usize) -> Result<Self> {
        if msg.data.len() < prefix_size {
            return Err(IsoTpError::InvalidCanData(
                "message is missing data according to prefix size".into(),
            ));
        }
        let can_dl = msg.data.len();
        let data = &msg.data[prefix_size..];
        let Some(&first) = data.first() else {
            return Err(IsoTpError::InvalidCanData("empty CAN frame".into()));
        };

        match first >> 4 {
            0x0 => Self::parse_single_frame(data, can_dl),
            0x1 => Self::parse_first_frame(data, can_dl),
            0x2 => Ok(Pdu::ConsecutiveFrame {
                seqnum: first & 0xF,
                data: data[1..].to_vec(),
            }),
            0x3 => Self::parse_flow_control(data),
            kind => Err(IsoTpError::InvalidCanData(format!(
                "unknown frame type {kind}"
            ))),
        }
    }

    fn parse_single_frame(data: &[u8], can_dl: usize) -> Result<Self> {
        let length_placeholder = usize::from(data[0] & 0xF);
        if length_placeholder != 0 {
            // Classical form. Forbidden on frames wider than 8 bytes.
            if can_dl > 8 {
                return Err(IsoTpError::MissingEscapeSequence);
            }
            if length_placeholder > data.len() - 1 {
                return Err(IsoTpError::InvalidCanData(format!(
                    "single frame length of {} exceeds the {} available data bytes",
                    length_placeholder,
                    data.len() - 1
                )));
            }
            Ok(Pdu::SingleFrame {
                data: data[1..1 + length_placeholder].to_vec(),
                escape_sequence: false,
            })
        } else {
            if data.len() < 2 {
                return Err(IsoTpError::InvalidCanData(
                    "single frame with escape sequence is too short".into(),
                ));
            }
            let length = usize::from(data[1]);
            if length == 0 {
                return Err(IsoTpError::InvalidCanData(
                    "received single frame with a length of 0 bytes".into(),
                ));
            }
            if length > data.len() - 2 {
                return Err(IsoTpError::InvalidCanData(format!(
                    "single frame length of {} exceeds the {} available data bytes",
                    length,
                    data.len() - 2
                )));
            }
            Ok(Pdu::SingleFrame {
                data: data[2..2 + length].to_vec(),
                escape_sequence: true,
            })
        }
    }

    fn parse_first_frame(data: &[u8], can_dl: usize) -> Result<Self> {
        if data.len() < 2 {
            return Err(IsoTpError::InvalidCanData("first frame is too short".into()));
        }
        let length_placeholder = (u32::from(data[0] & 0xF) << 8) | u32::from(data[1]);
        if length_placeholder != 0 {
            let length = length_placeholder;
            let take = (length as usize).min(data.len() - 2);
            Ok(Pdu::FirstFrame {
                length,
                data: data[2..2 + take].to_vec(),
                escape_sequence: false,
            })
        } else {
            // 32-bit escape form, only meaningful on CAN FD widths.
            if can_dl <= 8 {
                return Err(IsoTpError::MissingEscapeSequence);
            }
            if data.len() < 6 {
                return Err(IsoTpError::InvalidCanData(
                    "first frame with escape sequence is too short".into(),
                ));
            }
            let length = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
            let take = (length as usize).min(data.len() - 6);
            Ok(Pdu::FirstFrame {
                length,
                data: data[6..6 + take].to_vec(),
                escape_sequence: true,
            })
        }
    }

    fn parse_flow_control(data: &[u8]) -> Result<Self> {
        if data.len() < 3 {
            return Err(IsoTpError::InvalidCanData(
                "flow control frame must be at least 3 bytes".into(),
            ));
        }
        let flow_status = match data[0] & 0xF {
            0 => FlowStatus::ContinueToSend,
            1 => FlowStatus::Wait,
            2 => FlowStatus::Overflow,
            status => {
                return Err(IsoTpError::InvalidCanData(format!(
                    "unknown flow status {status}"
                )))
            }
        };
        let stmin = data[2];
        Ok(Pdu::FlowControl {
            flow_status,
            blocksize: data[1],
            stmin,
            stmin_duration: stmin_to_duration(stmin),
        })
    }
}

/// Decodes an STmin byte. Values in the reserved ranges are treated as the
/// longest valid separation time (0x7F, 127 ms).
pub fn stmin_to_duration(stmin: u8) -> Duration {
    match stmin {
        0x00..=0x7F => Duration::from_millis(u64::from(stmin)),
        0xF1..=0xF9 => Duration::from_micros(u64::from(stmin - 0xF0) * 100),
        _ => Duration::from_millis(0x7F),
    }
}

/// Crafts the 3-byte data field of a Flow Control frame.
pub fn flow_control_data(flow_status: FlowStatus, blocksize: u8, stmin: u8) -> Vec<u8> {
    vec![0x30 | (flow_status as u8 & 0xF), blocksize, stmin]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CanMessage;

    fn msg(data: &[u8]) -> CanMessage {
        CanMessage::new(0x123, data.to_vec(), false).unwrap()
    }

    #[test]
    fn decodes_single_frame() {
        let pdu = Pdu::parse(&msg(&[0x03, 0xAA, 0xBB, 0xCC]), 0).unwrap();
        assert_eq!(
            pdu,
            Pdu::SingleFrame {
                data: vec![0xAA, 0xBB, 0xCC],
                escape_sequence: false,
            }
        );
    }

    #[test]
    fn decodes_single_frame_with_prefix() {
        let pdu = Pdu::parse(&msg(&[0x55, 0x02, 0x10, 0x03]), 1).unwrap();
        assert_eq!(
            pdu,
            Pdu::SingleFrame {
                data: vec![0x10, 0x03],
                escape_sequence: false,
            }
        );
    }

    #[test]
    fn single_frame_length_must_fit_frame() {
        assert!(matches!(
            Pdu::parse(&msg(&[0x07, 0x01, 0x02]), 0),
            Err(IsoTpError::InvalidCanData(_))
        ));
    }

    #[test]
    fn wide_single_frame_requires_escape_sequence() {
        let mut data = vec![0x05; 12];
        data[0] = 0x05;
        assert!(matches!(
            Pdu::parse(&msg(&data), 0),
            Err(IsoTpError::MissingEscapeSequence)
        ));
        data[0] = 0x00;
        data[1] = 0x09;
        let pdu = Pdu::parse(&msg(&data), 0).unwrap();
        assert_eq!(
            pdu,
            Pdu::SingleFrame {
                data: vec![0x05; 9],
                escape_sequence: true,
            }
        );
    }

    #[test]
    fn decodes_first_frame() {
        let pdu = Pdu::parse(&msg(&[0x10, 0x0A, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05]), 0).unwrap();
        assert_eq!(
            pdu,
            Pdu::FirstFrame {
                length: 10,
                data: vec![0x00, 0x01, 0x02, 0x03, 0x04, 0x05],
                escape_sequence: false,
            }
        );
    }

    #[test]
    fn first_frame_escape_requires_fd_width() {
        let classical = [0x10, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00];
        assert!(matches!(
            Pdu::parse(&msg(&classical), 0),
            Err(IsoTpError::MissingEscapeSequence)
        ));

        let mut fd = vec![0x00; 64];
        fd[0] = 0x10;
        fd[1] = 0x00;
        fd[2..6].copy_from_slice(&0x0001_1000u32.to_be_bytes());
        match Pdu::parse(&msg(&fd), 0).unwrap() {
            Pdu::FirstFrame {
                length,
                data,
                escape_sequence,
            } => {
                assert_eq!(length, 0x11000);
                assert_eq!(data.len(), 58);
                assert!(escape_sequence);
            }
            other => panic!("unexpected PDU: {other:?}"),
        }
    }

    #[test]
    fn decodes_consecutive_frame() {
        let pdu = Pdu::parse(&msg(&[0x21, 0x06, 0x07, 0x08, 0x09]), 0).unwrap();
        assert_eq!(
            pdu,
            Pdu::ConsecutiveFrame {
                seqnum: 1,
                data: vec![0x06, 0x07, 0x08, 0x09],
            }
        );
    }

    #[test]
    fn decodes_flow_control() {
        let pdu = Pdu::parse(&msg(&[0x31, 0x08, 0x14]), 0).unwrap();
        assert_eq!(
            pdu,
            Pdu::FlowControl {
                flow_status: FlowStatus::Wait,
                blocksize: 8,
                stmin: 0x14,
                stmin_duration: Duration::from_millis(20),
            }
        );
        assert!(matches!(
            Pdu::parse(&msg(&[0x33, 0x00, 0x00]), 0),
            Err(IsoTpError::InvalidCanData(_))
        ));
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        assert!(matches!(
            Pdu::parse(&msg(&[0x40, 0x00]), 0),
            Err(IsoTpError::InvalidCanData(_))
        ));
    }

    #[test]
    fn stmin_decoding_covers_reserved_ranges() {
        assert_eq!(stmin_to_duration(0x00), Duration::ZERO);
        assert_eq!(stmin_to_duration(0x7F), Duration::from_millis(127));
        assert_eq!(stmin_to_duration(0xF1), Duration::from_micros(100));
        assert_eq!(stmin_to_duration(0xF9), Duration::from_micros(900));
        assert_eq!(stmin_to_duration(0x80), Duration::from_millis(127));
        assert_eq!(stmin_to_duration(0xFA), Duration::from_millis(127));
    }

    #[test]
    fn flow_control_data_layout() {
        assert_eq!(
            flow_control_data(FlowStatus::ContinueToSend, 8, 0),
            vec![0x30, 0x08, 0x00]
        );
        assert_eq!(
            flow_control_data(FlowStatus::Overflow, 0, 0x7F),
            vec![0x32, 0x00, 0x7F]
        );
    }
}
