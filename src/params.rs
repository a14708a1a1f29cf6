//! Transport layer configuration record.

use std::time::Duration;

use crate::address::TargetAddressType;
use crate::error::{IsoTpError, Result};
use crate::types::CAN_FD_SIZES;

/// Behavioral parameters of the transport layer.
///
/// Validated when handed to the transport; the worker re-reads a snapshot on
/// every tick, so updates through
/// [`TransportLayer::set_params`](crate::TransportLayer::set_params) take
/// effect between ticks, never in the middle of one.
#[derive(Debug, Clone)]
pub struct Params {
    /// Minimum separation time advertised in outgoing Flow Control frames.
    /// Raw wire encoding: 0x00-0x7F ms, 0xF1-0xF9 hundreds of microseconds.
    pub stmin: u8,
    /// Block size advertised in outgoing Flow Control frames. 0 means no limit.
    pub blocksize: u8,
    /// Maximum number of data bytes per outgoing CAN frame.
    pub tx_data_length: usize,
    /// When set, outgoing frames are padded up to at least this length.
    pub tx_data_min_length: Option<usize>,
    /// When set, replaces the STmin requested by the receiver. Zero means
    /// sending as fast as the scheduler allows.
    pub override_receiver_stmin: Option<Duration>,
    /// N_Bs: how long to wait for a Flow Control frame after a First Frame
    /// or a completed block.
    pub rx_flowcontrol_timeout: Duration,
    /// N_Cr: how long to wait for the next Consecutive Frame.
    pub rx_consecutive_frame_timeout: Duration,
    /// Padding byte for outgoing frames. On classical CAN, setting this
    /// enables padding to 8 bytes; on CAN FD padding is always performed and
    /// this selects the byte (0xCC otherwise).
    pub tx_padding: Option<u8>,
    /// Number of Flow Control wait frames tolerated before aborting. 0
    /// makes wait frames an error.
    pub wftmax: u32,
    /// Largest incoming payload accepted; longer First Frames are answered
    /// with a Flow Control overflow.
    pub max_frame_size: u32,
    /// Mark outgoing frames as CAN FD.
    pub can_fd: bool,
    /// Set the bitrate switch flag on outgoing frames.
    pub bitrate_switch: bool,
    /// Target address type used by `send` when none is specified.
    pub default_target_address_type: TargetAddressType,
    pub rate_limit_enable: bool,
    /// Mean outbound bitrate cap, in bits per second of payload data.
    pub rate_limit_max_bitrate: u32,
    /// Width of the rate limiter sliding window.
    pub rate_limit_window_size: Duration,
    /// Reassemble incoming transmissions without ever emitting Flow Control.
    pub listen_mode: bool,
    /// Make `send` block until the transmission completed or failed.
    pub blocking_send: bool,
    /// Log target used for frame traces and warnings.
    pub logger_name: String,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            stmin: 0,
            blocksize: 8,
            tx_data_length: 8,
            tx_data_min_length: None,
            override_receiver_stmin: None,
            rx_flowcontrol_timeout: Duration::from_millis(1000),
            rx_consecutive_frame_timeout: Duration::from_millis(1000),
            tx_padding: None,
            wftmax: 0,
            max_frame_size: 4095,
            can_fd: false,
            bitrate_switch: false,
            default_target_address_type: TargetAddressType::Physical,
            rate_limit_enable: false,
            rate_limit_max_bitrate: 10_000_000,
            rate_limit_window_size: Duration::from_millis(200),
            listen_mode: false,
            blocking_send: false,
            logger_name: "isotp".to_owned(),
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<()> {
        if !CAN_FD_SIZES.contains(&self.tx_data_length) {
            return Err(IsoTpError::Config(format!(
                "tx_data_length must be one of {CAN_FD_SIZES:?}, got {}",
                self.tx_data_length
            )));
        }
        if let Some(min_length) = self.tx_data_min_length {
            let valid = (1..=8).contains(&min_length) || CAN_FD_SIZES.contains(&min_length);
            if !valid {
                return Err(IsoTpError::Config(format!(
                    "tx_data_min_length must be 1-8 or one of {CAN_FD_SIZES:?}, got {min_length}"
                )));
            }
            if min_length > self.tx_data_length {
                return Err(IsoTpError::Config(
                    "tx_data_min_length cannot be greater than tx_data_length".into(),
                ));
            }
        }
        if self.rate_limit_max_bitrate == 0 {
            return Err(IsoTpError::Config(
                "rate_limit_max_bitrate must be greater than 0".into(),
            ));
        }
        if self.rate_limit_window_size.is_zero() {
            return Err(IsoTpError::Config(
                "rate_limit_window_size must be greater than 0".into(),
            ));
        }
        let window_bits =
            f64::from(self.rate_limit_max_bitrate) * self.rate_limit_window_size.as_secs_f64();
        if window_bits < (self.tx_data_length * 8) as f64 {
            return Err(IsoTpError::Config(format!(
                "rate limiter window too small to ever send a frame of \
                 tx_data_length = {} bytes",
                self.tx_data_length
            )));
        }
        if self.logger_name.is_empty() {
            return Err(IsoTpError::Config("logger_name must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Params::default().validate().is_ok());
    }

    #[test]
    fn tx_data_length_restricted_to_can_fd_sizes() {
        let mut params = Params::default();
        params.tx_data_length = 10;
        assert!(params.validate().is_err());
        params.tx_data_length = 64;
        assert!(params.validate().is_ok());
    }

    #[test]
    fn tx_data_min_length_bounded_by_tx_data_length() {
        let mut params = Params::default();
        params.tx_data_min_length = Some(12);
        assert!(params.validate().is_err());
        params.tx_data_length = 16;
        assert!(params.validate().is_ok());
        params.tx_data_min_length = Some(9);
        assert!(params.validate().is_err());
    }

    #[test]
    fn rate_limit_window_must_fit_one_frame() {
        let mut params = Params::default();
        params.rate_limit_max_bitrate = 100;
        params.rate_limit_window_size = Duration::from_millis(100);
        // 10 bits of budget cannot carry a 64-bit frame.
        assert!(params.validate().is_err());
        params.rate_limit_window_size = Duration::from_secs(1);
        assert!(params.validate().is_ok());
    }
}
