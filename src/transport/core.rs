//! Protocol core: the two coupled state machines and their shared queues.
//!
//! [`TransportCore`] is single-threaded by construction. It is owned by the
//! worker thread while the layer is started, or driven directly through
//! [`TransportLayer::process`](crate::TransportLayer::process) in polling
//! mode. Everything user threads touch goes through [`Shared`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::address::{TargetAddressType, TransportAddress};
use crate::error::{IsoTpError, Result};
use crate::params::Params;
use crate::pdu::{flow_control_data, FlowStatus, Pdu};
use crate::rate_limiter::RateLimiter;
use crate::timer::Timer;
use crate::transport::payload::{TxBuffer, TxPayload};
use crate::types::{dlc_for_payload_len, hex, nearest_can_fd_size, CanMessage, CAN_FD_SIZES};
use crate::FrameSender;

/// Payloads the transmit queue will hold before `send` refuses more.
pub(crate) const TX_QUEUE_CAPACITY: usize = 64;

/// Callback receiving protocol errors detected by the worker.
pub type ErrorHandler = Box<dyn Fn(&IsoTpError) + Send>;

/// Counters returned by one `process` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    /// CAN messages read from the link.
    pub received: u32,
    /// Messages addressed to us and fed to the state machines.
    pub received_processed: u32,
    /// CAN messages handed to the send callback.
    pub sent: u32,
}

/// Completion cell for blocking sends.
#[derive(Debug, Default)]
pub(crate) struct SendCompletion {
    state: Mutex<Option<bool>>,
    condvar: Condvar,
}

impl SendCompletion {
    pub(crate) fn signal(&self, success: bool) {
        let mut state = self.state.lock().unwrap();
        if state.is_none() {
            *state = Some(success);
            self.condvar.notify_all();
        }
    }

    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            match *state {
                Some(true) => return Ok(()),
                Some(false) => return Err(IsoTpError::BlockingSendFailure),
                None => {}
            }
            match timeout {
                Some(timeout) => {
                    let (guard, result) = self.condvar.wait_timeout(state, timeout).unwrap();
                    state = guard;
                    if result.timed_out() && state.is_none() {
                        return Err(IsoTpError::BlockingSendTimeout);
                    }
                }
                None => state = self.condvar.wait(state).unwrap(),
            }
        }
    }
}

/// One queued transmission.
pub(crate) struct TxRequest {
    pub payload: TxPayload,
    pub target_address_type: TargetAddressType,
    pub completion: Option<Arc<SendCompletion>>,
}

/// Event carried over the relay channel from user/relay threads to the worker.
pub(crate) enum RelayEvent {
    Frame(CanMessage),
    /// Sentinel injected to wake an idle-blocked worker.
    Wake,
    /// Receive-side link failure, dispatched by the worker.
    Error(IsoTpError),
}

/// State shared between user threads and the worker.
pub(crate) struct Shared {
    pub params: Mutex<Params>,
    pub tx_queue: Mutex<VecDeque<TxRequest>>,
    pub rx_queue: Mutex<VecDeque<Vec<u8>>>,
    pub rx_available: Condvar,
    pub tx_active: AtomicBool,
    pub stop_requested: AtomicBool,
    pub cancel_sending: AtomicBool,
    pub cancel_receiving: AtomicBool,
    /// Sleep durations used when fully idle and while waiting for a flow
    /// control, in that order.
    pub sleep_timing: Mutex<(Duration, Duration)>,
    /// Handle used to wake the worker; present while started.
    pub wake: Mutex<Option<std::sync::mpsc::Sender<RelayEvent>>>,
}

impl Shared {
    pub(crate) fn new(params: Params) -> Self {
        Self {
            params: Mutex::new(params),
            tx_queue: Mutex::new(VecDeque::new()),
            rx_queue: Mutex::new(VecDeque::new()),
            rx_available: Condvar::new(),
            tx_active: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            cancel_sending: AtomicBool::new(false),
            cancel_receiving: AtomicBool::new(false),
            sleep_timing: Mutex::new((Duration::from_millis(50), Duration::from_millis(10))),
            wake: Mutex::new(None),
        }
    }

    pub(crate) fn wake_worker(&self) {
        if let Some(tx) = self.wake.lock().unwrap().as_ref() {
            let _ = tx.send(RelayEvent::Wake);
        }
    }

    fn push_rx(&self, payload: Vec<u8>) {
        self.rx_queue.lock().unwrap().push_back(payload);
        self.rx_available.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Idle,
    WaitCf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Idle,
    WaitFc,
    TransmitCf,
}

/// What a parked (rate-limited) frame implies once it is finally emitted.
enum StandbyKind {
    SingleFrame,
    FirstFrame,
}

/// Decoded flow control relevant to the Tx machine.
struct FlowControlInfo {
    flow_status: FlowStatus,
    blocksize: u8,
    stmin_duration: Duration,
}

/// The ISO-TP protocol engine.
pub(crate) struct TransportCore<S: FrameSender> {
    sender: S,
    address: TransportAddress,
    shared: Arc<Shared>,
    params: Params,
    error_handler: Option<ErrorHandler>,

    rx_state: RxState,
    rx_buffer: Vec<u8>,
    rx_frame_length: usize,
    last_seqnum: u8,
    rx_block_counter: u32,
    actual_rxdl: Option<usize>,
    pending_flow_control: Option<FlowStatus>,
    last_flow_control: Option<FlowControlInfo>,

    tx_state: TxState,
    tx_buffer: Option<TxBuffer>,
    tx_standby: Option<(CanMessage, StandbyKind)>,
    active_completion: Option<Arc<SendCompletion>>,
    tx_seqnum: u8,
    tx_block_counter: u32,
    remote_blocksize: u8,
    wft_counter: u32,

    timer_rx_fc: Timer,
    timer_rx_cf: Timer,
    timer_tx_stmin: Timer,
    rate_limiter: RateLimiter,
}

impl<S: FrameSender> TransportCore<S> {
    pub(crate) fn new(
        sender: S,
        address: TransportAddress,
        error_handler: Option<ErrorHandler>,
        shared: Arc<Shared>,
    ) -> Self {
        let params = shared.params.lock().unwrap().clone();
        let mut rate_limiter = RateLimiter::new(
            f64::from(params.rate_limit_max_bitrate),
            params.rate_limit_window_size,
        );
        if params.rate_limit_enable {
            rate_limiter.enable();
        }
        Self {
            sender,
            address,
            shared,
            params,
            error_handler,
            rx_state: RxState::Idle,
            rx_buffer: Vec::new(),
            rx_frame_length: 0,
            last_seqnum: 0,
            rx_block_counter: 0,
            actual_rxdl: None,
            pending_flow_control: None,
            last_flow_control: None,
            tx_state: TxState::Idle,
            tx_buffer: None,
            tx_standby: None,
            active_completion: None,
            tx_seqnum: 0,
            tx_block_counter: 0,
            remote_blocksize: 0,
            wft_counter: 0,
            timer_rx_fc: Timer::new(Duration::ZERO),
            timer_rx_cf: Timer::new(Duration::ZERO),
            timer_tx_stmin: Timer::new(Duration::ZERO),
            rate_limiter,
        }
    }

    pub(crate) fn set_address(&mut self, address: TransportAddress) {
        self.address = address;
    }

    /// Re-reads the params snapshot so updates land between ticks.
    pub(crate) fn refresh_params(&mut self) {
        let params = self.shared.params.lock().unwrap().clone();
        if params.rate_limit_max_bitrate != self.params.rate_limit_max_bitrate
            || params.rate_limit_window_size != self.params.rate_limit_window_size
        {
            self.rate_limiter = RateLimiter::new(
                f64::from(params.rate_limit_max_bitrate),
                params.rate_limit_window_size,
            );
        }
        if params.rate_limit_enable != self.rate_limiter.is_enabled() {
            if params.rate_limit_enable {
                self.rate_limiter.enable();
            } else {
                self.rate_limiter.disable();
            }
        }
        self.params = params;
    }

    pub(crate) fn is_transmitting(&self) -> bool {
        self.tx_state != TxState::Idle || self.tx_standby.is_some()
    }

    /// One full processing pass: service timeouts, drain incoming frames,
    /// run the Tx machine, and repeat while one side demands immediate
    /// service of the other.
    pub(crate) fn process(
        &mut self,
        poll: &mut dyn FnMut() -> Option<CanMessage>,
    ) -> ProcessStats {
        let mut stats = ProcessStats::default();
        loop {
            let mut run_again = false;
            self.check_timeouts_rx();
            self.rate_limiter.update();

            while let Some(msg) = poll() {
                stats.received += 1;
                let for_me = self.address.is_for_me(&msg);
                if log::log_enabled!(target: self.params.logger_name.as_str(), log::Level::Debug) {
                    let marker = if for_me { 'p' } else { 'i' };
                    debug!(
                        target: self.params.logger_name.as_str(),
                        "rx <{}> ({:02}) [{}] {}",
                        format_id(&msg),
                        msg.data.len(),
                        marker,
                        hex(&msg.data)
                    );
                }
                if for_me {
                    stats.received_processed += 1;
                    if self.process_rx_msg(&msg) {
                        // A flow control is involved; run the Tx machine
                        // before decoding more frames.
                        run_again = true;
                        break;
                    }
                }
            }

            loop {
                let (sent, immediate_rx) = self.process_tx();
                if sent {
                    stats.sent += 1;
                }
                if immediate_rx {
                    run_again = true;
                    break;
                }
                if !sent {
                    break;
                }
            }

            if !run_again {
                break;
            }
        }
        stats
    }

    pub(crate) fn check_timeouts_rx(&mut self) {
        if self.timer_rx_cf.is_timed_out() {
            self.dispatch_error(&IsoTpError::ConsecutiveFrameTimeout);
            self.stop_receiving();
        }
    }

    /// Feeds one addressed frame to the Rx machine. Returns true when the
    /// Tx machine must run before any further frame is decoded.
    fn process_rx_msg(&mut self, msg: &CanMessage) -> bool {
        let pdu = match Pdu::parse(msg, self.address.rx_prefix_size()) {
            Ok(pdu) => pdu,
            Err(error @ IsoTpError::MissingEscapeSequence) => {
                self.dispatch_error(&error);
                return false;
            }
            Err(error) => {
                self.dispatch_error(&error);
                self.stop_receiving();
                return false;
            }
        };
        let rx_dl = msg.data.len().max(8);

        if let Pdu::FlowControl {
            flow_status,
            blocksize,
            stmin_duration,
            ..
        } = pdu
        {
            // Queue of depth one, consumed by the Tx machine right away.
            self.last_flow_control = Some(FlowControlInfo {
                flow_status,
                blocksize,
                stmin_duration,
            });
            return true;
        }

        let mut immediate_tx = false;
        match self.rx_state {
            RxState::Idle => {
                self.rx_frame_length = 0;
                self.timer_rx_cf.stop();
                match pdu {
                    Pdu::SingleFrame { data, .. } => self.shared.push_rx(data),
                    Pdu::FirstFrame { length, data, .. } => {
                        self.start_reception_after_first_frame(length, data, rx_dl);
                    }
                    Pdu::ConsecutiveFrame { .. } => {
                        self.dispatch_error(&IsoTpError::UnexpectedConsecutiveFrame);
                    }
                    Pdu::FlowControl { .. } => unreachable!(),
                }
            }
            RxState::WaitCf => match pdu {
                Pdu::SingleFrame { data, .. } => {
                    self.shared.push_rx(data);
                    self.rx_state = RxState::Idle;
                    self.timer_rx_cf.stop();
                    self.dispatch_error(&IsoTpError::ReceptionInterruptedWithSingleFrame);
                }
                Pdu::FirstFrame { length, data, .. } => {
                    self.start_reception_after_first_frame(length, data, rx_dl);
                    self.dispatch_error(&IsoTpError::ReceptionInterruptedWithFirstFrame);
                }
                Pdu::ConsecutiveFrame { seqnum, data } => {
                    immediate_tx = self.process_consecutive_frame(seqnum, &data, rx_dl);
                }
                Pdu::FlowControl { .. } => unreachable!(),
            },
        }
        immediate_tx
    }

    fn process_consecutive_frame(&mut self, seqnum: u8, data: &[u8], rx_dl: usize) -> bool {
        let expected_seqnum = (self.last_seqnum + 1) & 0xF;
        if seqnum != expected_seqnum {
            self.stop_receiving();
            self.dispatch_error(&IsoTpError::WrongSequenceNumber {
                expected: expected_seqnum,
                received: seqnum,
            });
            return false;
        }

        let bytes_to_receive = self.rx_frame_length - self.rx_buffer.len();
        if Some(rx_dl) != self.actual_rxdl && rx_dl < bytes_to_receive {
            // Not wide enough to be the last frame: the sender changed its
            // frame width mid-transmission. Ignore the frame.
            self.dispatch_error(&IsoTpError::ChangingInvalidRxDl {
                expected: self.actual_rxdl.unwrap_or(0),
                received: rx_dl,
            });
            return false;
        }

        self.timer_rx_cf
            .restart(self.params.rx_consecutive_frame_timeout);
        self.last_seqnum = seqnum;
        let take = bytes_to_receive.min(data.len());
        self.rx_buffer.extend_from_slice(&data[..take]);

        if self.rx_buffer.len() >= self.rx_frame_length {
            self.shared.push_rx(std::mem::take(&mut self.rx_buffer));
            self.stop_receiving();
            return false;
        }

        self.rx_block_counter += 1;
        let blocksize = u32::from(self.params.blocksize);
        if blocksize > 0 && self.rx_block_counter % blocksize == 0 {
            self.request_tx_flowcontrol(FlowStatus::ContinueToSend);
            // Hold N_Cr until the flow control actually leaves; the Tx
            // machine restarts it.
            self.timer_rx_cf.stop();
            return true;
        }
        false
    }

    fn start_reception_after_first_frame(&mut self, length: u32, data: Vec<u8>, rx_dl: usize) {
        self.rx_buffer.clear();
        if !CAN_FD_SIZES.contains(&rx_dl) {
            self.dispatch_error(&IsoTpError::InvalidCanFdFirstFrameRxDl { rx_dl });
            self.stop_receiving();
            return;
        }
        self.actual_rxdl = Some(rx_dl);

        if length > self.params.max_frame_size {
            self.dispatch_error(&IsoTpError::FrameTooLong {
                length,
                max: self.params.max_frame_size,
            });
            self.request_tx_flowcontrol(FlowStatus::Overflow);
            self.rx_state = RxState::Idle;
        } else {
            self.rx_state = RxState::WaitCf;
            self.rx_frame_length = length as usize;
            self.rx_buffer.extend_from_slice(&data);
            self.request_tx_flowcontrol(FlowStatus::ContinueToSend);
            self.timer_rx_cf
                .restart(self.params.rx_consecutive_frame_timeout);
        }
        self.last_seqnum = 0;
        self.rx_block_counter = 0;
    }

    /// One Tx machine tick. Returns (frame sent, Rx machine must run again).
    fn process_tx(&mut self) -> (bool, bool) {
        let allowed_bytes = self.rate_limiter.allowed_bytes();

        // Flow control requested by the Rx machine goes out first.
        if let Some(status) = self.pending_flow_control.take() {
            if status == FlowStatus::ContinueToSend {
                // The peer may resume sending; watch N_Cr again.
                self.timer_rx_cf
                    .restart(self.params.rx_consecutive_frame_timeout);
            }
            if !self.params.listen_mode {
                match self.make_flow_control(status) {
                    Ok(msg) => {
                        let sent = self.emit(&msg);
                        return (sent, true);
                    }
                    Err(error) => self.dispatch_error(&error),
                }
            }
        }

        if let Some(fc) = self.last_flow_control.take() {
            self.handle_flow_control(fc);
        }

        if self.timer_rx_fc.is_timed_out() {
            self.dispatch_error(&IsoTpError::FlowControlTimeout);
            self.stop_sending(false);
        }

        if self.tx_state != TxState::Idle
            && self.tx_buffer.as_ref().map_or(0, TxBuffer::remaining) == 0
        {
            self.stop_sending(true);
        }

        // A frame parked by the rate limiter blocks everything behind it.
        if let Some((msg, _)) = &self.tx_standby {
            if msg.data.len() <= allowed_bytes {
                let (msg, kind) = self.tx_standby.take().unwrap();
                let sent = self.emit(&msg);
                match kind {
                    StandbyKind::SingleFrame => self.finish_transmission(true),
                    StandbyKind::FirstFrame => {
                        self.tx_state = TxState::WaitFc;
                        self.timer_rx_fc.restart(self.params.rx_flowcontrol_timeout);
                    }
                }
                return (sent, false);
            }
            return (false, false);
        }

        match self.tx_state {
            TxState::Idle => self.start_next_transmission(allowed_bytes),
            TxState::WaitFc => (false, false),
            TxState::TransmitCf => self.transmit_consecutive_frame(allowed_bytes),
        }
    }

    fn handle_flow_control(&mut self, fc: FlowControlInfo) {
        if fc.flow_status == FlowStatus::Overflow {
            self.stop_sending(false);
            self.dispatch_error(&IsoTpError::Overflow);
            return;
        }
        if self.tx_state == TxState::Idle {
            self.dispatch_error(&IsoTpError::UnexpectedFlowControl);
            return;
        }
        match fc.flow_status {
            FlowStatus::Wait => {
                if self.params.wftmax == 0 {
                    self.dispatch_error(&IsoTpError::UnsupportedWaitFrame);
                } else if self.wft_counter >= self.params.wftmax {
                    self.dispatch_error(&IsoTpError::MaximumWaitFrameReached {
                        count: self.wft_counter,
                    });
                    self.stop_sending(false);
                } else {
                    self.wft_counter += 1;
                    self.tx_state = TxState::WaitFc;
                    self.timer_rx_fc.restart(self.params.rx_flowcontrol_timeout);
                }
            }
            FlowStatus::ContinueToSend => {
                if self.timer_rx_fc.is_timed_out() {
                    // Too late; the timeout handler owns this transmission.
                    return;
                }
                self.wft_counter = 0;
                self.timer_rx_fc.stop();
                let stmin = self
                    .params
                    .override_receiver_stmin
                    .unwrap_or(fc.stmin_duration);
                self.timer_tx_stmin.set_timeout(stmin);
                self.remote_blocksize = fc.blocksize;
                if self.tx_state == TxState::WaitFc {
                    self.tx_block_counter = 0;
                    self.timer_tx_stmin.start();
                }
                self.tx_state = TxState::TransmitCf;
            }
            FlowStatus::Overflow => unreachable!(),
        }
    }

    fn start_next_transmission(&mut self, allowed_bytes: usize) -> (bool, bool) {
        let request = loop {
            let Some(request) = self.shared.tx_queue.lock().unwrap().pop_front() else {
                return (false, false);
            };
            if request.payload.total_length() == 0 {
                // Nothing to put on the wire; trivially complete.
                if let Some(completion) = request.completion {
                    completion.signal(true);
                }
                continue;
            }
            break request;
        };

        let prefix_len = self.address.tx_prefix_size();
        let total_length = request.payload.total_length();
        self.active_completion = request.completion.clone();
        self.shared.tx_active.store(true, Ordering::Relaxed);
        let mut buffer = TxBuffer::new(request.payload);

        let size_on_first_byte = total_length + prefix_len <= 7;
        let size_offset = if size_on_first_byte { 1 } else { 2 };

        if total_length <= self.params.tx_data_length - size_offset - prefix_len {
            // Fits a single frame.
            let payload = match buffer.take(total_length) {
                Ok(payload) => payload,
                Err(error) => return self.abort_on_pull_failure(error),
            };
            let mut msg_data = self.data_with_prefix();
            if size_on_first_byte {
                msg_data.push(total_length as u8);
            } else {
                msg_data.push(0x00);
                msg_data.push(total_length as u8);
            }
            msg_data.extend_from_slice(&payload);
            let msg = match self.make_tx_msg(request.target_address_type, msg_data) {
                Ok(msg) => msg,
                Err(error) => return self.abort_on_tx_setup_failure(error),
            };
            self.tx_buffer = Some(buffer);
            if msg.data.len() > allowed_bytes {
                self.tx_standby = Some((msg, StandbyKind::SingleFrame));
                (false, false)
            } else {
                let sent = self.emit(&msg);
                self.finish_transmission(true);
                (sent, false)
            }
        } else {
            // Multi-frame: emit the First Frame.
            let encode_on_2_bytes = total_length <= 0xFFF;
            let header_len = if encode_on_2_bytes { 2 } else { 6 };
            let data_length = self.params.tx_data_length - header_len - prefix_len;
            let chunk = match buffer.take(data_length) {
                Ok(chunk) => chunk,
                Err(error) => return self.abort_on_pull_failure(error),
            };
            let mut msg_data = self.data_with_prefix();
            if encode_on_2_bytes {
                msg_data.push(0x10 | ((total_length >> 8) & 0xF) as u8);
                msg_data.push((total_length & 0xFF) as u8);
            } else {
                msg_data.push(0x10);
                msg_data.push(0x00);
                msg_data.extend_from_slice(&(total_length as u32).to_be_bytes());
            }
            msg_data.extend_from_slice(&chunk);
            let msg = match self.make_tx_msg(TargetAddressType::Physical, msg_data) {
                Ok(msg) => msg,
                Err(error) => return self.abort_on_tx_setup_failure(error),
            };
            self.tx_buffer = Some(buffer);
            self.tx_seqnum = 1;
            if msg.data.len() <= allowed_bytes {
                let sent = self.emit(&msg);
                self.tx_state = TxState::WaitFc;
                self.timer_rx_fc.restart(self.params.rx_flowcontrol_timeout);
                (sent, false)
            } else {
                self.tx_standby = Some((msg, StandbyKind::FirstFrame));
                (false, false)
            }
        }
    }

    fn transmit_consecutive_frame(&mut self, allowed_bytes: usize) -> (bool, bool) {
        let mut sent = false;
        if self.timer_tx_stmin.is_timed_out() {
            let prefix_len = self.address.tx_prefix_size();
            let data_length = self.params.tx_data_length - 1 - prefix_len;
            let remaining = self.tx_buffer.as_ref().map_or(0, TxBuffer::remaining);
            let chunk_len = data_length.min(remaining);
            let frame_len = self.padded_len(prefix_len + 1 + chunk_len);
            if frame_len <= allowed_bytes {
                let chunk = match self.tx_buffer.as_mut().unwrap().take(chunk_len) {
                    Ok(chunk) => chunk,
                    Err(error) => return self.abort_on_pull_failure(error),
                };
                let mut msg_data = self.data_with_prefix();
                msg_data.push(0x20 | self.tx_seqnum);
                msg_data.extend_from_slice(&chunk);
                let msg = match self.make_tx_msg(TargetAddressType::Physical, msg_data) {
                    Ok(msg) => msg,
                    Err(error) => return self.abort_on_tx_setup_failure(error),
                };
                sent = self.emit(&msg);
                self.tx_seqnum = (self.tx_seqnum + 1) & 0xF;
                self.timer_tx_stmin.start();
                self.tx_block_counter += 1;
            }
        }

        let remaining = self.tx_buffer.as_ref().map_or(0, TxBuffer::remaining);
        if remaining == 0 {
            self.stop_sending(true);
            (sent, false)
        } else if self.remote_blocksize != 0
            && self.tx_block_counter >= u32::from(self.remote_blocksize)
        {
            self.tx_state = TxState::WaitFc;
            self.timer_rx_fc.restart(self.params.rx_flowcontrol_timeout);
            // The flow control may already sit in the relay queue.
            (sent, true)
        } else {
            (sent, false)
        }
    }

    fn abort_on_pull_failure(&mut self, error: IsoTpError) -> (bool, bool) {
        self.dispatch_error(&error);
        self.stop_sending(false);
        (false, false)
    }

    fn abort_on_tx_setup_failure(&mut self, error: IsoTpError) -> (bool, bool) {
        self.dispatch_error(&error);
        self.stop_sending(false);
        (false, false)
    }

    fn data_with_prefix(&self) -> Vec<u8> {
        match self.address.tx_payload_prefix() {
            Some(prefix) => vec![prefix],
            None => Vec::new(),
        }
    }

    fn request_tx_flowcontrol(&mut self, status: FlowStatus) {
        self.pending_flow_control = Some(status);
    }

    fn make_flow_control(&self, flow_status: FlowStatus) -> Result<CanMessage> {
        let mut data = self.data_with_prefix();
        data.extend_from_slice(&flow_control_data(
            flow_status,
            self.params.blocksize,
            self.params.stmin,
        ));
        self.make_tx_msg(TargetAddressType::Physical, data)
    }

    fn make_tx_msg(
        &self,
        target_address_type: TargetAddressType,
        data: Vec<u8>,
    ) -> Result<CanMessage> {
        let arbitration_id = self.address.tx_arbitration_id(target_address_type)?;
        let data = self.pad_message_data(data);
        if self.params.tx_data_length == 8 && data.len() > 8 {
            return Err(IsoTpError::Config(format!(
                "cannot fit {} bytes in a classical CAN frame",
                data.len()
            )));
        }
        Ok(CanMessage {
            arbitration_id,
            dlc: dlc_for_payload_len(data.len())?,
            data,
            is_extended_id: self.address.is_tx_29bits(),
            is_fd: self.params.can_fd,
            bitrate_switch: self.params.bitrate_switch,
        })
    }

    /// Length `raw_len` bytes of frame data will occupy after padding.
    fn padded_len(&self, raw_len: usize) -> usize {
        let (must_pad, target) = self.padding_target(raw_len);
        if must_pad {
            raw_len.max(target)
        } else {
            raw_len
        }
    }

    fn padding_target(&self, raw_len: usize) -> (bool, usize) {
        if self.params.tx_data_length == 8 {
            match self.params.tx_data_min_length {
                None => (self.params.tx_padding.is_some(), 8),
                Some(min_length) => (true, min_length),
            }
        } else {
            let fd_size = nearest_can_fd_size(raw_len).unwrap_or(64);
            match self.params.tx_data_min_length {
                None => (true, fd_size),
                Some(min_length) => (true, min_length.max(fd_size)),
            }
        }
    }

    fn pad_message_data(&self, mut data: Vec<u8>) -> Vec<u8> {
        let (must_pad, target) = self.padding_target(data.len());
        if must_pad && data.len() < target {
            let padding_byte = self.params.tx_padding.unwrap_or(0xCC);
            data.resize(target, padding_byte);
        }
        data
    }

    /// Hands a frame to the send callback. Link failures are dispatched,
    /// never propagated; the protocol timers recover from the lost frame.
    fn emit(&mut self, msg: &CanMessage) -> bool {
        debug!(
            target: self.params.logger_name.as_str(),
            "tx <{}> ({:02}) {}",
            format_id(msg),
            msg.data.len(),
            hex(&msg.data)
        );
        match self.sender.send(msg) {
            Ok(()) => {
                self.rate_limiter.inform_bytes_sent(msg.data.len());
                true
            }
            Err(error) => {
                self.dispatch_error(&error);
                false
            }
        }
    }

    fn finish_transmission(&mut self, success: bool) {
        self.tx_buffer = None;
        self.shared
            .tx_active
            .store(self.is_transmitting(), Ordering::Relaxed);
        if let Some(completion) = self.active_completion.take() {
            completion.signal(success);
        }
    }

    pub(crate) fn stop_sending(&mut self, success: bool) {
        self.tx_state = TxState::Idle;
        self.tx_standby = None;
        self.timer_rx_fc.stop();
        self.timer_tx_stmin.stop();
        self.remote_blocksize = 0;
        self.tx_block_counter = 0;
        self.tx_seqnum = 0;
        self.wft_counter = 0;
        self.finish_transmission(success);
    }

    pub(crate) fn stop_receiving(&mut self) {
        self.rx_state = RxState::Idle;
        self.rx_buffer.clear();
        self.actual_rxdl = None;
        self.pending_flow_control = None;
        self.last_flow_control = None;
        self.timer_rx_cf.stop();
    }

    /// Empties queues and resets both machines.
    pub(crate) fn reset(&mut self) {
        for request in self.shared.tx_queue.lock().unwrap().drain(..) {
            if let Some(completion) = request.completion {
                completion.signal(false);
            }
        }
        self.shared.rx_queue.lock().unwrap().clear();
        self.stop_sending(false);
        self.stop_receiving();
        self.rate_limiter.reset();
    }

    /// Time the worker may sleep before the next deadline needs service.
    pub(crate) fn sleep_time(&self) -> Duration {
        let (idle, wait_fc) = *self.shared.sleep_timing.lock().unwrap();
        let mut sleep = match (self.rx_state, self.tx_state) {
            (RxState::Idle, TxState::Idle) if self.tx_standby.is_none() => idle,
            (_, TxState::WaitFc) => wait_fc,
            _ => Duration::from_millis(1),
        };
        for timer in [&self.timer_rx_fc, &self.timer_rx_cf] {
            if !timer.is_stopped() {
                sleep = sleep.min(timer.remaining());
            }
        }
        if self.tx_state == TxState::TransmitCf && !self.timer_tx_stmin.is_stopped() {
            sleep = sleep.min(self.timer_tx_stmin.remaining());
        }
        if self.tx_standby.is_some() {
            if let Some(wait) = self.rate_limiter.time_until_room() {
                sleep = sleep.min(wait);
            }
        }
        sleep
    }

    pub(crate) fn dispatch_error(&self, error: &IsoTpError) {
        warn!(target: self.params.logger_name.as_str(), "{error}");
        if let Some(handler) = &self.error_handler {
            handler(error);
        }
    }
}

fn format_id(msg: &CanMessage) -> String {
    if msg.is_extended_id {
        format!("{:08X}", msg.arbitration_id)
    } else {
        format!("{:03X}", msg.arbitration_id)
    }
}
