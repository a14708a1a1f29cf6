//! The public transport object, its worker thread and the receive relay.
//!
//! Threading model when started: the worker thread exclusively owns the
//! protocol core (and with it the send callback); the relay thread owns the
//! receive callback and forwards frames into an mpsc channel the worker
//! blocks on. User threads only touch the shared queues, so a `send` while
//! the worker is idle-blocked is bounded by two context switches: the wake
//! sentinel lands in the channel, the worker picks the request up.
//!
//! When not started, the layer degrades to the polling mode: the caller
//! invokes [`TransportLayer::process`] periodically and the receive
//! callback is polled inline.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::address::{TargetAddressType, TransportAddress};
use crate::error::{IsoTpError, Result};
use crate::link::{FrameReceiver, FrameSender};
use crate::params::Params;
use crate::transport::core::{
    ErrorHandler, ProcessStats, RelayEvent, SendCompletion, Shared, TransportCore, TxRequest,
    TX_QUEUE_CAPACITY,
};
use crate::transport::payload::{PayloadSource, TxPayload};
use crate::types::CanId;

/// How long the relay blocks in the receive callback per call. Bounds the
/// join latency of `stop`.
const RELAY_RX_TIMEOUT: Duration = Duration::from_millis(100);

/// Back-off after a receive-side link error so a dead link does not spin.
const RELAY_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// The ISO-TP transport layer.
///
/// Segments outgoing payloads into CAN frames and reassembles incoming
/// ones, coordinating with the peer through the flow-control handshake.
pub struct TransportLayer<R: FrameReceiver + 'static, S: FrameSender + 'static> {
    shared: Arc<Shared>,
    address: TransportAddress,
    core: Option<TransportCore<S>>,
    receiver: Option<R>,
    worker_handle: Option<JoinHandle<TransportCore<S>>>,
    relay_handle: Option<JoinHandle<R>>,
    started: bool,
}

impl<R: FrameReceiver + 'static, S: FrameSender + 'static> TransportLayer<R, S> {
    /// Builds a transport layer over the given link callbacks.
    ///
    /// `error_handler` receives every protocol or timing error detected
    /// while the stack runs; it is invoked from the worker thread (or from
    /// `process` in polling mode).
    pub fn new(
        receiver: R,
        sender: S,
        address: impl Into<TransportAddress>,
        error_handler: Option<ErrorHandler>,
        params: Params,
    ) -> Result<Self> {
        params.validate()?;
        let address = address.into();
        warn_on_reserved_ids(&address, &params.logger_name);
        let shared = Arc::new(Shared::new(params));
        let core = TransportCore::new(sender, address.clone(), error_handler, Arc::clone(&shared));
        Ok(Self {
            shared,
            address,
            core: Some(core),
            receiver: Some(receiver),
            worker_handle: None,
            relay_handle: None,
            started: false,
        })
    }

    /// Enqueues a payload using the default target address type. Blocks
    /// until completion when the `blocking_send` parameter is set.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        let target = self.shared.params.lock().unwrap().default_target_address_type;
        self.send_with(data, target, None)
    }

    /// Enqueues a payload for the given target address type. `timeout`
    /// bounds the wait when `blocking_send` is set; it is ignored otherwise.
    pub fn send_with(
        &self,
        data: impl Into<Vec<u8>>,
        target_address_type: TargetAddressType,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.enqueue(TxPayload::Owned(data.into()), target_address_type, timeout)
    }

    /// Enqueues a lazily produced payload of `length` bytes. The source is
    /// pulled from the worker thread as frames are emitted.
    pub fn send_source(
        &self,
        source: Box<dyn PayloadSource>,
        length: usize,
        target_address_type: TargetAddressType,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.enqueue(
            TxPayload::Streamed { source, length },
            target_address_type,
            timeout,
        )
    }

    fn enqueue(
        &self,
        payload: TxPayload,
        target_address_type: TargetAddressType,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let params = self.shared.params.lock().unwrap().clone();

        // A partial (receive-only) address cannot transmit; surface that
        // here rather than inside the worker.
        self.address.tx_arbitration_id(target_address_type)?;

        if target_address_type == TargetAddressType::Functional {
            let length_bytes = if params.tx_data_length == 8 { 1 } else { 2 };
            let maxlen = params.tx_data_length - length_bytes - self.address.tx_prefix_size();
            if payload.total_length() > maxlen {
                return Err(IsoTpError::Config(
                    "cannot send a multi-frame payload with a functional target address".into(),
                ));
            }
        }

        // Beyond 4095 bytes the first frame must use the 32-bit escape
        // encoding, which only exists on frames wider than 8 bytes.
        if payload.total_length() > 0xFFF && params.tx_data_length <= 8 {
            return Err(IsoTpError::Config(format!(
                "a payload of {} bytes requires the first frame escape encoding, \
                 which needs a tx_data_length greater than 8",
                payload.total_length()
            )));
        }

        let completion = if params.blocking_send {
            if !self.started {
                return Err(IsoTpError::Config(
                    "blocking send requires a started transport layer".into(),
                ));
            }
            Some(Arc::new(SendCompletion::default()))
        } else {
            None
        };

        {
            let mut tx_queue = self.shared.tx_queue.lock().unwrap();
            if tx_queue.len() >= TX_QUEUE_CAPACITY {
                return Err(IsoTpError::TxQueueFull);
            }
            tx_queue.push_back(TxRequest {
                payload,
                target_address_type,
                completion: completion.clone(),
            });
        }
        self.shared.wake_worker();

        if let Some(completion) = completion {
            completion.wait(timeout).map_err(|error| {
                if matches!(error, IsoTpError::BlockingSendTimeout) {
                    // Abort the transmission we gave up on.
                    self.shared.cancel_sending.store(true, Ordering::Relaxed);
                    self.shared.wake_worker();
                }
                error
            })?;
        }
        Ok(())
    }

    /// Dequeues the next reassembled payload, if any.
    pub fn recv(&self) -> Option<Vec<u8>> {
        self.shared.rx_queue.lock().unwrap().pop_front()
    }

    /// Dequeues the next reassembled payload, waiting up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut rx_queue = self.shared.rx_queue.lock().unwrap();
        loop {
            if let Some(payload) = rx_queue.pop_front() {
                return Some(payload);
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) = self
                .shared
                .rx_available
                .wait_timeout(rx_queue, remaining)
                .unwrap();
            rx_queue = guard;
            if result.timed_out() && rx_queue.is_empty() {
                return None;
            }
        }
    }

    /// True when a reassembled payload awaits in the reception queue.
    pub fn available(&self) -> bool {
        !self.shared.rx_queue.lock().unwrap().is_empty()
    }

    /// True while a payload is queued or being put on the wire.
    pub fn transmitting(&self) -> bool {
        !self.shared.tx_queue.lock().unwrap().is_empty()
            || self.shared.tx_active.load(Ordering::Relaxed)
    }

    /// Replaces the address. Only allowed before `start`.
    pub fn set_address(&mut self, address: impl Into<TransportAddress>) -> Result<()> {
        if self.started {
            return Err(IsoTpError::Config(
                "address cannot change while the transport layer is started".into(),
            ));
        }
        let address = address.into();
        let logger_name = self.shared.params.lock().unwrap().logger_name.clone();
        warn_on_reserved_ids(&address, &logger_name);
        if let Some(core) = &mut self.core {
            core.set_address(address.clone());
        }
        self.address = address;
        Ok(())
    }

    /// Replaces the parameters. Takes effect on the next worker tick.
    pub fn set_params(&self, params: Params) -> Result<()> {
        params.validate()?;
        *self.shared.params.lock().unwrap() = params;
        self.shared.wake_worker();
        Ok(())
    }

    pub fn params(&self) -> Params {
        self.shared.params.lock().unwrap().clone()
    }

    /// Tunes the worker sleep while fully idle and while waiting for a
    /// flow control.
    pub fn set_sleep_timing(&self, idle: Duration, wait_fc: Duration) {
        *self.shared.sleep_timing.lock().unwrap() = (idle, wait_fc);
    }

    /// Aborts any transmission in progress and empties the transmit queue
    /// of the payload being sent.
    pub fn stop_sending(&mut self) {
        if self.started {
            self.shared.cancel_sending.store(true, Ordering::Relaxed);
            self.shared.wake_worker();
        } else if let Some(core) = &mut self.core {
            core.stop_sending(false);
        }
    }

    /// Discards any partially reassembled payload.
    pub fn stop_receiving(&mut self) {
        if self.started {
            self.shared.cancel_receiving.store(true, Ordering::Relaxed);
            self.shared.wake_worker();
        } else if let Some(core) = &mut self.core {
            core.stop_receiving();
        }
    }

    /// Empties every queue and resets both state machines. Only allowed
    /// while the worker is not running.
    pub fn reset(&mut self) -> Result<()> {
        if self.started {
            return Err(IsoTpError::Config(
                "reset is not allowed while the transport layer is started".into(),
            ));
        }
        if let Some(core) = &mut self.core {
            core.reset();
        }
        Ok(())
    }

    /// Discards reassembled payloads not yet consumed.
    pub fn clear_rx_queue(&self) {
        self.shared.rx_queue.lock().unwrap().clear();
    }

    /// Discards queued payloads not yet transmitted.
    pub fn clear_tx_queue(&self) {
        for request in self.shared.tx_queue.lock().unwrap().drain(..) {
            if let Some(completion) = request.completion {
                completion.signal(false);
            }
        }
    }

    /// Single-threaded mode: runs one processing pass, polling the receive
    /// callback inline. Must not be called while the worker is started.
    pub fn process(&mut self, rx_timeout: Duration) -> Result<ProcessStats> {
        if self.started {
            return Err(IsoTpError::Config(
                "process cannot be called while the worker thread runs".into(),
            ));
        }
        let core = self.core.as_mut().expect("core present while stopped");
        let receiver = self.receiver.as_mut().expect("receiver present while stopped");

        if self.shared.cancel_sending.swap(false, Ordering::Relaxed) {
            core.stop_sending(false);
        }
        if self.shared.cancel_receiving.swap(false, Ordering::Relaxed) {
            core.stop_receiving();
        }
        core.refresh_params();

        let rx_errors = Mutex::new(Vec::new());
        let stats = core.process(&mut || match receiver.receive(rx_timeout) {
            Ok(msg) => msg,
            Err(error) => {
                rx_errors.lock().unwrap().push(error);
                None
            }
        });
        for error in rx_errors.into_inner().unwrap() {
            core.dispatch_error(&error);
        }
        self.shared
            .tx_active
            .store(core.is_transmitting(), Ordering::Relaxed);
        Ok(stats)
    }

    /// Starts the worker and relay threads.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(IsoTpError::Config(
                "transport layer is already started".into(),
            ));
        }
        let logger_name = self.shared.params.lock().unwrap().logger_name.clone();
        debug!(target: &logger_name, "starting transport layer");

        let (event_tx, event_rx) = mpsc::channel::<RelayEvent>();
        self.shared.stop_requested.store(false, Ordering::Relaxed);
        *self.shared.wake.lock().unwrap() = Some(event_tx.clone());

        let mut receiver = self.receiver.take().expect("receiver present while stopped");
        let relay_shared = Arc::clone(&self.shared);
        let relay_handle = thread::Builder::new()
            .name("cantp-relay".into())
            .spawn(move || {
                while !relay_shared.stop_requested.load(Ordering::Relaxed) {
                    match receiver.receive(RELAY_RX_TIMEOUT) {
                        Ok(Some(msg)) => {
                            if event_tx.send(RelayEvent::Frame(msg)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(error) => {
                            if event_tx.send(RelayEvent::Error(error)).is_err() {
                                break;
                            }
                            thread::sleep(RELAY_ERROR_BACKOFF);
                        }
                    }
                }
                receiver
            })
            .map_err(|e| IsoTpError::Config(format!("failed to spawn relay thread: {e}")))?;

        let mut core = self.core.take().expect("core present while stopped");
        let worker_shared = Arc::clone(&self.shared);
        let worker_handle = thread::Builder::new()
            .name("cantp-worker".into())
            .spawn(move || {
                let mut backlog: VecDeque<_> = VecDeque::new();
                loop {
                    if worker_shared.stop_requested.load(Ordering::Relaxed) {
                        break;
                    }
                    if worker_shared.cancel_sending.swap(false, Ordering::Relaxed) {
                        core.stop_sending(false);
                    }
                    if worker_shared.cancel_receiving.swap(false, Ordering::Relaxed) {
                        core.stop_receiving();
                    }
                    core.refresh_params();
                    loop {
                        match event_rx.try_recv() {
                            Ok(RelayEvent::Frame(msg)) => backlog.push_back(msg),
                            Ok(RelayEvent::Wake) => {}
                            Ok(RelayEvent::Error(error)) => core.dispatch_error(&error),
                            Err(_) => break,
                        }
                    }
                    core.process(&mut || backlog.pop_front());
                    worker_shared
                        .tx_active
                        .store(core.is_transmitting(), Ordering::Relaxed);
                    match event_rx.recv_timeout(core.sleep_time()) {
                        Ok(RelayEvent::Frame(msg)) => backlog.push_back(msg),
                        Ok(RelayEvent::Wake) => {}
                        Ok(RelayEvent::Error(error)) => core.dispatch_error(&error),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                core.reset();
                core
            })
            .map_err(|e| IsoTpError::Config(format!("failed to spawn worker thread: {e}")))?;

        self.relay_handle = Some(relay_handle);
        self.worker_handle = Some(worker_handle);
        self.started = true;
        Ok(())
    }

    /// Stops both threads, drains the machines and reclaims the link
    /// callbacks so the layer can be restarted.
    pub fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        let logger_name = self.shared.params.lock().unwrap().logger_name.clone();
        debug!(target: &logger_name, "stopping transport layer");

        self.shared.stop_requested.store(true, Ordering::Relaxed);
        self.shared.wake_worker();

        if let Some(handle) = self.worker_handle.take() {
            match handle.join() {
                Ok(core) => self.core = Some(core),
                Err(_) => {
                    warn!(target: &logger_name, "worker thread panicked");
                    return Err(IsoTpError::Config("worker thread panicked".into()));
                }
            }
        }
        *self.shared.wake.lock().unwrap() = None;
        if let Some(handle) = self.relay_handle.take() {
            match handle.join() {
                Ok(receiver) => self.receiver = Some(receiver),
                Err(_) => {
                    warn!(target: &logger_name, "relay thread panicked");
                    return Err(IsoTpError::Config("relay thread panicked".into()));
                }
            }
        }
        self.shared.stop_requested.store(false, Ordering::Relaxed);
        self.shared.tx_active.store(false, Ordering::Relaxed);
        self.started = false;
        Ok(())
    }
}

impl<R: FrameReceiver + 'static, S: FrameSender + 'static> Drop for TransportLayer<R, S> {
    fn drop(&mut self) {
        if self.started {
            self.shared.stop_requested.store(true, Ordering::Relaxed);
            self.shared.wake_worker();
            if let Some(handle) = self.worker_handle.take() {
                let _ = handle.join();
            }
            *self.shared.wake.lock().unwrap() = None;
            if let Some(handle) = self.relay_handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn warn_on_reserved_ids(address: &TransportAddress, logger_name: &str) {
    let reserved = |id: CanId| (0x7F4..=0x7F6).contains(&id) || (0x7FA..=0x7FB).contains(&id);
    if address.txid().is_some_and(reserved) {
        warn!(
            target: logger_name,
            "txid overlaps the range of IDs reserved by ISO-15765 \
             (0x7F4-0x7F6 and 0x7FA-0x7FB)"
        );
    }
    if address.rxid().is_some_and(reserved) {
        warn!(
            target: logger_name,
            "rxid overlaps the range of IDs reserved by ISO-15765 \
             (0x7F4-0x7F6 and 0x7FA-0x7FB)"
        );
    }
}
