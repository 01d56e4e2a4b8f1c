use std::any::Any;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AcquisitionConfig;
use crate::context::Context;
use crate::decoder::{BlockDecoder, BlockSink, DecodeCounters};
use crate::discovery::{StreamDiscovery, StreamParams};
use crate::error::{IngestError, IngestResult};
use crate::message::{AcquisitionEvent, AcquisitionState};
use crate::packet::BOARD_CHANNELS;
use crate::session::Session;

/// How long `stop_acquisition` waits for the receive loop before giving up on it.
pub const STOP_TIMEOUT: Duration = Duration::from_millis(500);

type SharedSink = Arc<Mutex<Box<dyn BlockSink>>>;

/// Counters for the current process lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AcquisitionStats {
    pub blocks: u64,
    pub samples: u64,
    pub invalid_packets: u64,
    pub failed_batches: u64,
    pub faults: u64,
}

/// Everything an operator panel shows.
#[derive(Clone, Debug, Serialize)]
pub struct AcquisitionStatus {
    pub state: AcquisitionState,
    pub receiving: bool,
    pub candidates: Vec<IpAddr>,
    pub selected: Option<IpAddr>,
    pub bound: Option<SocketAddr>,
    pub port: u16,
    pub boards: usize,
    pub channels: usize,
    pub sample_rate_hz: u32,
    pub refresh_requested: bool,
    pub stats: AcquisitionStats,
}

/// What the receive loop hands back when it ends.
struct WorkerExit {
    decoder: BlockDecoder,
    session: Option<Session>,
    fault: Option<String>,
}

struct Worker {
    stop: Arc<AtomicBool>,
    done: Receiver<WorkerExit>,
    thread: JoinHandle<()>,
    /// Where the loop's socket is bound, for rebinding if the loop dies with it.
    local: SocketAddr,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Sequences discovery, start, the background receive loop and stop.
///
/// Owned by a single control context. The socket session moves into the receive
/// loop for the duration of a run and comes back when it ends.
pub struct Acquisition {
    config: AcquisitionConfig,
    params: StreamParams,
    state: AcquisitionState,
    receiving: bool,
    refresh_requested: bool,
    session: Option<Session>,
    discovery: StreamDiscovery,
    decoder: Option<BlockDecoder>,
    counters: Arc<DecodeCounters>,
    faults: u64,
    sink: SharedSink,
    events: Context,
    worker: Option<Worker>,
}

impl Acquisition {
    pub fn new(config: AcquisitionConfig, sink: Box<dyn BlockSink>, events: Context) -> Self {
        let counters = Arc::new(DecodeCounters::default());
        Self {
            config,
            params: StreamParams::default(),
            state: AcquisitionState::Idle,
            receiving: false,
            refresh_requested: false,
            session: None,
            discovery: StreamDiscovery::new(),
            decoder: Some(BlockDecoder::new(counters.clone())),
            counters,
            faults: 0,
            sink: Arc::new(Mutex::new(sink)),
            events,
            worker: None,
        }
    }

    /// Events and decoded blocks both go out on `ctx`.
    pub fn with_context(config: AcquisitionConfig, ctx: Context) -> Self {
        Self::new(config, Box::new(ctx.clone()), ctx)
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    pub fn params(&self) -> StreamParams {
        self.params
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn refresh_requested(&self) -> bool {
        self.refresh_requested
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.session.as_ref().map(Session::local_addr)
    }

    pub fn stats(&self) -> AcquisitionStats {
        AcquisitionStats {
            blocks: self.counters.blocks.load(Ordering::Relaxed),
            samples: self.counters.samples.load(Ordering::Relaxed),
            invalid_packets: self.counters.invalid_packets.load(Ordering::Relaxed),
            failed_batches: self.counters.failed_batches.load(Ordering::Relaxed),
            faults: self.faults,
        }
    }

    pub fn status(&self) -> AcquisitionStatus {
        AcquisitionStatus {
            state: self.state,
            receiving: self.receiving,
            candidates: self.config.candidates.clone(),
            selected: self.config.selected,
            bound: self.bound_addr(),
            port: self.config.port,
            boards: self.params.boards(),
            channels: self.params.channels(),
            sample_rate_hz: self.params.sample_rate_hz(),
            refresh_requested: self.refresh_requested,
            stats: self.stats(),
        }
    }

    fn set_state(&mut self, state: AcquisitionState) {
        if self.state != state {
            debug!("Acquisition {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.publish(AcquisitionEvent::StateChanged(state));
        }
    }

    fn set_receiving(&mut self, receiving: bool) {
        if self.receiving != receiving {
            self.receiving = receiving;
            self.events.publish(AcquisitionEvent::ReceivingChanged(receiving));
        }
    }

    fn acquiring(&self) -> bool {
        self.state == AcquisitionState::Acquiring
    }

    fn reject_while_acquiring(&self, what: &str) -> IngestResult<()> {
        if self.acquiring() {
            return Err(IngestError::IllegalStateTransition(format!("{what} while acquiring")));
        }
        Ok(())
    }

    /// Apply operator-entered port text. The new port takes effect on the next discovery.
    pub fn set_port_text(&mut self, text: &str) -> IngestResult<u16> {
        self.reject_while_acquiring("port change")?;
        self.config.set_port_text(text)
    }

    pub fn select_address(&mut self, ip: IpAddr) -> IngestResult<()> {
        self.reject_while_acquiring("address change")?;
        self.config.select(ip)
    }

    /// Ask the next discovery to re-measure boards and rate. Ignored mid-run.
    pub fn request_refresh(&mut self) -> bool {
        self.poll();
        if self.acquiring() {
            debug!("Refresh ignored while acquiring");
            return false;
        }
        if !self.refresh_requested {
            self.refresh_requested = true;
            self.events.publish(AcquisitionEvent::RefreshRequested(true));
        }
        true
    }

    /// Reap a receive loop that ended on its own. Returns the current state.
    pub fn poll(&mut self) -> AcquisitionState {
        let exit = match &self.worker {
            Some(worker) => match worker.done.try_recv() {
                Ok(exit) => Some(Ok(exit)),
                Err(TryRecvError::Disconnected) => Some(Err(())),
                Err(TryRecvError::Empty) => None,
            },
            None => None,
        };
        let Some(exit) = exit else {
            return self.state;
        };
        if let Some(worker) = self.worker.take() {
            match exit {
                Ok(exit) => {
                    Self::join(worker.thread);
                    self.absorb(exit);
                }
                Err(()) => self.reap_dead(worker),
            }
        }
        self.set_state(AcquisitionState::Idle);
        self.state
    }

    fn join(thread: JoinHandle<()>) {
        if let Err(payload) = thread.join() {
            error!("Receive loop panicked: {}", panic_message(&*payload));
        }
    }

    /// The loop ended without handing anything back, so its session and decoder are
    /// gone with it. Rebuild the socket here and report the run as faulted.
    fn reap_dead(&mut self, worker: Worker) {
        let reason = match worker.thread.join() {
            Ok(()) => "receive loop exited without handing back its session".to_string(),
            Err(payload) => format!("receive loop panicked: {}", panic_message(&*payload)),
        };
        error!("{}", reason);

        self.session = match Session::bind_with_buffer(
            worker.local.ip(),
            worker.local.port(),
            self.config.recv_buffer,
        ) {
            Ok(session) => Some(session),
            Err(e) => {
                error!("Rebind after receive loop died failed: {}", e);
                None
            }
        };
        self.sink.lock().clear();
        self.events.publish(AcquisitionEvent::Faulted(reason.clone()));
        self.absorb_fault(reason);
    }

    fn absorb(&mut self, exit: WorkerExit) {
        self.decoder = Some(exit.decoder);
        self.session = exit.session;
        if let Some(fault) = exit.fault {
            self.absorb_fault(fault);
        }
    }

    fn absorb_fault(&mut self, fault: String) {
        warn!("Acquisition ended by receive loop: {}", fault);
        self.faults += 1;
        self.set_receiving(false);
    }

    /// Check whether the stream is arriving, (re)binding and re-measuring as needed.
    ///
    /// Mid-run this only reports the current receiving flag.
    pub fn found_input_source(&mut self) -> bool {
        self.poll();
        if self.acquiring() {
            return self.receiving;
        }

        self.set_state(AcquisitionState::Discovering);
        let valid = match self.discover() {
            Ok(valid) => valid,
            Err(e) => {
                debug!("Input source check failed: {}", e);
                false
            }
        };

        self.set_receiving(valid);
        self.set_state(if valid {
            AcquisitionState::Ready
        } else {
            AcquisitionState::Idle
        });
        valid
    }

    fn discover(&mut self) -> IngestResult<bool> {
        let ip = self.config.resolve_address().ok_or(IngestError::NoAddress)?;
        let port = self.config.port;

        let bound = self.session.as_ref().is_some_and(|s| s.is_bound_to(ip, port));
        if !bound {
            // release the old port before binding again
            self.session = None;
            self.session = Some(Session::bind_with_buffer(ip, port, self.config.recv_buffer)?);
        }
        let Some(session) = self.session.as_ref() else {
            return Err(IngestError::NoAddress);
        };

        let refresh = std::mem::take(&mut self.refresh_requested);
        if refresh {
            self.events.publish(AcquisitionEvent::RefreshRequested(false));
        }

        let probe = self.discovery.probe(session)?;
        if !probe.valid {
            return Ok(false);
        }
        if self.receiving && !refresh {
            return Ok(true);
        }

        match self.params.set_boards(probe.boards, self.state == AcquisitionState::Acquiring) {
            Ok(true) => {
                info!("Detected {} boards ({} channels)", probe.boards, self.params.channels());
                self.events.publish(AcquisitionEvent::BoardCountChanged(probe.boards));
                self.resize_buffers();
            }
            Ok(false) => {}
            Err(e) => {
                error!("{}", e);
                return Err(e);
            }
        }

        match self.discovery.measure_rate(session, probe.boards) {
            Ok(Some(hz)) => {
                if self.params.set_sample_rate(hz, false)? {
                    self.events.publish(AcquisitionEvent::SampleRateChanged(hz));
                    self.resize_buffers();
                }
            }
            Ok(None) => {}
            Err(e) => {
                // not receiving yet, so the next check measures again
                warn!("Rate measurement discarded: {}", e);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Start the background receive loop. Only valid once discovery has found the stream.
    pub fn start_acquisition(&mut self) -> IngestResult<()> {
        self.poll();
        if self.state != AcquisitionState::Ready {
            return Err(IngestError::IllegalStateTransition(format!(
                "start requested in state {:?}",
                self.state
            )));
        }
        let session = self.session.take().ok_or(IngestError::NoAddress)?;
        let local = session.local_addr();

        let mut decoder = self
            .decoder
            .take()
            .unwrap_or_else(|| BlockDecoder::new(self.counters.clone()));
        if self.refresh_requested {
            self.refresh_requested = false;
            self.events.publish(AcquisitionEvent::RefreshRequested(false));
        }
        decoder.start_run(self.params.sample_rate_hz());

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = channel::bounded(1);
        let job = ReceiveLoop {
            decoder,
            session,
            boards: self.params.boards(),
            sink: self.sink.clone(),
            stop: stop.clone(),
            events: self.events.clone(),
            max_failed_batches: self.config.max_failed_batches,
            recv_buffer: self.config.recv_buffer,
        };

        let thread = thread::Builder::new()
            .name("lynx-receive".into())
            .spawn(move || job.run(done_tx))?;

        info!(
            "Acquisition started: {} channels at {} Hz",
            self.params.channels(),
            self.params.sample_rate_hz()
        );
        self.worker = Some(Worker {
            stop,
            done,
            thread,
            local,
        });
        self.set_state(AcquisitionState::Acquiring);
        Ok(())
    }

    /// Ask the receive loop to end and wait up to `STOP_TIMEOUT`. `false` if it did not.
    pub fn stop_acquisition(&mut self) -> bool {
        let mut ok = true;

        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            match worker.done.recv_timeout(STOP_TIMEOUT) {
                Ok(exit) => {
                    Self::join(worker.thread);
                    self.absorb(exit);
                }
                Err(RecvTimeoutError::Timeout) => {
                    // the loop keeps the old socket; the next discovery binds a new one
                    error!("Receive loop did not stop within {:?}", STOP_TIMEOUT);
                    ok = false;
                }
                Err(RecvTimeoutError::Disconnected) => self.reap_dead(worker),
            }
            info!("Acquisition stopped");
        }

        self.sink.lock().clear();
        self.set_state(AcquisitionState::Idle);
        ok
    }

    /// Let the sink re-size for the current channel count.
    pub fn resize_buffers(&self) {
        self.sink.lock().resize(self.params.channels());
    }

    pub fn num_data_outputs(&self) -> usize {
        self.params.channels()
    }

    pub fn num_ttl_outputs(&self) -> usize {
        32
    }

    pub fn sample_rate(&self) -> f32 {
        self.params.sample_rate_hz() as f32
    }

    /// Output is already scaled to µV.
    pub fn bit_volts(&self) -> f32 {
        1.0
    }

    pub fn channel_units(&self) -> &'static str {
        "uV"
    }

    pub fn channel_names(&self) -> Vec<String> {
        (1..=self.params.boards() * BOARD_CHANNELS)
            .map(|c| format!("CH{c}"))
            .collect()
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop_acquisition();
        }
    }
}

/// State moved onto the receive thread for one run.
struct ReceiveLoop {
    decoder: BlockDecoder,
    session: Session,
    boards: usize,
    sink: SharedSink,
    stop: Arc<AtomicBool>,
    events: Context,
    max_failed_batches: u32,
    recv_buffer: usize,
}

impl ReceiveLoop {
    fn run(mut self, done: Sender<WorkerExit>) {
        let mut failed = 0u32;

        let fault = loop {
            if self.stop.load(Ordering::Acquire) {
                break None;
            }

            match self.decoder.receive(&self.session, self.boards) {
                Ok(()) => {
                    failed = 0;
                    let mut sink = self.sink.lock();
                    self.decoder.deliver(self.boards, &mut **sink);
                }
                Err(e) if e.is_transient() => {
                    failed += 1;
                    if failed > self.max_failed_batches {
                        break Some(format!("{failed} consecutive batches failed, last: {e}"));
                    }
                }
                Err(e) => break Some(e.to_string()),
            }
        };

        let ReceiveLoop {
            decoder,
            session,
            sink,
            events,
            recv_buffer,
            ..
        } = self;

        let exit = match fault {
            None => WorkerExit {
                decoder,
                session: Some(session),
                fault: None,
            },
            Some(fault) => {
                error!("Receive loop fault: {}", fault);
                let local = session.local_addr();
                drop(session);
                // we are the loop, so rebuild the socket here rather than wait on ourselves
                let session = match Session::bind_with_buffer(local.ip(), local.port(), recv_buffer) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        error!("Rebind after fault failed: {}", e);
                        None
                    }
                };
                sink.lock().clear();
                events.publish(AcquisitionEvent::Faulted(fault.clone()));
                WorkerExit {
                    decoder,
                    session,
                    fault: Some(fault),
                }
            }
        };

        let _ = done.send(exit);
    }
}
