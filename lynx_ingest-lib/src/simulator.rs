//! Paced synthetic packet source, for tests and for running without hardware.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info};

use crate::error::{IngestError, IngestResult};
use crate::packet::{self, BOARD_CHANNELS, MAX_BOARDS, MIN_BOARDS};

/// Most packets sent in one pacing step, so a stalled sender does not burst forever.
const MAX_BURST: u64 = 2_000;

#[derive(Clone, Debug)]
pub struct Simulator {
    pub boards: usize,
    pub rate_hz: u32,
    pub target: SocketAddr,
    /// Hardware timestamp (µs) of sequence number 0.
    pub base_timestamp: u64,
    /// Flip one sample bit in every n-th packet.
    pub corrupt_every: Option<u64>,
}

impl Simulator {
    pub fn new(boards: usize, rate_hz: u32, target: SocketAddr) -> Self {
        Self {
            boards,
            rate_hz,
            target,
            base_timestamp: 1_000_000,
            corrupt_every: None,
        }
    }

    /// Raw sample value carried by packet `seq` on `channel`.
    pub fn raw_sample(seq: u64, channel: usize) -> i32 {
        ((seq * 131 + channel as u64 * 4_099) % 2_000_000) as i32 - 1_000_000
    }

    /// Hardware timestamp of packet `seq`.
    pub fn timestamp(&self, seq: u64) -> u64 {
        self.base_timestamp + seq * 1_000_000 / u64::from(self.rate_hz)
    }

    /// Encode packet `seq` into `out`, replacing its contents.
    pub fn packet(&self, seq: u64, samples: &mut Vec<i32>, out: &mut Vec<u8>) {
        samples.clear();
        samples.extend((0..self.boards * BOARD_CHANNELS).map(|c| Self::raw_sample(seq, c)));
        out.clear();
        packet::encode_into(out, self.boards, self.timestamp(seq), seq as u32, samples);

        if let Some(n) = self.corrupt_every {
            if n > 0 && seq % n == n - 1 {
                out[packet::HEADER_WORDS * 4] ^= 0x01;
            }
        }
    }

    /// Reject parameters that cannot produce a stream.
    pub fn validate(&self) -> IngestResult<()> {
        if !(MIN_BOARDS..=MAX_BOARDS).contains(&self.boards) {
            return Err(IngestError::InvalidConfiguration(format!(
                "simulated board count {} outside {MIN_BOARDS}..={MAX_BOARDS}",
                self.boards
            )));
        }
        if self.rate_hz == 0 {
            return Err(IngestError::InvalidConfiguration(
                "simulated sample rate must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Start sending on a background thread until the handle is stopped or dropped.
    pub fn spawn(self) -> IngestResult<SimulatorHandle> {
        self.validate()?;
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(self.target)?;

        let stop = Arc::new(AtomicBool::new(false));
        let sent = Arc::new(AtomicU64::new(0));
        let thread = {
            let stop = stop.clone();
            let sent = sent.clone();
            thread::Builder::new()
                .name("lynx-simulator".into())
                .spawn(move || self.run(socket, &stop, &sent))?
        };

        Ok(SimulatorHandle {
            stop,
            sent,
            thread: Some(thread),
        })
    }

    fn run(&self, socket: UdpSocket, stop: &AtomicBool, sent: &AtomicU64) {
        info!(
            "Simulating {} boards at {} Hz toward {}",
            self.boards, self.rate_hz, self.target
        );
        let mut samples = Vec::with_capacity(self.boards * BOARD_CHANNELS);
        let mut buf = Vec::with_capacity(packet::packet_len(self.boards));
        let start = Instant::now();
        let mut seq = 0u64;

        while !stop.load(Ordering::Relaxed) {
            let elapsed_us = start.elapsed().as_micros() as u64;
            let due = elapsed_us * u64::from(self.rate_hz) / 1_000_000;
            let until = due.min(seq + MAX_BURST);

            while seq < until {
                self.packet(seq, &mut samples, &mut buf);
                if let Err(e) = socket.send(&buf) {
                    // nobody listening yet is fine; anything else ends the run
                    if e.kind() != std::io::ErrorKind::ConnectionRefused {
                        error!("Simulator send failed: {}", e);
                        return;
                    }
                }
                seq += 1;
            }
            sent.store(seq, Ordering::Relaxed);
            thread::sleep(Duration::from_millis(1));
        }
    }
}

pub struct SimulatorHandle {
    stop: Arc<AtomicBool>,
    sent: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatorHandle {
    pub fn packets_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
