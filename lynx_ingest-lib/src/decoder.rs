use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{trace, warn};

use crate::error::IngestResult;
use crate::packet::{self, MAX_CHANNELS, MAX_PACKET_LEN, PacketView};
use crate::session::Session;

/// Packets received and decoded per cycle.
pub const BLOCK_SIZE: usize = 20;

/// Full-scale input of the amplifier in µV; raw samples carry 24 significant bits.
pub const MAX_INPUT_UV: f32 = 131_072.0;
pub const RAW_BIT_VOLTS: f32 = MAX_INPUT_UV / (1u32 << 23) as f32;

const US_PER_SECOND: i128 = 1_000_000;

/// Destination for decoded blocks.
///
/// `samples` is sample-major: `count` rows of `samples.len() / count` channels.
pub trait BlockSink: Send {
    fn add_block(&mut self, samples: &[f32], timestamps: &[i64], ttl_words: &[u32], count: usize);

    /// The channel count changed; drop anything sized for the old one.
    fn resize(&mut self, _channels: usize) {}

    /// Acquisition stopped; discard buffered output.
    fn clear(&mut self) {}
}

/// Per-run timestamp origin and rate.
#[derive(Clone, Copy, Debug)]
pub struct RunState {
    first_sample: bool,
    origin: u64,
    sample_rate_hz: u32,
}

impl RunState {
    pub fn new(sample_rate_hz: u32) -> Self {
        Self {
            first_sample: true,
            origin: 0,
            sample_rate_hz,
        }
    }

    pub fn is_first_sample(&self) -> bool {
        self.first_sample
    }

    pub fn us_per_sample(&self) -> f64 {
        1_000_000.0 / f64::from(self.sample_rate_hz)
    }

    /// Sample index of a raw hardware timestamp (µs), relative to the run's first sample.
    ///
    /// Rounded half-up in exact integer arithmetic: `round(delta / us_per_sample)`.
    pub fn sample_index(&mut self, raw: u64) -> i64 {
        if self.first_sample {
            self.first_sample = false;
            self.origin = raw;
            return 0;
        }
        let delta = i128::from(raw.wrapping_sub(self.origin) as i64);
        let twice = 2 * delta * i128::from(self.sample_rate_hz) + US_PER_SECOND;
        twice.div_euclid(2 * US_PER_SECOND) as i64
    }
}

/// Counters shared with whoever reports on the run.
#[derive(Debug, Default)]
pub struct DecodeCounters {
    pub blocks: AtomicU64,
    pub samples: AtomicU64,
    pub invalid_packets: AtomicU64,
    pub failed_batches: AtomicU64,
}

/// Receives fixed-size batches and turns them into timestamped µV blocks.
///
/// All buffers are sized for the largest board count once and reused every cycle.
pub struct BlockDecoder {
    recv: Vec<u8>,
    samples: Vec<f32>,
    timestamps: Vec<i64>,
    ttl_words: Vec<u32>,
    run: RunState,
    needs_flush: bool,
    counters: Arc<DecodeCounters>,
}

impl BlockDecoder {
    pub fn new(counters: Arc<DecodeCounters>) -> Self {
        Self {
            recv: vec![0u8; BLOCK_SIZE * MAX_PACKET_LEN],
            samples: vec![0.0; BLOCK_SIZE * MAX_CHANNELS],
            timestamps: vec![0; BLOCK_SIZE],
            ttl_words: vec![0; BLOCK_SIZE],
            run: RunState::new(crate::discovery::DEFAULT_RATE_HZ),
            needs_flush: true,
            counters,
        }
    }

    /// Reset the timestamp origin for a new run at `sample_rate_hz`.
    pub fn start_run(&mut self, sample_rate_hz: u32) {
        self.run = RunState::new(sample_rate_hz);
        self.needs_flush = true;
    }

    pub fn run_state(&self) -> &RunState {
        &self.run
    }

    pub fn counters(&self) -> &Arc<DecodeCounters> {
        &self.counters
    }

    /// Receive and deliver one block. `false` only when the batch itself could not be read.
    pub fn update_buffer(&mut self, session: &Session, boards: usize, sink: &mut dyn BlockSink) -> bool {
        self.next_block(session, boards, sink).is_ok()
    }

    /// Receive one batch and decode it into `sink`, returning the number of samples
    /// delivered. The error is the batch receive failure.
    pub fn next_block(
        &mut self,
        session: &Session,
        boards: usize,
        sink: &mut dyn BlockSink,
    ) -> IngestResult<usize> {
        self.receive(session, boards)?;
        Ok(self.deliver(boards, sink))
    }

    /// Fill the receive buffer with one batch, flushing first at the start of a run.
    pub fn receive(&mut self, session: &Session, boards: usize) -> IngestResult<()> {
        if self.needs_flush {
            session.flush()?;
            self.needs_flush = false;
        }

        if let Err(e) = session.receive_batch(&mut self.recv, boards, BLOCK_SIZE) {
            self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
            trace!("Batch receive failed: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// Decode the batch in the receive buffer and hand the valid samples to `sink`.
    pub fn deliver(&mut self, boards: usize, sink: &mut dyn BlockSink) -> usize {
        let channels = boards * packet::BOARD_CHANNELS;
        let len = packet::packet_len(boards);
        let mut out = 0;

        for raw in self.recv.chunks_exact(len).take(BLOCK_SIZE) {
            if !packet::is_valid(raw, boards) {
                // a flipped bit costs one sample, not the run
                self.counters.invalid_packets.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let view = PacketView::new(raw, boards);
            self.timestamps[out] = self.run.sample_index(view.timestamp());
            self.ttl_words[out] = view.ttl();

            let row = &mut self.samples[out * channels..(out + 1) * channels];
            for (dst, s) in row.iter_mut().zip(view.samples()) {
                *dst = s as f32 * RAW_BIT_VOLTS;
            }
            out += 1;
        }

        if out < BLOCK_SIZE {
            warn!("Skipped {} invalid packets in block", BLOCK_SIZE - out);
        }

        sink.add_block(
            &self.samples[..out * channels],
            &self.timestamps[..out],
            &self.ttl_words[..out],
            out,
        );
        self.counters.blocks.fetch_add(1, Ordering::Relaxed);
        self.counters.samples.fetch_add(out as u64, Ordering::Relaxed);
        out
    }

    /// Decode `raw` (`BLOCK_SIZE` packets back to back) as if it had just been received.
    pub fn decode_batch(&mut self, raw: &[u8], boards: usize, sink: &mut dyn BlockSink) -> usize {
        let n = raw.len().min(self.recv.len());
        self.recv[..n].copy_from_slice(&raw[..n]);
        self.deliver(boards, sink)
    }
}
