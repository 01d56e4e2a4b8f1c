use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, IngestResult};
use crate::packet::{self, MAX_BOARDS, MAX_PACKET_LEN, MIN_BOARDS, PacketView};
use crate::session::{RECV_TIMEOUT, Session};

/// Span of hardware time sampled when inferring the rate (µs of packet timestamps).
pub const RATE_WINDOW_US: u32 = 100_000;

/// Packet counts within the window that identify the 32,768 Hz hardware mode.
pub const SPECIAL_RATE_COUNTS: std::ops::RangeInclusive<u32> = 3239..=3338;
pub const SPECIAL_RATE_HZ: u32 = 32_768;

pub const MIN_RATE_HZ: u32 = 16_000;
pub const MAX_RATE_HZ: u32 = 40_000;
pub const DEFAULT_RATE_HZ: u32 = 30_000;

/// Stops the window if timestamps never advance: ten times what 40 kHz produces in 100 ms.
const MAX_WINDOW_PACKETS: u32 = MAX_RATE_HZ;

/// Board count and sample rate of the incoming stream.
///
/// Written only by discovery while no run is active, read by the decoder for the
/// duration of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    boards: usize,
    sample_rate_hz: u32,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            boards: MIN_BOARDS,
            sample_rate_hz: DEFAULT_RATE_HZ,
        }
    }
}

impl StreamParams {
    pub fn boards(&self) -> usize {
        self.boards
    }

    pub fn channels(&self) -> usize {
        self.boards * packet::BOARD_CHANNELS
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    /// Change the board count. Returns whether it actually changed.
    ///
    /// Refused while a run is active since the decoder sizes every packet by it.
    pub fn set_boards(&mut self, boards: usize, acquiring: bool) -> IngestResult<bool> {
        if acquiring {
            return Err(IngestError::IllegalStateTransition(format!(
                "board count change to {boards} while acquiring"
            )));
        }
        if !(MIN_BOARDS..=MAX_BOARDS).contains(&boards) {
            return Err(IngestError::InvalidConfiguration(format!(
                "board count {boards} outside {MIN_BOARDS}..={MAX_BOARDS}"
            )));
        }
        let changed = self.boards != boards;
        self.boards = boards;
        Ok(changed)
    }

    pub fn set_sample_rate(&mut self, hz: u32, acquiring: bool) -> IngestResult<bool> {
        if acquiring {
            return Err(IngestError::IllegalStateTransition(format!(
                "sample rate change to {hz} Hz while acquiring"
            )));
        }
        let changed = self.sample_rate_hz != hz;
        self.sample_rate_hz = hz;
        Ok(changed)
    }
}

/// Sample rate implied by the number of packets seen in `RATE_WINDOW_US`.
///
/// 32,768 Hz is recognized from its count band; every other mode is a multiple of
/// 2 kHz. Counts that round outside the hardware's 16–40 kHz range are rejected.
pub fn infer_sample_rate(count: u32) -> Option<u32> {
    if SPECIAL_RATE_COUNTS.contains(&count) {
        return Some(SPECIAL_RATE_HZ);
    }
    let hz = count.checked_add(100)? / 200 * 2000;
    (MIN_RATE_HZ..=MAX_RATE_HZ).contains(&hz).then_some(hz)
}

/// Result of one probe of the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Probe {
    pub boards: usize,
    pub valid: bool,
}

/// Scratch space and routines for probing a live stream.
pub struct StreamDiscovery {
    buf: Vec<u8>,
}

impl Default for StreamDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDiscovery {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; MAX_PACKET_LEN],
        }
    }

    /// Flush the socket, then read one packet of unknown size and validate it against
    /// the board count its header announces.
    ///
    /// Only the first packet of whatever the read returns is inspected.
    pub fn probe(&mut self, session: &Session) -> IngestResult<Probe> {
        session.flush()?;
        let boards = session.receive_one(&mut self.buf, 0, RECV_TIMEOUT)?;
        let valid = packet::is_valid(&self.buf, boards);
        if !valid {
            debug!("Probe packet announced {} boards but failed validation", boards);
        }
        Ok(Probe { boards, valid })
    }

    /// Count packets whose timestamps fall within `RATE_WINDOW_US` of the first one.
    ///
    /// Any failed receive inside the window discards the measurement.
    pub fn count_window(&mut self, session: &Session, boards: usize) -> IngestResult<u32> {
        let mut count = 0u32;
        let mut start: Option<u32> = None;

        loop {
            session.receive_one(&mut self.buf, boards, RECV_TIMEOUT)?;
            let ts = PacketView::new(&self.buf, boards).timestamp_low();

            match start {
                None => start = Some(ts),
                Some(first) if ts.wrapping_sub(first) >= RATE_WINDOW_US => break,
                Some(_) => {}
            }

            count += 1;
            if count > MAX_WINDOW_PACKETS {
                return Err(IngestError::InvalidPacket("packet timestamps are not advancing"));
            }
        }
        Ok(count)
    }

    /// Measure the stream and infer its sample rate. `Ok(None)` when the count falls
    /// outside every known hardware mode.
    pub fn measure_rate(&mut self, session: &Session, boards: usize) -> IngestResult<Option<u32>> {
        let count = self.count_window(session, boards)?;
        let rate = infer_sample_rate(count);
        match rate {
            Some(hz) => info!("Counted {} packets in 100 ms: {} Hz", count, hz),
            None => warn!(
                "Counted {} packets in 100 ms, outside {}-{} Hz; keeping previous rate",
                count, MIN_RATE_HZ, MAX_RATE_HZ
            ),
        }
        Ok(rate)
    }
}
