//! Wire layout of the acquisition system's UDP packets.
//!
//! Every packet is a run of little-endian 32-bit words:
//!
//! | word      | contents                                  |
//! |-----------|-------------------------------------------|
//! | 0         | sync (2048)                               |
//! | 1         | version (1)                               |
//! | 2         | channel-count field (`boards * 32 + 10`)  |
//! | 3, 4      | timestamp in µs, high word then low word  |
//! | 6         | TTL event word                            |
//! | 17..      | `boards * 32` signed samples              |
//! | last      | checksum, chosen so the XOR of all words is 0 |

pub const SYNC_WORD: u32 = 2048;
pub const VERSION_WORD: u32 = 1;

pub const HEADER_WORDS: usize = 17;
pub const FOOTER_WORDS: usize = 1;
pub const BOARD_CHANNELS: usize = 32;
pub const MIN_BOARDS: usize = 1;
pub const MAX_BOARDS: usize = 16;
pub const MAX_CHANNELS: usize = BOARD_CHANNELS * MAX_BOARDS;

/// Header words that are not channels but are counted by the channel-count field.
const CHANNEL_FIELD_EXTRA: u32 = 10;

const SYNC_IDX: usize = 0;
const VERSION_IDX: usize = 1;
const CHANNELS_IDX: usize = 2;
const TS_HIGH_IDX: usize = 3;
const TS_LOW_IDX: usize = 4;
const TTL_IDX: usize = 6;

pub const MIN_PACKET_LEN: usize = packet_len(MIN_BOARDS);
pub const MAX_PACKET_LEN: usize = packet_len(MAX_BOARDS);

pub const fn words_in_packet(boards: usize) -> usize {
    HEADER_WORDS + boards * BOARD_CHANNELS + FOOTER_WORDS
}

/// Packet size in bytes for the given board count.
pub const fn packet_len(boards: usize) -> usize {
    words_in_packet(boards) * 4
}

pub const fn channel_field(boards: usize) -> u32 {
    (boards * BOARD_CHANNELS) as u32 + CHANNEL_FIELD_EXTRA
}

#[inline]
fn word(bytes: &[u8], idx: usize) -> u32 {
    let mut w = [0u8; 4];
    w.copy_from_slice(&bytes[idx * 4..idx * 4 + 4]);
    u32::from_le_bytes(w)
}

/// Checks header fields and the XOR checksum of a packet carrying `boards` boards.
///
/// Only the first `packet_len(boards)` bytes are inspected; a slice shorter than that,
/// or a board count outside `MIN_BOARDS..=MAX_BOARDS`, is never valid.
pub fn is_valid(packet: &[u8], boards: usize) -> bool {
    if !(MIN_BOARDS..=MAX_BOARDS).contains(&boards) || packet.len() < packet_len(boards) {
        return false;
    }

    if word(packet, SYNC_IDX) != SYNC_WORD
        || word(packet, VERSION_IDX) != VERSION_WORD
        || word(packet, CHANNELS_IDX) != channel_field(boards)
    {
        return false;
    }

    checksum(&packet[..packet_len(boards)]) == 0
}

/// Word-wise XOR fold. Trailing bytes that do not fill a word are ignored.
pub fn checksum(bytes: &[u8]) -> u32 {
    bytes
        .chunks_exact(4)
        .fold(0u32, |acc, w| acc ^ u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
}

/// Board count announced by a packet header, if it is a plausible one.
///
/// `received` is the number of bytes the socket actually delivered; the header is
/// rejected when those bytes cannot hold the packet it describes. Checksum is not
/// checked here.
pub fn boards_from_header(received: &[u8]) -> Option<usize> {
    if received.len() < MIN_PACKET_LEN {
        return None;
    }

    let field = word(received, CHANNELS_IDX);
    let channels = field.checked_sub(CHANNEL_FIELD_EXTRA)? as usize;
    if channels % BOARD_CHANNELS != 0 {
        return None;
    }

    let boards = channels / BOARD_CHANNELS;
    if !(MIN_BOARDS..=MAX_BOARDS).contains(&boards) || received.len() < packet_len(boards) {
        return None;
    }
    Some(boards)
}

/// Read-only accessors over one already-validated packet.
#[derive(Clone, Copy, Debug)]
pub struct PacketView<'a> {
    bytes: &'a [u8],
    boards: usize,
}

impl<'a> PacketView<'a> {
    /// `bytes` must hold at least `packet_len(boards)` bytes.
    pub fn new(bytes: &'a [u8], boards: usize) -> Self {
        debug_assert!(bytes.len() >= packet_len(boards));
        Self { bytes, boards }
    }

    pub fn timestamp(&self) -> u64 {
        (u64::from(word(self.bytes, TS_HIGH_IDX)) << 32) | u64::from(word(self.bytes, TS_LOW_IDX))
    }

    /// Lower 32 bits of the timestamp.
    pub fn timestamp_low(&self) -> u32 {
        word(self.bytes, TS_LOW_IDX)
    }

    pub fn ttl(&self) -> u32 {
        word(self.bytes, TTL_IDX)
    }

    pub fn channels(&self) -> usize {
        self.boards * BOARD_CHANNELS
    }

    /// Raw two's-complement samples in channel order.
    pub fn samples(&self) -> impl Iterator<Item = i32> + 'a {
        let start = HEADER_WORDS * 4;
        let end = start + self.boards * BOARD_CHANNELS * 4;
        self.bytes[start..end]
            .chunks_exact(4)
            .map(|w| i32::from_le_bytes([w[0], w[1], w[2], w[3]]))
    }
}

/// Builds a well-formed packet, appending it to `out`.
///
/// `samples` must contain `boards * 32` values.
pub fn encode_into(out: &mut Vec<u8>, boards: usize, timestamp: u64, ttl: u32, samples: &[i32]) {
    debug_assert_eq!(samples.len(), boards * BOARD_CHANNELS);

    let start = out.len();
    let mut header = [0u32; HEADER_WORDS];
    header[SYNC_IDX] = SYNC_WORD;
    header[VERSION_IDX] = VERSION_WORD;
    header[CHANNELS_IDX] = channel_field(boards);
    header[TS_HIGH_IDX] = (timestamp >> 32) as u32;
    header[TS_LOW_IDX] = timestamp as u32;
    header[TTL_IDX] = ttl;

    out.reserve(packet_len(boards));
    for w in header {
        out.extend_from_slice(&w.to_le_bytes());
    }
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    let fold = checksum(&out[start..]);
    out.extend_from_slice(&fold.to_le_bytes());
}

pub fn encode(boards: usize, timestamp: u64, ttl: u32, samples: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packet_len(boards));
    encode_into(&mut out, boards, timestamp, ttl, samples);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet(boards: usize) -> Vec<u8> {
        let samples: Vec<i32> = (0..boards * BOARD_CHANNELS)
            .map(|c| (c as i32 - 40) * 1_000)
            .collect();
        encode(boards, 0x0000_0001_8000_0010, 0b1010, &samples)
    }

    fn set_word(bytes: &mut [u8], idx: usize, value: u32) {
        bytes[idx * 4..idx * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn sizes_follow_board_count() {
        assert_eq!(words_in_packet(1), 50);
        assert_eq!(packet_len(1), 200);
        assert_eq!(MAX_PACKET_LEN, (17 + 16 * 32 + 1) * 4);
        assert_eq!(channel_field(3), 106);
    }

    #[test]
    fn encoded_packets_validate_for_every_board_count() {
        for boards in MIN_BOARDS..=MAX_BOARDS {
            let pkt = sample_packet(boards);
            assert_eq!(pkt.len(), packet_len(boards));
            assert!(is_valid(&pkt, boards), "boards={boards}");
        }
    }

    #[test]
    fn wrong_board_count_is_invalid() {
        let pkt = sample_packet(2);
        assert!(!is_valid(&pkt, 1));
        assert!(!is_valid(&pkt, 3));
        assert!(!is_valid(&pkt, 0));
        assert!(!is_valid(&pkt, 17));
    }

    #[test]
    fn header_mismatch_is_invalid_even_with_fixed_checksum() {
        for (idx, bad) in [(SYNC_IDX, 2049), (VERSION_IDX, 2), (CHANNELS_IDX, 43)] {
            let mut pkt = sample_packet(1);
            let old = word(&pkt, idx);
            set_word(&mut pkt, idx, bad);
            // keep the XOR fold at zero so only the header check can fail
            let last = words_in_packet(1) - 1;
            let footer = word(&pkt, last);
            set_word(&mut pkt, last, footer ^ old ^ bad);
            assert_eq!(checksum(&pkt), 0);
            assert!(!is_valid(&pkt, 1), "word {idx}");
        }
    }

    #[test]
    fn any_single_bit_flip_is_detected() {
        let pkt = sample_packet(1);
        for bit in 0..pkt.len() * 8 {
            let mut corrupted = pkt.clone();
            corrupted[bit / 8] ^= 1 << (bit % 8);
            assert!(!is_valid(&corrupted, 1), "bit {bit}");
        }
    }

    #[test]
    fn paired_flips_in_the_same_column_cancel() {
        // documented limitation of an XOR fold
        let mut pkt = sample_packet(1);
        let a = HEADER_WORDS * 4;
        let b = (HEADER_WORDS + 5) * 4;
        pkt[a] ^= 0x01;
        pkt[b] ^= 0x01;
        assert!(is_valid(&pkt, 1));
    }

    #[test]
    fn truncated_packet_is_invalid() {
        let pkt = sample_packet(1);
        assert!(!is_valid(&pkt[..pkt.len() - 4], 1));
    }

    #[test]
    fn board_count_is_read_from_header() {
        for k in MIN_BOARDS..=MAX_BOARDS {
            let pkt = sample_packet(k);
            assert_eq!(boards_from_header(&pkt), Some(k));
        }
    }

    #[test]
    fn implausible_headers_yield_no_board_count() {
        let mut buf = vec![0u8; MAX_PACKET_LEN];
        for field in [0, 10, 41, 43, 32 * 17 + 10, 5, u32::MAX] {
            set_word(&mut buf, CHANNELS_IDX, field);
            assert_eq!(boards_from_header(&buf), None, "field {field}");
        }

        // header claims two boards but only one board's worth arrived
        let pkt = sample_packet(2);
        assert_eq!(boards_from_header(&pkt[..packet_len(1)]), None);
        assert_eq!(boards_from_header(&pkt[..16]), None);
    }

    #[test]
    fn view_extracts_fields() {
        let pkt = sample_packet(1);
        let view = PacketView::new(&pkt, 1);
        assert_eq!(view.timestamp(), 0x0000_0001_8000_0010);
        assert_eq!(view.timestamp_low(), 0x8000_0010);
        assert_eq!(view.ttl(), 0b1010);
        assert_eq!(view.channels(), 32);
        let samples: Vec<i32> = view.samples().collect();
        assert_eq!(samples.len(), 32);
        assert_eq!(samples[0], -40_000);
        assert_eq!(samples[31], -9_000);
    }
}
