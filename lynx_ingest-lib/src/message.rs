use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle states of an acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionState {
    Idle,
    Discovering,
    Ready,
    Acquiring,
}

/// State changes published to whoever displays or configures the acquisition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "value")]
pub enum AcquisitionEvent {
    StateChanged(AcquisitionState),
    ReceivingChanged(bool),
    BoardCountChanged(usize),
    SampleRateChanged(u32),
    RefreshRequested(bool),
    /// The run ended from inside the receive loop.
    Faulted(String),
}

/// One decoded block, owned by whoever received it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockData {
    pub channels: usize,
    /// Sample-major µV values, `timestamps.len() * channels` long.
    pub samples: Vec<f32>,
    pub timestamps: Vec<i64>,
    pub ttl_words: Vec<u32>,
}

impl BlockData {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Little-endian frame: count u32, channels u32, timestamps i64, TTL u32, samples f32.
    pub fn to_le_frame(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.len() * 12 + self.samples.len() * 4);
        buf.extend_from_slice(&(self.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.channels as u32).to_le_bytes());
        for ts in &self.timestamps {
            buf.extend_from_slice(&ts.to_le_bytes());
        }
        for ttl in &self.ttl_words {
            buf.extend_from_slice(&ttl.to_le_bytes());
        }
        for s in &self.samples {
            buf.extend_from_slice(&s.to_le_bytes());
        }
        buf
    }
}

/// Everything carried on the broadcast channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    Event {
        at: DateTime<Utc>,
        event: AcquisitionEvent,
    },
    Block(BlockData),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_value(AcquisitionEvent::SampleRateChanged(32_768)).unwrap();
        assert_eq!(json, serde_json::json!({"event": "SampleRateChanged", "value": 32768}));

        let json = serde_json::to_value(AcquisitionEvent::StateChanged(AcquisitionState::Ready)).unwrap();
        assert_eq!(json["value"], "Ready");
    }

    #[test]
    fn block_frame_layout() {
        let block = BlockData {
            channels: 2,
            samples: vec![1.0, -1.0, 0.5, 0.25],
            timestamps: vec![0, 1],
            ttl_words: vec![7, 8],
        };
        let frame = block.to_le_frame();
        assert_eq!(frame.len(), 8 + 2 * 8 + 2 * 4 + 4 * 4);
        assert_eq!(&frame[0..4], &2u32.to_le_bytes());
        assert_eq!(&frame[4..8], &2u32.to_le_bytes());
        assert_eq!(&frame[16..24], &1i64.to_le_bytes());
        assert_eq!(&frame[24..28], &7u32.to_le_bytes());
        assert_eq!(&frame[frame.len() - 4..], &0.25f32.to_le_bytes());
    }
}
