use chrono::Utc;
use log::trace;
use tokio::sync::broadcast;

use crate::decoder::BlockSink;
use crate::message::{AcquisitionEvent, BlockData, Message};

/// A small wrapper around a Tokio broadcast channel,
/// used to fan out acquisition events and decoded blocks.
#[derive(Clone)]
pub struct Context {
    pub tx: broadcast::Sender<Message>,
}

impl Context {
    /// Create a new Context with a channel of the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: AcquisitionEvent) {
        let msg = Message::Event {
            at: Utc::now(),
            event,
        };
        if self.tx.send(msg).is_err() {
            trace!("No subscribers for acquisition event");
        }
    }
}

impl BlockSink for Context {
    fn add_block(&mut self, samples: &[f32], timestamps: &[i64], ttl_words: &[u32], count: usize) {
        if count == 0 || self.tx.receiver_count() == 0 {
            return;
        }
        let block = BlockData {
            channels: samples.len() / count,
            samples: samples.to_vec(),
            timestamps: timestamps.to_vec(),
            ttl_words: ttl_words.to_vec(),
        };
        // lagging receivers drop blocks on their side
        let _ = self.tx.send(Message::Block(block));
    }
}
