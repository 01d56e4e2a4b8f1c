#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use lynx_ingest_lib::{BlockData, BlockSink};
use parking_lot::Mutex;

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A port nothing is bound to right now.
pub fn free_port() -> u16 {
    let probe = UdpSocket::bind((LOCALHOST, 0)).unwrap();
    probe.local_addr().unwrap().port()
}

pub fn sender() -> UdpSocket {
    UdpSocket::bind((LOCALHOST, 0)).unwrap()
}

pub fn target(port: u16) -> SocketAddr {
    SocketAddr::new(LOCALHOST, port)
}

/// Keeps every block it is handed.
#[derive(Clone, Default)]
pub struct Collector {
    pub blocks: Arc<Mutex<Vec<BlockData>>>,
    pub cleared: Arc<AtomicUsize>,
}

impl Collector {
    pub fn take(&self) -> Vec<BlockData> {
        std::mem::take(&mut *self.blocks.lock())
    }

    pub fn clear_count(&self) -> usize {
        self.cleared.load(Ordering::SeqCst)
    }
}

impl BlockSink for Collector {
    fn add_block(&mut self, samples: &[f32], timestamps: &[i64], ttl_words: &[u32], count: usize) {
        let channels = if count == 0 { 0 } else { samples.len() / count };
        self.blocks.lock().push(BlockData {
            channels,
            samples: samples.to_vec(),
            timestamps: timestamps.to_vec(),
            ttl_words: ttl_words.to_vec(),
        });
    }

    fn clear(&mut self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}
