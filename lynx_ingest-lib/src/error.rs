use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while acquiring from the hardware stream.
///
/// Receive-side conditions (timeouts, short reads, failed batches, bad packets) are
/// recovered locally by the caller; only configuration and lifecycle misuse are meant
/// to reach an operator.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to bind UDP socket to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("no packet received within {0:?}")]
    Timeout(Duration),

    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),

    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },

    #[error("batch receive failed at packet {slot}: {source}")]
    BatchFailure {
        slot: usize,
        #[source]
        source: Box<IngestError>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("illegal state transition: {0}")]
    IllegalStateTransition(String),

    #[error("no local address available to bind")]
    NoAddress,

    #[error("UDP socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// True for conditions the receive loop simply retries on its next cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            IngestError::Timeout(_)
            | IngestError::ShortRead { .. }
            | IngestError::InvalidPacket(_) => true,
            IngestError::BatchFailure { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

pub type IngestResult<T> = Result<T, IngestError>;
