//! lynx_ingest-lib: UDP acquisition of multi-board neural data streams,
//! from packet validation to timestamped µV blocks.

pub mod error;
pub mod packet;
pub mod session;
pub mod discovery;
pub mod decoder;
pub mod acquisition;

pub mod config;
pub mod context;
pub mod message;
pub mod simulator;

// re-exports for ergonomic imports:
pub use acquisition::{Acquisition, AcquisitionStats, AcquisitionStatus};
pub use config::AcquisitionConfig;
pub use context::Context;
pub use decoder::{BlockDecoder, BlockSink};
pub use discovery::StreamParams;
pub use error::{IngestError, IngestResult};
pub use message::{AcquisitionEvent, AcquisitionState, BlockData, Message};
pub use session::Session;
pub use simulator::Simulator;
