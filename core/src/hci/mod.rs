//! Host controller interface layer
//!
//! Command encoding, event parsing, the transport seam, completion tracking,
//! controller bring-up and the advertising burst pipeline.

pub mod bring_up;
pub mod command;
pub mod event;
pub mod pipeline;
pub mod queue;
pub mod transport;
pub mod virtual_controller;

pub use bring_up::{BringUp, BringUpProgress, BringUpStep};
pub use command::{AdvData, AdvParameters, HciCommand, ScanParameters};
pub use event::{EventError, HciEvent};
pub use pipeline::{
    new_pipeline, AdvBurst, AdvStats, AdvertisingPipeline, BurstProgress, ChainedPipeline,
    PipelineError, Stage, SyncPipeline,
};
pub use queue::{CommandQueue, CompletionTag, PendingCommand, MAX_WRITE_RETRIES};
pub use transport::{EventHandler, HciTransport, TransportError};
pub use virtual_controller::{RecordedCommand, VirtualController, WriteMode};
