//! Advertising burst pipeline
//!
//! A burst is the ordered command sequence
//! LE Set Advertising Enable(0) → LE Set Advertising Parameters →
//! LE Set Advertising Data → LE Set Advertising Enable(1).
//!
//! Two strategies implement [`AdvertisingPipeline`]:
//!
//! - [`SyncPipeline`] writes every step with a blocking write and finishes the
//!   burst before `transmit` returns.
//! - [`ChainedPipeline`] submits one step at a time and issues the next one
//!   from the previous step's completion. Bursts requested meanwhile wait
//!   their turn, so both strategies put the same packets on air in the same
//!   order.

use super::command::{AdvData, AdvParameters, HciCommand};
use super::queue::{CommandQueue, CompletionTag};
use super::transport::TransportError;
use crate::config::BurstMode;
use crate::tx::PacketId;
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Position inside a burst
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Disable,
    SetParams,
    SetData,
    Enable,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Disable, Stage::SetParams, Stage::SetData, Stage::Enable];

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Disable => Some(Stage::SetParams),
            Stage::SetParams => Some(Stage::SetData),
            Stage::SetData => Some(Stage::Enable),
            Stage::Enable => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Disable => "advertising disable",
            Stage::SetParams => "advertising parameters",
            Stage::SetData => "advertising data",
            Stage::Enable => "advertising enable",
        };
        write!(f, "{}", name)
    }
}

/// Vendor advertising statistics attached to a repeated transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdvStats {
    pub seqn: u32,
    pub count: u32,
}

/// One transmission handed from the scheduler to the pipeline. The payload is
/// a snapshot: later changes to the queue never reach a burst in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvBurst {
    pub packet_id: PacketId,
    pub interval_ms: u16,
    pub data: AdvData,
    pub stats: Option<AdvStats>,
}

impl AdvBurst {
    pub fn command(&self, stage: Stage) -> HciCommand {
        match stage {
            Stage::Disable => HciCommand::LeSetAdvEnable(false),
            Stage::SetParams => {
                HciCommand::LeSetAdvParameters(AdvParameters::non_connectable(self.interval_ms))
            }
            Stage::SetData => HciCommand::LeSetAdvData(self.data.clone()),
            Stage::Enable => HciCommand::LeSetAdvEnable(true),
        }
    }

    fn stats_command(&self) -> Option<HciCommand> {
        self.stats.map(|s| HciCommand::VendorSetAdvStat {
            seqn: s.seqn,
            count: s.count,
        })
    }
}

/// Outcome of driving a burst
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstProgress {
    /// Nothing finished yet
    Pending,
    /// All four stages accepted by the controller
    Completed(PacketId),
    /// Burst abandoned before advertising was enabled
    Aborted(PacketId),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Failed to send {stage} for packet {packet_id}: {source}")]
    Burst {
        packet_id: PacketId,
        stage: Stage,
        #[source]
        source: TransportError,
    },

    #[error("Failed to stop advertising: {0}")]
    Stop(#[source] TransportError),

    #[error("Failed to set random address: {0}")]
    AddressRotation(#[source] TransportError),
}

impl PipelineError {
    /// Packet whose burst was lost, if any
    pub fn packet_id(&self) -> Option<PacketId> {
        match self {
            PipelineError::Burst { packet_id, .. } => Some(*packet_id),
            _ => None,
        }
    }
}

/// Strategy executing advertising bursts on the radio
pub trait AdvertisingPipeline: Send {
    fn mode(&self) -> BurstMode;

    /// Start (or queue) a burst
    fn transmit(
        &mut self,
        queue: &mut CommandQueue,
        burst: AdvBurst,
    ) -> Result<BurstProgress, PipelineError>;

    /// Completion of a burst step submitted by this pipeline
    fn on_stage_complete(
        &mut self,
        queue: &mut CommandQueue,
        burst_id: u64,
        stage: Stage,
        status: u8,
    ) -> Result<BurstProgress, PipelineError>;

    /// Stop advertising at the end of a burst sequence
    fn stop(&mut self, queue: &mut CommandQueue) -> Result<(), PipelineError>;

    /// Completion of the disable issued by [`AdvertisingPipeline::stop`]
    fn on_stopped(&mut self, queue: &mut CommandQueue) -> Result<(), PipelineError> {
        rotate_random_address(queue)
    }

    /// The packet was cancelled. A burst that has only issued its disable
    /// step is abandoned; one further along completes from its snapshot.
    /// Returns `true` if a burst was dropped.
    fn cancel_burst(&mut self, packet_id: PacketId) -> bool;

    /// Whether a burst is still being driven
    fn is_busy(&self) -> bool;

    fn is_advertising(&self) -> bool;

    /// Forget all burst state (radio handle dropped)
    fn reset(&mut self);
}

/// Build the pipeline for a burst mode
pub fn new_pipeline(mode: BurstMode) -> Box<dyn AdvertisingPipeline> {
    match mode {
        BurstMode::Synchronous => Box::new(SyncPipeline::new()),
        BurstMode::Chained => Box::new(ChainedPipeline::new()),
    }
}

/// Draw a fresh static random address and program it
pub fn rotate_random_address(queue: &mut CommandQueue) -> Result<(), PipelineError> {
    let mut addr = [0u8; 6];
    queue.random_bytes(&mut addr);
    addr[5] |= 0xc0;
    trace!("Rotating random address to {}", hex::encode(addr));
    queue
        .submit(HciCommand::LeSetRandomAddress(addr), CompletionTag::RandomAddressSet)
        .map_err(PipelineError::AddressRotation)
}

// ============================================================================
// SYNCHRONOUS PIPELINE
// ============================================================================

/// Writes each burst straight to the controller
#[derive(Debug, Default)]
pub struct SyncPipeline {
    advertising: bool,
}

impl SyncPipeline {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdvertisingPipeline for SyncPipeline {
    fn mode(&self) -> BurstMode {
        BurstMode::Synchronous
    }

    fn transmit(
        &mut self,
        queue: &mut CommandQueue,
        burst: AdvBurst,
    ) -> Result<BurstProgress, PipelineError> {
        if let Some(cmd) = burst.stats_command() {
            if let Err(e) = queue.write_blocking(&cmd) {
                warn!("Failed to write advertising statistics: {}", e);
            }
        }

        for stage in Stage::ALL {
            queue
                .write_blocking(&burst.command(stage))
                .map_err(|source| {
                    // Whatever was written before the failure, advertising is
                    // no longer known to be on.
                    self.advertising = false;
                    PipelineError::Burst {
                        packet_id: burst.packet_id,
                        stage,
                        source,
                    }
                })?;
        }

        self.advertising = true;
        trace!("Burst for packet {} written", burst.packet_id);
        Ok(BurstProgress::Completed(burst.packet_id))
    }

    fn on_stage_complete(
        &mut self,
        _queue: &mut CommandQueue,
        burst_id: u64,
        stage: Stage,
        _status: u8,
    ) -> Result<BurstProgress, PipelineError> {
        debug!("Unexpected chained completion {}/{} in synchronous mode", burst_id, stage);
        Ok(BurstProgress::Pending)
    }

    fn stop(&mut self, queue: &mut CommandQueue) -> Result<(), PipelineError> {
        if self.advertising {
            queue
                .write_blocking(&HciCommand::LeSetAdvEnable(false))
                .map_err(PipelineError::Stop)?;
            self.advertising = false;
        }
        rotate_random_address(queue)
    }

    fn cancel_burst(&mut self, _packet_id: PacketId) -> bool {
        false
    }

    fn is_busy(&self) -> bool {
        false
    }

    fn is_advertising(&self) -> bool {
        self.advertising
    }

    fn reset(&mut self) {
        self.advertising = false;
    }
}

// ============================================================================
// CHAINED PIPELINE
// ============================================================================

#[derive(Debug)]
struct ActiveBurst {
    id: u64,
    burst: AdvBurst,
    stage: Stage,
    cancelled: bool,
}

/// Issues each burst step from the completion of the previous one
#[derive(Debug, Default)]
pub struct ChainedPipeline {
    current: Option<ActiveBurst>,
    /// Bursts requested while another was in progress, oldest first
    queued: VecDeque<AdvBurst>,
    next_id: u64,
    advertising: bool,
    /// Stop requested while a burst was in progress
    stop_requested: bool,
}

impl ChainedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage currently awaiting completion
    pub fn current_stage(&self) -> Option<Stage> {
        self.current.as_ref().map(|b| b.stage)
    }

    fn start(&mut self, queue: &mut CommandQueue, burst: AdvBurst) -> Result<(), PipelineError> {
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;

        if let Some(cmd) = burst.stats_command() {
            if let Err(e) = queue.submit(cmd, CompletionTag::AdvStats) {
                warn!("Failed to submit advertising statistics: {}", e);
            }
        }

        debug!("Starting burst {} for packet {}", id, burst.packet_id);
        self.current = Some(ActiveBurst {
            id,
            burst,
            stage: Stage::Disable,
            cancelled: false,
        });
        self.drive(queue)
    }

    /// Issue the command for the current stage
    fn drive(&mut self, queue: &mut CommandQueue) -> Result<(), PipelineError> {
        let Some(active) = self.current.as_ref() else {
            return Ok(());
        };
        let stage = active.stage;
        let command = active.burst.command(stage);
        let tag = CompletionTag::Burst {
            burst_id: active.id,
            stage,
        };

        if let Err(source) = queue.submit(command, tag) {
            let packet_id = active.burst.packet_id;
            self.current = None;
            if stage != Stage::Disable {
                self.advertising = false;
            }
            return Err(PipelineError::Burst {
                packet_id,
                stage,
                source,
            });
        }
        Ok(())
    }

    /// The current burst is over: start the oldest queued burst, or honour a
    /// deferred stop once nothing is left. A queued burst that cannot be
    /// submitted is dropped and the next one tried.
    fn advance(&mut self, queue: &mut CommandQueue) {
        while let Some(next) = self.queued.pop_front() {
            match self.start(queue, next) {
                Ok(()) => return,
                Err(e) => warn!("{}", e),
            }
        }
        if self.stop_requested {
            if let Err(e) = self.stop_now(queue) {
                warn!("{}", e);
            }
        }
    }

    fn stop_now(&mut self, queue: &mut CommandQueue) -> Result<(), PipelineError> {
        self.stop_requested = false;
        if !self.advertising {
            return rotate_random_address(queue);
        }
        queue
            .submit(HciCommand::LeSetAdvEnable(false), CompletionTag::AdvertisingStopped)
            .map_err(PipelineError::Stop)?;
        self.advertising = false;
        Ok(())
    }
}

impl AdvertisingPipeline for ChainedPipeline {
    fn mode(&self) -> BurstMode {
        BurstMode::Chained
    }

    fn transmit(
        &mut self,
        queue: &mut CommandQueue,
        burst: AdvBurst,
    ) -> Result<BurstProgress, PipelineError> {
        self.stop_requested = false;
        if self.current.is_some() {
            trace!(
                "Burst for packet {} queued behind {} other(s)",
                burst.packet_id,
                self.queued.len()
            );
            self.queued.push_back(burst);
            return Ok(BurstProgress::Pending);
        }
        self.start(queue, burst)?;
        Ok(BurstProgress::Pending)
    }

    fn on_stage_complete(
        &mut self,
        queue: &mut CommandQueue,
        burst_id: u64,
        stage: Stage,
        status: u8,
    ) -> Result<BurstProgress, PipelineError> {
        let Some(active) = self.current.as_mut() else {
            trace!("Completion for finished burst {} ignored", burst_id);
            return Ok(BurstProgress::Pending);
        };
        if active.id != burst_id || active.stage != stage {
            trace!("Stale completion {}/{} ignored", burst_id, stage);
            return Ok(BurstProgress::Pending);
        }

        if stage == Stage::Disable {
            self.advertising = false;
        }

        let packet_id = active.burst.packet_id;

        if status != 0 {
            warn!(
                "Burst for packet {} failed at {} (status {:#04x}), aborting",
                packet_id, stage, status
            );
            self.current = None;
            self.advance(queue);
            return Ok(BurstProgress::Aborted(packet_id));
        }

        if active.cancelled {
            debug!("Burst for packet {} abandoned after cancel", packet_id);
            self.current = None;
            self.advance(queue);
            return Ok(BurstProgress::Aborted(packet_id));
        }

        match stage.next() {
            Some(next) => {
                active.stage = next;
                if let Err(e) = self.drive(queue) {
                    self.advance(queue);
                    return Err(e);
                }
                Ok(BurstProgress::Pending)
            }
            None => {
                self.advertising = true;
                self.current = None;
                trace!("Burst for packet {} complete", packet_id);
                self.advance(queue);
                Ok(BurstProgress::Completed(packet_id))
            }
        }
    }

    fn stop(&mut self, queue: &mut CommandQueue) -> Result<(), PipelineError> {
        if let Some(active) = self.current.as_ref() {
            // Bursts already handed over still go out; the disable follows
            debug!(
                "Stop deferred until burst for packet {} and {} queued burst(s) finish",
                active.burst.packet_id,
                self.queued.len()
            );
            self.stop_requested = true;
            return Ok(());
        }
        self.stop_now(queue)
    }

    fn cancel_burst(&mut self, packet_id: PacketId) -> bool {
        let queued = self.queued.len();
        self.queued.retain(|b| b.packet_id != packet_id);
        let mut dropped = self.queued.len() != queued;
        if let Some(active) = self.current.as_mut() {
            if active.burst.packet_id == packet_id && active.stage == Stage::Disable {
                active.cancelled = true;
                dropped = true;
            }
        }
        dropped
    }

    fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    fn is_advertising(&self) -> bool {
        self.advertising
    }

    fn reset(&mut self) {
        self.current = None;
        self.queued.clear();
        self.advertising = false;
        self.stop_requested = false;
    }
}
