//! One-time controller bring-up
//!
//! Reset → Read Local Supported Commands → Read Local Supported Features →
//! Set Event Mask → LE Set Event Mask → LE Set Scan Parameters, each step
//! submitted when the previous one completes. A failing step is logged and
//! the sequence carries on: a partially configured radio may still work.

use super::command::{HciCommand, ScanParameters, EVENT_MASK, LE_EVENT_MASK};
use super::queue::{CommandQueue, CompletionTag};
use super::transport::TransportError;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpStep {
    Reset,
    ReadLocalCommands,
    ReadLocalFeatures,
    SetEventMask,
    LeSetEventMask,
    LeSetScanParameters,
}

impl BringUpStep {
    pub fn command(self) -> HciCommand {
        match self {
            BringUpStep::Reset => HciCommand::Reset,
            BringUpStep::ReadLocalCommands => HciCommand::ReadLocalCommands,
            BringUpStep::ReadLocalFeatures => HciCommand::ReadLocalFeatures,
            BringUpStep::SetEventMask => HciCommand::SetEventMask(EVENT_MASK),
            BringUpStep::LeSetEventMask => HciCommand::LeSetEventMask(LE_EVENT_MASK),
            BringUpStep::LeSetScanParameters => {
                HciCommand::LeSetScanParameters(ScanParameters::bring_up())
            }
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            BringUpStep::Reset => Some(BringUpStep::ReadLocalCommands),
            BringUpStep::ReadLocalCommands => Some(BringUpStep::ReadLocalFeatures),
            BringUpStep::ReadLocalFeatures => Some(BringUpStep::SetEventMask),
            BringUpStep::SetEventMask => Some(BringUpStep::LeSetEventMask),
            BringUpStep::LeSetEventMask => Some(BringUpStep::LeSetScanParameters),
            BringUpStep::LeSetScanParameters => None,
        }
    }

    fn failure_message(self) -> &'static str {
        match self {
            BringUpStep::ReadLocalCommands => "Failed to read local commands",
            BringUpStep::ReadLocalFeatures => "Failed to read local features",
            _ => "Failed to initialize HCI",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpProgress {
    InProgress,
    Complete { failures: u32 },
}

/// Bring-up sequencer
#[derive(Debug, Default)]
pub struct BringUp {
    current: Option<BringUpStep>,
    failures: u32,
}

impl BringUp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    /// Submit the first step
    pub fn start(&mut self, queue: &mut CommandQueue) -> Result<(), TransportError> {
        self.failures = 0;
        self.submit(queue, BringUpStep::Reset)
    }

    /// Handle completion of `step` and submit the next one
    pub fn on_complete(
        &mut self,
        queue: &mut CommandQueue,
        step: BringUpStep,
        status: u8,
    ) -> Result<BringUpProgress, TransportError> {
        if self.current != Some(step) {
            debug!("Ignoring stale bring-up completion for {:?}", step);
            return Ok(BringUpProgress::InProgress);
        }

        if status != 0 {
            error!("{} ({:?}, status {:#04x})", step.failure_message(), step, status);
            self.failures += 1;
        }

        match step.next() {
            Some(next) => {
                self.submit(queue, next)?;
                Ok(BringUpProgress::InProgress)
            }
            None => {
                self.current = None;
                Ok(BringUpProgress::Complete {
                    failures: self.failures,
                })
            }
        }
    }

    pub fn abort(&mut self) {
        self.current = None;
    }

    fn submit(&mut self, queue: &mut CommandQueue, step: BringUpStep) -> Result<(), TransportError> {
        self.current = Some(step);
        let result = queue.submit(step.command(), CompletionTag::BringUp(step));
        if result.is_err() {
            self.current = None;
        }
        result
    }
}
