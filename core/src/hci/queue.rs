// Command queue: submission and completion tracking for HCI commands
//
// Every asynchronously submitted command is remembered together with a tag
// naming what should happen when it completes. Completions are matched to
// the oldest pending command with the same opcode.

use super::bring_up::BringUpStep;
use super::command::HciCommand;
use super::pipeline::Stage;
use super::transport::{HciTransport, TransportError};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// Maximum immediate retries of a blocking write that would block or was interrupted
pub const MAX_WRITE_RETRIES: usize = 8;

/// Continuation attached to a submitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionTag {
    /// Controller bring-up step
    BringUp(BringUpStep),
    /// Step of an advertising burst
    Burst { burst_id: u64, stage: Stage },
    /// Advertising disabled at the end of a burst sequence
    AdvertisingStopped,
    RandomAddressSet,
    AdvStats,
    /// Scan disabled; `reconfigure` continues with parameters + enable
    ScanDisabled { reconfigure: bool },
    ScanParametersSet,
    ScanEnabled,
}

/// A submitted command waiting for its completion event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub opcode: u16,
    pub tag: CompletionTag,
}

/// Owner of the radio handle and of the pending-command list
pub struct CommandQueue {
    transport: Arc<dyn HciTransport>,
    pending: VecDeque<PendingCommand>,
}

impl CommandQueue {
    pub fn new(transport: Arc<dyn HciTransport>) -> Self {
        Self {
            transport,
            pending: VecDeque::new(),
        }
    }

    /// Submit a command and remember its continuation
    pub fn submit(&mut self, command: HciCommand, tag: CompletionTag) -> Result<(), TransportError> {
        self.transport.submit(&command)?;
        trace!("Submitted {} ({:?})", command, tag);
        self.pending.push_back(PendingCommand {
            opcode: command.opcode(),
            tag,
        });
        Ok(())
    }

    /// Write a command directly, retrying transient failures a bounded number of times
    pub fn write_blocking(&self, command: &HciCommand) -> Result<(), TransportError> {
        let mut retries = 0;
        loop {
            match self.transport.write_blocking(command) {
                Ok(()) => {
                    trace!("Wrote {}", command);
                    return Ok(());
                }
                Err(e) if e.is_transient() && retries < MAX_WRITE_RETRIES => {
                    retries += 1;
                    trace!("Retrying {} after {} (attempt {})", command, e, retries);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Match a completion to the oldest pending command with this opcode
    pub fn complete(&mut self, opcode: u16) -> Option<CompletionTag> {
        let index = self.pending.iter().position(|p| p.opcode == opcode)?;
        self.pending.remove(index).map(|p| p.tag)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Forget all outstanding continuations
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            debug!("Dropping {} pending command completions", self.pending.len());
        }
        self.pending.clear();
    }

    pub fn random_bytes(&self, buf: &mut [u8]) {
        self.transport.random_bytes(buf);
    }

    pub fn transport(&self) -> &Arc<dyn HciTransport> {
        &self.transport
    }
}
