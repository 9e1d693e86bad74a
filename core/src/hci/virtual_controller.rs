//! In-process controller for tests and simulation
//!
//! Accepts every command, records it, and answers with a Command Complete
//! event. Events go to the registered handler, or are buffered until
//! [`VirtualController::take_events`] when no handler is installed.

use super::command::HciCommand;
use super::event::{HciEvent, LE_SUBEVT_ADV_REPORT};
use super::transport::{EventHandler, HciTransport, TransportError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;

/// How a command reached the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Submitted,
    Written,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub at_ms: u32,
    pub mode: WriteMode,
    pub command: HciCommand,
}

#[derive(Default)]
struct ControllerState {
    log: Vec<RecordedCommand>,
    now_ms: u32,
    status: HashMap<u16, u8>,
    submit_failures: HashMap<u16, TransportError>,
    write_failures: HashMap<u16, TransportError>,
    buffered: Vec<Vec<u8>>,
}

pub struct VirtualController {
    state: Mutex<ControllerState>,
    handler: Mutex<Option<Arc<dyn Fn(&[u8]) + Send + Sync>>>,
    rng: Mutex<StdRng>,
}

impl VirtualController {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic random addresses
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            state: Mutex::new(ControllerState::default()),
            handler: Mutex::new(None),
            rng: Mutex::new(rng),
        }
    }

    /// Timestamp applied to subsequently recorded commands
    pub fn set_time(&self, now_ms: u32) {
        self.state.lock().now_ms = now_ms;
    }

    /// Status returned in the Command Complete for `opcode`
    pub fn set_status(&self, opcode: u16, status: u8) {
        self.state.lock().status.insert(opcode, status);
    }

    /// Refuse submissions of `opcode`
    pub fn fail_submits(&self, opcode: u16, error: TransportError) {
        self.state.lock().submit_failures.insert(opcode, error);
    }

    /// Refuse blocking writes of `opcode`
    pub fn fail_writes(&self, opcode: u16, error: TransportError) {
        self.state.lock().write_failures.insert(opcode, error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.status.clear();
        state.submit_failures.clear();
        state.write_failures.clear();
    }

    pub fn records(&self) -> Vec<RecordedCommand> {
        self.state.lock().log.clone()
    }

    pub fn commands(&self) -> Vec<HciCommand> {
        self.state.lock().log.iter().map(|r| r.command.clone()).collect()
    }

    pub fn opcodes(&self) -> Vec<u16> {
        self.state.lock().log.iter().map(|r| r.command.opcode()).collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Drain events produced while no handler was registered
    pub fn take_events(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().buffered)
    }

    /// Deliver a raw event as if the controller had produced it
    pub fn inject_event(&self, event: Vec<u8>) {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => handler(&event),
            None => self.state.lock().buffered.push(event),
        }
    }

    /// Deliver an LE Advertising Report event with a single report
    pub fn inject_adv_report(&self, event_type: u8, addr: [u8; 6], data: &[u8], rssi: i8) {
        let mut params = Vec::with_capacity(11 + data.len());
        params.push(1);
        params.push(event_type);
        params.push(0x01);
        params.extend_from_slice(&addr);
        params.push(data.len() as u8);
        params.extend_from_slice(data);
        params.push(rssi as u8);
        self.inject_event(HciEvent::le_meta(LE_SUBEVT_ADV_REPORT, &params));
    }

    fn accept(&self, command: &HciCommand, mode: WriteMode) -> Result<(), TransportError> {
        let opcode = command.opcode();
        let status = {
            let mut state = self.state.lock();
            let failures = match mode {
                WriteMode::Submitted => &state.submit_failures,
                WriteMode::Written => &state.write_failures,
            };
            if let Some(err) = failures.get(&opcode) {
                return Err(err.clone());
            }
            let at_ms = state.now_ms;
            state.log.push(RecordedCommand {
                at_ms,
                mode,
                command: command.clone(),
            });
            state.status.get(&opcode).copied().unwrap_or(0)
        };
        self.inject_event(HciEvent::command_complete(opcode, status));
        Ok(())
    }
}

impl Default for VirtualController {
    fn default() -> Self {
        Self::new()
    }
}

impl HciTransport for VirtualController {
    fn submit(&self, command: &HciCommand) -> Result<(), TransportError> {
        self.accept(command, WriteMode::Submitted)
    }

    fn write_blocking(&self, command: &HciCommand) -> Result<(), TransportError> {
        self.accept(command, WriteMode::Written)
    }

    fn register_event_handler(&self, handler: EventHandler) {
        *self.handler.lock() = Some(Arc::from(handler));
    }

    fn random_bytes(&self, buf: &mut [u8]) {
        self.rng.lock().fill_bytes(buf);
    }
}
