//! Mesh I/O facade
//!
//! [`MeshIo`] composes the transmit scheduler, the advertising pipeline, the
//! receive registry and the report decoder around one radio. It is fully
//! synchronous and clock-agnostic: the owner passes the current instant (ms)
//! into every call that needs one and drives [`MeshIo::on_tick`] whenever
//! [`MeshIo::next_deadline`] is reached. `service.rs` runs it on a tokio task.

use crate::adv::decode_adv_report;
use crate::config::MeshIoConfig;
use crate::hci::command::{HciCommand, ScanParameters};
use crate::hci::event::{HciEvent, LE_SUBEVT_ADV_REPORT};
use crate::hci::pipeline::{new_pipeline, AdvBurst, AdvertisingPipeline, BurstProgress};
use crate::hci::queue::{CommandQueue, CompletionTag};
use crate::hci::transport::{EventHandler, HciTransport};
use crate::hci::{BringUp, BringUpProgress};
use crate::rx::{AdvReceiver, RxRegistry, ScanChange};
use crate::tx::{PacketId, TimingPolicy, TxAction, TxScheduler};
use crate::MeshIoError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Called once when controller bring-up finishes (`true`) or fails (`false`)
pub type ReadyCallback = Box<dyn FnOnce(bool) + Send>;

/// Facade lifecycle. `Active` is derived from the transmit queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub max_filters: usize,
    pub window_accuracy_ms: u16,
}

struct Radio {
    index: u16,
    commands: CommandQueue,
    pipeline: Box<dyn AdvertisingPipeline>,
    bring_up: BringUp,
    ready_cb: Option<ReadyCallback>,
    ready: bool,
    /// Scan reconfiguration requested before bring-up finished, or cut short
    /// by a refused submission
    scan_pending: bool,
}

impl Radio {
    /// Submit one step of a scan reconfiguration. A refused step leaves the
    /// reconfiguration pending for the next receiver change.
    fn submit_scan_step(&mut self, command: HciCommand, tag: CompletionTag) {
        if let Err(e) = self.commands.submit(command, tag) {
            error!("Failed to submit scan command: {}", e);
            self.scan_pending = true;
        }
    }
}

pub struct MeshIo {
    config: MeshIoConfig,
    radio: Option<Radio>,
    scheduler: TxScheduler,
    registry: RxRegistry,
}

impl MeshIo {
    pub fn new(config: MeshIoConfig) -> Result<Self, MeshIoError> {
        config.validate()?;
        Ok(Self {
            scheduler: TxScheduler::new(&config),
            registry: RxRegistry::new(config.max_filters),
            radio: None,
            config,
        })
    }

    pub fn config(&self) -> &MeshIoConfig {
        &self.config
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Attach a radio and start controller bring-up. Raw controller events
    /// are routed to `events`; the owner feeds them back through
    /// [`MeshIo::handle_event`].
    pub fn init(
        &mut self,
        radio_index: u16,
        transport: Arc<dyn HciTransport>,
        events: EventHandler,
        ready: ReadyCallback,
    ) -> Result<(), MeshIoError> {
        if self.radio.is_some() {
            return Err(MeshIoError::AlreadyInitialized);
        }

        info!("Initializing mesh I/O on radio {}", radio_index);
        transport.register_event_handler(events);

        let mut radio = Radio {
            index: radio_index,
            commands: CommandQueue::new(transport),
            pipeline: new_pipeline(self.config.burst_mode),
            bring_up: BringUp::new(),
            ready_cb: Some(ready),
            ready: false,
            scan_pending: false,
        };

        if let Err(e) = radio.bring_up.start(&mut radio.commands) {
            error!("Failed to start controller bring-up: {}", e);
            radio.commands.transport().register_event_handler(Box::new(|_: &[u8]| {}));
            if let Some(cb) = radio.ready_cb.take() {
                cb(false);
            }
            return Err(MeshIoError::Radio(e));
        }

        self.radio = Some(radio);
        Ok(())
    }

    /// Tear everything down: timer, queue, registrations and radio handle
    pub fn destroy(&mut self) {
        self.scheduler.clear();
        self.registry.clear();
        if let Some(mut radio) = self.radio.take() {
            info!("Destroying mesh I/O on radio {}", radio.index);
            radio.bring_up.abort();
            radio.pipeline.reset();
            radio.commands.clear();
            radio.commands.transport().register_event_handler(Box::new(|_: &[u8]| {}));
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_filters: self.config.max_filters,
            window_accuracy_ms: self.config.window_accuracy_ms,
        }
    }

    pub fn state(&self) -> Lifecycle {
        match &self.radio {
            None => Lifecycle::Uninitialized,
            Some(radio) if !radio.ready => Lifecycle::Initializing,
            Some(_) if self.scheduler.is_active() => Lifecycle::Active,
            Some(_) => Lifecycle::Ready,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.radio.as_ref().is_some_and(|r| r.ready)
    }

    // ========================================================================
    // TRANSMIT
    // ========================================================================

    /// Queue a packet for transmission
    pub fn send(&mut self, policy: TimingPolicy, payload: &[u8]) -> Result<PacketId, MeshIoError> {
        if self.radio.is_none() {
            return Err(MeshIoError::NotInitialized);
        }
        Ok(self.scheduler.enqueue(policy, payload)?)
    }

    /// Drop queued packets matching `pattern` (one byte: AD type, `0x00` for
    /// all; longer: payload prefix)
    pub fn cancel(&mut self, pattern: &[u8]) -> Result<usize, MeshIoError> {
        let outcome = self.scheduler.cancel_matching(pattern)?;
        // Nothing reaches the pipeline before bring-up is done
        let Some(radio) = self.radio.as_mut().filter(|r| r.ready) else {
            return Ok(outcome.removed.len());
        };

        for id in &outcome.removed {
            if radio.pipeline.cancel_burst(*id) {
                debug!("Burst for cancelled packet {} dropped", id);
            }
        }
        if outcome.stop_advertising {
            if let Err(e) = radio.pipeline.stop(&mut radio.commands) {
                error!("{}", e);
            }
        }
        Ok(outcome.removed.len())
    }

    /// Run every scheduler step due at `now`
    pub fn on_tick(&mut self, now: u32) {
        if !self.is_ready() {
            return;
        }
        while self.scheduler.has_work(now) {
            match self.scheduler.tick(now) {
                Some(TxAction::Transmit(burst)) => self.transmit(burst),
                Some(TxAction::StopAdvertising) => self.stop_advertising(),
                None => {}
            }
        }
    }

    /// Next instant `on_tick` must run at, if any
    pub fn next_deadline(&self) -> Option<u32> {
        if !self.is_ready() {
            return None;
        }
        self.scheduler.next_deadline()
    }

    /// Whether `on_tick` should run right away
    pub fn has_work(&self, now: u32) -> bool {
        self.is_ready() && self.scheduler.has_work(now)
    }

    fn transmit(&mut self, burst: AdvBurst) {
        let Some(radio) = self.radio.as_mut() else {
            return;
        };
        trace!(
            "Transmitting packet {} every {} ms",
            burst.packet_id,
            burst.interval_ms
        );
        match radio.pipeline.transmit(&mut radio.commands, burst) {
            Ok(progress) => self.on_burst_progress(progress),
            Err(e) => {
                error!("{}", e);
                if let Some(id) = e.packet_id() {
                    self.scheduler.burst_finished(id);
                }
            }
        }
        self.release_if_idle();
    }

    /// An idle pipeline has nothing in flight, whatever became of the bursts
    /// queued behind the one that finished
    fn release_if_idle(&mut self) {
        let busy = self.radio.as_ref().is_some_and(|r| r.pipeline.is_busy());
        if !busy {
            if let Some(id) = self.scheduler.in_flight() {
                self.scheduler.burst_finished(id);
            }
        }
    }

    fn stop_advertising(&mut self) {
        if let Some(radio) = self.radio.as_mut() {
            if let Err(e) = radio.pipeline.stop(&mut radio.commands) {
                error!("{}", e);
            }
        }
    }

    fn on_burst_progress(&mut self, progress: BurstProgress) {
        match progress {
            BurstProgress::Completed(id) | BurstProgress::Aborted(id) => {
                self.scheduler.burst_finished(id)
            }
            BurstProgress::Pending => {}
        }
    }

    // ========================================================================
    // RECEIVE
    // ========================================================================

    /// Deliver fields starting with `filter` to `receiver`
    pub fn register_receiver(
        &mut self,
        filter: &[u8],
        receiver: Arc<dyn AdvReceiver>,
    ) -> Result<(), MeshIoError> {
        if self.radio.is_none() {
            return Err(MeshIoError::NotInitialized);
        }
        let before = self.registry.clone();
        let change = self.registry.register(filter, receiver)?;
        self.apply_or_restore(change, before)
    }

    pub fn deregister_receiver(&mut self, filter: &[u8]) -> Result<(), MeshIoError> {
        if self.radio.is_none() {
            return Err(MeshIoError::NotInitialized);
        }
        let before = self.registry.clone();
        let change = self.registry.deregister(filter);
        self.apply_or_restore(change, before)
    }

    /// The registry only keeps a change the radio accepted
    fn apply_or_restore(&mut self, change: ScanChange, before: RxRegistry) -> Result<(), MeshIoError> {
        let result = self.apply_scan_change(change);
        if result.is_err() {
            self.registry = before;
        }
        result
    }

    fn apply_scan_change(&mut self, change: ScanChange) -> Result<(), MeshIoError> {
        let Some(radio) = self.radio.as_mut() else {
            return Err(MeshIoError::NotInitialized);
        };

        let reconfigure = match change {
            ScanChange::None if radio.ready && radio.scan_pending && !self.registry.is_empty() => {
                debug!("Retrying interrupted scan configuration");
                true
            }
            ScanChange::None => return Ok(()),
            ScanChange::Reconfigure { active } => {
                debug!("Reconfiguring scan ({})", if active { "active" } else { "passive" });
                true
            }
            ScanChange::Disable => {
                debug!("No receivers left, disabling scan");
                false
            }
        };

        if !radio.ready {
            // Bring-up programs its own scan parameters; redo ours afterwards
            radio.scan_pending = !self.registry.is_empty();
            return Ok(());
        }

        radio
            .commands
            .submit(
                HciCommand::LeSetScanEnable {
                    enable: false,
                    filter_duplicates: false,
                },
                CompletionTag::ScanDisabled { reconfigure },
            )
            .map_err(|e| {
                error!("Failed to disable scan: {}", e);
                MeshIoError::Radio(e)
            })?;
        radio.scan_pending = false;
        Ok(())
    }

    // ========================================================================
    // RADIO EVENTS
    // ========================================================================

    /// Process one raw controller event received at `now`
    pub fn handle_event(&mut self, buf: &[u8], now: u32) {
        if self.radio.is_none() {
            trace!("Event received without radio, ignoring");
            return;
        }

        let event = match HciEvent::parse(buf) {
            Ok(event) => event,
            Err(e) => {
                warn!("Malformed HCI event dropped: {}", e);
                return;
            }
        };

        match &event {
            HciEvent::CommandComplete { opcode, .. } => {
                let status = event.status().unwrap_or(0);
                self.on_command_complete(*opcode, status);
            }
            HciEvent::CommandStatus { status, opcode, .. } => {
                // Success only means the command was accepted; our commands
                // all finish with a Command Complete.
                if *status != 0 {
                    self.on_command_complete(*opcode, *status);
                }
            }
            HciEvent::LeMeta { subevent, params } if *subevent == LE_SUBEVT_ADV_REPORT => {
                self.on_adv_report(params, now);
            }
            HciEvent::LeMeta { subevent, .. } => {
                debug!("Other LE meta event {:#04x}", subevent);
            }
            HciEvent::Other { code, .. } => {
                trace!("Unhandled event {:#04x}", code);
            }
        }
    }

    fn on_adv_report(&self, params: &[u8], now: u32) {
        let fields = match decode_adv_report(params, now) {
            Ok(fields) => fields,
            Err(e) => {
                warn!("Advertising report dropped: {}", e);
                return;
            }
        };
        for field in fields {
            self.registry.dispatch(&field.info, &field.data);
        }
    }

    fn on_command_complete(&mut self, opcode: u16, status: u8) {
        let Some(radio) = self.radio.as_mut() else {
            return;
        };
        let Some(tag) = radio.commands.complete(opcode) else {
            trace!("Completion for untracked command {:#06x}", opcode);
            return;
        };

        match tag {
            CompletionTag::BringUp(step) => {
                match radio.bring_up.on_complete(&mut radio.commands, step, status) {
                    Ok(BringUpProgress::InProgress) => {}
                    Ok(BringUpProgress::Complete { failures }) => {
                        info!(
                            "Radio {} ready ({} bring-up step(s) failed)",
                            radio.index, failures
                        );
                        self.on_ready();
                    }
                    Err(e) => {
                        error!("Controller bring-up aborted: {}", e);
                        if let Some(cb) = radio.ready_cb.take() {
                            cb(false);
                        }
                    }
                }
            }
            CompletionTag::Burst { burst_id, stage } => {
                let result =
                    radio
                        .pipeline
                        .on_stage_complete(&mut radio.commands, burst_id, stage, status);
                match result {
                    Ok(progress) => self.on_burst_progress(progress),
                    Err(e) => {
                        error!("{}", e);
                        if let Some(id) = e.packet_id() {
                            self.scheduler.burst_finished(id);
                        }
                    }
                }
                self.release_if_idle();
            }
            CompletionTag::AdvertisingStopped => {
                if status != 0 {
                    error!("LE Advertising disable failed ({:#04x})", status);
                }
                if let Err(e) = radio.pipeline.on_stopped(&mut radio.commands) {
                    error!("{}", e);
                }
            }
            CompletionTag::RandomAddressSet => {
                if status != 0 {
                    warn!("LE Set Random Address failed ({:#04x})", status);
                }
            }
            CompletionTag::AdvStats => {
                if status != 0 {
                    warn!("Advertising statistics command failed ({:#04x})", status);
                }
            }
            CompletionTag::ScanDisabled { reconfigure } => {
                if status != 0 {
                    error!("LE Scan disable failed ({:#04x})", status);
                }
                if reconfigure {
                    let params = ScanParameters::mesh(self.registry.is_active());
                    radio.submit_scan_step(
                        HciCommand::LeSetScanParameters(params),
                        CompletionTag::ScanParametersSet,
                    );
                }
            }
            CompletionTag::ScanParametersSet => {
                if status != 0 {
                    error!("LE Set Scan Parameters failed ({:#04x})", status);
                }
                radio.submit_scan_step(
                    HciCommand::LeSetScanEnable {
                        enable: true,
                        filter_duplicates: false,
                    },
                    CompletionTag::ScanEnabled,
                );
            }
            CompletionTag::ScanEnabled => {
                if status != 0 {
                    error!("LE Scan enable failed ({:#04x})", status);
                }
            }
        }
    }

    fn on_ready(&mut self) {
        let Some(radio) = self.radio.as_mut() else {
            return;
        };
        radio.ready = true;
        if let Some(cb) = radio.ready_cb.take() {
            cb(true);
        }
        if std::mem::take(&mut radio.scan_pending) && !self.registry.is_empty() {
            let active = self.registry.is_active();
            if let Err(e) = self.apply_scan_change(ScanChange::Reconfigure { active }) {
                error!("Deferred scan configuration failed: {}", e);
                if let Some(radio) = self.radio.as_mut() {
                    radio.scan_pending = true;
                }
            }
        }
    }

    // ========================================================================
    // INTROSPECTION
    // ========================================================================

    pub fn scheduler(&self) -> &TxScheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &RxRegistry {
        &self.registry
    }

    /// Commands awaiting completion
    pub fn pending_commands(&self) -> usize {
        self.radio.as_ref().map_or(0, |r| r.commands.pending_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BurstMode;
    use crate::adv::RecvInfo;
    use crate::hci::command::opcode;
    use crate::hci::transport::TransportError;
    use crate::hci::virtual_controller::VirtualController;
    use crate::tx::RepeatCount;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    type EventLog = Arc<Mutex<VecDeque<Vec<u8>>>>;

    struct Harness {
        io: MeshIo,
        controller: Arc<VirtualController>,
        events: EventLog,
        ready: Arc<Mutex<Option<bool>>>,
    }

    impl Harness {
        fn new(mode: BurstMode) -> Self {
            Self::with_controller(mode, Arc::new(VirtualController::with_seed(5)))
        }

        fn with_controller(mode: BurstMode, controller: Arc<VirtualController>) -> Self {
            let mut io = MeshIo::new(MeshIoConfig {
                burst_mode: mode,
                rng_seed: Some(11),
                ..MeshIoConfig::default()
            })
            .unwrap();
            let events: EventLog = Arc::new(Mutex::new(VecDeque::new()));
            let ready = Arc::new(Mutex::new(None));

            let sink = events.clone();
            let ready_flag = ready.clone();
            io.init(
                0,
                controller.clone(),
                Box::new(move |buf: &[u8]| sink.lock().push_back(buf.to_vec())),
                Box::new(move |ok| *ready_flag.lock() = Some(ok)),
            )
            .unwrap();

            let mut harness = Self {
                io,
                controller,
                events,
                ready,
            };
            harness.pump(0);
            harness
        }

        /// Deliver queued controller events until quiet
        fn pump(&mut self, now: u32) {
            loop {
                let next = self.events.lock().pop_front();
                match next {
                    Some(event) => self.io.handle_event(&event, now),
                    None => break,
                }
            }
        }

        fn run_until(&mut self, end: u32) {
            let mut now = 0;
            loop {
                self.controller.set_time(now);
                self.io.on_tick(now);
                self.pump(now);
                match self.io.next_deadline() {
                    Some(next) if next <= end => now = next,
                    _ => break,
                }
            }
        }
    }

    #[test]
    fn test_bring_up_reaches_ready() {
        let h = Harness::new(BurstMode::Chained);
        assert_eq!(*h.ready.lock(), Some(true));
        assert_eq!(h.io.state(), Lifecycle::Ready);
        assert_eq!(
            h.controller.opcodes(),
            vec![
                opcode::RESET,
                opcode::READ_LOCAL_COMMANDS,
                opcode::READ_LOCAL_FEATURES,
                opcode::SET_EVENT_MASK,
                opcode::LE_SET_EVENT_MASK,
                opcode::LE_SET_SCAN_PARAMETERS,
            ]
        );
    }

    #[test]
    fn test_bring_up_continues_past_failures() {
        let controller = Arc::new(VirtualController::new());
        controller.set_status(opcode::READ_LOCAL_FEATURES, 0x01);
        let h = Harness::with_controller(BurstMode::Chained, controller);

        assert_eq!(*h.ready.lock(), Some(true));
        assert_eq!(h.controller.opcodes().len(), 6);
    }

    #[test]
    fn test_init_refused_reports_not_ready() {
        let mut io = MeshIo::new(MeshIoConfig::default()).unwrap();
        let controller = Arc::new(VirtualController::new());
        controller.fail_submits(opcode::RESET, TransportError::NotAvailable("hci0".into()));
        let ready = Arc::new(Mutex::new(None));
        let flag = ready.clone();

        let result = io.init(0, controller, Box::new(|_: &[u8]| {}), Box::new(move |ok| *flag.lock() = Some(ok)));
        assert!(matches!(result, Err(MeshIoError::Radio(_))));
        assert_eq!(*ready.lock(), Some(false));
        assert_eq!(io.state(), Lifecycle::Uninitialized);
    }

    #[test]
    fn test_double_init_rejected() {
        let mut h = Harness::new(BurstMode::Chained);
        let result = h.io.init(
            1,
            h.controller.clone(),
            Box::new(|_: &[u8]| {}),
            Box::new(|_| {}),
        );
        assert_eq!(result, Err(MeshIoError::AlreadyInitialized));
    }

    #[test]
    fn test_operations_require_init() {
        let mut io = MeshIo::new(MeshIoConfig::default()).unwrap();
        let policy = TimingPolicy::Poll {
            min_delay: 0,
            max_delay: 0,
        };
        assert_eq!(io.send(policy, &[0x2a, 1]), Err(MeshIoError::NotInitialized));
        assert_eq!(
            io.register_receiver(&[0x2a], Arc::new(|_: &crate::adv::RecvInfo, _: &[u8]| {})),
            Err(MeshIoError::NotInitialized)
        );
        assert_eq!(io.capabilities().max_filters, 255);
    }

    #[test]
    fn test_send_runs_burst_and_stops() {
        let mut h = Harness::new(BurstMode::Chained);
        h.controller.clear_log();
        h.io
            .send(
                TimingPolicy::General {
                    min_delay: 0,
                    max_delay: 0,
                    interval: 100,
                    count: RepeatCount::Times(1),
                },
                &[0x2a, 0x01],
            )
            .unwrap();
        assert_eq!(h.io.state(), Lifecycle::Active);

        h.run_until(1000);
        assert_eq!(h.io.state(), Lifecycle::Ready);
        assert_eq!(
            h.controller.opcodes(),
            vec![
                opcode::LE_SET_ADV_ENABLE,
                opcode::LE_SET_ADV_PARAMETERS,
                opcode::LE_SET_ADV_DATA,
                opcode::LE_SET_ADV_ENABLE,
                opcode::LE_SET_ADV_ENABLE,
                opcode::LE_SET_RANDOM_ADDRESS,
            ]
        );
        assert_eq!(h.io.scheduler().in_flight(), None);
    }

    #[test]
    fn test_register_reconfigures_scan() {
        let mut h = Harness::new(BurstMode::Chained);
        h.controller.clear_log();

        h.io
            .register_receiver(&[0x2b], Arc::new(|_: &crate::adv::RecvInfo, _: &[u8]| {}))
            .unwrap();
        h.pump(0);
        let commands = h.controller.commands();
        assert_eq!(commands.len(), 3);
        assert_eq!(
            commands[0],
            HciCommand::LeSetScanEnable {
                enable: false,
                filter_duplicates: false
            }
        );
        assert_eq!(commands[1], HciCommand::LeSetScanParameters(ScanParameters::mesh(false)));
        assert_eq!(
            commands[2],
            HciCommand::LeSetScanEnable {
                enable: true,
                filter_duplicates: false
            }
        );

        h.controller.clear_log();
        h.io.deregister_receiver(&[0x2b]).unwrap();
        h.pump(0);
        assert_eq!(
            h.controller.commands(),
            vec![HciCommand::LeSetScanEnable {
                enable: false,
                filter_duplicates: false
            }]
        );
    }

    #[test]
    fn test_reports_dispatched_to_receivers() {
        let mut h = Harness::new(BurstMode::Synchronous);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        h.io
            .register_receiver(
                &[0x2b],
                Arc::new(move |info: &crate::adv::RecvInfo, data: &[u8]| {
                    sink.lock().push((info.rssi, data.to_vec()))
                }),
            )
            .unwrap();
        h.pump(0);

        h.controller
            .inject_adv_report(0x03, [1, 2, 3, 4, 5, 6], &[0x03, 0x2b, 0x01, 0x02], -48);
        h.controller.inject_adv_report(0x00, [1, 2, 3, 4, 5, 6], &[0x02, 0x2b, 0x09], -48);
        h.pump(7);

        assert_eq!(*seen.lock(), vec![(-48, vec![0x2b, 0x01, 0x02])]);
    }

    #[test]
    fn test_destroy_returns_to_uninitialized() {
        let mut h = Harness::new(BurstMode::Chained);
        h.io
            .send(
                TimingPolicy::General {
                    min_delay: 50,
                    max_delay: 50,
                    interval: 100,
                    count: RepeatCount::Unlimited,
                },
                &[0x2a, 0x01],
            )
            .unwrap();
        h.io
            .register_receiver(&[0x2a], Arc::new(|_: &crate::adv::RecvInfo, _: &[u8]| {}))
            .unwrap();

        h.io.destroy();
        assert_eq!(h.io.state(), Lifecycle::Uninitialized);
        assert!(h.io.scheduler().queue().is_empty());
        assert!(h.io.registry().is_empty());
        assert_eq!(h.io.next_deadline(), None);
        assert_eq!(h.io.pending_commands(), 0);
    }

    fn adv_data_bytes(controller: &VirtualController) -> Vec<u8> {
        controller
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                HciCommand::LeSetAdvData(data) => Some(data.as_bytes()[2]),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_back_to_back_bursts_all_reach_the_radio() {
        for mode in [BurstMode::Chained, BurstMode::Synchronous] {
            let mut h = Harness::new(mode);
            h.controller.clear_log();

            // Deadlines long gone: every transmission is due at once
            let overdue = TimingPolicy::PollResponse {
                instant: 0,
                delay: 0,
            };
            for byte in 1..=3 {
                h.io.send(overdue, &[0x2a, byte]).unwrap();
            }

            let mut now = 1000;
            loop {
                h.controller.set_time(now);
                h.io.on_tick(now);
                h.pump(now);
                match h.io.next_deadline() {
                    Some(next) if next <= 2000 => now = next,
                    _ => break,
                }
            }

            assert_eq!(adv_data_bytes(&h.controller), vec![3, 2, 1], "{} mode", mode);
            let opcodes = h.controller.opcodes();
            assert_eq!(
                &opcodes[opcodes.len() - 2..],
                &[opcode::LE_SET_ADV_ENABLE, opcode::LE_SET_RANDOM_ADDRESS]
            );
            assert_eq!(h.io.scheduler().in_flight(), None);
            assert_eq!(h.io.state(), Lifecycle::Ready);
        }
    }

    #[test]
    fn test_refused_scan_change_leaves_registry_untouched() {
        let mut h = Harness::new(BurstMode::Chained);
        h.io
            .register_receiver(&[0x2b], Arc::new(|_: &RecvInfo, _: &[u8]| {}))
            .unwrap();
        h.pump(0);
        assert!(!h.io.registry().is_active());

        h.controller
            .fail_submits(opcode::LE_SET_SCAN_ENABLE, TransportError::QueueFull);
        let result = h
            .io
            .register_receiver(&[0x16], Arc::new(|_: &RecvInfo, _: &[u8]| {}));
        assert_eq!(result, Err(MeshIoError::Radio(TransportError::QueueFull)));
        assert_eq!(h.io.registry().len(), 1);
        assert!(!h.io.registry().is_active());

        assert!(h.io.deregister_receiver(&[0x2b]).is_err());
        assert_eq!(h.io.registry().len(), 1);

        h.controller.clear_failures();
        h.controller.clear_log();
        h.io
            .register_receiver(&[0x16], Arc::new(|_: &RecvInfo, _: &[u8]| {}))
            .unwrap();
        h.pump(0);
        assert!(h.io.registry().is_active());
        assert_eq!(
            h.controller.commands(),
            vec![
                HciCommand::LeSetScanEnable {
                    enable: false,
                    filter_duplicates: false
                },
                HciCommand::LeSetScanParameters(ScanParameters::mesh(true)),
                HciCommand::LeSetScanEnable {
                    enable: true,
                    filter_duplicates: false
                },
            ]
        );
    }

    #[test]
    fn test_interrupted_scan_setup_retried_on_next_change() {
        let mut h = Harness::new(BurstMode::Chained);
        h.controller
            .fail_submits(opcode::LE_SET_SCAN_PARAMETERS, TransportError::QueueFull);
        h.io
            .register_receiver(&[0x2b], Arc::new(|_: &RecvInfo, _: &[u8]| {}))
            .unwrap();
        h.pump(0);

        h.controller.clear_failures();
        h.controller.clear_log();
        // Same scan mode, but the earlier setup never finished
        h.io
            .register_receiver(&[0x2a], Arc::new(|_: &RecvInfo, _: &[u8]| {}))
            .unwrap();
        h.pump(0);
        assert_eq!(
            h.controller.opcodes(),
            vec![
                opcode::LE_SET_SCAN_ENABLE,
                opcode::LE_SET_SCAN_PARAMETERS,
                opcode::LE_SET_SCAN_ENABLE,
            ]
        );

        h.controller.clear_log();
        h.io
            .register_receiver(&[0x29], Arc::new(|_: &RecvInfo, _: &[u8]| {}))
            .unwrap();
        h.pump(0);
        assert!(h.controller.opcodes().is_empty());
    }

    #[test]
    fn test_cancel_during_bring_up_stays_off_the_radio() {
        let controller = Arc::new(VirtualController::new());
        let mut io = MeshIo::new(MeshIoConfig::default()).unwrap();
        io.init(0, controller.clone(), Box::new(|_: &[u8]| {}), Box::new(|_| {}))
            .unwrap();
        assert_eq!(io.state(), Lifecycle::Initializing);

        let poll = TimingPolicy::Poll {
            min_delay: 0,
            max_delay: 0,
        };
        io.send(poll, &[0x2a, 0x01]).unwrap();
        assert_eq!(io.cancel(&[0x2a]), Ok(1));
        assert_eq!(controller.opcodes(), vec![opcode::RESET]);
    }
}
