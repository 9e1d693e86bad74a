// Integration test: radio command pipeline against a mocked HCI transport
//
// Verifies blocking-write retries, the bring-up sequence, and that every
// burst reaches the controller as disable → parameters → data → enable.

use meshio_core::config::{BurstMode, MeshIoConfig};
use meshio_core::hci::command::opcode;
use meshio_core::hci::{
    AdvBurst, AdvData, AdvertisingPipeline, BurstProgress, CommandQueue, EventHandler, HciCommand,
    HciEvent, HciTransport, SyncPipeline, TransportError, MAX_WRITE_RETRIES,
};
use meshio_core::tx::{PacketId, RepeatCount, TimingPolicy};
use meshio_core::{MeshIo, MeshIoError};
use mockall::{mock, Sequence};
use parking_lot::Mutex;
use std::sync::Arc;

mock! {
    pub Radio {}

    impl HciTransport for Radio {
        fn submit(&self, command: &HciCommand) -> Result<(), TransportError>;
        fn write_blocking(&self, command: &HciCommand) -> Result<(), TransportError>;
        fn register_event_handler(&self, handler: EventHandler);
        fn random_bytes(&self, buf: &mut [u8]);
    }
}

fn burst(id: u64) -> AdvBurst {
    AdvBurst {
        packet_id: PacketId(id),
        interval_ms: 100,
        data: AdvData::from_packet(&[0x2a, 0x01, 0x02]).unwrap(),
        stats: None,
    }
}

/// Mock that accepts every submission and records its opcode
fn recording_radio(log: Arc<Mutex<Vec<u16>>>) -> MockRadio {
    let mut radio = MockRadio::new();
    radio.expect_register_event_handler().returning(|_| ());
    radio.expect_submit().returning(move |cmd| {
        log.lock().push(cmd.opcode());
        Ok(())
    });
    radio.expect_random_bytes().returning(|buf| buf.fill(0x5a));
    radio
}

/// Answer every recorded command not yet completed with a success
fn complete_recorded(io: &mut MeshIo, log: &Arc<Mutex<Vec<u16>>>, done: &mut usize) {
    loop {
        let next = log.lock().get(*done).copied();
        let Some(op) = next else {
            break;
        };
        *done += 1;
        io.handle_event(&HciEvent::command_complete(op, 0), 0);
    }
}

#[test]
fn test_blocking_write_retries_transient_errors() {
    let mut radio = MockRadio::new();
    let mut attempts = 0;
    radio.expect_write_blocking().times(4).returning(move |_| {
        attempts += 1;
        if attempts < 4 {
            Err(TransportError::WouldBlock)
        } else {
            Ok(())
        }
    });

    let queue = CommandQueue::new(Arc::new(radio));
    assert_eq!(queue.write_blocking(&HciCommand::LeSetAdvEnable(false)), Ok(()));
}

#[test]
fn test_blocking_write_gives_up_after_retry_budget() {
    let mut radio = MockRadio::new();
    radio
        .expect_write_blocking()
        .times(MAX_WRITE_RETRIES + 1)
        .returning(|_| Err(TransportError::Interrupted));

    let queue = CommandQueue::new(Arc::new(radio));
    assert_eq!(
        queue.write_blocking(&HciCommand::LeSetAdvEnable(false)),
        Err(TransportError::Interrupted)
    );
}

#[test]
fn test_hard_write_error_is_not_retried() {
    let mut radio = MockRadio::new();
    radio
        .expect_write_blocking()
        .times(1)
        .returning(|_| Err(TransportError::Io("broken pipe".into())));

    let queue = CommandQueue::new(Arc::new(radio));
    assert!(queue.write_blocking(&HciCommand::Reset).is_err());
}

#[test]
fn test_sync_burst_writes_steps_in_order() {
    let mut radio = MockRadio::new();
    let mut seq = Sequence::new();
    radio.expect_submit().never();
    for expected in [
        opcode::LE_SET_ADV_ENABLE,
        opcode::LE_SET_ADV_PARAMETERS,
        opcode::LE_SET_ADV_DATA,
        opcode::LE_SET_ADV_ENABLE,
    ] {
        radio
            .expect_write_blocking()
            .withf(move |cmd: &HciCommand| cmd.opcode() == expected)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
    }

    let mut queue = CommandQueue::new(Arc::new(radio));
    let mut pipeline = SyncPipeline::new();
    assert_eq!(
        pipeline.transmit(&mut queue, burst(1)).unwrap(),
        BurstProgress::Completed(PacketId(1))
    );
}

#[test]
fn test_bring_up_sequence_then_ready() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let radio = recording_radio(log.clone());
    let ready = Arc::new(Mutex::new(None));
    let flag = ready.clone();

    let mut io = MeshIo::new(MeshIoConfig::default()).unwrap();
    io.init(
        0,
        Arc::new(radio),
        Box::new(|_: &[u8]| {}),
        Box::new(move |ok| *flag.lock() = Some(ok)),
    )
    .unwrap();
    assert_eq!(*log.lock(), vec![opcode::RESET]);
    assert_eq!(*ready.lock(), None);

    let mut done = 0;
    complete_recorded(&mut io, &log, &mut done);
    assert_eq!(
        *log.lock(),
        vec![
            opcode::RESET,
            opcode::READ_LOCAL_COMMANDS,
            opcode::READ_LOCAL_FEATURES,
            opcode::SET_EVENT_MASK,
            opcode::LE_SET_EVENT_MASK,
            opcode::LE_SET_SCAN_PARAMETERS,
        ]
    );
    assert_eq!(*ready.lock(), Some(true));
}

#[test]
fn test_refused_reset_reports_not_ready() {
    let mut radio = MockRadio::new();
    radio.expect_register_event_handler().returning(|_| ());
    radio
        .expect_submit()
        .times(1)
        .returning(|_| Err(TransportError::NotAvailable("hci0".into())));

    let ready = Arc::new(Mutex::new(None));
    let flag = ready.clone();
    let mut io = MeshIo::new(MeshIoConfig::default()).unwrap();
    let result = io.init(
        0,
        Arc::new(radio),
        Box::new(|_: &[u8]| {}),
        Box::new(move |ok| *flag.lock() = Some(ok)),
    );

    assert!(matches!(result, Err(MeshIoError::Radio(_))));
    assert_eq!(*ready.lock(), Some(false));
}

#[test]
fn test_chained_bursts_never_interleave() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let radio = recording_radio(log.clone());
    let mut io = MeshIo::new(MeshIoConfig {
        burst_mode: BurstMode::Chained,
        rng_seed: Some(4),
        ..MeshIoConfig::default()
    })
    .unwrap();
    io.init(0, Arc::new(radio), Box::new(|_: &[u8]| {}), Box::new(|_| {}))
        .unwrap();
    let mut done = 0;
    complete_recorded(&mut io, &log, &mut done);
    let bring_up = log.lock().len();

    let immediate = TimingPolicy::General {
        min_delay: 0,
        max_delay: 0,
        interval: 20,
        count: RepeatCount::Times(2),
    };
    io.send(immediate, &[0x2a, 0x01]).unwrap();
    io.send(immediate, &[0x2a, 0x02]).unwrap();

    // Step the clock, answering one command per step at most
    for now in 0..200 {
        io.on_tick(now);
        let next = log.lock().get(done).copied();
        if let Some(op) = next {
            done += 1;
            io.handle_event(&HciEvent::command_complete(op, 0), now);
        }
    }

    let sent: Vec<u16> = log.lock()[bring_up..].to_vec();
    let burst_ops = [
        opcode::LE_SET_ADV_ENABLE,
        opcode::LE_SET_ADV_PARAMETERS,
        opcode::LE_SET_ADV_DATA,
        opcode::LE_SET_ADV_ENABLE,
    ];
    // Four bursts, then the stop disable and an address rotation
    assert_eq!(sent.len(), 4 * 4 + 2);
    for chunk in sent[..16].chunks(4) {
        assert_eq!(chunk, burst_ops);
    }
    assert_eq!(
        &sent[16..],
        &[opcode::LE_SET_ADV_ENABLE, opcode::LE_SET_RANDOM_ADDRESS]
    );
}
