// Virtual-time simulation of the mesh bearer
//
// Runs a schedule of sends, cancels and received reports through the core
// against the in-process controller. Time only moves when nothing is due, so
// a run is deterministic for a given config.

use crate::config::Config;
use anyhow::{Context, Result};
use meshio_core::hci::{RecordedCommand, VirtualController, WriteMode};
use meshio_core::{MeshIo, RecvInfo, RepeatCount, TimingPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Address used for injected advertising reports
const PEER_ADDR: [u8; 6] = [0x01, 0x02, 0x03, 0x04, 0x05, 0xc1];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub at_ms: u32,
    #[serde(flatten)]
    pub action: ScheduleAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleAction {
    /// Queue a packet; `payload` is hex, AD type first
    Send { policy: TimingPolicy, payload: String },
    /// Cancel queued packets matching a hex pattern
    Cancel { pattern: String },
    /// Deliver advertising data as a non-connectable report
    Receive {
        data: String,
        #[serde(default = "default_rssi")]
        rssi: i8,
    },
}

fn default_rssi() -> i8 {
    -60
}

/// One line of the simulation output
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub at_ms: u32,
    #[serde(flatten)]
    pub kind: TimelineKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TimelineKind {
    Command {
        mode: String,
        name: String,
        opcode: String,
        params: String,
    },
    Queued {
        id: u64,
        payload: String,
    },
    Rejected {
        error: String,
    },
    Cancelled {
        removed: usize,
    },
    Received {
        from: String,
        rssi: i8,
        data: String,
    },
}

impl TimelineKind {
    fn command(record: &RecordedCommand) -> Self {
        let mode = match record.mode {
            WriteMode::Submitted => "submit",
            WriteMode::Written => "write",
        };
        TimelineKind::Command {
            mode: mode.to_string(),
            name: record.command.name().to_string(),
            opcode: format!("{:#06x}", record.command.opcode()),
            params: hex::encode(record.command.params()),
        }
    }
}

/// Built-in schedule: a repeated network packet and a poll response that
/// overtakes it
pub fn demo_schedule() -> Vec<ScheduleEntry> {
    vec![
        ScheduleEntry {
            at_ms: 0,
            action: ScheduleAction::Send {
                policy: TimingPolicy::General {
                    min_delay: 10,
                    max_delay: 10,
                    interval: 100,
                    count: RepeatCount::Times(3),
                },
                payload: "2aaa".to_string(),
            },
        },
        ScheduleEntry {
            at_ms: 5,
            action: ScheduleAction::Send {
                policy: TimingPolicy::PollResponse {
                    instant: 0,
                    delay: 20,
                },
                payload: "2abb".to_string(),
            },
        },
    ]
}

pub fn load_schedule(path: &Path) -> Result<Vec<ScheduleEntry>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schedule {}", path.display()))?;
    serde_json::from_str(&contents).context("Failed to parse schedule")
}

pub struct Simulation {
    io: MeshIo,
    controller: Arc<VirtualController>,
    events: mpsc::UnboundedReceiver<Vec<u8>>,
    received_tx: mpsc::UnboundedSender<(RecvInfo, Vec<u8>)>,
    received: mpsc::UnboundedReceiver<(RecvInfo, Vec<u8>)>,
    timeline: Vec<TimelineEntry>,
    seen_records: usize,
    now: u32,
}

impl Simulation {
    /// Attach a virtual controller and run bring-up
    pub fn new(config: &Config) -> Result<Self> {
        let mut io = MeshIo::new(config.mesh.clone())?;
        let controller = Arc::new(VirtualController::with_seed(config.simulation.controller_seed));
        let (event_tx, events) = mpsc::unbounded_channel();
        let (received_tx, received) = mpsc::unbounded_channel();

        io.init(
            config.simulation.radio_index,
            controller.clone(),
            Box::new(move |buf: &[u8]| {
                let _ = event_tx.send(buf.to_vec());
            }),
            Box::new(|ok| tracing::debug!("Virtual radio ready: {}", ok)),
        )?;

        let mut sim = Self {
            io,
            controller,
            events,
            received_tx,
            received,
            timeline: Vec::new(),
            seen_records: 0,
            now: 0,
        };
        sim.settle();
        anyhow::ensure!(sim.io.is_ready(), "Virtual controller bring-up did not finish");
        Ok(sim)
    }

    /// Receive advertising data starting with `filter`
    pub fn listen(&mut self, filter: &[u8]) -> Result<()> {
        let sink = self.received_tx.clone();
        self.io.register_receiver(
            filter,
            Arc::new(move |info: &RecvInfo, data: &[u8]| {
                let _ = sink.send((*info, data.to_vec()));
            }),
        )?;
        self.settle();
        Ok(())
    }

    /// Hide the commands issued so far (bring-up, scan setup)
    pub fn clear_timeline(&mut self) {
        self.settle();
        self.timeline.clear();
    }

    pub fn run(&mut self, schedule: &[ScheduleEntry], duration_ms: u32) -> Result<Vec<TimelineEntry>> {
        let mut schedule = schedule.to_vec();
        schedule.sort_by_key(|e| e.at_ms);
        let mut pending = schedule.iter().peekable();

        loop {
            self.controller.set_time(self.now);
            while let Some(entry) = pending.next_if(|e| e.at_ms <= self.now) {
                self.apply(&entry.action)?;
            }
            self.settle();

            let next_entry = pending.peek().map(|e| e.at_ms);
            let next = match (next_entry, self.io.next_deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match next {
                Some(next) if next <= duration_ms => self.now = next.max(self.now + 1),
                _ => break,
            }
        }

        Ok(std::mem::take(&mut self.timeline))
    }

    fn apply(&mut self, action: &ScheduleAction) -> Result<()> {
        match action {
            ScheduleAction::Send { policy, payload } => {
                let payload = hex::decode(payload).context("Invalid payload hex")?;
                let kind = match self.io.send(*policy, &payload) {
                    Ok(id) => TimelineKind::Queued {
                        id: id.0,
                        payload: hex::encode(&payload),
                    },
                    Err(e) => TimelineKind::Rejected {
                        error: e.to_string(),
                    },
                };
                self.push(kind);
            }
            ScheduleAction::Cancel { pattern } => {
                let pattern = hex::decode(pattern).context("Invalid pattern hex")?;
                match self.io.cancel(&pattern) {
                    Ok(removed) => self.push(TimelineKind::Cancelled { removed }),
                    Err(e) => self.push(TimelineKind::Rejected {
                        error: e.to_string(),
                    }),
                }
            }
            ScheduleAction::Receive { data, rssi } => {
                let data = hex::decode(data).context("Invalid advertising data hex")?;
                self.controller.inject_adv_report(0x03, PEER_ADDR, &data, *rssi);
            }
        }
        Ok(())
    }

    /// Deliver controller events and run due work until nothing is left
    fn settle(&mut self) {
        loop {
            self.drain_records();
            if let Ok(event) = self.events.try_recv() {
                self.io.handle_event(&event, self.now);
                self.drain_received();
                continue;
            }
            if self.io.has_work(self.now) {
                self.io.on_tick(self.now);
                continue;
            }
            break;
        }
    }

    fn drain_records(&mut self) {
        let records = self.controller.records();
        for record in &records[self.seen_records..] {
            self.timeline.push(TimelineEntry {
                at_ms: record.at_ms,
                kind: TimelineKind::command(record),
            });
        }
        self.seen_records = records.len();
    }

    fn drain_received(&mut self) {
        while let Ok((info, data)) = self.received.try_recv() {
            self.timeline.push(TimelineEntry {
                at_ms: info.instant,
                kind: TimelineKind::Received {
                    from: hex::encode(info.addr),
                    rssi: info.rssi,
                    data: hex::encode(data),
                },
            });
        }
    }

    fn push(&mut self, kind: TimelineKind) {
        self.timeline.push(TimelineEntry {
            at_ms: self.now,
            kind,
        });
    }
}
