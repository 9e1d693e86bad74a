// Mesh I/O service: the running radio task
//
// Owns a MeshIo facade on a single tokio task. Callers talk to it through a
// cloneable MeshIoHandle; controller events come in on a channel fed by the
// transport's event handler; the transmit timer is a sleep on the facade's
// next deadline. Everything that touches the radio runs on this one task.

use crate::config::MeshIoConfig;
use crate::hci::transport::HciTransport;
use crate::io::{Capabilities, Lifecycle, MeshIo, ReadyCallback};
use crate::rx::AdvReceiver;
use crate::tx::{PacketId, TimingPolicy};
use crate::MeshIoError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Commands that can be sent to the mesh I/O task
pub enum MeshIoCommand {
    Init {
        radio_index: u16,
        transport: Arc<dyn HciTransport>,
        ready: ReadyCallback,
        reply: mpsc::Sender<Result<(), MeshIoError>>,
    },
    Destroy {
        reply: mpsc::Sender<()>,
    },
    Capabilities {
        reply: mpsc::Sender<Capabilities>,
    },
    State {
        reply: mpsc::Sender<Lifecycle>,
    },
    Send {
        policy: TimingPolicy,
        payload: Vec<u8>,
        reply: mpsc::Sender<Result<PacketId, MeshIoError>>,
    },
    RegisterReceiver {
        filter: Vec<u8>,
        receiver: Arc<dyn AdvReceiver>,
        reply: mpsc::Sender<Result<(), MeshIoError>>,
    },
    DeregisterReceiver {
        filter: Vec<u8>,
        reply: mpsc::Sender<Result<(), MeshIoError>>,
    },
    Cancel {
        pattern: Vec<u8>,
        reply: mpsc::Sender<Result<usize, MeshIoError>>,
    },
    /// Stop the task
    Shutdown,
}

/// Millisecond clock shared by the task and its handles
#[derive(Debug, Clone, Copy)]
pub struct MeshClock {
    epoch: Instant,
}

impl MeshClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since the service started, wrapping at `u32::MAX`
    pub fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Wall instant of a millisecond deadline; past deadlines map to now
    pub fn instant_at(&self, deadline_ms: u32) -> Instant {
        let ahead = deadline_ms.wrapping_sub(self.now_ms()) as i32;
        Instant::now() + Duration::from_millis(ahead.max(0) as u64)
    }
}

impl Default for MeshClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the running mesh I/O task
#[derive(Clone)]
pub struct MeshIoHandle {
    command_tx: mpsc::Sender<MeshIoCommand>,
    clock: MeshClock,
}

impl MeshIoHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(mpsc::Sender<T>) -> MeshIoCommand,
    ) -> Result<T, MeshIoError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| MeshIoError::ServiceStopped)?;
        reply_rx.recv().await.ok_or(MeshIoError::ServiceStopped)
    }

    /// Attach a radio and wait for bring-up. Returns whether the controller
    /// reported ready.
    pub async fn init(
        &self,
        radio_index: u16,
        transport: Arc<dyn HciTransport>,
    ) -> Result<bool, MeshIoError> {
        let (ready_tx, mut ready_rx) = mpsc::channel(1);
        let ready: ReadyCallback = Box::new(move |ok| {
            let _ = ready_tx.try_send(ok);
        });
        self.request(|reply| MeshIoCommand::Init {
            radio_index,
            transport,
            ready,
            reply,
        })
        .await??;
        Ok(ready_rx.recv().await.unwrap_or(false))
    }

    pub async fn destroy(&self) -> Result<(), MeshIoError> {
        self.request(|reply| MeshIoCommand::Destroy { reply }).await
    }

    pub async fn capabilities(&self) -> Result<Capabilities, MeshIoError> {
        self.request(|reply| MeshIoCommand::Capabilities { reply }).await
    }

    pub async fn state(&self) -> Result<Lifecycle, MeshIoError> {
        self.request(|reply| MeshIoCommand::State { reply }).await
    }

    /// Queue a packet for transmission
    pub async fn send(&self, policy: TimingPolicy, payload: &[u8]) -> Result<PacketId, MeshIoError> {
        let payload = payload.to_vec();
        self.request(|reply| MeshIoCommand::Send {
            policy,
            payload,
            reply,
        })
        .await?
    }

    pub async fn register_receiver(
        &self,
        filter: &[u8],
        receiver: Arc<dyn AdvReceiver>,
    ) -> Result<(), MeshIoError> {
        let filter = filter.to_vec();
        self.request(|reply| MeshIoCommand::RegisterReceiver {
            filter,
            receiver,
            reply,
        })
        .await?
    }

    pub async fn deregister_receiver(&self, filter: &[u8]) -> Result<(), MeshIoError> {
        let filter = filter.to_vec();
        self.request(|reply| MeshIoCommand::DeregisterReceiver { filter, reply })
            .await?
    }

    /// Drop queued packets matching `pattern`; returns how many were removed
    pub async fn cancel(&self, pattern: &[u8]) -> Result<usize, MeshIoError> {
        let pattern = pattern.to_vec();
        self.request(|reply| MeshIoCommand::Cancel { pattern, reply })
            .await?
    }

    /// Current instant on the service clock (ms)
    pub fn instant(&self) -> u32 {
        self.clock.now_ms()
    }

    pub fn clock(&self) -> MeshClock {
        self.clock
    }

    /// Stop the task. Pending packets are dropped.
    pub async fn shutdown(&self) -> Result<(), MeshIoError> {
        self.command_tx
            .send(MeshIoCommand::Shutdown)
            .await
            .map_err(|_| MeshIoError::ServiceStopped)
    }
}

/// Start the mesh I/O task, returning a handle for communication.
///
/// Must be called from within a tokio runtime.
pub fn spawn_mesh_io(config: MeshIoConfig) -> Result<MeshIoHandle, MeshIoError> {
    let channel_size = config.command_channel_size;
    let mut io = MeshIo::new(config)?;
    let clock = MeshClock::new();

    let (command_tx, mut command_rx) = mpsc::channel::<MeshIoCommand>(channel_size);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let handle = MeshIoHandle { command_tx, clock };

    tokio::spawn(async move {
        tracing::info!("Mesh I/O task started");
        loop {
            io.on_tick(clock.now_ms());
            let wake_at = io.next_deadline().map(|d| clock.instant_at(d));

            tokio::select! {
                // Controller events first: a command must see every
                // completion that arrived before it
                biased;

                Some(event) = event_rx.recv() => {
                    io.handle_event(&event, clock.now_ms());
                }

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("All mesh I/O handles dropped");
                        break;
                    };
                    if !handle_command(&mut io, command, &event_tx) {
                        break;
                    }
                }

                _ = sleep_until(wake_at) => {}
            }
        }
        io.destroy();
        tracing::info!("Mesh I/O task stopped");
    });

    Ok(handle)
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Returns `false` when the task should stop
fn handle_command(
    io: &mut MeshIo,
    command: MeshIoCommand,
    event_tx: &mpsc::UnboundedSender<Vec<u8>>,
) -> bool {
    match command {
        MeshIoCommand::Init {
            radio_index,
            transport,
            ready,
            reply,
        } => {
            let event_tx = event_tx.clone();
            let events = Box::new(move |buf: &[u8]| {
                let _ = event_tx.send(buf.to_vec());
            });
            let _ = reply.try_send(io.init(radio_index, transport, events, ready));
        }
        MeshIoCommand::Destroy { reply } => {
            io.destroy();
            let _ = reply.try_send(());
        }
        MeshIoCommand::Capabilities { reply } => {
            let _ = reply.try_send(io.capabilities());
        }
        MeshIoCommand::State { reply } => {
            let _ = reply.try_send(io.state());
        }
        MeshIoCommand::Send {
            policy,
            payload,
            reply,
        } => {
            let result = io.send(policy, &payload);
            if let Err(e) = &result {
                tracing::debug!("Send rejected: {}", e);
            }
            let _ = reply.try_send(result);
        }
        MeshIoCommand::RegisterReceiver {
            filter,
            receiver,
            reply,
        } => {
            let _ = reply.try_send(io.register_receiver(&filter, receiver));
        }
        MeshIoCommand::DeregisterReceiver { filter, reply } => {
            let _ = reply.try_send(io.deregister_receiver(&filter));
        }
        MeshIoCommand::Cancel { pattern, reply } => {
            let _ = reply.try_send(io.cancel(&pattern));
        }
        MeshIoCommand::Shutdown => {
            tracing::info!("Mesh I/O shutting down");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_tracks_paused_time() {
        let clock = MeshClock::new();
        assert_eq!(clock.now_ms(), 0);
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.now_ms(), 1500);

        let past = clock.instant_at(1000);
        assert!(past <= Instant::now());
        let future = clock.instant_at(1600);
        assert_eq!(future - Instant::now(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_handle_after_shutdown_reports_stopped() {
        let handle = spawn_mesh_io(MeshIoConfig::default()).unwrap();
        assert_eq!(handle.capabilities().await.unwrap().max_filters, 255);
        handle.shutdown().await.unwrap();

        // The task drains its channel and exits; later requests fail
        let mut result = handle.state().await;
        for _ in 0..10 {
            if result.is_err() {
                break;
            }
            tokio::task::yield_now().await;
            result = handle.state().await;
        }
        assert_eq!(result, Err(MeshIoError::ServiceStopped));
    }

    #[tokio::test]
    async fn test_uninitialized_send_rejected() {
        let handle = spawn_mesh_io(MeshIoConfig::default()).unwrap();
        let result = handle
            .send(
                TimingPolicy::Poll {
                    min_delay: 0,
                    max_delay: 0,
                },
                &[0x2a, 1],
            )
            .await;
        assert_eq!(result, Err(MeshIoError::NotInitialized));
        assert_eq!(handle.state().await, Ok(Lifecycle::Uninitialized));
    }
}
