//! Per-flow tasks.
//!
//! A scheduler or a receiver is moved into its own tokio task and driven by an
//! event channel. All mutations of one flow's state happen inside that task,
//! one event at a time; waiting for capacity is simply waiting for the next
//! event. The first fatal error ends the task and is returned by `join`.

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{Error, Result, TransportError};
use crate::multipath::{
    DeliveredUnit, MultipathReceiver, PathScheduler, ReassemblyStats, SchedulerState, SchedulerStats,
    TransportChannel,
};
use crate::types::{FlowId, PathId};
use crate::util::DrawSource;

/// Default capacity of event and delivery channels.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Input to a sender task.
#[derive(Debug, Clone)]
pub enum SenderEvent {
    /// One application unit to send.
    Send(Bytes),
    /// The channel of this path freed capacity.
    CapacityAvailable(PathId),
    Stop,
    Close,
}

/// Input to a receiver task.
#[derive(Debug, Clone)]
pub enum ReceiverEvent {
    /// Bytes or a datagram received on `path`.
    Data { path: PathId, bytes: Bytes },
    Teardown,
}

/// Final state of a sender task.
#[derive(Debug, Clone, Serialize)]
pub struct SenderReport {
    pub flow: FlowId,
    pub state: SchedulerState,
    pub stats: SchedulerStats,
    pub discarded: usize,
    /// Units transmitted on each path.
    pub per_path: Vec<(PathId, u64)>,
}

/// Final state of a receiver task.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReceiverReport {
    pub flow: FlowId,
    pub stats: ReassemblyStats,
    /// Units still buffered at teardown.
    pub lost: usize,
}

/// Handle to a running sender task.
#[derive(Debug)]
pub struct SenderHandle {
    flow: FlowId,
    events: mpsc::Sender<SenderEvent>,
    task: JoinHandle<Result<SenderReport>>,
}

impl SenderHandle {
    pub fn flow(&self) -> FlowId {
        self.flow
    }

    /// A sender for events from other tasks, e.g. a channel signalling capacity.
    pub fn events(&self) -> mpsc::Sender<SenderEvent> {
        self.events.clone()
    }

    pub async fn send(&self, payload: Bytes) -> Result<()> {
        self.event(SenderEvent::Send(payload)).await
    }

    pub async fn capacity_available(&self, path: PathId) -> Result<()> {
        self.event(SenderEvent::CapacityAvailable(path)).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.event(SenderEvent::Stop).await
    }

    pub async fn close(&self) -> Result<()> {
        self.event(SenderEvent::Close).await
    }

    /// Wait for the task to end.
    pub async fn join(self) -> Result<SenderReport> {
        drop(self.events);
        self.task
            .await
            .map_err(|e| Error::Internal(format!("sender task for {} failed: {e}", self.flow)))?
    }

    async fn event(&self, event: SenderEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| TransportError::EventChannelClosed.into())
    }
}

/// Handle to a running receiver task.
#[derive(Debug)]
pub struct ReceiverHandle {
    flow: FlowId,
    events: mpsc::Sender<ReceiverEvent>,
    task: JoinHandle<Result<ReceiverReport>>,
}

impl ReceiverHandle {
    pub fn flow(&self) -> FlowId {
        self.flow
    }

    pub fn events(&self) -> mpsc::Sender<ReceiverEvent> {
        self.events.clone()
    }

    pub async fn data(&self, path: PathId, bytes: Bytes) -> Result<()> {
        self.event(ReceiverEvent::Data { path, bytes }).await
    }

    pub async fn teardown(&self) -> Result<()> {
        self.event(ReceiverEvent::Teardown).await
    }

    pub async fn join(self) -> Result<ReceiverReport> {
        drop(self.events);
        self.task
            .await
            .map_err(|e| Error::Internal(format!("receiver task for {} failed: {e}", self.flow)))?
    }

    async fn event(&self, event: ReceiverEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| TransportError::EventChannelClosed.into())
    }
}

/// Move `scheduler` into a task. An idle scheduler is started first.
///
/// The task ends after `Close`, when every event sender is dropped, or on the
/// first error. Channels are released in every case.
pub fn spawn_sender<C, D>(mut scheduler: PathScheduler<C, D>, buffer: usize) -> SenderHandle
where
    C: TransportChannel + 'static,
    D: DrawSource + 'static,
{
    let flow = scheduler.flow();
    let (tx, mut rx) = mpsc::channel(buffer.max(1));

    let task = tokio::spawn(async move {
        let mut discarded = 0;
        let result = async {
            if scheduler.state() == SchedulerState::Idle {
                scheduler.start()?;
            }
            while let Some(event) = rx.recv().await {
                match event {
                    SenderEvent::Send(payload) => {
                        scheduler.send(payload)?;
                    }
                    SenderEvent::CapacityAvailable(path) => {
                        scheduler.on_capacity_available(path)?;
                    }
                    SenderEvent::Stop => discarded += scheduler.stop()?,
                    SenderEvent::Close => {
                        discarded += scheduler.close()?;
                        break;
                    }
                }
            }
            Ok::<_, Error>(())
        }
        .await;

        if scheduler.state() != SchedulerState::Closed {
            match scheduler.close() {
                Ok(n) => discarded += n,
                Err(e) => debug!(flow = %flow, error = %e, "Close after sender exit failed"),
            }
        }

        match result {
            Ok(()) => {
                debug!(flow = %flow, sent = scheduler.stats().units_sent, "Sender task finished");
                Ok(SenderReport {
                    flow,
                    state: scheduler.state(),
                    stats: scheduler.stats(),
                    discarded,
                    per_path: scheduler
                        .path_ids()
                        .map(|path| (path, scheduler.sent_on(path)))
                        .collect(),
                })
            }
            Err(e) => {
                error!(flow = %flow, error = %e, "Sender halted");
                Err(e)
            }
        }
    });

    SenderHandle {
        flow,
        events: tx,
        task,
    }
}

/// Move `receiver` into a task; in-order units come out of the returned channel.
///
/// Deliveries are dropped silently once the application side is gone.
pub fn spawn_receiver(
    mut receiver: MultipathReceiver,
    buffer: usize,
) -> (ReceiverHandle, mpsc::Receiver<DeliveredUnit>) {
    let flow = receiver.flow();
    let (tx, mut rx) = mpsc::channel(buffer.max(1));
    let (out_tx, out_rx) = mpsc::channel(buffer.max(1));

    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ReceiverEvent::Data { path, bytes } => {
                    let delivered = match receiver.on_receive(path, bytes) {
                        Ok(delivered) => delivered,
                        Err(e) => {
                            error!(flow = %flow, path = %path, error = %e, "Receiver halted");
                            return Err(e);
                        }
                    };
                    for unit in delivered {
                        if out_tx.send(unit).await.is_err() {
                            debug!(flow = %flow, "Delivery channel closed");
                        }
                    }
                }
                ReceiverEvent::Teardown => break,
            }
        }

        let stats = receiver.stats();
        let lost = receiver.teardown();
        Ok(ReceiverReport { flow, stats, lost })
    });

    (
        ReceiverHandle {
            flow,
            events: tx,
            task,
        },
        out_rx,
    )
}
