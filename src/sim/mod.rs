//! In-process scenario driver.
//!
//! Runs every configured flow end to end over [`MemoryChannel`]s. Each path
//! gets a link task that serializes units at the path rate, adds the
//! propagation delay plus uniform jitter, and for stream flows hands the
//! receiver arbitrarily sized byte chunks. Delivery on one link is FIFO;
//! reordering only happens across links.
//!
//! Time comes from tokio, so a paused runtime runs a scenario instantly and
//! deterministically.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Uniform};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Config, SimulationConfig};
use crate::error::{Error, Result};
use crate::metrics::{FlowSummary, MemorySink, MetricsSink};
use crate::multipath::{
    FlowSpec, MemoryChannel, MemoryLink, MultipathReceiver, PathScheduler, PathSpec, ReassemblyConfig,
    SchedulerConfig,
};
use crate::runtime::{self, ReceiverEvent, ReceiverReport, SenderEvent, SenderReport};
use crate::types::{FlowId, FlowProtocol, PathId};
use crate::util::{Clock, RandomStreams};

/// Gap between application sends when the flow has no rate of its own.
const FALLBACK_SEND_INTERVAL: Duration = Duration::from_millis(1);

/// How often an idle link checks for new units.
const LINK_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Clock reading tokio time, paused or not.
#[derive(Debug, Clone)]
pub struct TokioClock {
    start: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Outcome of one flow.
#[derive(Debug, Clone, Serialize)]
pub struct FlowReport {
    pub flow: FlowId,
    pub protocol: FlowProtocol,
    pub sender: SenderReport,
    pub receiver: ReceiverReport,
    /// Units transmitted on each path.
    pub per_path: Vec<(PathId, u64)>,
    pub summary: FlowSummary,
    /// Whether the application saw 0, 1, 2, ... without gaps.
    pub in_order: bool,
}

/// Outcome of a whole scenario.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioReport {
    pub flows: Vec<FlowReport>,
}

impl ScenarioReport {
    pub fn flow(&self, id: FlowId) -> Option<&FlowReport> {
        self.flows.iter().find(|f| f.flow == id)
    }
}

/// A validated set of flows ready to run.
#[derive(Debug, Clone)]
pub struct Scenario {
    simulation: SimulationConfig,
    scheduler: SchedulerConfig,
    reassembly: ReassemblyConfig,
    flows: Vec<FlowSpec>,
}

impl Scenario {
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            simulation: config.simulation.clone(),
            scheduler: config.scheduler.clone(),
            reassembly: config.reassembly.clone(),
            flows: config.flows.clone(),
        })
    }

    pub fn flows(&self) -> &[FlowSpec] {
        &self.flows
    }

    /// Run every flow concurrently and collect their reports in flow order.
    ///
    /// The first fatal error of any flow is returned.
    pub async fn run(self) -> Result<ScenarioReport> {
        let sink = Arc::new(MemorySink::new());
        let clock = Arc::new(TokioClock::new());
        let mut streams = RandomStreams::new(self.simulation.seed, self.simulation.run);

        info!(
            flows = self.flows.len(),
            seed = self.simulation.seed,
            run = self.simulation.run,
            "Starting scenario"
        );

        let mut tasks: Vec<(FlowId, JoinHandle<Result<FlowReport>>)> = Vec::new();
        for spec in self.flows {
            // Streams are handed out in flow order so runs are reproducible.
            let rngs = FlowRngs {
                scheduler: streams.next_rng(),
                links: spec.paths.iter().map(|_| streams.next_rng()).collect(),
            };
            let run = FlowRun {
                spec,
                simulation: self.simulation.clone(),
                scheduler: self.scheduler.clone(),
                reassembly: self.reassembly.clone(),
                sink: Arc::clone(&sink),
                clock: Arc::clone(&clock),
            };
            tasks.push((run.spec.id, tokio::spawn(run.run(rngs))));
        }

        let mut report = ScenarioReport::default();
        for (flow, task) in tasks {
            let flow_report = task
                .await
                .map_err(|e| Error::Internal(format!("scenario task for {flow} failed: {e}")))??;
            report.flows.push(flow_report);
        }
        Ok(report)
    }
}

struct FlowRngs {
    scheduler: ChaCha8Rng,
    links: Vec<ChaCha8Rng>,
}

struct FlowRun {
    spec: FlowSpec,
    simulation: SimulationConfig,
    scheduler: SchedulerConfig,
    reassembly: ReassemblyConfig,
    sink: Arc<MemorySink>,
    clock: Arc<TokioClock>,
}

impl FlowRun {
    async fn run(self, rngs: FlowRngs) -> Result<FlowReport> {
        let spec = &self.spec;
        let buffer = self.simulation.event_buffer;

        let mut links: Vec<(PathSpec, MemoryLink)> = Vec::new();
        let scheduler = PathScheduler::for_flow(spec, self.scheduler.clone(), rngs.scheduler, |path| {
            let (tx, rx) = MemoryChannel::pair(path.send_buffer);
            links.push((path.clone(), rx));
            tx
        })?
        .with_sink(Arc::clone(&self.sink) as Arc<dyn MetricsSink>)
        .with_clock(Arc::clone(&self.clock) as Arc<dyn Clock>);

        let receiver = MultipathReceiver::for_flow(spec, &self.reassembly)?
            .with_sink(Arc::clone(&self.sink) as Arc<dyn MetricsSink>)
            .with_clock(Arc::clone(&self.clock) as Arc<dyn Clock>);

        let sender = runtime::spawn_sender(scheduler, buffer);
        let (receiver, mut deliveries) = runtime::spawn_receiver(receiver, buffer);

        let consumer = tokio::spawn(async move {
            let mut next = 0u64;
            let mut in_order = true;
            while let Some(unit) = deliveries.recv().await {
                in_order &= unit.seq.get() == next;
                next += 1;
            }
            in_order
        });

        let mut wires = Vec::new();
        for ((path, link), rng) in links.into_iter().zip(rngs.links) {
            let wire = Wire {
                path,
                link,
                protocol: spec.protocol,
                unit_size: spec.unit_size(),
                rng,
                capacity: sender.events(),
                receiver: receiver.events(),
            };
            wires.push(tokio::spawn(wire.run()));
        }

        let interval = self
            .simulation
            .send_interval
            .or_else(|| spec.transmission_interval())
            .unwrap_or(FALLBACK_SEND_INTERVAL);
        let payload_size = spec.data_payload_size();
        debug!(
            flow = %spec.id,
            interval = ?interval,
            payload_size,
            units = self.simulation.units_per_flow,
            "Flow application started"
        );

        let driven = async {
            let mut ticker = tokio::time::interval(interval);
            for i in 0..self.simulation.units_per_flow {
                ticker.tick().await;
                sender.send(Bytes::from(vec![(i % 251) as u8; payload_size])).await?;
            }
            sender.stop().await?;
            sender.close().await
        }
        .await;

        let sender_report = sender.join().await;
        for wire in wires {
            wire.await
                .map_err(|e| Error::Internal(format!("link task for {} failed: {e}", spec.id)))?;
        }
        if receiver.teardown().await.is_err() {
            debug!(flow = %spec.id, "Receiver already stopped");
        }
        let receiver_report = receiver.join().await;
        let in_order = consumer
            .await
            .map_err(|e| Error::Internal(format!("consumer task for {} failed: {e}", spec.id)))?;

        let sender_report = sender_report?;
        driven?;
        let receiver_report = receiver_report?;

        let summary = self.sink.summary(spec.id);
        if receiver_report.lost > 0 {
            warn!(flow = %spec.id, lost = receiver_report.lost, "Units lost at teardown");
        }
        info!(
            flow = %spec.id,
            sent = sender_report.stats.units_sent,
            delivered = receiver_report.stats.delivered,
            reordered = receiver_report.stats.reordered,
            "Flow finished"
        );

        Ok(FlowReport {
            flow: spec.id,
            protocol: spec.protocol,
            per_path: sender_report.per_path.clone(),
            sender: sender_report,
            receiver: receiver_report,
            summary,
            in_order,
        })
    }
}

/// One simulated path between a flow's sender and receiver.
struct Wire {
    path: PathSpec,
    link: MemoryLink,
    protocol: FlowProtocol,
    unit_size: usize,
    rng: ChaCha8Rng,
    capacity: mpsc::Sender<SenderEvent>,
    receiver: mpsc::Sender<ReceiverEvent>,
}

impl Wire {
    async fn run(mut self) {
        let (deliver_tx, mut deliver_rx) = mpsc::unbounded_channel::<(Instant, Bytes)>();
        let receiver = self.receiver.clone();
        let path = self.path.id;
        let delivery = tokio::spawn(async move {
            while let Some((deadline, bytes)) = deliver_rx.recv().await {
                tokio::time::sleep_until(deadline).await;
                if receiver.send(ReceiverEvent::Data { path, bytes }).await.is_err() {
                    break;
                }
            }
        });

        let jitter = Uniform::new_inclusive(0.0, self.path.jitter.as_secs_f64());
        let mut last_deadline = Instant::now();

        loop {
            let chunk = if self.protocol.is_stream() {
                let max = self.rng.gen_range(1..=2 * self.unit_size.max(1));
                self.link.take(max)
            } else {
                self.link.pop()
            };

            let Some(bytes) = chunk else {
                // Drained, and the sender closed the channel or has gone away.
                if self.link.is_closed() || self.capacity.is_closed() {
                    break;
                }
                tokio::time::sleep(LINK_POLL_INTERVAL).await;
                continue;
            };

            // Capacity freed; the sender may already be gone.
            let _ = self.capacity.send(SenderEvent::CapacityAvailable(path)).await;

            let extra = Duration::from_secs_f64(jitter.sample(&mut self.rng));
            let deadline = (Instant::now() + self.path.delay + extra).max(last_deadline);
            last_deadline = deadline;
            let len = bytes.len();
            if deliver_tx.send((deadline, bytes)).is_err() {
                break;
            }
            tokio::time::sleep(self.serialization_delay(len)).await;
        }

        drop(deliver_tx);
        if delivery.await.is_err() {
            debug!(path = %path, "Delivery task ended abnormally");
        }
    }

    fn serialization_delay(&self, bytes: usize) -> Duration {
        if self.path.data_rate_bps <= 0.0 {
            return LINK_POLL_INTERVAL;
        }
        Duration::from_secs_f64((bytes * 8) as f64 / self.path.data_rate_bps)
    }
}
