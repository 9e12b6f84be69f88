//! Ordered per-plan event delivery.
//!
//! Every plan gets its own bounded channel and a forwarder task that hands
//! events to the [`EventSink`] one at a time, so a sink never observes two
//! events of one plan out of order. The executor and the agent's
//! [`StepStream`] write into the same channel, and a flush is a barrier
//! queued behind them on it. A plan's channel is only torn down once the
//! plan has terminated.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::util::{backoff_delay, blocking};
use crate::workflow::{CheckpointKind, PlanId, RequestId, SessionId, StepFailure};

/// Publish attempts per event before the forwarder gives up on it.
const PUBLISH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEvent {
    pub plan_id: PlanId,
    /// Position of this event in the plan's stream, starting at 1.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl PlanEvent {
    pub fn new(plan_id: PlanId, seq: u64, kind: EventKind) -> Self {
        Self {
            plan_id,
            seq,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::PlanCompleted | EventKind::PlanRejected { .. } | EventKind::PlanFailed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    PlanCreated {
        session_id: SessionId,
        task_description: String,
    },
    PlanApprovalRequested {
        request_id: RequestId,
        kind: CheckpointKind,
        sequence: Vec<String>,
    },
    StepStarted {
        agent_id: String,
        ordinal: usize,
        iteration: u32,
    },
    StepStreaming {
        agent_id: String,
        ordinal: usize,
        chunk: String,
    },
    StepCompleted {
        agent_id: String,
        ordinal: usize,
        iteration: u32,
        result_message: Value,
    },
    PostAgentReviewRequested {
        request_id: RequestId,
        kind: CheckpointKind,
        agent_id: String,
        ordinal: usize,
        iteration: u32,
        result_message: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<StepFailure>,
        #[serde(default)]
        needs_revision: bool,
    },
    PlanCompleted,
    PlanRejected {
        reason: String,
    },
    PlanFailed {
        reason: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::PlanCreated { .. } => "plan_created",
            EventKind::PlanApprovalRequested { .. } => "plan_approval_requested",
            EventKind::StepStarted { .. } => "step_started",
            EventKind::StepStreaming { .. } => "step_streaming",
            EventKind::StepCompleted { .. } => "step_completed",
            EventKind::PostAgentReviewRequested { .. } => "post_agent_review_requested",
            EventKind::PlanCompleted => "plan_completed",
            EventKind::PlanRejected { .. } => "plan_rejected",
            EventKind::PlanFailed { .. } => "plan_failed",
        }
    }
}

/// Outbound consumer of plan events.
///
/// Delivery is at-least-once: a sink may see the same `(plan_id, seq)` twice
/// after a crash or a failed publish, but never out of order.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &PlanEvent) -> Result<()>;
}

enum Message {
    Event(PlanEvent),
    /// Answered once every message queued before it has been handled.
    Flush(oneshot::Sender<()>),
}

/// Write half of one plan's channel.
#[derive(Clone)]
pub struct EventSender {
    plan_id: PlanId,
    tx: mpsc::Sender<Message>,
}

impl EventSender {
    pub async fn send(&self, event: PlanEvent) -> Result<()> {
        self.tx
            .send(Message::Event(event))
            .await
            .map_err(|e| Error::EventDelivery {
                plan_id: self.plan_id,
                message: e.to_string(),
            })
    }
}

struct PlanChannel {
    tx: mpsc::Sender<Message>,
    forwarder: JoinHandle<()>,
}

/// Owns the per-plan channels between producers and the sink.
pub struct EventPump {
    sink: Arc<dyn EventSink>,
    buffer: usize,
    channels: Mutex<HashMap<PlanId, PlanChannel>>,
}

impl EventPump {
    pub fn new(sink: Arc<dyn EventSink>, buffer: usize) -> Self {
        Self {
            sink,
            buffer: buffer.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Sender for the plan's channel, spawning its forwarder on first use.
    pub async fn sender(&self, plan_id: PlanId) -> EventSender {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(&plan_id) {
            if !channel.tx.is_closed() {
                return EventSender {
                    plan_id,
                    tx: channel.tx.clone(),
                };
            }
        }
        let (tx, rx) = mpsc::channel(self.buffer);
        let forwarder = tokio::spawn(forward(plan_id, rx, Arc::clone(&self.sink)));
        channels.insert(
            plan_id,
            PlanChannel {
                tx: tx.clone(),
                forwarder,
            },
        );
        EventSender { plan_id, tx }
    }

    pub async fn emit(&self, event: PlanEvent) -> Result<()> {
        tracing::trace!(plan_id = %event.plan_id, seq = event.seq, event = event.name(), "emit");
        self.sender(event.plan_id).await.send(event).await
    }

    /// Wait until every event queued for the plan so far has reached the
    /// sink. The channel stays open and later events queue behind the
    /// barrier.
    pub async fn flush(&self, plan_id: PlanId) {
        let tx = match self.channels.lock().await.get(&plan_id) {
            Some(channel) => channel.tx.clone(),
            None => return,
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(Message::Flush(done_tx)).await.is_err() || done_rx.await.is_err() {
            tracing::debug!(plan_id = %plan_id, "flush found the forwarder gone");
        }
    }

    /// Drain the plan's channel, then shut its forwarder down. Only for
    /// plans that will emit nothing more.
    pub async fn close(&self, plan_id: PlanId) {
        self.flush(plan_id).await;
        let channel = self.channels.lock().await.remove(&plan_id);
        if let Some(PlanChannel { tx, forwarder }) = channel {
            drop(tx);
            if let Err(e) = forwarder.await {
                tracing::error!(plan_id = %plan_id, error = %e, "event forwarder panicked");
            }
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<(PlanId, PlanChannel)> = self.channels.lock().await.drain().collect();
        let forwarders = drained.into_iter().map(|(plan_id, PlanChannel { tx, forwarder })| {
            drop(tx);
            async move {
                if let Err(e) = forwarder.await {
                    tracing::error!(plan_id = %plan_id, error = %e, "event forwarder panicked");
                }
            }
        });
        futures::future::join_all(forwarders).await;
    }
}

async fn forward(plan_id: PlanId, mut rx: mpsc::Receiver<Message>, sink: Arc<dyn EventSink>) {
    while let Some(message) = rx.recv().await {
        let event = match message {
            Message::Event(event) => event,
            Message::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };
        let mut attempt = 1;
        loop {
            match sink.publish(&event).await {
                Ok(()) => break,
                Err(e) if attempt < PUBLISH_ATTEMPTS => {
                    tracing::warn!(plan_id = %plan_id, seq = event.seq, attempt, error = %e, "publish failed, retrying");
                    tokio::time::sleep(backoff_delay(
                        Duration::from_millis(10),
                        attempt,
                        Duration::from_millis(200),
                    ))
                    .await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(plan_id = %plan_id, seq = event.seq, error = %e, "dropping event after failed publish");
                    break;
                }
            }
        }
    }
    tracing::trace!(plan_id = %plan_id, "event forwarder finished");
}

/// Handle an agent uses to stream partial output while it runs.
///
/// Chunks are numbered from the plan's event counter and go through the same
/// channel as the executor's own events.
pub struct StepStream {
    plan_id: PlanId,
    agent_id: String,
    ordinal: usize,
    tx: EventSender,
    seq: Mutex<u64>,
}

impl StepStream {
    pub fn new(
        plan_id: PlanId,
        agent_id: impl Into<String>,
        ordinal: usize,
        tx: EventSender,
        last_seq: u64,
    ) -> Self {
        Self {
            plan_id,
            agent_id: agent_id.into(),
            ordinal,
            tx,
            seq: Mutex::new(last_seq),
        }
    }

    pub async fn send(&self, chunk: impl Into<String>) -> Result<()> {
        let mut seq = self.seq.lock().await;
        *seq += 1;
        let event = PlanEvent::new(
            self.plan_id,
            *seq,
            EventKind::StepStreaming {
                agent_id: self.agent_id.clone(),
                ordinal: self.ordinal,
                chunk: chunk.into(),
            },
        );
        self.tx.send(event).await
    }

    /// Sequence number of the last chunk sent, or the starting value.
    pub fn into_last_seq(self) -> u64 {
        self.seq.into_inner()
    }
}

/// Keeps every event in memory. Used by tests and embedders that poll.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<PlanEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<PlanEvent> {
        self.events.lock().await.clone()
    }

    pub async fn events_for(&self, plan_id: PlanId) -> Vec<PlanEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.plan_id == plan_id)
            .cloned()
            .collect()
    }

    /// Event names for one plan, in delivery order.
    pub async fn names_for(&self, plan_id: PlanId) -> Vec<&'static str> {
        self.events_for(plan_id)
            .await
            .iter()
            .map(PlanEvent::name)
            .collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, event: &PlanEvent) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Fans events out to live subscribers. Events published while nobody is
/// subscribed are dropped.
pub struct BroadcastSink {
    tx: broadcast::Sender<PlanEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlanEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn publish(&self, event: &PlanEvent) -> Result<()> {
        if self.tx.send(event.clone()).is_err() {
            tracing::trace!(plan_id = %event.plan_id, seq = event.seq, "no subscribers");
        }
        Ok(())
    }
}

/// Appends one JSON line per event to `<dir>/<plan_id>.jsonl`.
pub struct JsonlSink {
    dir: PathBuf,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, plan_id: PlanId) -> PathBuf {
        event_log_path(&self.dir, plan_id)
    }

    /// Read back a plan's event log. A missing log reads as empty.
    pub async fn read(dir: &Path, plan_id: PlanId) -> Result<Vec<PlanEvent>> {
        let path = event_log_path(dir, plan_id);
        blocking(move || {
            if !path.exists() {
                return Ok(Vec::new());
            }
            fs::read_to_string(&path)?
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| serde_json::from_str(line).map_err(Error::from))
                .collect()
        })
        .await
    }
}

fn event_log_path(dir: &Path, plan_id: PlanId) -> PathBuf {
    dir.join(format!("{plan_id}.jsonl"))
}

#[async_trait]
impl EventSink for JsonlSink {
    async fn publish(&self, event: &PlanEvent) -> Result<()> {
        let dir = self.dir.clone();
        let path = self.path_for(event.plan_id);
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        blocking(move || {
            fs::create_dir_all(&dir)?;
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(line.as_bytes())?;
            Ok(())
        })
        .await
    }
}
