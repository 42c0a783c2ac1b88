//! Bounded send pool.
//!
//! Channel sends are fire-and-forget from the caller's point of view, but
//! they run on a fixed set of workers fed by a bounded queue:
//! - intake is refused (or waits, per [`OverflowPolicy`]) when the queue is full
//! - every send runs under a timeout
//! - failed, timed-out and dropped sends land in a bounded dead-letter log
//!
//! Nothing is retried.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::channel::ChannelSender;
use crate::error::{DropReason, SendOutcome};
use crate::types::{ChannelType, MessageId};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::counter!(name).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// What to do when the send queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the send and report backpressure to the caller.
    #[default]
    DropNewest,
    /// Wait until the queue has room.
    Block,
}

#[derive(Debug, Clone)]
pub struct SendPoolConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub send_timeout: Duration,
    pub dead_letter_capacity: usize,
}

impl Default for SendPoolConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_count,
            queue_capacity: 1_000,
            overflow_policy: OverflowPolicy::DropNewest,
            send_timeout: Duration::from_secs(10),
            dead_letter_capacity: 10_000,
        }
    }
}

/// Why a send was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendKind {
    Notification,
    Welcome,
    Goodbye,
}

impl fmt::Display for SendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendKind::Notification => write!(f, "notification"),
            SendKind::Welcome => write!(f, "welcome"),
            SendKind::Goodbye => write!(f, "goodbye"),
        }
    }
}

/// A unit of work consumed by workers.
#[derive(Clone)]
pub struct SendJob {
    pub kind: SendKind,
    pub message_id: Option<MessageId>,
    pub channel: ChannelType,
    pub address: String,
    pub subject: Arc<str>,
    pub body: Arc<str>,
    pub sender: Arc<dyn ChannelSender>,
}

impl fmt::Debug for SendJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendJob")
            .field("kind", &self.kind)
            .field("message_id", &self.message_id)
            .field("channel", &self.channel)
            .field("address", &self.address)
            .finish()
    }
}

/// Dead-letter log entry.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub kind: SendKind,
    pub message_id: Option<MessageId>,
    pub channel: ChannelType,
    pub address: String,
    pub subject: String,
    pub failure: String,
    pub created_at_secs: u64,
}

/// Bounded log of sends that did not make it; oldest entries fall off.
#[derive(Debug)]
pub struct DeadLetters {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl DeadLetters {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    async fn record(&self, job: &SendJob, outcome: &SendOutcome) {
        let failure = match outcome {
            SendOutcome::Delivered => return,
            SendOutcome::Dropped(reason) => reason.to_string(),
            SendOutcome::Failed(reason) => reason.clone(),
        };

        tracing::warn!(
            kind = %job.kind,
            channel = %job.channel,
            address = %job.address,
            message_id = job.message_id.as_ref().map(|id| id.0.as_str()),
            failure = %failure,
            "send dead-lettered"
        );
        metric_inc("relay.dead_letter.inserted");

        let entry = DeadLetter {
            kind: job.kind,
            message_id: job.message_id.clone(),
            channel: job.channel.clone(),
            address: job.address.clone(),
            subject: job.subject.to_string(),
            failure,
            created_at_secs: now_secs(),
        };

        let mut guard = self.entries.lock().await;
        guard.push_back(entry);
        while guard.len() > self.capacity {
            guard.pop_front();
        }
    }

    pub async fn snapshot(&self) -> Vec<DeadLetter> {
        let guard = self.entries.lock().await;
        guard.iter().cloned().collect()
    }
}

/// Reasons a job was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    Backpressure,
    Shutdown,
}

/// Cloneable intake side of the pool.
#[derive(Clone)]
pub struct SendQueue {
    tx: Arc<RwLock<Option<mpsc::Sender<SendJob>>>>,
    policy: OverflowPolicy,
    dead_letters: Arc<DeadLetters>,
}

impl SendQueue {
    /// Queue a send. Refused jobs are dead-lettered before returning.
    pub async fn enqueue(&self, job: SendJob) -> Result<(), EnqueueError> {
        let tx = {
            let guard = self.tx.read().await;
            guard.clone()
        };

        let Some(tx) = tx else {
            self.refuse(job, DropReason::Shutdown).await;
            return Err(EnqueueError::Shutdown);
        };

        let result = match self.policy {
            OverflowPolicy::DropNewest => match tx.try_send(job) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(job)) => Err((job, DropReason::Backpressure)),
                Err(mpsc::error::TrySendError::Closed(job)) => Err((job, DropReason::Shutdown)),
            },
            OverflowPolicy::Block => tx.send(job).await.map_err(|e| (e.0, DropReason::Shutdown)),
        };

        match result {
            Ok(()) => {
                metric_inc("relay.send.queued");
                Ok(())
            }
            Err((job, reason)) => {
                self.refuse(job, reason).await;
                Err(match reason {
                    DropReason::Backpressure => EnqueueError::Backpressure,
                    DropReason::Shutdown => EnqueueError::Shutdown,
                })
            }
        }
    }

    async fn refuse(&self, job: SendJob, reason: DropReason) {
        metric_inc("relay.send.dropped");
        self.dead_letters.record(&job, &SendOutcome::Dropped(reason)).await;
    }
}

/// Shared, read-only context for all workers.
struct WorkerContext {
    send_timeout: Duration,
    dead_letters: Arc<DeadLetters>,
}

/// Fixed set of workers draining a bounded queue.
pub struct SendPool {
    queue: SendQueue,
    worker_handles: Vec<JoinHandle<()>>,
    dead_letters: Arc<DeadLetters>,
}

impl SendPool {
    /// Spawn the workers. Must be called inside a tokio runtime.
    pub fn start(config: SendPoolConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared_rx = Arc::new(Mutex::new(rx));
        let dead_letters = Arc::new(DeadLetters::new(config.dead_letter_capacity));

        let ctx = Arc::new(WorkerContext {
            send_timeout: config.send_timeout,
            dead_letters: dead_letters.clone(),
        });

        let worker_handles = (0..config.worker_count.max(1))
            .map(|_| tokio::spawn(worker_loop(shared_rx.clone(), ctx.clone())))
            .collect();

        Self {
            queue: SendQueue {
                tx: Arc::new(RwLock::new(Some(tx))),
                policy: config.overflow_policy,
                dead_letters: dead_letters.clone(),
            },
            worker_handles,
            dead_letters,
        }
    }

    pub fn queue(&self) -> SendQueue {
        self.queue.clone()
    }

    pub fn dead_letters(&self) -> Arc<DeadLetters> {
        self.dead_letters.clone()
    }

    /// Stop intake, let workers drain what is queued, then join them.
    pub async fn shutdown(&mut self) {
        self.queue.tx.write().await.take();
        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
        tracing::debug!("send pool drained");
    }
}

/// Main worker loop.
///
/// Pulls jobs until the queue is closed and empty.
async fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<SendJob>>>, ctx: Arc<WorkerContext>) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(job) = job else { break };

        let outcome = process_job(&job, &ctx).await;
        ctx.dead_letters.record(&job, &outcome).await;
    }
}

async fn process_job(job: &SendJob, ctx: &WorkerContext) -> SendOutcome {
    let send = job.sender.send(&job.address, &job.subject, &job.body);
    match tokio::time::timeout(ctx.send_timeout, send).await {
        Ok(Ok(())) => {
            metric_inc("relay.send.delivered");
            tracing::debug!(kind = %job.kind, channel = %job.channel, address = %job.address, "send accepted");
            SendOutcome::Delivered
        }
        Ok(Err(err)) => {
            metric_inc("relay.send.failed");
            SendOutcome::Failed(err.to_string())
        }
        Err(_) => {
            metric_inc("relay.send.failed");
            SendOutcome::Failed(crate::error::SendError::Timeout.to_string())
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
