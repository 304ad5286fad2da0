//! Task Processor
//!
//! Consumer side of the pipeline. Each worker loop leases one task at a
//! time, decodes it, runs the registered handler under a timeout and
//! settles the outcome with the broker:
//!
//! - handler `Ok`: task is completed
//! - `TaskError::Permanent`: task is archived after this single attempt
//! - `TaskError::Retryable` with retries left: rescheduled with backoff
//! - `TaskError::Retryable` with `retry_count == max_retry`: archived
//!
//! A task is therefore attempted at most `max_retry + 1` times. Delivery is
//! at-least-once, so handlers must tolerate running more than once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::broker::Broker;
use super::error::{QueueError, TaskError};
use super::retry::RetryPolicy;
use super::task::{QueueClass, Task, TaskKind, TaskMessage};
use crate::config::WorkerConfig;

// ============================================================================
// Queue priority
// ============================================================================

/// Order in which queues are polled on each dequeue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuePriority {
    /// Higher weight is drawn first more often; low weights are never starved
    Weighted(Vec<(QueueClass, u32)>),
    /// Always poll in the given order
    Strict(Vec<QueueClass>),
}

impl QueuePriority {
    /// Zero-weight queues are not consumed at all
    pub fn from_weights(weights: &BTreeMap<QueueClass, u32>, strict: bool) -> Self {
        let mut queues: Vec<(QueueClass, u32)> = weights
            .iter()
            .filter(|(_, w)| **w > 0)
            .map(|(q, w)| (*q, *w))
            .collect();

        if strict {
            queues.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            QueuePriority::Strict(queues.into_iter().map(|(q, _)| q).collect())
        } else {
            QueuePriority::Weighted(queues)
        }
    }

    /// Polling order for one dequeue
    pub fn order(&self) -> Vec<QueueClass> {
        match self {
            QueuePriority::Strict(queues) => queues.clone(),
            QueuePriority::Weighted(weights) => {
                let mut remaining = weights.clone();
                let mut order = Vec::with_capacity(remaining.len());
                let mut rng = rand::thread_rng();
                while !remaining.is_empty() {
                    let total: u32 = remaining.iter().map(|(_, w)| *w).sum();
                    let mut pick = rng.gen_range(0..total);
                    let idx = remaining
                        .iter()
                        .position(|(_, w)| {
                            if pick < *w {
                                true
                            } else {
                                pick -= *w;
                                false
                            }
                        })
                        .unwrap_or(remaining.len() - 1);
                    order.push(remaining.remove(idx).0);
                }
                order
            }
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub concurrency: usize,
    /// Idle sleep between polls of empty queues
    pub poll_interval: Duration,
    pub lease: Duration,
    pub handler_timeout: Duration,
    /// How often expired leases are swept back to pending
    pub recover_interval: Duration,
    pub priority: QueuePriority,
    pub retry_policy: RetryPolicy,
}

impl ProcessorConfig {
    /// Build from the YAML worker section, rejecting unusable timings
    pub fn from_worker_config(config: &WorkerConfig) -> Result<Self, QueueError> {
        let built = Self::build(config);
        built.validate()?;
        Ok(built)
    }

    fn build(config: &WorkerConfig) -> Self {
        let lease = Duration::from_secs(config.lease_secs);
        Self {
            concurrency: config.concurrency.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            lease,
            handler_timeout: Duration::from_secs(config.handler_timeout_secs),
            recover_interval: (lease / 2).max(Duration::from_secs(1)),
            priority: QueuePriority::from_weights(&config.queues, config.strict_priority),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// A handler must give up before its lease runs out, or the task is
    /// handed to a second worker while the first is still running it.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.handler_timeout >= self.lease {
            return Err(QueueError::Config(format!(
                "handler timeout {:?} must be shorter than lease {:?}",
                self.handler_timeout, self.lease
            )));
        }
        Ok(())
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::build(&WorkerConfig::default())
    }
}

// ============================================================================
// Handlers
// ============================================================================

#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn kind(&self) -> TaskKind;

    async fn handle(&self, task: Task) -> Result<(), TaskError>;
}

/// How a single delivery was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Retried {
        retry_count: u32,
        next_attempt: DateTime<Utc>,
    },
    Archived {
        reason: String,
    },
}

// ============================================================================
// Processor
// ============================================================================

pub struct TaskProcessor {
    broker: Arc<dyn Broker>,
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
    config: ProcessorConfig,
}

impl TaskProcessor {
    pub fn new(broker: Arc<dyn Broker>, config: ProcessorConfig) -> Self {
        Self {
            broker,
            handlers: HashMap::new(),
            config,
        }
    }

    /// Register the handler for its task kind, replacing any previous one
    pub fn register(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Lease, run and settle at most one task
    ///
    /// Returns `Ok(None)` when every queue is empty.
    pub async fn process_next(&self) -> Result<Option<ProcessOutcome>, QueueError> {
        let order = self.config.priority.order();
        let Some(msg) = self.broker.dequeue(&order, self.config.lease).await? else {
            return Ok(None);
        };

        let result = self.execute(&msg).await;
        self.settle(&msg, result).await.map(Some)
    }

    async fn execute(&self, msg: &TaskMessage) -> Result<(), TaskError> {
        let task = Task::decode(&msg.kind, &msg.payload)?;
        let handler = self
            .handlers
            .get(&task.kind())
            .cloned()
            .ok_or_else(|| {
                TaskError::Retryable(format!("no handler registered for {}", msg.kind))
            })?;

        let run = AssertUnwindSafe(handler.handle(task)).catch_unwind();
        match tokio::time::timeout(self.config.handler_timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(TaskError::Retryable(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(TaskError::Retryable(format!(
                "handler timed out after {:?}",
                self.config.handler_timeout
            ))),
        }
    }

    async fn settle(
        &self,
        msg: &TaskMessage,
        result: Result<(), TaskError>,
    ) -> Result<ProcessOutcome, QueueError> {
        let err = match result {
            Ok(()) => {
                self.broker.complete(msg).await?;
                info!(
                    target: "WORKER",
                    task_id = %msg.id,
                    task_type = %msg.kind,
                    retry_count = msg.retry_count,
                    "processed task"
                );
                return Ok(ProcessOutcome::Completed);
            }
            Err(err) => err,
        };

        if err.is_permanent() || msg.retry_count >= msg.max_retry {
            let reason = if err.is_permanent() {
                err.reason().to_string()
            } else {
                format!("retries exhausted: {}", err.reason())
            };
            self.broker.archive(msg, &reason).await?;
            error!(
                target: "WORKER",
                task_id = %msg.id,
                task_type = %msg.kind,
                retry_count = msg.retry_count,
                error = %reason,
                "task archived"
            );
            return Ok(ProcessOutcome::Archived { reason });
        }

        let delay = self.config.retry_policy.delay(msg.retry_count);
        let next_attempt = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.broker.retry(msg, next_attempt, err.reason()).await?;
        warn!(
            target: "WORKER",
            task_id = %msg.id,
            task_type = %msg.kind,
            retry_count = msg.retry_count + 1,
            max_retry = msg.max_retry,
            next_attempt = %next_attempt,
            error = %err.reason(),
            "process task failed, will retry"
        );
        Ok(ProcessOutcome::Retried {
            retry_count: msg.retry_count + 1,
            next_attempt,
        })
    }

    /// Run worker loops and the lease recoverer until `shutdown` flips to true
    ///
    /// In-flight handlers are allowed to finish; no new task is leased after
    /// the signal.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            target: "WORKER",
            concurrency = self.config.concurrency,
            priority = ?self.config.priority,
            "start task processor"
        );

        let mut loops = JoinSet::new();
        for worker_id in 0..self.config.concurrency {
            let this = self.clone();
            let rx = shutdown.clone();
            loops.spawn(async move { this.worker_loop(worker_id, rx).await });
        }
        let this = self.clone();
        loops.spawn(async move { this.recover_loop(shutdown).await });

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(target: "WORKER", "worker loop aborted: {}", e);
            }
        }
        info!(target: "WORKER", "task processor stopped");
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    error!(target: "WORKER", worker_id, code = e.code(), "queue error: {}", e)
                }
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!(target: "WORKER", worker_id, "worker loop exited");
    }

    async fn recover_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.recover_interval) => {
                    match self.broker.recover_expired_leases().await {
                        Ok(0) => {}
                        Ok(n) => warn!(
                            target: "WORKER",
                            settled = n,
                            "settled tasks with expired leases"
                        ),
                        Err(e) => error!(target: "WORKER", "lease recovery failed: {}", e),
                    }
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
