//! Queue Backends
//!
//! The broker owns task storage; nothing about a task lives in the
//! relational store. Delivery is at-least-once: a leased task whose
//! processor disappears is handed out again once its lease expires.
//! An expired lease counts as a failed attempt, so a task that keeps
//! killing its worker is archived once its retries run out.

pub mod memory;
pub mod redis;

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::error::QueueError;
use super::task::{QueueClass, TaskInfo, TaskMessage};

#[async_trait]
pub trait Broker: Send + Sync {
    /// Durably store a task; it becomes visible at `not_before`
    async fn enqueue(&self, msg: TaskMessage) -> Result<TaskInfo, QueueError>;

    /// Lease the next ready task, trying `queues` in the order given
    async fn dequeue(
        &self,
        queues: &[QueueClass],
        lease: Duration,
    ) -> Result<Option<TaskMessage>, QueueError>;

    /// Mark a leased task as done
    async fn complete(&self, msg: &TaskMessage) -> Result<(), QueueError>;

    /// Release a leased task for another attempt at `process_at`, bumping its retry count
    async fn retry(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError>;

    /// Move a leased task to the archive; it is never delivered again
    async fn archive(&self, msg: &TaskMessage, error: &str) -> Result<(), QueueError>;

    /// Settle every task whose lease expired as a failed attempt
    ///
    /// The task is retried immediately while `retry_count < max_retry` and
    /// archived otherwise. Returns how many tasks were settled.
    async fn recover_expired_leases(&self) -> Result<usize, QueueError>;
}

/// `last_error` recorded for a task whose lease ran out
pub const LEASE_EXPIRED: &str = "lease expired";

pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
