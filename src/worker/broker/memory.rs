//! In-process broker
//!
//! Keeps completed and archived tasks around so tests can inspect the full
//! lifecycle of every message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Broker, LEASE_EXPIRED, lease_deadline};
use crate::worker::error::QueueError;
use crate::worker::state::TaskState;
use crate::worker::task::{QueueClass, TaskInfo, TaskMessage};

struct Slot {
    msg: TaskMessage,
    state: TaskState,
    /// Enqueue order, used to keep FIFO among equally ready tasks
    seq: u64,
    lease_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<Uuid, Slot>,
    next_seq: u64,
}

#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every task ever enqueued, oldest first
    pub async fn tasks(&self) -> Vec<TaskInfo> {
        let inner = self.inner.lock().await;
        let mut slots: Vec<&Slot> = inner.slots.values().collect();
        slots.sort_by_key(|s| s.seq);
        slots.into_iter().map(|s| s.msg.info(s.state)).collect()
    }

    pub async fn task(&self, id: Uuid) -> Option<TaskInfo> {
        let inner = self.inner.lock().await;
        inner.slots.get(&id).map(|s| s.msg.info(s.state))
    }

    /// Number of tasks in `state`
    pub async fn count(&self, state: TaskState) -> usize {
        let inner = self.inner.lock().await;
        inner.slots.values().filter(|s| s.state == state).count()
    }

    fn leased<'a>(inner: &'a mut Inner, msg: &TaskMessage) -> Result<&'a mut Slot, QueueError> {
        match inner.slots.get_mut(&msg.id) {
            Some(slot) if slot.state == TaskState::Active => Ok(slot),
            Some(slot) => Err(QueueError::Internal(format!(
                "task {} is {}, not ACTIVE",
                msg.id, slot.state
            ))),
            None => Err(QueueError::TaskNotFound(msg.id.to_string())),
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, msg: TaskMessage) -> Result<TaskInfo, QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.slots.contains_key(&msg.id) {
            return Err(QueueError::Internal(format!("task {} already exists", msg.id)));
        }
        let state = msg.initial_state(Utc::now());
        let info = msg.info(state);
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.slots.insert(
            msg.id,
            Slot {
                msg,
                state,
                seq,
                lease_until: None,
            },
        );
        Ok(info)
    }

    async fn dequeue(
        &self,
        queues: &[QueueClass],
        lease: Duration,
    ) -> Result<Option<TaskMessage>, QueueError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        for queue in queues {
            let next = inner
                .slots
                .values()
                .filter(|s| {
                    s.msg.queue == *queue && s.state.is_waiting() && s.msg.not_before <= now
                })
                .min_by_key(|s| (s.msg.not_before, s.seq))
                .map(|s| s.msg.id);

            if let Some(id) = next
                && let Some(slot) = inner.slots.get_mut(&id)
            {
                slot.state = TaskState::Active;
                slot.lease_until = Some(lease_deadline(now, lease));
                return Ok(Some(slot.msg.clone()));
            }
        }
        Ok(None)
    }

    async fn complete(&self, msg: &TaskMessage) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let slot = Self::leased(&mut inner, msg)?;
        slot.state = TaskState::Completed;
        slot.lease_until = None;
        Ok(())
    }

    async fn retry(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let slot = Self::leased(&mut inner, msg)?;
        slot.msg.retry_count += 1;
        slot.msg.not_before = process_at;
        slot.msg.last_error = Some(error.to_string());
        slot.state = TaskState::Retry;
        slot.lease_until = None;
        Ok(())
    }

    async fn archive(&self, msg: &TaskMessage, error: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let slot = Self::leased(&mut inner, msg)?;
        slot.msg.last_error = Some(error.to_string());
        slot.state = TaskState::Archived;
        slot.lease_until = None;
        Ok(())
    }

    async fn recover_expired_leases(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let mut recovered = 0;
        for slot in inner.slots.values_mut() {
            if slot.state != TaskState::Active || !slot.lease_until.is_some_and(|t| t <= now) {
                continue;
            }
            slot.lease_until = None;
            slot.msg.last_error = Some(LEASE_EXPIRED.to_string());
            if slot.msg.retry_count >= slot.msg.max_retry {
                slot.state = TaskState::Archived;
            } else {
                slot.msg.retry_count += 1;
                slot.msg.not_before = now;
                slot.state = TaskState::Retry;
            }
            recovered += 1;
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::task::EnqueueOptions;

    fn message(queue: QueueClass) -> TaskMessage {
        TaskMessage::raw("test", b"{}".to_vec(), &EnqueueOptions::default().queue(queue))
    }

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_enqueue_dequeue_complete() {
        let broker = MemoryBroker::new();
        let info = broker.enqueue(message(QueueClass::Default)).await.unwrap();
        assert_eq!(info.state, TaskState::Pending);

        let msg = broker
            .dequeue(&[QueueClass::Default], LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.id, info.id);
        assert_eq!(broker.count(TaskState::Active).await, 1);

        broker.complete(&msg).await.unwrap();
        assert_eq!(
            broker.task(msg.id).await.unwrap().state,
            TaskState::Completed
        );
        assert!(
            broker
                .dequeue(&[QueueClass::Default], LEASE)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_scheduled_task_invisible_until_due() {
        let broker = MemoryBroker::new();
        let opts = EnqueueOptions::default().process_in(Duration::from_secs(60));
        let info = broker
            .enqueue(TaskMessage::raw("test", vec![], &opts))
            .await
            .unwrap();
        assert_eq!(info.state, TaskState::Scheduled);

        let next = broker.dequeue(&QueueClass::ALL, LEASE).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_queue_order_respected() {
        let broker = MemoryBroker::new();
        broker.enqueue(message(QueueClass::Low)).await.unwrap();
        let critical = broker.enqueue(message(QueueClass::Critical)).await.unwrap();

        let msg = broker
            .dequeue(&[QueueClass::Critical, QueueClass::Low], LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.id, critical.id);
    }

    #[tokio::test]
    async fn test_fifo_within_queue() {
        let broker = MemoryBroker::new();
        let first = broker.enqueue(message(QueueClass::Default)).await.unwrap();
        broker.enqueue(message(QueueClass::Default)).await.unwrap();

        let msg = broker
            .dequeue(&[QueueClass::Default], LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.id, first.id);
    }

    #[tokio::test]
    async fn test_retry_bumps_count_and_requeues() {
        let broker = MemoryBroker::new();
        broker.enqueue(message(QueueClass::Default)).await.unwrap();
        let msg = broker
            .dequeue(&[QueueClass::Default], LEASE)
            .await
            .unwrap()
            .unwrap();

        broker.retry(&msg, Utc::now(), "boom").await.unwrap();
        let again = broker
            .dequeue(&[QueueClass::Default], LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, msg.id);
        assert_eq!(again.retry_count, 1);
        assert_eq!(again.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_archived_never_redelivered() {
        let broker = MemoryBroker::new();
        broker.enqueue(message(QueueClass::Default)).await.unwrap();
        let msg = broker
            .dequeue(&[QueueClass::Default], LEASE)
            .await
            .unwrap()
            .unwrap();

        broker.archive(&msg, "bad payload").await.unwrap();
        assert!(
            broker
                .dequeue(&QueueClass::ALL, LEASE)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(broker.recover_expired_leases().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let broker = MemoryBroker::new();
        broker.enqueue(message(QueueClass::Default)).await.unwrap();
        let msg = broker
            .dequeue(&[QueueClass::Default], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(broker.recover_expired_leases().await.unwrap(), 1);
        let again = broker
            .dequeue(&[QueueClass::Default], LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, msg.id);
        assert_eq!(again.retry_count, 1);
        assert_eq!(again.last_error.as_deref(), Some(LEASE_EXPIRED));
    }

    #[tokio::test]
    async fn test_expired_leases_exhaust_retries() {
        let broker = MemoryBroker::new();
        let opts = EnqueueOptions::default().max_retry(2);
        let info = broker
            .enqueue(TaskMessage::raw("test", vec![], &opts))
            .await
            .unwrap();

        let mut deliveries = 0;
        while let Some(msg) = broker
            .dequeue(&[QueueClass::Default], Duration::ZERO)
            .await
            .unwrap()
        {
            deliveries += 1;
            assert_eq!(msg.retry_count, deliveries - 1);
            assert_eq!(broker.recover_expired_leases().await.unwrap(), 1);
            assert!(deliveries <= 3, "task redelivered past its retry budget");
        }

        assert_eq!(deliveries, 3);
        let task = broker.task(info.id).await.unwrap();
        assert_eq!(task.state, TaskState::Archived);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.last_error.as_deref(), Some(LEASE_EXPIRED));
    }

    #[tokio::test]
    async fn test_zero_retry_task_archived_on_first_expiry() {
        let broker = MemoryBroker::new();
        let opts = EnqueueOptions::default().max_retry(0);
        broker
            .enqueue(TaskMessage::raw("test", vec![], &opts))
            .await
            .unwrap();
        broker
            .dequeue(&QueueClass::ALL, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(broker.recover_expired_leases().await.unwrap(), 1);
        assert!(broker.dequeue(&QueueClass::ALL, LEASE).await.unwrap().is_none());
        assert_eq!(broker.count(TaskState::Archived).await, 1);
    }

    #[tokio::test]
    async fn test_settle_requires_lease() {
        let broker = MemoryBroker::new();
        let msg = message(QueueClass::Default);
        broker.enqueue(msg.clone()).await.unwrap();
        assert!(broker.complete(&msg).await.is_err());
    }
}
