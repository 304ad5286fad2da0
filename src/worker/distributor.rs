//! Task Distributor
//!
//! Producer side of the pipeline: serialize a typed task and hand it to the
//! broker with its delivery options.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::broker::Broker;
use super::error::QueueError;
use super::task::{EnqueueOptions, PayloadSendVerifyEmail, Task, TaskInfo, TaskMessage};

#[async_trait]
pub trait TaskDistributor: Send + Sync {
    /// Durably enqueue `task`; returns once the backend has accepted it
    async fn distribute(&self, task: Task, opts: EnqueueOptions) -> Result<TaskInfo, QueueError>;

    async fn distribute_task_send_verify_email(
        &self,
        payload: PayloadSendVerifyEmail,
        opts: EnqueueOptions,
    ) -> Result<TaskInfo, QueueError> {
        self.distribute(Task::SendVerifyEmail(payload), opts).await
    }
}

#[derive(Clone)]
pub struct BrokerTaskDistributor {
    broker: Arc<dyn Broker>,
}

impl BrokerTaskDistributor {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl TaskDistributor for BrokerTaskDistributor {
    async fn distribute(&self, task: Task, opts: EnqueueOptions) -> Result<TaskInfo, QueueError> {
        let msg = TaskMessage::new(&task, &opts)?;
        let info = self.broker.enqueue(msg).await?;

        info!(
            task_id = %info.id,
            task_type = %info.kind,
            queue = %info.queue,
            max_retry = info.max_retry,
            "enqueued task"
        );
        Ok(info)
    }
}
