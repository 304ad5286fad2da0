//! Background task pipeline
//!
//! ```text
//! producer ──▶ TaskDistributor ──▶ Broker (Redis) ──▶ TaskProcessor ──▶ TaskHandler
//!                                      ▲                   │
//!                                      └── retry/archive ──┘
//! ```
//!
//! Tasks live only in the broker, never in the relational store.

pub mod broker;
pub mod distributor;
pub mod error;
pub mod processor;
pub mod retry;
pub mod state;
pub mod task;
pub mod verify_email;

pub use broker::{Broker, MemoryBroker, RedisBroker};
pub use distributor::{BrokerTaskDistributor, TaskDistributor};
pub use error::{QueueError, TaskError};
pub use processor::{ProcessOutcome, ProcessorConfig, QueuePriority, TaskHandler, TaskProcessor};
pub use retry::RetryPolicy;
pub use state::TaskState;
pub use task::{
    EnqueueOptions, PayloadSendVerifyEmail, QueueClass, TASK_SEND_VERIFY_EMAIL, Task, TaskInfo,
    TaskKind, TaskMessage,
};
pub use verify_email::SendVerifyEmailHandler;
