//! Simple Bank - transactional core
//!
//! Money movement and user onboarding on PostgreSQL, with follow-up work
//! (email verification) pushed through a durable Redis task queue.
//!
//! # Modules
//!
//! - [`config`] - YAML application configuration
//! - [`logging`] - tracing subscriber setup
//! - [`error`] - Store error taxonomy
//! - [`db`] - Connection pool and Unit-of-Work
//! - [`store`] - Repository (PostgreSQL and in-memory)
//! - [`transfer`] - Transfer Engine
//! - [`provisioning`] - User Provisioning
//! - [`worker`] - Task distributor, broker, processor and handlers
//! - [`mail`] - Outbound Notifier

pub mod config;
pub mod error;
pub mod logging;

// Relational store
pub mod db;
pub mod store;

// Core operations
pub mod provisioning;
pub mod transfer;

// Async pipeline
pub mod mail;
pub mod worker;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use db::{Database, UnitOfWork};
pub use error::StoreError;
pub use mail::{EmailContent, EmailSender, MailError};
pub use provisioning::{PendingTask, ProvisionError, Provisioned, UserProvisioner};
pub use store::{MemoryStore, PgStore, Store};
pub use transfer::{OverdraftPolicy, TransferService, TransferTxParams, TransferTxResult};
pub use worker::{
    Broker, BrokerTaskDistributor, MemoryBroker, QueueClass, RedisBroker, Task, TaskDistributor,
    TaskProcessor,
};
