//! User Provisioning
//!
//! Creating a user touches two systems that cannot commit together: the
//! relational store and the task queue. Two compositions are offered.
//!
//! **Two-phase (default).** [`UserProvisioner::create_user`] commits the user
//! and returns the side effects it owes as [`PendingTask`] descriptors.
//! [`UserProvisioner::publish`] enqueues them afterwards. A task is never
//! enqueued for a user that did not commit; if publishing fails the user
//! exists without a verification task and the caller gets
//! [`ProvisionError::TaskDispatch`].
//!
//! **Hook in transaction.** [`UserProvisioner::create_user_in_tx`] enqueues
//! from inside the unit of work. An enqueue failure rolls the user back, but
//! a commit failure after a successful enqueue leaves a task pointing at a
//! user that never existed. The 10 second delivery delay narrows that window
//! without closing it; the handler archives such a task as permanent.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::Validate;

use crate::error::StoreError;
use crate::store::{
    AfterCreateHook, CreateUserParams, CreateUserTxParams, Store, User, VerifyEmailTxParams,
    VerifyEmailTxResult,
};
use crate::worker::verify_email::SECRET_CODE_LEN;
use crate::worker::{
    EnqueueOptions, PayloadSendVerifyEmail, QueueClass, QueueError, Task, TaskDistributor,
    TaskInfo,
};

pub const VERIFY_EMAIL_MAX_RETRY: u32 = 10;
pub const VERIFY_EMAIL_DELAY: Duration = Duration::from_secs(10);

/// Delivery options for `send-verify-email`
pub fn verify_email_options() -> EnqueueOptions {
    EnqueueOptions::default()
        .queue(QueueClass::Critical)
        .max_retry(VERIFY_EMAIL_MAX_RETRY)
        .process_in(VERIFY_EMAIL_DELAY)
}

/// Side effect owed by a committed write, not yet enqueued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTask {
    pub task: Task,
    pub options: EnqueueOptions,
}

impl PendingTask {
    pub fn send_verify_email(user: &User) -> Self {
        Self {
            task: Task::SendVerifyEmail(PayloadSendVerifyEmail {
                username: user.username.clone(),
            }),
            options: verify_email_options(),
        }
    }
}

/// A committed user plus the tasks still to publish
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub user: User,
    pub pending: Vec<PendingTask>,
}

#[derive(Debug, Clone)]
pub struct CreateUserResult {
    pub user: User,
    pub tasks: Vec<TaskInfo>,
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The write itself failed; nothing was committed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The user committed but its follow-up task could not be enqueued
    #[error("user committed but task dispatch failed: {source}")]
    TaskDispatch {
        user: Box<User>,
        #[source]
        source: QueueError,
    },
}

impl ProvisionError {
    pub fn code(&self) -> &'static str {
        match self {
            ProvisionError::Store(e) => e.code(),
            ProvisionError::TaskDispatch { .. } => "TASK_DISPATCH_FAILED",
        }
    }
}

pub struct UserProvisioner {
    store: Arc<dyn Store>,
    distributor: Arc<dyn TaskDistributor>,
}

impl UserProvisioner {
    pub fn new(store: Arc<dyn Store>, distributor: Arc<dyn TaskDistributor>) -> Self {
        Self { store, distributor }
    }

    /// Phase one: validate and commit the user
    pub async fn create_user(
        &self,
        params: CreateUserParams,
    ) -> Result<Provisioned, ProvisionError> {
        params.validate().map_err(StoreError::from)?;

        let user = self
            .store
            .create_user_tx(CreateUserTxParams::new(params))
            .await?;
        info!(target: "PROVISION", username = %user.username, "user created");

        let pending = vec![PendingTask::send_verify_email(&user)];
        Ok(Provisioned { user, pending })
    }

    /// Phase two: enqueue side effects of an already committed write
    pub async fn publish(&self, pending: Vec<PendingTask>) -> Result<Vec<TaskInfo>, QueueError> {
        let mut tasks = Vec::with_capacity(pending.len());
        for PendingTask { task, options } in pending {
            tasks.push(self.distributor.distribute(task, options).await?);
        }
        Ok(tasks)
    }

    /// Both phases; an enqueue failure is reported apart from the committed write
    pub async fn create_user_and_notify(
        &self,
        params: CreateUserParams,
    ) -> Result<CreateUserResult, ProvisionError> {
        let Provisioned { user, pending } = self.create_user(params).await?;

        match self.publish(pending).await {
            Ok(tasks) => Ok(CreateUserResult { user, tasks }),
            Err(source) => {
                error!(
                    target: "PROVISION",
                    username = %user.username,
                    code = source.code(),
                    "failed to enqueue verify email task: {}",
                    source
                );
                Err(ProvisionError::TaskDispatch {
                    user: Box::new(user),
                    source,
                })
            }
        }
    }

    /// Enqueue the verification task before the user commits
    ///
    /// Failing to enqueue rolls the user back.
    pub async fn create_user_in_tx(
        &self,
        params: CreateUserParams,
    ) -> Result<User, ProvisionError> {
        params.validate().map_err(StoreError::from)?;

        let distributor = self.distributor.clone();
        let hook: AfterCreateHook = Box::new(
            move |user: User| -> BoxFuture<'static, Result<(), StoreError>> {
                Box::pin(async move {
                    let PendingTask { task, options } = PendingTask::send_verify_email(&user);
                    distributor
                        .distribute(task, options)
                        .await
                        .map(|_| ())
                        .map_err(|e| {
                            StoreError::Internal(format!("enqueue verify email task: {e}"))
                        })
                })
            },
        );

        let user = self
            .store
            .create_user_tx(CreateUserTxParams::with_hook(params, hook))
            .await?;
        info!(
            target: "PROVISION",
            username = %user.username,
            "user created with verify email task"
        );
        Ok(user)
    }

    /// Consume a verification code and mark the user's email verified
    pub async fn verify_email(
        &self,
        email_id: i64,
        secret_code: &str,
    ) -> Result<VerifyEmailTxResult, ProvisionError> {
        if email_id <= 0 {
            return Err(StoreError::Validation("email_id must be positive".to_string()).into());
        }
        if secret_code.len() != SECRET_CODE_LEN {
            return Err(StoreError::Validation(format!(
                "secret_code must be {SECRET_CODE_LEN} characters"
            ))
            .into());
        }

        let result = self
            .store
            .verify_email_tx(VerifyEmailTxParams {
                email_id,
                secret_code: secret_code.to_string(),
            })
            .await?;
        info!(target: "PROVISION", username = %result.user.username, "email verified");
        Ok(result)
    }
}
