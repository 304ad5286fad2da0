//! Repository layer
//!
//! [`Store`] is the seam every composite operation and task handler talks to.
//! It bundles the primitive row operations with the transactional
//! compositions (`transfer_tx`, `create_user_tx`, `verify_email_tx`).
//!
//! - [`PgStore`] - PostgreSQL, each composition runs in one [`UnitOfWork`](crate::db::UnitOfWork)
//! - [`MemoryStore`] - in-process store with the same semantics, used by tests and local runs

pub mod memory;
pub mod models;
pub mod postgres;
pub mod queries;

pub use memory::MemoryStore;
pub use models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateSessionParams, CreateTransferParams, CreateUserParams, CreateVerifyEmailParams, Entry,
    ListAccountsParams, Session, Transfer, UpdateUserParams, User, VerifyEmail,
    VerifyEmailTxParams, VerifyEmailTxResult,
};
pub use postgres::PgStore;

use async_trait::async_trait;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::StoreError;
use crate::transfer::{TransferTxParams, TransferTxResult};

/// Callback run inside the user-creation transaction, before commit
///
/// An `Err` rolls the new user back.
pub type AfterCreateHook =
    Box<dyn FnOnce(User) -> BoxFuture<'static, Result<(), StoreError>> + Send>;

pub struct CreateUserTxParams {
    pub params: CreateUserParams,
    pub after_create: Option<AfterCreateHook>,
}

impl CreateUserTxParams {
    pub fn new(params: CreateUserParams) -> Self {
        Self {
            params,
            after_create: None,
        }
    }

    pub fn with_hook(params: CreateUserParams, hook: AfterCreateHook) -> Self {
        Self {
            params,
            after_create: Some(hook),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // === Accounts ===
    async fn create_account(&self, arg: CreateAccountParams) -> Result<Account, StoreError>;
    async fn get_account(&self, id: i64) -> Result<Account, StoreError>;
    async fn list_accounts(&self, arg: ListAccountsParams) -> Result<Vec<Account>, StoreError>;
    async fn add_account_balance(
        &self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError>;

    // === Ledger ===
    async fn create_entry(&self, arg: CreateEntryParams) -> Result<Entry, StoreError>;
    async fn get_entry(&self, id: i64) -> Result<Entry, StoreError>;
    async fn create_transfer(&self, arg: CreateTransferParams) -> Result<Transfer, StoreError>;
    async fn get_transfer(&self, id: i64) -> Result<Transfer, StoreError>;

    // === Users ===
    async fn create_user(&self, arg: CreateUserParams) -> Result<User, StoreError>;
    async fn get_user(&self, username: &str) -> Result<User, StoreError>;
    async fn update_user(&self, arg: UpdateUserParams) -> Result<User, StoreError>;

    // === Sessions ===
    async fn create_session(&self, arg: CreateSessionParams) -> Result<Session, StoreError>;
    async fn get_session(&self, id: Uuid) -> Result<Session, StoreError>;

    // === Email verification ===
    async fn create_verify_email(
        &self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError>;

    // === Transactional compositions ===

    /// Move funds between two accounts atomically
    async fn transfer_tx(&self, arg: TransferTxParams) -> Result<TransferTxResult, StoreError>;

    /// Insert a user and run the optional hook before commit
    async fn create_user_tx(&self, arg: CreateUserTxParams) -> Result<User, StoreError>;

    /// Consume a verification code and flag the user's email as verified
    async fn verify_email_tx(
        &self,
        arg: VerifyEmailTxParams,
    ) -> Result<VerifyEmailTxResult, StoreError>;
}
