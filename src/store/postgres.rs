//! PostgreSQL-backed [`Store`]

use async_trait::async_trait;
use uuid::Uuid;

use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateSessionParams, CreateTransferParams, CreateUserParams, CreateVerifyEmailParams, Entry,
    ListAccountsParams, Session, Transfer, UpdateUserParams, User, VerifyEmail,
    VerifyEmailTxParams, VerifyEmailTxResult,
};
use super::{CreateUserTxParams, Store, queries};
use crate::db::{Database, UnitOfWork};
use crate::error::StoreError;
use crate::transfer::{self, TransferTxParams, TransferTxResult};

pub struct PgStore {
    db: Database,
    uow: UnitOfWork,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        let uow = db.unit_of_work();
        Self { db, uow }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_account(&self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        queries::create_account(self.db.pool(), &arg).await
    }

    async fn get_account(&self, id: i64) -> Result<Account, StoreError> {
        queries::get_account(self.db.pool(), id).await
    }

    async fn list_accounts(&self, arg: ListAccountsParams) -> Result<Vec<Account>, StoreError> {
        queries::list_accounts(self.db.pool(), &arg).await
    }

    async fn add_account_balance(
        &self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        queries::add_account_balance(self.db.pool(), arg).await
    }

    async fn create_entry(&self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        queries::create_entry(self.db.pool(), arg).await
    }

    async fn get_entry(&self, id: i64) -> Result<Entry, StoreError> {
        queries::get_entry(self.db.pool(), id).await
    }

    async fn create_transfer(&self, arg: CreateTransferParams) -> Result<Transfer, StoreError> {
        queries::create_transfer(self.db.pool(), arg).await
    }

    async fn get_transfer(&self, id: i64) -> Result<Transfer, StoreError> {
        queries::get_transfer(self.db.pool(), id).await
    }

    async fn create_user(&self, arg: CreateUserParams) -> Result<User, StoreError> {
        queries::create_user(self.db.pool(), &arg).await
    }

    async fn get_user(&self, username: &str) -> Result<User, StoreError> {
        queries::get_user(self.db.pool(), username).await
    }

    async fn update_user(&self, arg: UpdateUserParams) -> Result<User, StoreError> {
        queries::update_user(self.db.pool(), &arg).await
    }

    async fn create_session(&self, arg: CreateSessionParams) -> Result<Session, StoreError> {
        queries::create_session(self.db.pool(), &arg).await
    }

    async fn get_session(&self, id: Uuid) -> Result<Session, StoreError> {
        queries::get_session(self.db.pool(), id).await
    }

    async fn create_verify_email(
        &self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        queries::create_verify_email(self.db.pool(), &arg).await
    }

    async fn transfer_tx(&self, arg: TransferTxParams) -> Result<TransferTxResult, StoreError> {
        arg.validate()?;
        self.uow
            .execute(move |conn| Box::pin(transfer::execute_in_tx(conn, arg)))
            .await
    }

    async fn create_user_tx(&self, arg: CreateUserTxParams) -> Result<User, StoreError> {
        let CreateUserTxParams {
            params,
            after_create,
        } = arg;

        self.uow
            .execute(move |conn| {
                Box::pin(async move {
                    let user = queries::create_user(&mut *conn, &params).await?;
                    if let Some(hook) = after_create {
                        hook(user.clone()).await?;
                    }
                    Ok(user)
                })
            })
            .await
    }

    async fn verify_email_tx(
        &self,
        arg: VerifyEmailTxParams,
    ) -> Result<VerifyEmailTxResult, StoreError> {
        self.uow
            .execute(move |conn| {
                Box::pin(async move {
                    let verify_email =
                        queries::consume_verify_email(&mut *conn, arg.email_id, &arg.secret_code)
                            .await?;
                    let user = queries::mark_email_verified(&mut *conn, &verify_email.username)
                        .await?;
                    Ok(VerifyEmailTxResult { user, verify_email })
                })
            })
            .await
    }
}
