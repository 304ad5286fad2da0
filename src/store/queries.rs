//! Primitive queries
//!
//! Every function is generic over [`sqlx::PgExecutor`] so the same statement
//! runs against the pool directly or against the connection handed out by a
//! [`UnitOfWork`](crate::db::UnitOfWork).

use sqlx::PgExecutor;

use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateSessionParams, CreateTransferParams, CreateUserParams, CreateVerifyEmailParams, Entry,
    ListAccountsParams, Session, Transfer, UpdateUserParams, User, VerifyEmail,
};
use crate::error::StoreError;

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const USER_COLUMNS: &str =
    "username, hashed_password, full_name, email, password_changed_at, created_at, is_email_verified";
const VERIFY_EMAIL_COLUMNS: &str =
    "id, username, email, secret_code, is_used, created_at, expired_at";

// ============================================================================
// Accounts
// ============================================================================

pub async fn create_account<'e, E: PgExecutor<'e>>(
    executor: E,
    arg: &CreateAccountParams,
) -> Result<Account, StoreError> {
    let account = sqlx::query_as::<_, Account>(&format!(
        "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {ACCOUNT_COLUMNS}"
    ))
    .bind(&arg.owner)
    .bind(arg.balance)
    .bind(&arg.currency)
    .fetch_one(executor)
    .await?;
    Ok(account)
}

pub async fn get_account<'e, E: PgExecutor<'e>>(
    executor: E,
    id: i64,
) -> Result<Account, StoreError> {
    sqlx::query_as::<_, Account>(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("account {id}")))
}

/// Take an exclusive row lock on an account for the rest of the transaction
///
/// `NO KEY UPDATE` does not conflict with the `KEY SHARE` locks that
/// foreign-key checks take when entries and transfers referencing the
/// account are inserted concurrently.
pub async fn lock_account<'e, E: PgExecutor<'e>>(
    executor: E,
    id: i64,
) -> Result<Account, StoreError> {
    sqlx::query_as::<_, Account>(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1 FOR NO KEY UPDATE"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("account {id}")))
}

pub async fn list_accounts<'e, E: PgExecutor<'e>>(
    executor: E,
    arg: &ListAccountsParams,
) -> Result<Vec<Account>, StoreError> {
    let accounts = sqlx::query_as::<_, Account>(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = $1 ORDER BY id LIMIT $2 OFFSET $3"
    ))
    .bind(&arg.owner)
    .bind(arg.limit)
    .bind(arg.offset)
    .fetch_all(executor)
    .await?;
    Ok(accounts)
}

/// Atomic balance delta; never read-modify-write
pub async fn add_account_balance<'e, E: PgExecutor<'e>>(
    executor: E,
    arg: AddAccountBalanceParams,
) -> Result<Account, StoreError> {
    sqlx::query_as::<_, Account>(&format!(
        "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {ACCOUNT_COLUMNS}"
    ))
    .bind(arg.amount)
    .bind(arg.id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("account {}", arg.id)))
}

// ============================================================================
// Entries & Transfers
// ============================================================================

pub async fn create_entry<'e, E: PgExecutor<'e>>(
    executor: E,
    arg: CreateEntryParams,
) -> Result<Entry, StoreError> {
    let entry = sqlx::query_as::<_, Entry>(
        "INSERT INTO entries (account_id, amount) VALUES ($1, $2)
         RETURNING id, account_id, amount, created_at",
    )
    .bind(arg.account_id)
    .bind(arg.amount)
    .fetch_one(executor)
    .await?;
    Ok(entry)
}

pub async fn get_entry<'e, E: PgExecutor<'e>>(executor: E, id: i64) -> Result<Entry, StoreError> {
    sqlx::query_as::<_, Entry>(
        "SELECT id, account_id, amount, created_at FROM entries WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("entry {id}")))
}

pub async fn create_transfer<'e, E: PgExecutor<'e>>(
    executor: E,
    arg: CreateTransferParams,
) -> Result<Transfer, StoreError> {
    let transfer = sqlx::query_as::<_, Transfer>(
        "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3)
         RETURNING id, from_account_id, to_account_id, amount, created_at",
    )
    .bind(arg.from_account_id)
    .bind(arg.to_account_id)
    .bind(arg.amount)
    .fetch_one(executor)
    .await?;
    Ok(transfer)
}

pub async fn get_transfer<'e, E: PgExecutor<'e>>(
    executor: E,
    id: i64,
) -> Result<Transfer, StoreError> {
    sqlx::query_as::<_, Transfer>(
        "SELECT id, from_account_id, to_account_id, amount, created_at FROM transfers WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("transfer {id}")))
}

// ============================================================================
// Users
// ============================================================================

pub async fn create_user<'e, E: PgExecutor<'e>>(
    executor: E,
    arg: &CreateUserParams,
) -> Result<User, StoreError> {
    let user = sqlx::query_as::<_, User>(&format!(
        "INSERT INTO users (username, hashed_password, full_name, email) VALUES ($1, $2, $3, $4)
         RETURNING {USER_COLUMNS}"
    ))
    .bind(&arg.username)
    .bind(&arg.hashed_password)
    .bind(&arg.full_name)
    .bind(&arg.email)
    .fetch_one(executor)
    .await?;
    Ok(user)
}

pub async fn get_user<'e, E: PgExecutor<'e>>(
    executor: E,
    username: &str,
) -> Result<User, StoreError> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
    ))
    .bind(username)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("user {username}")))
}

pub async fn update_user<'e, E: PgExecutor<'e>>(
    executor: E,
    arg: &UpdateUserParams,
) -> Result<User, StoreError> {
    sqlx::query_as::<_, User>(&format!(
        "UPDATE users SET
            hashed_password = COALESCE($1, hashed_password),
            password_changed_at = COALESCE($2, password_changed_at),
            full_name = COALESCE($3, full_name),
            email = COALESCE($4, email)
         WHERE username = $5
         RETURNING {USER_COLUMNS}"
    ))
    .bind(&arg.hashed_password)
    .bind(arg.password_changed_at)
    .bind(&arg.full_name)
    .bind(&arg.email)
    .bind(&arg.username)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("user {}", arg.username)))
}

pub async fn mark_email_verified<'e, E: PgExecutor<'e>>(
    executor: E,
    username: &str,
) -> Result<User, StoreError> {
    sqlx::query_as::<_, User>(&format!(
        "UPDATE users SET is_email_verified = TRUE WHERE username = $1 RETURNING {USER_COLUMNS}"
    ))
    .bind(username)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("user {username}")))
}

// ============================================================================
// Sessions
// ============================================================================

pub async fn create_session<'e, E: PgExecutor<'e>>(
    executor: E,
    arg: &CreateSessionParams,
) -> Result<Session, StoreError> {
    let session = sqlx::query_as::<_, Session>(
        "INSERT INTO sessions (id, username, refresh_token, user_agent, client_ip, is_blocked, expires_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         RETURNING id, username, refresh_token, user_agent, client_ip, is_blocked, expires_at, created_at",
    )
    .bind(arg.id)
    .bind(&arg.username)
    .bind(&arg.refresh_token)
    .bind(&arg.user_agent)
    .bind(&arg.client_ip)
    .bind(arg.is_blocked)
    .bind(arg.expires_at)
    .fetch_one(executor)
    .await?;
    Ok(session)
}

pub async fn get_session<'e, E: PgExecutor<'e>>(
    executor: E,
    id: uuid::Uuid,
) -> Result<Session, StoreError> {
    sqlx::query_as::<_, Session>(
        "SELECT id, username, refresh_token, user_agent, client_ip, is_blocked, expires_at, created_at
         FROM sessions WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
}

// ============================================================================
// Email verification
// ============================================================================

pub async fn create_verify_email<'e, E: PgExecutor<'e>>(
    executor: E,
    arg: &CreateVerifyEmailParams,
) -> Result<VerifyEmail, StoreError> {
    let record = sqlx::query_as::<_, VerifyEmail>(&format!(
        "INSERT INTO verify_emails (username, email, secret_code, expired_at) VALUES ($1, $2, $3, $4)
         RETURNING {VERIFY_EMAIL_COLUMNS}"
    ))
    .bind(&arg.username)
    .bind(&arg.email)
    .bind(&arg.secret_code)
    .bind(arg.expired_at)
    .fetch_one(executor)
    .await?;
    Ok(record)
}

/// Consume a verification code; only an unused, unexpired, matching record qualifies
pub async fn consume_verify_email<'e, E: PgExecutor<'e>>(
    executor: E,
    email_id: i64,
    secret_code: &str,
) -> Result<VerifyEmail, StoreError> {
    sqlx::query_as::<_, VerifyEmail>(&format!(
        "UPDATE verify_emails SET is_used = TRUE
         WHERE id = $1 AND secret_code = $2 AND is_used = FALSE AND expired_at > now()
         RETURNING {VERIFY_EMAIL_COLUMNS}"
    ))
    .bind(email_id)
    .bind(secret_code)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("verify email {email_id}")))
}
