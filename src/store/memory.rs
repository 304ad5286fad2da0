//! In-process [`Store`]
//!
//! A single async mutex guards all rows, which makes every composition
//! trivially serializable. Transactional operations validate everything
//! before the first write, so a failing call leaves no trace.
//!
//! The schema's constraints are enforced with the same outcome PostgreSQL
//! reports: an account owner must exist (NotFound), and `(owner, currency)`,
//! usernames and emails are unique (Conflict).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateSessionParams, CreateTransferParams, CreateUserParams, CreateVerifyEmailParams, Entry,
    ListAccountsParams, Session, Transfer, UpdateUserParams, User, VerifyEmail,
    VerifyEmailTxParams, VerifyEmailTxResult,
};
use super::{CreateUserTxParams, Store};
use crate::error::StoreError;
use crate::transfer::{TransferTxParams, TransferTxResult};

#[derive(Default)]
struct State {
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    users: HashMap<String, User>,
    sessions: HashMap<Uuid, Session>,
    verify_emails: BTreeMap<i64, VerifyEmail>,
    next_account_id: i64,
    next_entry_id: i64,
    next_transfer_id: i64,
    next_verify_email_id: i64,
}

impl State {
    fn account(&self, id: i64) -> Result<&Account, StoreError> {
        self.accounts
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("account {id}")))
    }

    fn insert_entry(&mut self, account_id: i64, amount: i64) -> Entry {
        self.next_entry_id += 1;
        let entry = Entry {
            id: self.next_entry_id,
            account_id,
            amount,
            created_at: Utc::now(),
        };
        self.entries.insert(entry.id, entry.clone());
        entry
    }

    fn insert_transfer(&mut self, arg: CreateTransferParams) -> Transfer {
        self.next_transfer_id += 1;
        let transfer = Transfer {
            id: self.next_transfer_id,
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.transfers.insert(transfer.id, transfer.clone());
        transfer
    }

    fn add_balance(&mut self, id: i64, amount: i64) -> Result<Account, StoreError> {
        let account = self
            .accounts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("account {id}")))?;
        account.balance += amount;
        Ok(account.clone())
    }

    fn new_user(&self, arg: &CreateUserParams) -> Result<User, StoreError> {
        if self.users.contains_key(&arg.username) {
            return Err(StoreError::Conflict(format!(
                "username {} already exists",
                arg.username
            )));
        }
        if self.users.values().any(|u| u.email == arg.email) {
            return Err(StoreError::Conflict(format!(
                "email {} already exists",
                arg.email
            )));
        }
        let now = Utc::now();
        Ok(User {
            username: arg.username.clone(),
            hashed_password: arg.hashed_password.clone(),
            full_name: arg.full_name.clone(),
            email: arg.email.clone(),
            password_changed_at: DateTime::<Utc>::UNIX_EPOCH,
            created_at: now,
            is_email_verified: false,
        })
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage; every call fails with `Internal` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Internal("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    /// Sum of all account balances
    pub async fn total_balance(&self) -> i64 {
        self.state.lock().await.accounts.values().map(|a| a.balance).sum()
    }

    pub async fn transfer_count(&self) -> usize {
        self.state.lock().await.transfers.len()
    }

    pub async fn entries_for(&self, account_id: i64) -> Vec<Entry> {
        self.state
            .lock()
            .await
            .entries
            .values()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect()
    }

    pub async fn verify_emails_for(&self, username: &str) -> Vec<VerifyEmail> {
        self.state
            .lock()
            .await
            .verify_emails
            .values()
            .filter(|v| v.username == username)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_account(&self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if !state.users.contains_key(&arg.owner) {
            return Err(StoreError::NotFound(format!("user {}", arg.owner)));
        }
        if state
            .accounts
            .values()
            .any(|a| a.owner == arg.owner && a.currency == arg.currency)
        {
            return Err(StoreError::Conflict(format!(
                "{} already owns a {} account",
                arg.owner, arg.currency
            )));
        }
        state.next_account_id += 1;
        let account = Account {
            id: state.next_account_id,
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        };
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, id: i64) -> Result<Account, StoreError> {
        self.check_available()?;
        self.state.lock().await.account(id).cloned()
    }

    async fn list_accounts(&self, arg: ListAccountsParams) -> Result<Vec<Account>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .filter(|a| a.owner == arg.owner)
            .skip(arg.offset.max(0) as usize)
            .take(arg.limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn add_account_balance(
        &self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        self.check_available()?;
        self.state.lock().await.add_balance(arg.id, arg.amount)
    }

    async fn create_entry(&self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.account(arg.account_id)?;
        Ok(state.insert_entry(arg.account_id, arg.amount))
    }

    async fn get_entry(&self, id: i64) -> Result<Entry, StoreError> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("entry {id}")))
    }

    async fn create_transfer(&self, arg: CreateTransferParams) -> Result<Transfer, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.account(arg.from_account_id)?;
        state.account(arg.to_account_id)?;
        Ok(state.insert_transfer(arg))
    }

    async fn get_transfer(&self, id: i64) -> Result<Transfer, StoreError> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .transfers
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("transfer {id}")))
    }

    async fn create_user(&self, arg: CreateUserParams) -> Result<User, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let user = state.new_user(&arg)?;
        state.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&self, username: &str) -> Result<User, StoreError> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .users
            .get(username)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {username}")))
    }

    async fn update_user(&self, arg: UpdateUserParams) -> Result<User, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(email) = &arg.email
            && state
                .users
                .values()
                .any(|u| u.username != arg.username && &u.email == email)
        {
            return Err(StoreError::Conflict(format!("email {email} already exists")));
        }
        let user = state
            .users
            .get_mut(&arg.username)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", arg.username)))?;
        if let Some(hashed_password) = arg.hashed_password {
            user.hashed_password = hashed_password;
        }
        if let Some(changed_at) = arg.password_changed_at {
            user.password_changed_at = changed_at;
        }
        if let Some(full_name) = arg.full_name {
            user.full_name = full_name;
        }
        if let Some(email) = arg.email {
            user.email = email;
        }
        Ok(user.clone())
    }

    async fn create_session(&self, arg: CreateSessionParams) -> Result<Session, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if !state.users.contains_key(&arg.username) {
            return Err(StoreError::NotFound(format!("user {}", arg.username)));
        }
        if state.sessions.contains_key(&arg.id) {
            return Err(StoreError::Conflict(format!("session {}", arg.id)));
        }
        let session = Session {
            id: arg.id,
            username: arg.username,
            refresh_token: arg.refresh_token,
            user_agent: arg.user_agent,
            client_ip: arg.client_ip,
            is_blocked: arg.is_blocked,
            expires_at: arg.expires_at,
            created_at: Utc::now(),
        };
        state.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: Uuid) -> Result<Session, StoreError> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    async fn create_verify_email(
        &self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if !state.users.contains_key(&arg.username) {
            return Err(StoreError::NotFound(format!("user {}", arg.username)));
        }
        state.next_verify_email_id += 1;
        let record = VerifyEmail {
            id: state.next_verify_email_id,
            username: arg.username,
            email: arg.email,
            secret_code: arg.secret_code,
            is_used: false,
            created_at: Utc::now(),
            expired_at: arg.expired_at,
        };
        state.verify_emails.insert(record.id, record.clone());
        Ok(record)
    }

    async fn transfer_tx(&self, arg: TransferTxParams) -> Result<TransferTxResult, StoreError> {
        arg.validate()?;
        self.check_available()?;
        let mut state = self.state.lock().await;

        // Validate before the first write so failure leaves no partial state
        let from_balance = state.account(arg.from_account_id)?.balance;
        state.account(arg.to_account_id)?;
        let mut projected = state.account(arg.from_account_id)?.clone();
        projected.balance = from_balance - arg.amount;
        arg.overdraft.check(&projected, arg.amount)?;

        let transfer = state.insert_transfer(CreateTransferParams {
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
        });
        let from_entry = state.insert_entry(arg.from_account_id, -arg.amount);
        let to_entry = state.insert_entry(arg.to_account_id, arg.amount);
        let from_account = state.add_balance(arg.from_account_id, -arg.amount)?;
        let to_account = state.add_balance(arg.to_account_id, arg.amount)?;

        Ok(TransferTxResult {
            transfer,
            from_entry,
            to_entry,
            from_account,
            to_account,
        })
    }

    async fn create_user_tx(&self, arg: CreateUserTxParams) -> Result<User, StoreError> {
        self.check_available()?;
        // Held across the hook: the hook must not call back into this store
        let mut state = self.state.lock().await;
        let user = state.new_user(&arg.params)?;
        if let Some(hook) = arg.after_create {
            hook(user.clone()).await?;
        }
        state.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn verify_email_tx(
        &self,
        arg: VerifyEmailTxParams,
    ) -> Result<VerifyEmailTxResult, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let not_found = || StoreError::NotFound(format!("verify email {}", arg.email_id));

        let record = state.verify_emails.get(&arg.email_id).ok_or_else(not_found)?;
        if record.secret_code != arg.secret_code
            || record.is_used
            || record.expired_at <= Utc::now()
        {
            return Err(not_found());
        }
        let username = record.username.clone();
        if !state.users.contains_key(&username) {
            return Err(StoreError::NotFound(format!("user {username}")));
        }

        let verify_email = match state.verify_emails.get_mut(&arg.email_id) {
            Some(record) => {
                record.is_used = true;
                record.clone()
            }
            None => return Err(not_found()),
        };
        let user = match state.users.get_mut(&username) {
            Some(user) => {
                user.is_email_verified = true;
                user.clone()
            }
            None => return Err(StoreError::NotFound(format!("user {username}"))),
        };

        Ok(VerifyEmailTxResult { user, verify_email })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    /// One USD account per balance, each with its own owner
    async fn seed_accounts(store: &MemoryStore, balances: &[i64]) -> Vec<Account> {
        let mut accounts = Vec::new();
        for (i, balance) in balances.iter().enumerate() {
            let owner = format!("owner{i}");
            store.create_user(new_user(&owner)).await.unwrap();
            let account = store
                .create_account(CreateAccountParams {
                    owner,
                    balance: *balance,
                    currency: "USD".into(),
                })
                .await
                .unwrap();
            accounts.push(account);
        }
        accounts
    }

    fn new_user(username: &str) -> CreateUserParams {
        CreateUserParams {
            username: username.into(),
            hashed_password: "hash".into(),
            full_name: "Alice Liddell".into(),
            email: format!("{username}@example.com"),
        }
    }

    #[tokio::test]
    async fn test_transfer_scenario() {
        let store = MemoryStore::new();
        let accounts = seed_accounts(&store, &[100, 50]).await;

        let result = store
            .transfer_tx(TransferTxParams::new(accounts[0].id, accounts[1].id, 30))
            .await
            .unwrap();

        assert_eq!(result.from_account.balance, 70);
        assert_eq!(result.to_account.balance, 80);
        assert_eq!(result.transfer.amount, 30);
        assert_eq!(result.from_entry.amount, -30);
        assert_eq!(result.to_entry.amount, 30);
        assert_eq!(store.total_balance().await, 150);
    }

    #[tokio::test]
    async fn test_failed_transfer_leaves_no_trace() {
        let store = MemoryStore::new();
        let accounts = seed_accounts(&store, &[100]).await;

        let err = store
            .transfer_tx(TransferTxParams::new(accounts[0].id, 999, 30))
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(store.transfer_count().await, 0);
        assert!(store.entries_for(accounts[0].id).await.is_empty());
        assert_eq!(store.get_account(accounts[0].id).await.unwrap().balance, 100);
    }

    #[tokio::test]
    async fn test_insufficient_funds_rejected() {
        let store = MemoryStore::new();
        let accounts = seed_accounts(&store, &[10, 0]).await;

        let err = store
            .transfer_tx(TransferTxParams::new(accounts[0].id, accounts[1].id, 30))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(store.total_balance().await, 10);
        assert_eq!(store.transfer_count().await, 0);
    }

    #[tokio::test]
    async fn test_account_owner_must_exist() {
        let store = MemoryStore::new();
        let err = store
            .create_account(CreateAccountParams {
                owner: "nobody".into(),
                balance: 0,
                currency: "USD".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.total_balance().await, 0);
    }

    #[tokio::test]
    async fn test_one_account_per_owner_and_currency() {
        let store = MemoryStore::new();
        store.create_user(new_user("alice")).await.unwrap();
        let usd = |currency: &str| CreateAccountParams {
            owner: "alice".into(),
            balance: 0,
            currency: currency.into(),
        };

        store.create_account(usd("USD")).await.unwrap();
        let err = store.create_account(usd("USD")).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        store.create_account(usd("EUR")).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_to_taken_email_conflicts() {
        let store = MemoryStore::new();
        store.create_user(new_user("alice")).await.unwrap();
        store.create_user(new_user("bob")).await.unwrap();

        let err = store
            .update_user(UpdateUserParams::new("bob").with_email("alice@example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        assert_eq!(store.get_user("bob").await.unwrap().email, "bob@example.com");

        // Keeping one's own email is not a conflict
        store
            .update_user(UpdateUserParams::new("alice").with_email("alice@example.com"))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_opposite_transfers_conserve_total() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let accounts = seed_accounts(&store, &[10_000, 10_000]).await;
        let (a, b) = (accounts[0].id, accounts[1].id);
        const TRANSFERS: i64 = 100;

        let mut handles = Vec::new();
        for i in 0..TRANSFERS {
            let store = store.clone();
            let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
            handles.push(tokio::spawn(async move {
                store.transfer_tx(TransferTxParams::new(from, to, i + 1)).await
            }));
        }

        let joined = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            futures::future::join_all(handles),
        )
        .await
        .expect("concurrent transfers stalled");
        for result in joined {
            let result = result.unwrap().unwrap();
            assert_eq!(result.from_entry.amount + result.to_entry.amount, 0);
        }

        assert_eq!(store.total_balance().await, 20_000);
        assert_eq!(store.transfer_count().await, TRANSFERS as usize);
        let entries = store.entries_for(a).await.len() + store.entries_for(b).await.len();
        assert_eq!(entries, 2 * TRANSFERS as usize);

        // Odd amounts (sum 2500) went a to b, even amounts (sum 2550) b to a
        assert_eq!(store.get_account(a).await.unwrap().balance, 10_000 + 50);
        assert_eq!(store.get_account(b).await.unwrap().balance, 10_000 - 50);
    }

    #[tokio::test]
    async fn test_duplicate_username_conflicts() {
        let store = MemoryStore::new();
        store.create_user(new_user("alice")).await.unwrap();
        let err = store.create_user(new_user("alice")).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_update_user_partial() {
        let store = MemoryStore::new();
        store.create_user(new_user("alice")).await.unwrap();

        let updated = store
            .update_user(UpdateUserParams {
                username: "alice".into(),
                full_name: Some("Alice Pleasance".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(updated.full_name, "Alice Pleasance");
        assert_eq!(updated.email, "alice@example.com");
    }

    #[tokio::test]
    async fn test_verify_email_tx_consumes_code_once() {
        let store = MemoryStore::new();
        store.create_user(new_user("alice")).await.unwrap();
        let record = store
            .create_verify_email(CreateVerifyEmailParams {
                username: "alice".into(),
                email: "alice@example.com".into(),
                secret_code: "code".into(),
                expired_at: Utc::now() + Duration::minutes(15),
            })
            .await
            .unwrap();

        let params = VerifyEmailTxParams {
            email_id: record.id,
            secret_code: "code".into(),
        };
        let result = store.verify_email_tx(params.clone()).await.unwrap();
        assert!(result.user.is_email_verified);
        assert!(result.verify_email.is_used);

        let err = store.verify_email_tx(params).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_verify_email_wrong_code() {
        let store = MemoryStore::new();
        store.create_user(new_user("alice")).await.unwrap();
        let record = store
            .create_verify_email(CreateVerifyEmailParams {
                username: "alice".into(),
                email: "alice@example.com".into(),
                secret_code: "code".into(),
                expired_at: Utc::now() + Duration::minutes(15),
            })
            .await
            .unwrap();

        let err = store
            .verify_email_tx(VerifyEmailTxParams {
                email_id: record.id,
                secret_code: "wrong".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.get_user("alice").await.unwrap().is_email_verified);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_internal() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.get_user("alice").await.unwrap_err();
        assert_eq!(err.code(), "INTERNAL");
    }
}
