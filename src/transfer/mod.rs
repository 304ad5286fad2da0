//! Transfer Engine
//!
//! Moves funds between two accounts inside one unit of work.
//!
//! # Algorithm
//!
//! ```text
//! LOCK min(from, to) → LOCK max(from, to) → INSERT transfer
//!     → INSERT entry(-amount, from) → INSERT entry(+amount, to)
//!     → balance(from) += -amount → balance(to) += amount
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Fixed Lock Order**: rows are locked in ascending account id regardless of
//!    direction, so two transfers over the same pair can never wait on each other
//!    in a cycle
//! 2. **Atomic Deltas**: balances change through `balance = balance + delta`, never
//!    read-modify-write
//! 3. **All or Nothing**: any failing step rolls back every write of the call
//! 4. **Conservation**: the two entries always sum to zero

use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::StoreError;
use crate::store::Store;
use crate::store::models::{
    Account, AddAccountBalanceParams, CreateEntryParams, CreateTransferParams, Entry, Transfer,
};
use crate::store::queries;

/// Whether a transfer may leave the source balance negative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverdraftPolicy {
    /// Fail with `InsufficientFunds` and roll back
    #[default]
    Reject,
    Allow,
}

impl OverdraftPolicy {
    pub fn from_allow(allow_overdraft: bool) -> Self {
        if allow_overdraft {
            OverdraftPolicy::Allow
        } else {
            OverdraftPolicy::Reject
        }
    }

    /// Check the source account after its debit has been applied
    pub fn check(&self, debited: &Account, amount: i64) -> Result<(), StoreError> {
        match self {
            OverdraftPolicy::Reject if debited.balance < 0 => Err(StoreError::InsufficientFunds {
                account_id: debited.id,
                balance: debited.balance,
                amount,
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTxParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
    pub overdraft: OverdraftPolicy,
}

impl TransferTxParams {
    pub fn new(from_account_id: i64, to_account_id: i64, amount: i64) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
            overdraft: OverdraftPolicy::default(),
        }
    }

    pub fn with_overdraft(mut self, overdraft: OverdraftPolicy) -> Self {
        self.overdraft = overdraft;
        self
    }

    /// Reject inputs that can never form a valid transfer
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.from_account_id == self.to_account_id {
            return Err(StoreError::Validation(
                "source and destination account cannot be the same".to_string(),
            ));
        }
        if self.amount <= 0 {
            return Err(StoreError::Validation(
                "amount must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Account ids in the order their row locks must be taken
    #[inline]
    pub fn lock_order(&self) -> (i64, i64) {
        lock_order(self.from_account_id, self.to_account_id)
    }
}

/// Everything a committed transfer produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_entry: Entry,
    pub to_entry: Entry,
    pub from_account: Account,
    pub to_account: Account,
}

/// Ascending id order, independent of transfer direction
#[inline]
pub fn lock_order(a: i64, b: i64) -> (i64, i64) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Run the transfer algorithm on a connection that is already inside a transaction
pub async fn execute_in_tx(
    conn: &mut PgConnection,
    arg: TransferTxParams,
) -> Result<TransferTxResult, StoreError> {
    let (first, second) = arg.lock_order();
    queries::lock_account(&mut *conn, first).await?;
    queries::lock_account(&mut *conn, second).await?;

    let transfer = queries::create_transfer(
        &mut *conn,
        CreateTransferParams {
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
        },
    )
    .await?;

    let from_entry = queries::create_entry(
        &mut *conn,
        CreateEntryParams {
            account_id: arg.from_account_id,
            amount: -arg.amount,
        },
    )
    .await?;

    let to_entry = queries::create_entry(
        &mut *conn,
        CreateEntryParams {
            account_id: arg.to_account_id,
            amount: arg.amount,
        },
    )
    .await?;

    let from_account = queries::add_account_balance(
        &mut *conn,
        AddAccountBalanceParams {
            id: arg.from_account_id,
            amount: -arg.amount,
        },
    )
    .await?;
    arg.overdraft.check(&from_account, arg.amount)?;

    let to_account = queries::add_account_balance(
        &mut *conn,
        AddAccountBalanceParams {
            id: arg.to_account_id,
            amount: arg.amount,
        },
    )
    .await?;

    debug!(
        transfer_id = transfer.id,
        from = arg.from_account_id,
        to = arg.to_account_id,
        amount = arg.amount,
        "transfer applied"
    );

    Ok(TransferTxResult {
        transfer,
        from_entry,
        to_entry,
        from_account,
        to_account,
    })
}

/// Entry point for moving money; applies the configured overdraft policy
#[derive(Clone)]
pub struct TransferService {
    store: Arc<dyn Store>,
    overdraft: OverdraftPolicy,
}

impl TransferService {
    pub fn new(store: Arc<dyn Store>, overdraft: OverdraftPolicy) -> Self {
        Self { store, overdraft }
    }

    pub fn from_config(store: Arc<dyn Store>, config: &TransferConfig) -> Self {
        Self::new(store, OverdraftPolicy::from_allow(config.allow_overdraft))
    }

    pub fn overdraft(&self) -> OverdraftPolicy {
        self.overdraft
    }

    pub async fn transfer_funds(
        &self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<TransferTxResult, StoreError> {
        let arg = TransferTxParams::new(from_account_id, to_account_id, amount)
            .with_overdraft(self.overdraft);

        match self.store.transfer_tx(arg).await {
            Ok(result) => {
                info!(
                    target: "TRANSFER",
                    transfer_id = result.transfer.id,
                    from = from_account_id,
                    to = to_account_id,
                    amount,
                    "transfer committed"
                );
                Ok(result)
            }
            Err(e) => {
                warn!(
                    target: "TRANSFER",
                    from = from_account_id,
                    to = to_account_id,
                    amount,
                    code = e.code(),
                    "transfer failed: {}",
                    e
                );
                Err(e)
            }
        }
    }
}
