//! Persistence seam for accounts, credentials, the transaction log and usage
//! counters.
//!
//! Every mutating method is one atomic unit: either all of its writes commit
//! or none do. Balance-affecting methods write their [`Transaction`] inside
//! that same unit.

use async_trait::async_trait;
use thiserror::Error;
use time::{Date, OffsetDateTime};

use super::quota::QuotaPolicy;
use super::store_types::{
    Account, ApiKeyRecord, PaymentEventRecord, PricingSettings, Role, Transaction,
    TransactionStatus, UsageRecord,
};
use crate::error::MeterError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entity {
    Account,
    ApiKey,
    Deposit,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Entity::Account => "account",
            Entity::ApiKey => "api key",
            Entity::Deposit => "deposit",
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: String },
    #[error("concurrent update conflict on {entity} {id}")]
    Conflict { entity: Entity, id: String },
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
    #[error("{entity} already exists: {id}")]
    Duplicate { entity: Entity, id: String },
    #[error("ledger inconsistency: {detail}")]
    Inconsistent { detail: String },
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// True when the failed call is known to have rolled back completely.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict { .. } | StoreError::Unavailable { .. }
        )
    }

    pub(crate) fn account_not_found(account_id: &str) -> Self {
        StoreError::NotFound {
            entity: Entity::Account,
            id: account_id.to_string(),
        }
    }

    pub(crate) fn inconsistent(detail: impl Into<String>) -> Self {
        StoreError::Inconsistent {
            detail: detail.into(),
        }
    }
}

impl From<StoreError> for MeterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound {
                entity: Entity::Account,
                id,
            } => MeterError::AccountNotFound { account_id: id },
            StoreError::NotFound {
                entity: Entity::ApiKey,
                id,
            } => MeterError::ApiKeyNotFound { key_id: id },
            StoreError::NotFound {
                entity: Entity::Deposit,
                id,
            } => MeterError::DepositNotFound { reference: id },
            StoreError::Duplicate {
                entity: Entity::Deposit,
                id,
            } => MeterError::DuplicatePaymentReference { reference: id },
            StoreError::Duplicate { entity, id } => {
                MeterError::invalid(format!("{entity} already exists: {id}"))
            }
            StoreError::Conflict { .. } => MeterError::ConcurrencyConflict,
            StoreError::Inconsistent { detail } => MeterError::LedgerInconsistency { detail },
            other => MeterError::StorageUnavailable {
                message: other.to_string(),
            },
        }
    }
}

/// One metered unit to be charged against an account.
#[derive(Clone, Debug)]
pub struct ChargeRequest {
    pub account_id: String,
    pub operation: String,
    pub cost: i64,
    pub policy: QuotaPolicy,
    pub now: OffsetDateTime,
    /// Id used for the paid-path transaction; unused on the free path.
    pub transaction_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChargeOutcome {
    Free {
        account: Account,
    },
    Paid {
        account: Account,
        transaction: Transaction,
    },
    /// Nothing was written.
    Insufficient {
        balance: i64,
    },
}

/// The writes a charge would perform, derived from the locked account row.
/// Shared by every backend so the decision rules live in one place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ChargePlan {
    Free {
        updated: Account,
    },
    Paid {
        updated: Account,
        transaction: Transaction,
    },
    Insufficient {
        balance: i64,
    },
}

impl ChargeRequest {
    pub(crate) fn plan(&self, account: &Account) -> Result<ChargePlan, StoreError> {
        if account.balance < 0 {
            return Err(StoreError::inconsistent(format!(
                "account {} has negative balance {}",
                account.id, account.balance
            )));
        }

        let quota = self.policy.evaluate(
            self.now,
            account.free_operations_used,
            account.free_operations_reset_at,
        );

        if quota.has_free() {
            let mut updated = account.clone();
            updated.free_operations_used = quota.used.saturating_add(1);
            updated.free_operations_reset_at = quota.reset_at;
            updated.version = account.version.wrapping_add(1);
            return Ok(ChargePlan::Free { updated });
        }

        if account.balance < self.cost {
            return Ok(ChargePlan::Insufficient {
                balance: account.balance,
            });
        }

        let new_balance = account
            .balance
            .checked_sub(self.cost)
            .filter(|balance| *balance >= 0)
            .ok_or_else(|| {
                StoreError::inconsistent(format!(
                    "charging {} against balance {} of account {} would go negative",
                    self.cost, account.balance, account.id
                ))
            })?;

        let mut updated = account.clone();
        updated.balance = new_balance;
        updated.free_operations_used = quota.used;
        updated.free_operations_reset_at = quota.reset_at;
        updated.version = account.version.wrapping_add(1);

        let transaction = Transaction {
            id: self.transaction_id.clone(),
            account_id: account.id.clone(),
            amount: -self.cost,
            balance_after: new_balance,
            status: TransactionStatus::Completed,
            external_payment_ref: None,
            description: operation_description(&self.operation),
            created_at: self.now,
        };
        Ok(ChargePlan::Paid {
            updated,
            transaction,
        })
    }
}

pub fn operation_description(operation: &str) -> String {
    format!("operation: {operation}")
}

#[derive(Clone, Debug)]
pub struct PendingDepositRequest {
    pub account_id: String,
    pub amount: i64,
    pub reference: String,
    pub description: String,
    pub transaction_id: String,
    pub now: OffsetDateTime,
}

impl PendingDepositRequest {
    /// The pending row records the balance as it stands; it only moves when
    /// the deposit completes.
    pub(crate) fn transaction(&self, current_balance: i64) -> Transaction {
        Transaction {
            id: self.transaction_id.clone(),
            account_id: self.account_id.clone(),
            amount: self.amount,
            balance_after: current_balance,
            status: TransactionStatus::Pending,
            external_payment_ref: Some(self.reference.clone()),
            description: self.description.clone(),
            created_at: self.now,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Credit the account. `None` keeps the amount recorded when the deposit
    /// was created.
    Complete { confirmed_amount: Option<i64> },
    Fail { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettleOutcome {
    /// This call performed the transition.
    Applied(Transaction),
    /// The deposit was already terminal; nothing was written.
    AlreadySettled(Transaction),
}

impl SettleOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            SettleOutcome::Applied(tx) | SettleOutcome::AlreadySettled(tx) => tx,
        }
    }

    pub fn into_transaction(self) -> Transaction {
        match self {
            SettleOutcome::Applied(tx) | SettleOutcome::AlreadySettled(tx) => tx,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, SettleOutcome::Applied(_))
    }
}

/// Applies `settlement` to a pending deposit row, returning the rewritten
/// transaction and the account's new balance.
pub(crate) fn settle_pending(
    pending: &Transaction,
    account: &Account,
    settlement: &Settlement,
) -> Result<(Transaction, i64), StoreError> {
    let mut settled = pending.clone();
    match settlement {
        Settlement::Complete { confirmed_amount } => {
            let amount = confirmed_amount.unwrap_or(pending.amount);
            if amount <= 0 {
                return Err(StoreError::inconsistent(format!(
                    "deposit {} confirmed with non-positive amount {amount}",
                    pending.id
                )));
            }
            let new_balance = account.balance.checked_add(amount).ok_or_else(|| {
                StoreError::inconsistent(format!(
                    "deposit {} overflows balance of account {}",
                    pending.id, account.id
                ))
            })?;
            settled.amount = amount;
            settled.balance_after = new_balance;
            settled.status = TransactionStatus::Completed;
            Ok((settled, new_balance))
        }
        Settlement::Fail { .. } => {
            settled.balance_after = account.balance;
            settled.status = TransactionStatus::Failed;
            Ok((settled, account.balance))
        }
    }
}

#[derive(Clone, Debug)]
pub struct AdjustmentRequest {
    pub account_id: String,
    pub amount: i64,
    pub description: String,
    pub transaction_id: String,
    pub now: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdjustmentOutcome {
    Applied {
        account: Account,
        transaction: Transaction,
    },
    /// The adjustment would leave a negative balance; nothing was written.
    Refused { balance: i64 },
}

impl AdjustmentRequest {
    pub(crate) fn apply(&self, account: &Account) -> Result<Option<(Account, Transaction)>, StoreError> {
        let Some(new_balance) = account.balance.checked_add(self.amount) else {
            return Err(StoreError::inconsistent(format!(
                "adjustment of {} overflows balance of account {}",
                self.amount, account.id
            )));
        };
        if new_balance < 0 {
            return Ok(None);
        }
        let mut updated = account.clone();
        updated.balance = new_balance;
        updated.version = account.version.wrapping_add(1);
        let transaction = Transaction {
            id: self.transaction_id.clone(),
            account_id: account.id.clone(),
            amount: self.amount,
            balance_after: new_balance,
            status: TransactionStatus::Completed,
            external_payment_ref: None,
            description: self.description.clone(),
            created_at: self.now,
        };
        Ok(Some((updated, transaction)))
    }
}

/// Per-account ceiling on live API keys, chosen by whether the account is
/// funded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyLimits {
    pub unfunded: u32,
    pub funded: u32,
}

impl KeyLimits {
    pub fn for_balance(&self, balance: i64) -> u32 {
        if balance > 0 { self.funded } else { self.unfunded }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyInsertOutcome {
    Created,
    LimitReached { limit: u32 },
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Creates the account and, when given, its opening transaction.
    async fn create_account(
        &self,
        account: Account,
        opening: Option<Transaction>,
    ) -> Result<(), StoreError>;

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError>;

    async fn set_role(&self, account_id: &str, role: Role) -> Result<Account, StoreError>;

    /// Runs the quota rollover and the charge decision against the locked
    /// account row and commits the resulting writes.
    async fn charge(&self, request: ChargeRequest) -> Result<ChargeOutcome, StoreError>;

    async fn apply_adjustment(
        &self,
        request: AdjustmentRequest,
    ) -> Result<AdjustmentOutcome, StoreError>;

    /// Fails with `Duplicate { entity: Deposit }` when the reference exists.
    async fn create_pending_deposit(
        &self,
        request: PendingDepositRequest,
    ) -> Result<Transaction, StoreError>;

    /// Only pending rows transition; `now` stamps the row's update time.
    async fn settle_deposit(
        &self,
        reference: &str,
        settlement: Settlement,
        now: OffsetDateTime,
    ) -> Result<SettleOutcome, StoreError>;

    async fn find_deposit(&self, reference: &str) -> Result<Option<Transaction>, StoreError>;

    /// Newest first.
    async fn list_transactions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError>;

    async fn insert_api_key(
        &self,
        record: ApiKeyRecord,
        limits: KeyLimits,
    ) -> Result<KeyInsertOutcome, StoreError>;

    async fn find_api_key(&self, key: &str) -> Result<Option<ApiKeyRecord>, StoreError>;

    async fn touch_api_key(&self, key_id: &str, now: OffsetDateTime) -> Result<(), StoreError>;

    async fn list_api_keys(&self, account_id: &str) -> Result<Vec<ApiKeyRecord>, StoreError>;

    /// Returns false when the account owns no key with that id.
    async fn delete_api_key(&self, account_id: &str, key_id: &str) -> Result<bool, StoreError>;

    /// Adds one to the `(account, operation, date)` counter, creating the row
    /// on first use, and returns the new count.
    async fn increment_usage(
        &self,
        account_id: &str,
        operation: &str,
        date: Date,
    ) -> Result<u64, StoreError>;

    /// Rows with `from <= date <= to`.
    async fn usage_between(
        &self,
        account_id: &str,
        from: Date,
        to: Date,
    ) -> Result<Vec<UsageRecord>, StoreError>;

    async fn payment_event_seen(&self, event_id: &str) -> Result<bool, StoreError>;

    /// Returns false when the event id was already recorded.
    async fn record_payment_event(&self, event: PaymentEventRecord) -> Result<bool, StoreError>;

    /// `None` until pricing has been saved once.
    async fn load_pricing_settings(&self) -> Result<Option<PricingSettings>, StoreError>;

    /// Replaces the saved pricing as a whole.
    async fn save_pricing_settings(&self, settings: PricingSettings) -> Result<(), StoreError>;
}
