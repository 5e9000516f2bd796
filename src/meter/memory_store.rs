use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use tokio::sync::Mutex;

use super::store::{
    AdjustmentOutcome, AdjustmentRequest, ChargeOutcome, ChargePlan, ChargeRequest, Entity,
    KeyInsertOutcome, KeyLimits, LedgerStore, PendingDepositRequest, SettleOutcome, Settlement,
    StoreError, settle_pending,
};
use super::store_types::{
    Account, ApiKeyRecord, PaymentEventRecord, PricingSettings, Role, Transaction, UsageRecord,
};

/// Process-local store. One mutex guards the whole state, so every method is
/// trivially atomic and serialised per account.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<String, Account>,
    api_keys: BTreeMap<String, ApiKeyRecord>,
    /// Append order; status transitions rewrite in place.
    transactions: Vec<Transaction>,
    deposits_by_ref: HashMap<String, usize>,
    usage: BTreeMap<(String, String, Date), u64>,
    payment_events: HashMap<String, PaymentEventRecord>,
    pricing: Option<PricingSettings>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryState {
    fn account_mut(&mut self, account_id: &str) -> Result<&mut Account, StoreError> {
        self.accounts
            .get_mut(account_id)
            .ok_or_else(|| StoreError::account_not_found(account_id))
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn create_account(
        &self,
        account: Account,
        opening: Option<Transaction>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.accounts.contains_key(&account.id) {
            return Err(StoreError::Duplicate {
                entity: Entity::Account,
                id: account.id,
            });
        }
        state.accounts.insert(account.id.clone(), account);
        if let Some(opening) = opening {
            state.transactions.push(opening);
        }
        Ok(())
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.accounts.get(account_id).cloned())
    }

    async fn set_role(&self, account_id: &str, role: Role) -> Result<Account, StoreError> {
        let mut state = self.state.lock().await;
        let account = state.account_mut(account_id)?;
        account.role = role;
        account.version = account.version.wrapping_add(1);
        Ok(account.clone())
    }

    async fn charge(&self, request: ChargeRequest) -> Result<ChargeOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let account = state.account_mut(&request.account_id)?;
        match request.plan(account)? {
            ChargePlan::Free { updated } => {
                *account = updated.clone();
                Ok(ChargeOutcome::Free { account: updated })
            }
            ChargePlan::Paid {
                updated,
                transaction,
            } => {
                *account = updated.clone();
                state.transactions.push(transaction.clone());
                Ok(ChargeOutcome::Paid {
                    account: updated,
                    transaction,
                })
            }
            ChargePlan::Insufficient { balance } => Ok(ChargeOutcome::Insufficient { balance }),
        }
    }

    async fn apply_adjustment(
        &self,
        request: AdjustmentRequest,
    ) -> Result<AdjustmentOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let account = state.account_mut(&request.account_id)?;
        let Some((updated, transaction)) = request.apply(account)? else {
            return Ok(AdjustmentOutcome::Refused {
                balance: account.balance,
            });
        };
        *account = updated.clone();
        state.transactions.push(transaction.clone());
        Ok(AdjustmentOutcome::Applied {
            account: updated,
            transaction,
        })
    }

    async fn create_pending_deposit(
        &self,
        request: PendingDepositRequest,
    ) -> Result<Transaction, StoreError> {
        let mut state = self.state.lock().await;
        if state.deposits_by_ref.contains_key(&request.reference) {
            return Err(StoreError::Duplicate {
                entity: Entity::Deposit,
                id: request.reference,
            });
        }
        let balance = state.account_mut(&request.account_id)?.balance;
        let transaction = request.transaction(balance);
        let index = state.transactions.len();
        state.transactions.push(transaction.clone());
        state.deposits_by_ref.insert(request.reference, index);
        Ok(transaction)
    }

    async fn settle_deposit(
        &self,
        reference: &str,
        settlement: Settlement,
        _now: OffsetDateTime,
    ) -> Result<SettleOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let index = *state
            .deposits_by_ref
            .get(reference)
            .ok_or_else(|| StoreError::NotFound {
                entity: Entity::Deposit,
                id: reference.to_string(),
            })?;
        let pending = state
            .transactions
            .get(index)
            .cloned()
            .ok_or_else(|| StoreError::inconsistent(format!("deposit index lost for {reference}")))?;
        if pending.status.is_terminal() {
            return Ok(SettleOutcome::AlreadySettled(pending));
        }

        let account = state.account_mut(&pending.account_id)?;
        let (settled, new_balance) = settle_pending(&pending, account, &settlement)?;
        if new_balance != account.balance {
            account.balance = new_balance;
            account.version = account.version.wrapping_add(1);
        }
        state.transactions[index] = settled.clone();
        Ok(SettleOutcome::Applied(settled))
    }

    async fn find_deposit(&self, reference: &str) -> Result<Option<Transaction>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .deposits_by_ref
            .get(reference)
            .and_then(|index| state.transactions.get(*index))
            .cloned())
    }

    async fn list_transactions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|tx| tx.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_api_key(
        &self,
        record: ApiKeyRecord,
        limits: KeyLimits,
    ) -> Result<KeyInsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let balance = state
            .accounts
            .get(&record.account_id)
            .map(|account| account.balance)
            .ok_or_else(|| StoreError::account_not_found(&record.account_id))?;
        let limit = limits.for_balance(balance);
        let existing = state
            .api_keys
            .values()
            .filter(|key| key.account_id == record.account_id)
            .count();
        if existing >= limit as usize {
            return Ok(KeyInsertOutcome::LimitReached { limit });
        }
        if state.api_keys.values().any(|key| key.key == record.key) {
            return Err(StoreError::Duplicate {
                entity: Entity::ApiKey,
                id: record.id,
            });
        }
        state.api_keys.insert(record.id.clone(), record);
        Ok(KeyInsertOutcome::Created)
    }

    async fn find_api_key(&self, key: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.api_keys.values().find(|record| record.key == key).cloned())
    }

    async fn touch_api_key(&self, key_id: &str, now: OffsetDateTime) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .api_keys
            .get_mut(key_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: Entity::ApiKey,
                id: key_id.to_string(),
            })?;
        record.last_used_at = Some(now);
        Ok(())
    }

    async fn list_api_keys(&self, account_id: &str) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut keys: Vec<ApiKeyRecord> = state
            .api_keys
            .values()
            .filter(|key| key.account_id == account_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn delete_api_key(&self, account_id: &str, key_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let owned = state
            .api_keys
            .get(key_id)
            .is_some_and(|key| key.account_id == account_id);
        if owned {
            state.api_keys.remove(key_id);
        }
        Ok(owned)
    }

    async fn increment_usage(
        &self,
        account_id: &str,
        operation: &str,
        date: Date,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let count = state
            .usage
            .entry((account_id.to_string(), operation.to_string(), date))
            .or_insert(0);
        *count = count.saturating_add(1);
        Ok(*count)
    }

    async fn usage_between(
        &self,
        account_id: &str,
        from: Date,
        to: Date,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .usage
            .iter()
            .filter(|((account, _, date), _)| account == account_id && *date >= from && *date <= to)
            .map(|((account, operation, date), count)| UsageRecord {
                account_id: account.clone(),
                operation: operation.clone(),
                date: *date,
                count: *count,
            })
            .collect())
    }

    async fn payment_event_seen(&self, event_id: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.payment_events.contains_key(event_id))
    }

    async fn record_payment_event(&self, event: PaymentEventRecord) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.payment_events.contains_key(&event.event_id) {
            return Ok(false);
        }
        state.payment_events.insert(event.event_id.clone(), event);
        Ok(true)
    }

    async fn load_pricing_settings(&self) -> Result<Option<PricingSettings>, StoreError> {
        Ok(self.state.lock().await.pricing.clone())
    }

    async fn save_pricing_settings(&self, settings: PricingSettings) -> Result<(), StoreError> {
        self.state.lock().await.pricing = Some(settings);
        Ok(())
    }
}
