use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::ledger::{CallKind, RetryPolicy};
use super::rates::RateCard;
use super::store::LedgerStore;
use super::store_types::{Transaction, TransactionStatus};
use super::usage::UsageAggregator;
use crate::error::{MeterError, Result};
use crate::money;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub id: String,
    pub amount: i64,
    pub display_amount: String,
    pub balance_after: i64,
    pub status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_payment_ref: Option<String>,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<Transaction> for TransactionView {
    fn from(tx: Transaction) -> Self {
        Self {
            display_amount: money::display_amount(tx.amount),
            id: tx.id,
            amount: tx.amount,
            balance_after: tx.balance_after,
            status: tx.status,
            external_payment_ref: tx.external_payment_ref,
            description: tx.description,
            created_at: tx.created_at,
        }
    }
}

/// Read-only account overview. The quota figures apply any due rollover for
/// display but never persist it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSummary {
    pub account_id: String,
    pub balance: i64,
    pub balance_display: String,
    pub free_operations_used: u32,
    pub free_operations_remaining: u32,
    pub free_operations_total: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub next_reset_at: OffsetDateTime,
    pub total_operations: u64,
    pub monthly_usage: BTreeMap<String, u64>,
    pub recent_transactions: Vec<TransactionView>,
}

#[derive(Clone)]
pub struct SummaryReader {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
    rates: Arc<RateCard>,
    usage: UsageAggregator,
    recent_limit: usize,
}

impl SummaryReader {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        retry: RetryPolicy,
        rates: Arc<RateCard>,
        usage: UsageAggregator,
        recent_limit: usize,
    ) -> Self {
        Self {
            store,
            retry,
            rates,
            usage,
            recent_limit,
        }
    }

    pub async fn balance_summary(
        &self,
        account_id: &str,
        now: OffsetDateTime,
    ) -> Result<BalanceSummary> {
        let account = self
            .retry
            .run("get_account", CallKind::Read, || self.store.get_account(account_id))
            .await?
            .ok_or_else(|| MeterError::AccountNotFound {
                account_id: account_id.to_string(),
            })?;
        let plan = self.rates.current().await?;
        let quota = plan.policy.evaluate(
            now,
            account.free_operations_used,
            account.free_operations_reset_at,
        );

        let transactions = self
            .retry
            .run("list_transactions", CallKind::Read, || {
                self.store.list_transactions(account_id, self.recent_limit)
            })
            .await?;
        let monthly_usage = self.usage.monthly_usage(account_id, now).await?;
        let total_operations = monthly_usage
            .values()
            .fold(0u64, |acc, count| acc.saturating_add(*count));

        Ok(BalanceSummary {
            account_id: account.id,
            balance: account.balance,
            balance_display: money::format_amount(account.balance, 3),
            free_operations_used: quota.used,
            free_operations_remaining: quota.remaining(),
            free_operations_total: quota.allotment,
            next_reset_at: quota.reset_at,
            total_operations,
            monthly_usage,
            recent_transactions: transactions.into_iter().map(TransactionView::from).collect(),
        })
    }
}
