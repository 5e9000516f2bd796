use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::ledger::{CallKind, RetryPolicy};
use super::rates::{RateCard, RatePlan};
use super::store::LedgerStore;
use super::store_types::{Account, Role};
use crate::error::{MeterError, Result};

pub const INSUFFICIENT_ENTITLEMENT: &str = "insufficient entitlement";
pub const ACCOUNT_SUSPENDED: &str = "account suspended";

/// Advisory answer to "may this account run this operation now?". The
/// charge re-derives the decision under the account lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eligibility {
    pub allowed: bool,
    pub uses_free: bool,
    pub free_remaining: u32,
    pub balance: i64,
    pub operation_cost: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct EntitlementEvaluator {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
    rates: Arc<RateCard>,
}

impl EntitlementEvaluator {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryPolicy, rates: Arc<RateCard>) -> Self {
        Self {
            store,
            retry,
            rates,
        }
    }

    pub async fn check(
        &self,
        account_id: &str,
        operation: &str,
        now: OffsetDateTime,
    ) -> Result<Eligibility> {
        let account = self
            .retry
            .run("get_account", CallKind::Read, || self.store.get_account(account_id))
            .await?
            .ok_or_else(|| MeterError::AccountNotFound {
                account_id: account_id.to_string(),
            })?;
        let plan = self.rates.current().await?;
        let eligibility = evaluate(&plan, &account, operation, now);
        tracing::debug!(
            account_id,
            operation,
            allowed = eligibility.allowed,
            uses_free = eligibility.uses_free,
            free_remaining = eligibility.free_remaining,
            "checked eligibility"
        );
        Ok(eligibility)
    }
}

/// Pure eligibility decision against one rate plan.
pub fn evaluate(
    plan: &RatePlan,
    account: &Account,
    operation: &str,
    now: OffsetDateTime,
) -> Eligibility {
    let operation_cost = plan.pricing.cost_for(operation);
    let quota = plan.policy.evaluate(
        now,
        account.free_operations_used,
        account.free_operations_reset_at,
    );
    let free_remaining = quota.remaining();
    let uses_free = free_remaining > 0;
    let funded = account.balance >= operation_cost;

    let reason = if account.role == Role::Suspended {
        Some(ACCOUNT_SUSPENDED)
    } else if !(uses_free || funded) {
        Some(INSUFFICIENT_ENTITLEMENT)
    } else {
        None
    };

    Eligibility {
        allowed: reason.is_none(),
        uses_free,
        free_remaining,
        balance: account.balance,
        operation_cost,
        reason: reason.map(str::to_string),
    }
}
