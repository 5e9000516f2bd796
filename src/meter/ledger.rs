use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::config::StoreConfig;
use super::ids;
use super::observability::MeterMetrics;
use super::rates::{RateCard, RatePlan};
use super::store::{
    AdjustmentOutcome, AdjustmentRequest, ChargeOutcome, ChargeRequest, LedgerStore, StoreError,
};
use super::store_types::{Account, Transaction};
use super::usage::UsageAggregator;
use crate::error::{MeterError, Result};

/// Outcome of one committed charge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeResult {
    pub used_free: bool,
    pub free_remaining: u32,
    pub balance: i64,
    pub operation_cost: i64,
    /// The debit written on the paid path; free charges write none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Transaction>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CallKind {
    Read,
    Write,
}

/// Bounded timeout and retry around store calls.
///
/// Only errors that guarantee a rollback are retried. A write that times out
/// may still commit on its blocking thread, so it is surfaced instead of
/// retried.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    timeout: Duration,
    max_attempts: u32,
    backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            timeout,
            max_attempts: max_attempts.max(1),
            backoff_ms,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.timeout(), config.max_attempts, config.retry_backoff_ms)
    }

    pub(crate) async fn run<T, F, Fut>(&self, label: &'static str, kind: CallKind, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        let mut attempt = 1u32;
        loop {
            let err = match tokio::time::timeout(self.timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => {
                    if kind == CallKind::Write || attempt >= self.max_attempts {
                        tracing::warn!(call = label, attempt, "store call timed out");
                        return Err(MeterError::StorageUnavailable {
                            message: format!(
                                "{label} timed out after {}ms",
                                self.timeout.as_millis()
                            ),
                        });
                    }
                    StoreError::Unavailable {
                        message: "timed out".to_string(),
                    }
                }
            };

            if err.is_retryable() && attempt < self.max_attempts {
                tracing::debug!(call = label, attempt, error = %err, "retrying store call");
                tokio::time::sleep(Duration::from_millis(
                    self.backoff_ms.saturating_mul(u64::from(attempt)),
                ))
                .await;
                attempt += 1;
                continue;
            }

            if let StoreError::Inconsistent { detail } = &err {
                tracing::error!(
                    alert = "ledger_inconsistency",
                    call = label,
                    detail = %detail,
                    "ledger invariant violated; operation blocked"
                );
            }
            return Err(err.into());
        }
    }
}

pub struct LedgerProcessor {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
    rates: Arc<RateCard>,
    usage: UsageAggregator,
    metrics: Arc<MeterMetrics>,
}

impl LedgerProcessor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        retry: RetryPolicy,
        rates: Arc<RateCard>,
        usage: UsageAggregator,
        metrics: Arc<MeterMetrics>,
    ) -> Self {
        Self {
            store,
            retry,
            rates,
            usage,
            metrics,
        }
    }

    /// Charges one unit of `operation`: a free unit when one remains this
    /// month, otherwise the operation cost from the balance.
    #[tracing::instrument(skip(self), fields(cost))]
    pub async fn charge(
        &self,
        account_id: &str,
        operation: &str,
        now: OffsetDateTime,
    ) -> Result<ChargeResult> {
        let operation = operation.trim();
        if operation.is_empty() {
            return Err(MeterError::invalid("operation name is required"));
        }
        let plan = self.rates.current().await?;
        let cost = plan.pricing.cost_for(operation);
        tracing::Span::current().record("cost", cost);

        let request = ChargeRequest {
            account_id: account_id.to_string(),
            operation: operation.to_string(),
            cost,
            policy: plan.policy,
            now,
            transaction_id: ids::transaction_id()?,
        };
        let outcome = self
            .retry
            .run("charge", CallKind::Write, || self.store.charge(request.clone()))
            .await?;

        let result = match outcome {
            ChargeOutcome::Free { account } => {
                self.metrics.record_free_charge();
                tracing::info!(
                    account_id,
                    operation,
                    free_used = account.free_operations_used,
                    "charged free operation"
                );
                ChargeResult {
                    used_free: true,
                    free_remaining: free_remaining(&plan, &account),
                    balance: account.balance,
                    operation_cost: cost,
                    transaction: None,
                }
            }
            ChargeOutcome::Paid {
                account,
                transaction,
            } => {
                self.metrics.record_paid_charge();
                tracing::info!(
                    account_id,
                    operation,
                    cost,
                    balance = account.balance,
                    transaction_id = %transaction.id,
                    "charged paid operation"
                );
                ChargeResult {
                    used_free: false,
                    free_remaining: free_remaining(&plan, &account),
                    balance: account.balance,
                    operation_cost: cost,
                    transaction: Some(transaction),
                }
            }
            ChargeOutcome::Insufficient { balance } => {
                self.metrics.record_rejected_charge();
                tracing::info!(account_id, operation, balance, cost, "insufficient entitlement");
                return Err(MeterError::InsufficientEntitlement {
                    balance,
                    free_remaining: 0,
                    operation_cost: cost,
                });
            }
        };

        self.usage.record(account_id, operation, now).await;
        Ok(result)
    }

    /// Explicit, audited balance correction. Never invoked implicitly.
    pub async fn credit_adjustment(
        &self,
        account_id: &str,
        amount: i64,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<Transaction> {
        if amount == 0 {
            return Err(MeterError::invalid("adjustment amount must be non-zero"));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(MeterError::invalid("adjustment reason is required"));
        }
        let request = AdjustmentRequest {
            account_id: account_id.to_string(),
            amount,
            description: format!("adjustment: {reason}"),
            transaction_id: ids::transaction_id()?,
            now,
        };
        let outcome = self
            .retry
            .run("credit_adjustment", CallKind::Write, || {
                self.store.apply_adjustment(request.clone())
            })
            .await?;
        match outcome {
            AdjustmentOutcome::Applied {
                account,
                transaction,
            } => {
                tracing::info!(
                    account_id,
                    amount,
                    balance = account.balance,
                    transaction_id = %transaction.id,
                    "applied balance adjustment"
                );
                Ok(transaction)
            }
            AdjustmentOutcome::Refused { balance } => Err(MeterError::InsufficientEntitlement {
                balance,
                free_remaining: 0,
                operation_cost: amount.saturating_neg(),
            }),
        }
    }
}

fn free_remaining(plan: &RatePlan, account: &Account) -> u32 {
    plan.policy
        .allotment()
        .saturating_sub(account.free_operations_used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::store::Entity;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(200), 3, 1)
    }

    #[tokio::test]
    async fn retries_conflicts_then_succeeds() {
        let calls = AtomicU32::new(0);
        let value = policy()
            .run("test", CallKind::Write, || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(StoreError::Conflict {
                            entity: Entity::Account,
                            id: "acc".to_string(),
                        })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .expect("third attempt succeeds");
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = policy()
            .run("test", CallKind::Read, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(StoreError::Unavailable {
                        message: "busy".to_string(),
                    })
                }
            })
            .await
            .expect_err("exhausted");
        assert!(matches!(err, MeterError::StorageUnavailable { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let err = policy()
            .run("test", CallKind::Write, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StoreError::inconsistent("negative balance")) }
            })
            .await
            .expect_err("inconsistent");
        assert!(matches!(err, MeterError::LedgerInconsistency { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timed_out_writes_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::new(Duration::from_millis(20), 3, 1)
            .run("test", CallKind::Write, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, StoreError>(())
                }
            })
            .await
            .expect_err("timeout");
        assert!(matches!(err, MeterError::StorageUnavailable { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timed_out_reads_are_retried() {
        let calls = AtomicU32::new(0);
        let value = RetryPolicy::new(Duration::from_millis(20), 3, 1)
            .run("test", CallKind::Read, || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Ok::<_, StoreError>(attempt)
                }
            })
            .await
            .expect("second attempt");
        assert_eq!(value, 1);
    }
}
