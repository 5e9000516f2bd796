use std::collections::BTreeMap;
use std::sync::Arc;

use time::{OffsetDateTime, UtcOffset};

use super::ledger::{CallKind, RetryPolicy};
use super::observability::MeterMetrics;
use super::quota::month_start;
use super::store::LedgerStore;
use crate::error::Result;

/// Per-account, per-operation, per-UTC-day counters. Reporting only; a failed
/// increment never affects billing.
#[derive(Clone)]
pub struct UsageAggregator {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
    metrics: Arc<MeterMetrics>,
}

impl UsageAggregator {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryPolicy, metrics: Arc<MeterMetrics>) -> Self {
        Self {
            store,
            retry,
            metrics,
        }
    }

    pub async fn record(&self, account_id: &str, operation: &str, now: OffsetDateTime) {
        let date = now.to_offset(UtcOffset::UTC).date();
        let result = self
            .retry
            .run("increment_usage", CallKind::Write, || {
                self.store.increment_usage(account_id, operation, date)
            })
            .await;
        if let Err(err) = result {
            self.metrics.record_usage_failure();
            tracing::warn!(account_id, operation, %date, error = %err, "failed to record usage");
        }
    }

    /// Operation counts from the first day of the current UTC month through
    /// today.
    pub async fn monthly_usage(
        &self,
        account_id: &str,
        now: OffsetDateTime,
    ) -> Result<BTreeMap<String, u64>> {
        let from = month_start(now).date();
        let to = now.to_offset(UtcOffset::UTC).date();
        let rows = self
            .retry
            .run("usage_between", CallKind::Read, || {
                self.store.usage_between(account_id, from, to)
            })
            .await?;

        let mut out = BTreeMap::<String, u64>::new();
        for row in rows {
            let total = out.entry(row.operation).or_insert(0);
            *total = total.saturating_add(row.count);
        }
        Ok(out)
    }
}
