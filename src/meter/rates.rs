use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::ledger::{CallKind, RetryPolicy};
use super::pricing::PricingTable;
use super::quota::QuotaPolicy;
use super::store::LedgerStore;
use super::store_types::PricingSettings;
use crate::error::{MeterError, Result};

/// Prices and free allotment in force for the next charge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatePlan {
    pub pricing: PricingTable,
    pub policy: QuotaPolicy,
    pub updated_at: Option<OffsetDateTime>,
}

impl RatePlan {
    pub fn new(pricing: PricingTable, policy: QuotaPolicy) -> Self {
        Self {
            pricing,
            policy,
            updated_at: None,
        }
    }

    pub fn settings(&self) -> PricingSettings {
        PricingSettings {
            operation_cost: self.pricing.default_cost(),
            monthly_free_operations: self.policy.allotment(),
            custom_prices: self.pricing.custom_prices().clone(),
            updated_at: self.updated_at,
        }
    }

    fn with_settings(&self, settings: &PricingSettings) -> Result<Self> {
        let pricing = self
            .pricing
            .with_prices(settings.operation_cost, settings.custom_prices.clone())
            .map_err(|err| MeterError::LedgerInconsistency {
                detail: format!("stored pricing settings: {err}"),
            })?;
        Ok(Self {
            pricing,
            policy: QuotaPolicy::new(settings.monthly_free_operations),
            updated_at: settings.updated_at,
        })
    }
}

/// Partial pricing change. A provided `custom_prices` map replaces the
/// current map as a whole; an empty map clears every custom price.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_cost: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_free_operations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_prices: Option<BTreeMap<String, i64>>,
}

impl PricingUpdate {
    pub fn is_empty(&self) -> bool {
        self.operation_cost.is_none()
            && self.monthly_free_operations.is_none()
            && self.custom_prices.is_none()
    }
}

/// Shared view of the live pricing. Configuration seeds the defaults; saved
/// settings win from the first lookup on, and updates replace the cached
/// plan after they are persisted.
pub struct RateCard {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
    defaults: RatePlan,
    current: Mutex<Option<Arc<RatePlan>>>,
}

impl RateCard {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryPolicy, defaults: RatePlan) -> Self {
        Self {
            store,
            retry,
            defaults,
            current: Mutex::new(None),
        }
    }

    pub async fn current(&self) -> Result<Arc<RatePlan>> {
        let mut current = self.current.lock().await;
        if let Some(plan) = current.as_ref() {
            return Ok(plan.clone());
        }
        let plan = Arc::new(self.load().await?);
        *current = Some(plan.clone());
        Ok(plan)
    }

    async fn load(&self) -> Result<RatePlan> {
        let saved = self
            .retry
            .run("load_pricing_settings", CallKind::Read, || {
                self.store.load_pricing_settings()
            })
            .await?;
        match saved {
            Some(settings) => {
                tracing::debug!(
                    operation_cost = settings.operation_cost,
                    free_operations = settings.monthly_free_operations,
                    "loaded saved pricing"
                );
                self.defaults.with_settings(&settings)
            }
            None => Ok(self.defaults.clone()),
        }
    }

    /// Validates `update` against the current plan, persists the merged
    /// settings and makes them current.
    pub async fn update(&self, update: PricingUpdate, now: OffsetDateTime) -> Result<RatePlan> {
        if update.is_empty() {
            return Err(MeterError::invalid("pricing update changes nothing"));
        }
        let mut current = self.current.lock().await;
        let base = match current.as_ref() {
            Some(plan) => plan.as_ref().clone(),
            None => self.load().await?,
        };

        let mut settings = base.settings();
        if let Some(cost) = update.operation_cost {
            if cost <= 0 {
                return Err(MeterError::invalid("operation cost must be positive"));
            }
            settings.operation_cost = cost;
        }
        if let Some(allotment) = update.monthly_free_operations {
            settings.monthly_free_operations = allotment;
        }
        if let Some(custom_prices) = update.custom_prices {
            for (operation, cost) in &custom_prices {
                base.pricing
                    .check_custom_price(operation, *cost)
                    .map_err(|err| MeterError::invalid(err.to_string()))?;
            }
            settings.custom_prices = custom_prices;
        }
        settings.updated_at = Some(now);

        let plan = base.with_settings(&settings)?;
        self.retry
            .run("save_pricing_settings", CallKind::Write, || {
                self.store.save_pricing_settings(settings.clone())
            })
            .await?;
        tracing::info!(
            operation_cost = settings.operation_cost,
            free_operations = settings.monthly_free_operations,
            custom_prices = settings.custom_prices.len(),
            "updated pricing"
        );
        *current = Some(Arc::new(plan.clone()));
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::memory_store::MemoryStore;
    use std::time::Duration;
    use time::macros::datetime;

    fn rate_card(store: Arc<MemoryStore>) -> RateCard {
        RateCard::new(
            store,
            RetryPolicy::new(Duration::from_secs(1), 1, 0),
            RatePlan::new(PricingTable::default(), QuotaPolicy::new(500)),
        )
    }

    #[tokio::test]
    async fn defaults_apply_until_pricing_is_saved() {
        let card = rate_card(Arc::new(MemoryStore::new()));
        let plan = card.current().await.expect("plan");
        assert_eq!(plan.pricing.cost_for("ocr"), 5_000);
        assert_eq!(plan.policy.allotment(), 500);
        assert_eq!(plan.updated_at, None);
    }

    #[tokio::test]
    async fn updates_merge_and_persist() {
        let store = Arc::new(MemoryStore::new());
        let card = rate_card(store.clone());
        let at = datetime!(2026-03-10 12:00 UTC);

        card.update(
            PricingUpdate {
                custom_prices: Some(BTreeMap::from([("ocr".to_string(), 20_000)])),
                ..PricingUpdate::default()
            },
            at,
        )
        .await
        .expect("custom prices");
        let plan = card
            .update(
                PricingUpdate {
                    operation_cost: Some(8_000),
                    ..PricingUpdate::default()
                },
                at,
            )
            .await
            .expect("operation cost");
        assert_eq!(plan.pricing.cost_for("ocr"), 20_000);
        assert_eq!(plan.pricing.cost_for("merge"), 8_000);
        assert_eq!(plan.policy.allotment(), 500);

        let saved = store
            .load_pricing_settings()
            .await
            .expect("load")
            .expect("saved");
        assert_eq!(saved, plan.settings());
        assert_eq!(saved.updated_at, Some(at));

        let reopened = rate_card(store);
        assert_eq!(*reopened.current().await.expect("plan"), plan);
    }

    #[tokio::test]
    async fn invalid_updates_change_nothing() {
        let store = Arc::new(MemoryStore::new());
        let card = rate_card(store.clone());
        let at = datetime!(2026-03-10 12:00 UTC);

        for update in [
            PricingUpdate::default(),
            PricingUpdate {
                operation_cost: Some(0),
                ..PricingUpdate::default()
            },
            PricingUpdate {
                custom_prices: Some(BTreeMap::from([("ocr".to_string(), 500_000)])),
                ..PricingUpdate::default()
            },
            PricingUpdate {
                custom_prices: Some(BTreeMap::from([("teleport".to_string(), 5_000)])),
                ..PricingUpdate::default()
            },
        ] {
            let err = card.update(update, at).await.expect_err("rejected");
            assert!(matches!(err, MeterError::InvalidRequest { .. }));
        }
        assert!(store.load_pricing_settings().await.expect("load").is_none());
        assert_eq!(card.current().await.expect("plan").pricing.default_cost(), 5_000);
    }
}
