use std::collections::BTreeMap;

use thiserror::Error;

use crate::money;

/// Metered operations known to the processing backend.
pub const KNOWN_OPERATIONS: &[&str] = &[
    "convert",
    "compress",
    "merge",
    "split",
    "watermark",
    "protect",
    "unlock",
    "remove",
    "rotate",
    "sign",
    "ocr",
    "repair",
    "pagenumber",
];

pub const DEFAULT_OPERATION_COST: i64 = 5_000;

pub fn is_known_operation(operation: &str) -> bool {
    KNOWN_OPERATIONS.contains(&operation)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PricingTable {
    default_cost: i64,
    custom: BTreeMap<String, i64>,
    min_custom: i64,
    max_custom: i64,
}

#[derive(Debug, Error)]
pub enum PricingTableError {
    #[error("invalid pricing value for {field}: {value}")]
    InvalidCostValue { field: String, value: f64 },
    #[error("operation cost must be positive, got {cost}")]
    NonPositiveCost { cost: i64 },
    #[error("custom price bounds are inverted: min={min} max={max}")]
    InvertedBounds { min: i64, max: i64 },
    #[error("unknown operation {operation:?}")]
    UnknownOperation { operation: String },
    #[error("custom price {cost} for {operation} is outside [{min}, {max}]")]
    CustomPriceOutOfRange {
        operation: String,
        cost: i64,
        min: i64,
        max: i64,
    },
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            default_cost: DEFAULT_OPERATION_COST,
            custom: BTreeMap::new(),
            min_custom: 1_000,
            max_custom: 100_000,
        }
    }
}

impl PricingTable {
    pub fn new(default_cost: i64) -> Result<Self, PricingTableError> {
        if default_cost <= 0 {
            return Err(PricingTableError::NonPositiveCost { cost: default_cost });
        }
        Ok(Self {
            default_cost,
            ..Self::default()
        })
    }

    /// Builds a table from configuration values expressed in whole units
    /// (`0.005` per operation).
    pub fn from_config_values(
        operation_cost: f64,
        custom_prices: &BTreeMap<String, f64>,
        min_custom_price: f64,
        max_custom_price: f64,
    ) -> Result<Self, PricingTableError> {
        let default_cost = units_to_micros(operation_cost, "operation_cost")?;
        let min_custom = units_to_micros(min_custom_price, "min_custom_price")?;
        let max_custom = units_to_micros(max_custom_price, "max_custom_price")?;
        if min_custom > max_custom {
            return Err(PricingTableError::InvertedBounds {
                min: min_custom,
                max: max_custom,
            });
        }

        let mut table = Self::new(default_cost)?;
        table.min_custom = min_custom;
        table.max_custom = max_custom;
        for (operation, price) in custom_prices {
            let micros = units_to_micros(*price, &format!("custom_prices.{operation}"))?;
            table.custom.insert(operation.clone(), micros);
        }
        Ok(table)
    }

    pub fn with_custom_price(mut self, operation: impl Into<String>, cost: i64) -> Self {
        self.custom.insert(operation.into(), cost);
        self
    }

    pub fn default_cost(&self) -> i64 {
        self.default_cost
    }

    pub fn custom_prices(&self) -> &BTreeMap<String, i64> {
        &self.custom
    }

    /// Same custom-price bounds, new prices. Stored custom prices are taken
    /// as-is; [`cost_for`](Self::cost_for) still screens them.
    pub fn with_prices(
        &self,
        default_cost: i64,
        custom: BTreeMap<String, i64>,
    ) -> Result<Self, PricingTableError> {
        if default_cost <= 0 {
            return Err(PricingTableError::NonPositiveCost { cost: default_cost });
        }
        Ok(Self {
            default_cost,
            custom,
            min_custom: self.min_custom,
            max_custom: self.max_custom,
        })
    }

    /// Strict check applied to prices an administrator submits.
    pub fn check_custom_price(&self, operation: &str, cost: i64) -> Result<(), PricingTableError> {
        if !is_known_operation(operation) {
            return Err(PricingTableError::UnknownOperation {
                operation: operation.to_string(),
            });
        }
        if cost < self.min_custom || cost > self.max_custom {
            return Err(PricingTableError::CustomPriceOutOfRange {
                operation: operation.to_string(),
                cost,
                min: self.min_custom,
                max: self.max_custom,
            });
        }
        Ok(())
    }

    /// Cost of one unit of `operation`. Custom prices outside the sanity
    /// bounds are ignored in favour of the global price.
    pub fn cost_for(&self, operation: &str) -> i64 {
        let Some(&custom) = self.custom.get(operation) else {
            return self.default_cost;
        };
        if custom < self.min_custom || custom > self.max_custom {
            tracing::warn!(
                operation,
                custom_cost = custom,
                default_cost = self.default_cost,
                "custom price outside allowed range; using global price"
            );
            return self.default_cost;
        }
        custom
    }
}

fn units_to_micros(value: f64, field: &str) -> Result<i64, PricingTableError> {
    let invalid = || PricingTableError::InvalidCostValue {
        field: field.to_string(),
        value,
    };
    if value < 0.0 {
        return Err(invalid());
    }
    money::from_f64(value).ok_or_else(invalid)
}
