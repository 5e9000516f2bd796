use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::pricing::{DEFAULT_OPERATION_COST, PricingTable, PricingTableError};
use crate::money;

pub const DEFAULT_SESSION_SECRET_ENV: &str = "OPMETER_SESSION_SECRET";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse toml config failed: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("parse json config failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid pricing: {0}")]
    Pricing(#[from] PricingTableError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub quota: QuotaConfig,
    pub pricing: PricingConfig,
    pub session: SessionConfig,
    pub store: StoreConfig,
    pub deposits: DepositConfig,
    pub keys: KeysConfig,
    pub limits: LimitsConfig,
    pub summary: SummaryConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub monthly_free_operations: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            monthly_free_operations: 500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub operation_cost: f64,
    pub custom_prices: BTreeMap<String, f64>,
    pub min_custom_price: f64,
    pub max_custom_price: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            operation_cost: money::to_f64(DEFAULT_OPERATION_COST),
            custom_prices: BTreeMap::new(),
            min_custom_price: 0.001,
            max_custom_price: 0.1,
        }
    }
}

impl PricingConfig {
    pub fn table(&self) -> Result<PricingTable, PricingTableError> {
        PricingTable::from_config_values(
            self.operation_cost,
            &self.custom_prices,
            self.min_custom_price,
            self.max_custom_price,
        )
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub secret_env: String,
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: None,
            secret_env: DEFAULT_SESSION_SECRET_ENV.to_string(),
            ttl_secs: DEFAULT_SESSION_TTL_SECS,
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("secret_env", &self.secret_env)
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

impl SessionConfig {
    /// The explicit secret wins; otherwise `secret_env` is looked up in `env`.
    pub fn resolve_secret(&self, env: &Env) -> Result<String, ConfigError> {
        if let Some(secret) = self.secret.as_ref().filter(|value| !value.trim().is_empty()) {
            return Ok(secret.clone());
        }
        env.get(self.secret_env.as_str()).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "missing session secret (set session.secret or {})",
                self.secret_env
            ))
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_attempts: 3,
            retry_backoff_ms: 25,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DepositConfig {
    pub min_amount: f64,
    pub currency: String,
}

impl Default for DepositConfig {
    fn default() -> Self {
        Self {
            min_amount: 5.0,
            currency: "USD".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    pub free_account_limit: u32,
    pub funded_account_limit: u32,
    pub default_permissions: Vec<String>,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            free_account_limit: 1,
            funded_account_limit: 10,
            default_permissions: ["convert", "compress", "merge", "split"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_window: Option<u32>,
    pub window_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            requests_per_window: None,
            window_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub recent_transactions: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            recent_transactions: 10,
        }
    }
}

impl MeterConfig {
    /// Loads `.json` files as JSON and everything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            serde_json::from_str(&raw)?
        } else {
            Self::from_toml_str(&raw)?
        };
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pricing.table()?;
        if self.store.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "store.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "store.timeout_ms must be positive".to_string(),
            ));
        }
        if self.session.ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.ttl_secs must be positive".to_string(),
            ));
        }
        if self.limits.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "limits.window_secs must be positive".to_string(),
            ));
        }
        match money::from_f64(self.deposits.min_amount) {
            Some(amount) if amount > 0 => {}
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "deposits.min_amount must be positive, got {}",
                    self.deposits.min_amount
                )));
            }
        }
        if self.deposits.currency.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "deposits.currency is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn min_deposit(&self) -> i64 {
        money::from_f64(self.deposits.min_amount).unwrap_or(0)
    }
}

/// Dotenv values layered over the process environment.
#[derive(Clone, Default)]
pub struct Env {
    pub dotenv: BTreeMap<String, String>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.dotenv.keys().map(|key| key.as_str()).collect();
        f.debug_struct("Env").field("dotenv_keys", &keys).finish()
    }
}

impl Env {
    pub fn parse_dotenv(contents: &str) -> Self {
        Self {
            dotenv: parse_dotenv(contents),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.dotenv.get(key) {
            return Some(value.clone());
        }
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line).trim();
        let Some((raw_key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let key = raw_key.trim();
        if key.is_empty() {
            continue;
        }

        let value = raw_value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        if value.trim().is_empty() {
            continue;
        }

        out.insert(key.to_string(), value.to_string());
    }

    out
}
