//! Operation entitlement and billing ledger.
//!
//! [`Meter`] wires the components together: credentials are resolved,
//! eligibility is checked, the charge is committed against the free monthly
//! allotment or the prepaid balance, and deposits are reconciled with the
//! payment gateway.

pub mod backend;
pub mod config;
pub mod credentials;
pub mod deposit;
pub mod entitlement;
pub mod ids;
pub mod ledger;
pub mod limits;
pub mod memory_store;
pub mod observability;
pub mod pricing;
pub mod quota;
pub mod rates;
pub mod session;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
pub mod store;
pub mod store_types;
pub mod summary;
pub mod usage;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{MeterError, Result};
use crate::payments::{PaymentGateway, WebhookEvent};

pub use backend::{BackendError, DocumentBackend, ProcessingJob, ProcessingOutput};
pub use config::{Env, MeterConfig};
pub use credentials::{ApiKeySummary, Credential, CredentialKind, CredentialResolver, Identity};
pub use deposit::{DepositReconciler, StartedDeposit, WebhookOutcome};
pub use entitlement::{Eligibility, EntitlementEvaluator};
pub use ledger::{ChargeResult, LedgerProcessor, RetryPolicy};
pub use limits::KeyedRateLimiter;
pub use memory_store::MemoryStore;
pub use observability::{MeterMetrics, MeterMetricsSnapshot};
pub use pricing::PricingTable;
pub use quota::QuotaPolicy;
pub use rates::{PricingUpdate, RateCard, RatePlan};
pub use session::{SessionClaims, SessionSigner};
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;
pub use store::{LedgerStore, SettleOutcome, StoreError};
pub use store_types::{
    Account, ApiKeyRecord, PermissionScope, PricingSettings, Role, Transaction, TransactionStatus,
    UsageRecord,
};
pub use summary::{BalanceSummary, SummaryReader, TransactionView};
pub use usage::UsageAggregator;

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Test clock with millisecond resolution.
#[derive(Debug)]
pub struct ManualClock {
    unix_millis: AtomicI64,
}

impl ManualClock {
    pub fn new(at: OffsetDateTime) -> Self {
        Self {
            unix_millis: AtomicI64::new(to_unix_millis(at)),
        }
    }

    pub fn set(&self, at: OffsetDateTime) {
        self.unix_millis.store(to_unix_millis(at), Ordering::SeqCst);
    }

    pub fn advance(&self, by: time::Duration) {
        let millis = i64::try_from(by.whole_milliseconds()).unwrap_or(i64::MAX);
        self.unix_millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        let millis = self.unix_millis.load(Ordering::SeqCst);
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

fn to_unix_millis(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Result of [`Meter::execute`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub identity: Identity,
    pub charge: ChargeResult,
    pub output: ProcessingOutput,
}

pub struct Meter {
    config: MeterConfig,
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    rates: Arc<RateCard>,
    credentials: CredentialResolver,
    entitlement: EntitlementEvaluator,
    ledger: LedgerProcessor,
    deposits: DepositReconciler,
    summaries: SummaryReader,
    metrics: Arc<MeterMetrics>,
}

impl Meter {
    pub fn new(config: MeterConfig, store: Arc<dyn LedgerStore>, env: &Env) -> Result<Self> {
        config.validate()?;
        let secret = config.session.resolve_secret(env)?;
        let ttl = time::Duration::seconds(i64::try_from(config.session.ttl_secs).unwrap_or(i64::MAX));
        let signer = SessionSigner::new(&secret, ttl)?;

        let retry = RetryPolicy::from_config(&config.store);
        let pricing = config.pricing.table().map_err(config::ConfigError::from)?;
        let policy = QuotaPolicy::new(config.quota.monthly_free_operations);
        let rates = Arc::new(RateCard::new(
            store.clone(),
            retry.clone(),
            RatePlan::new(pricing, policy),
        ));
        let metrics = Arc::new(MeterMetrics::default());

        let usage = UsageAggregator::new(store.clone(), retry.clone(), metrics.clone());
        let mut credentials = CredentialResolver::new(
            store.clone(),
            retry.clone(),
            signer,
            config.keys.clone(),
            metrics.clone(),
        );
        if let Some(limit) = config.limits.requests_per_window {
            credentials = credentials
                .with_rate_limiter(KeyedRateLimiter::new(limit, config.limits.window_secs));
        }
        let entitlement = EntitlementEvaluator::new(store.clone(), retry.clone(), rates.clone());
        let ledger = LedgerProcessor::new(
            store.clone(),
            retry.clone(),
            rates.clone(),
            usage.clone(),
            metrics.clone(),
        );
        let deposits = DepositReconciler::new(
            store.clone(),
            retry.clone(),
            config.min_deposit(),
            config.deposits.currency.clone(),
            metrics.clone(),
        );
        let summaries = SummaryReader::new(
            store.clone(),
            retry.clone(),
            rates.clone(),
            usage,
            config.summary.recent_transactions,
        );

        Ok(Self {
            config,
            store,
            clock: Arc::new(SystemClock),
            retry,
            rates,
            credentials,
            entitlement,
            ledger,
            deposits,
            summaries,
            metrics,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_payment_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.deposits = self.deposits.with_gateway(gateway);
        self
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn metrics(&self) -> MeterMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Creates an account with a fresh monthly allotment. A positive opening
    /// balance is written as a completed transaction in the same step.
    pub async fn register_account(
        &self,
        account_id: Option<&str>,
        opening_balance: i64,
    ) -> Result<Account> {
        if opening_balance < 0 {
            return Err(MeterError::invalid("opening balance must not be negative"));
        }
        let now = self.now();
        let id = match account_id.map(str::trim) {
            Some("") => return Err(MeterError::invalid("account id must not be empty")),
            Some(id) => id.to_string(),
            None => ids::account_id()?,
        };
        let account = Account {
            id: id.clone(),
            balance: opening_balance,
            free_operations_used: 0,
            free_operations_reset_at: quota::next_reset_boundary(now),
            role: Role::Normal,
            version: 0,
            created_at: now,
        };
        let opening = if opening_balance > 0 {
            Some(Transaction {
                id: ids::transaction_id()?,
                account_id: id.clone(),
                amount: opening_balance,
                balance_after: opening_balance,
                status: TransactionStatus::Completed,
                external_payment_ref: None,
                description: "Opening balance".to_string(),
                created_at: now,
            })
        } else {
            None
        };

        self.retry
            .run("create_account", ledger::CallKind::Write, || {
                self.store.create_account(account.clone(), opening.clone())
            })
            .await?;
        tracing::info!(account_id = %id, opening_balance, "registered account");
        Ok(account)
    }

    pub async fn account(&self, account_id: &str) -> Result<Account> {
        self.retry
            .run("get_account", ledger::CallKind::Read, || {
                self.store.get_account(account_id)
            })
            .await?
            .ok_or_else(|| MeterError::AccountNotFound {
                account_id: account_id.to_string(),
            })
    }

    pub async fn set_role(&self, account_id: &str, role: Role) -> Result<Account> {
        let account = self
            .retry
            .run("set_role", ledger::CallKind::Write, || {
                self.store.set_role(account_id, role)
            })
            .await?;
        tracing::info!(account_id, role = role.as_str(), "changed account role");
        Ok(account)
    }

    pub async fn issue_session(&self, account_id: &str) -> Result<String> {
        let account = self.account(account_id).await?;
        self.credentials.issue_session(&account, self.now())
    }

    pub async fn authenticate(&self, credential: &Credential, operation: &str) -> Result<Identity> {
        self.credentials
            .authenticate(credential, operation, self.now())
            .await
    }

    pub async fn check_eligibility(&self, account_id: &str, operation: &str) -> Result<Eligibility> {
        self.entitlement.check(account_id, operation, self.now()).await
    }

    pub async fn charge(&self, account_id: &str, operation: &str) -> Result<ChargeResult> {
        self.ledger.charge(account_id, operation, self.now()).await
    }

    pub async fn balance_summary(&self, account_id: &str) -> Result<BalanceSummary> {
        self.summaries.balance_summary(account_id, self.now()).await
    }

    pub async fn create_api_key(
        &self,
        account_id: &str,
        name: &str,
        permissions: &[String],
        expires_at: Option<OffsetDateTime>,
    ) -> Result<ApiKeyRecord> {
        self.account(account_id).await?;
        self.credentials
            .create_api_key(account_id, name, permissions, expires_at, self.now())
            .await
    }

    pub async fn list_api_keys(&self, account_id: &str) -> Result<Vec<ApiKeySummary>> {
        self.credentials.list_api_keys(account_id).await
    }

    pub async fn revoke_api_key(&self, account_id: &str, key_id: &str) -> Result<()> {
        self.credentials.revoke_api_key(account_id, key_id).await
    }

    pub async fn start_deposit(&self, account_id: &str, amount: i64) -> Result<StartedDeposit> {
        self.deposits
            .start_deposit(account_id, amount, self.now())
            .await
    }

    pub async fn confirm_deposit(&self, account_id: &str, reference: &str) -> Result<Transaction> {
        self.deposits
            .confirm_deposit(account_id, reference, self.now())
            .await
    }

    pub async fn create_pending_deposit(
        &self,
        account_id: &str,
        amount: i64,
        reference: &str,
    ) -> Result<Transaction> {
        self.account(account_id).await?;
        self.deposits
            .create_pending_deposit(account_id, amount, reference, self.now())
            .await
    }

    pub async fn complete_deposit(
        &self,
        reference: &str,
        confirmed_amount: Option<i64>,
    ) -> Result<SettleOutcome> {
        self.deposits
            .complete_deposit(reference, confirmed_amount, self.now())
            .await
    }

    pub async fn fail_deposit(&self, reference: &str, reason: &str) -> Result<SettleOutcome> {
        self.deposits
            .fail_deposit(reference, reason, self.now())
            .await
    }

    pub async fn handle_webhook(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        self.deposits.handle_webhook(event, self.now()).await
    }

    pub async fn credit_adjustment(
        &self,
        account_id: &str,
        amount: i64,
        reason: &str,
    ) -> Result<Transaction> {
        self.ledger
            .credit_adjustment(account_id, amount, reason, self.now())
            .await
    }

    /// Authenticate, gate, charge, then hand the job to `backend`. A backend
    /// failure does not reverse the committed charge.
    pub async fn execute(
        &self,
        credential: &Credential,
        operation: &str,
        job: &ProcessingJob,
        backend: &dyn DocumentBackend,
    ) -> Result<Execution> {
        let identity = self.authenticate(credential, operation).await?;
        let eligibility = self
            .check_eligibility(&identity.account_id, operation)
            .await?;
        if !eligibility.allowed {
            if eligibility.reason.as_deref() == Some(entitlement::ACCOUNT_SUSPENDED) {
                return Err(MeterError::AccountSuspended {
                    account_id: identity.account_id,
                });
            }
            return Err(MeterError::InsufficientEntitlement {
                balance: eligibility.balance,
                free_remaining: eligibility.free_remaining,
                operation_cost: eligibility.operation_cost,
            });
        }

        let charge = self.charge(&identity.account_id, operation).await?;
        match backend.process(operation, job).await {
            Ok(output) => Ok(Execution {
                identity,
                charge,
                output,
            }),
            Err(err) => {
                tracing::warn!(
                    account_id = %identity.account_id,
                    operation,
                    error = %err,
                    "processing failed after charge"
                );
                Err(MeterError::Processing {
                    message: err.to_string(),
                    charge,
                })
            }
        }
    }

    /// Pricing in force: saved settings, or the configured defaults.
    pub async fn pricing_settings(&self) -> Result<PricingSettings> {
        Ok(self.rates.current().await?.settings())
    }

    /// Admin-only. Applies from the next eligibility check or charge.
    pub async fn update_pricing(
        &self,
        admin_account_id: &str,
        update: PricingUpdate,
    ) -> Result<PricingSettings> {
        let admin = self.account(admin_account_id).await?;
        if admin.role != Role::Admin {
            tracing::warn!(account_id = admin_account_id, "pricing update refused");
            return Err(MeterError::AdminRequired {
                account_id: admin.id,
            });
        }
        let plan = self.rates.update(update, self.now()).await?;
        tracing::info!(admin_account_id, "pricing changed by administrator");
        Ok(plan.settings())
    }
}
