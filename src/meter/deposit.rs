use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::ids;
use super::ledger::{CallKind, RetryPolicy};
use super::observability::MeterMetrics;
use super::store::{LedgerStore, PendingDepositRequest, SettleOutcome, Settlement};
use super::store_types::{PaymentEventRecord, Transaction, TransactionStatus};
use crate::error::{MeterError, Result};
use crate::money;
use crate::payments::{OrderVerification, PaymentGateway, WebhookEvent};

/// Smallest amount a gateway order can carry (one cent).
const CENT: i64 = 10_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedDeposit {
    pub reference: String,
    pub approval_url: String,
    pub transaction: Transaction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Completed { transaction: Transaction },
    /// The gateway declined the order and the deposit was failed.
    Failed { transaction: Transaction },
    AlreadySettled { transaction: Transaction },
    /// The gateway has not verified the order yet. The event is not
    /// recorded, so a redelivery checks again.
    Pending { reference: String, status: String },
    Duplicate { event_id: String },
    Ignored { reason: String },
}

impl WebhookOutcome {
    fn settled(outcome: SettleOutcome) -> Self {
        match outcome {
            SettleOutcome::Applied(transaction) => WebhookOutcome::Completed { transaction },
            SettleOutcome::AlreadySettled(transaction) => {
                WebhookOutcome::AlreadySettled { transaction }
            }
        }
    }
}

/// Drives deposits through `pending -> completed | failed`.
///
/// The payment reference is the idempotency key. Client confirmation and the
/// gateway webhook both end in [`LedgerStore::settle_deposit`], which only
/// transitions rows that are still pending.
pub struct DepositReconciler {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
    gateway: Option<Arc<dyn PaymentGateway>>,
    min_amount: i64,
    currency: String,
    metrics: Arc<MeterMetrics>,
}

impl DepositReconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        retry: RetryPolicy,
        min_amount: i64,
        currency: impl Into<String>,
        metrics: Arc<MeterMetrics>,
    ) -> Self {
        Self {
            store,
            retry,
            gateway: None,
            min_amount,
            currency: currency.into(),
            metrics,
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    fn gateway(&self) -> Result<&Arc<dyn PaymentGateway>> {
        self.gateway.as_ref().ok_or_else(|| {
            MeterError::Payment(crate::payments::PaymentError::NotConfigured(
                "no payment gateway configured".to_string(),
            ))
        })
    }

    fn deposit_description(&self, amount: i64) -> String {
        format!(
            "Deposit of {} {}",
            money::format_amount(amount, 2),
            self.currency
        )
    }

    pub async fn create_pending_deposit(
        &self,
        account_id: &str,
        amount: i64,
        reference: &str,
        now: OffsetDateTime,
    ) -> Result<Transaction> {
        if amount <= 0 {
            return Err(MeterError::invalid("deposit amount must be positive"));
        }
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(MeterError::invalid("payment reference is required"));
        }

        let request = PendingDepositRequest {
            account_id: account_id.to_string(),
            amount,
            reference: reference.to_string(),
            description: self.deposit_description(amount),
            transaction_id: ids::transaction_id()?,
            now,
        };
        let transaction = self
            .retry
            .run("create_pending_deposit", CallKind::Write, || {
                self.store.create_pending_deposit(request.clone())
            })
            .await?;
        tracing::info!(account_id, reference, amount, "created pending deposit");
        Ok(transaction)
    }

    /// Credits a pending deposit once. Re-delivery returns the settled row
    /// untouched.
    pub async fn complete_deposit(
        &self,
        reference: &str,
        confirmed_amount: Option<i64>,
        now: OffsetDateTime,
    ) -> Result<SettleOutcome> {
        if confirmed_amount.is_some_and(|amount| amount <= 0) {
            return Err(MeterError::invalid("confirmed amount must be positive"));
        }
        let outcome = self
            .settle(reference, Settlement::Complete { confirmed_amount }, now)
            .await?;

        match &outcome {
            SettleOutcome::Applied(transaction) => {
                self.metrics.record_deposit_completed();
                tracing::info!(
                    account_id = %transaction.account_id,
                    reference,
                    amount = transaction.amount,
                    balance = transaction.balance_after,
                    "completed deposit"
                );
            }
            SettleOutcome::AlreadySettled(transaction) => {
                self.metrics.record_duplicate_confirmation();
                tracing::debug!(
                    reference,
                    status = transaction.status.as_str(),
                    "deposit already settled"
                );
            }
        }
        Ok(outcome)
    }

    pub async fn fail_deposit(
        &self,
        reference: &str,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<SettleOutcome> {
        let outcome = self
            .settle(
                reference,
                Settlement::Fail {
                    reason: reason.to_string(),
                },
                now,
            )
            .await?;
        if outcome.was_applied() {
            self.metrics.record_deposit_failed();
            tracing::info!(reference, reason, "failed deposit");
        }
        Ok(outcome)
    }

    async fn settle(
        &self,
        reference: &str,
        settlement: Settlement,
        now: OffsetDateTime,
    ) -> Result<SettleOutcome> {
        let pending = self.find_deposit(reference).await?;
        let confirmed = match &settlement {
            Settlement::Complete { confirmed_amount } => *confirmed_amount,
            Settlement::Fail { .. } => None,
        };
        if let Some(confirmed) = confirmed.filter(|amount| {
            pending.status == TransactionStatus::Pending && *amount != pending.amount
        }) {
            tracing::warn!(
                reference,
                requested = pending.amount,
                confirmed,
                "confirmed deposit amount differs from requested amount"
            );
        }

        self.retry
            .run("settle_deposit", CallKind::Write, || {
                self.store.settle_deposit(reference, settlement.clone(), now)
            })
            .await
    }

    pub async fn find_deposit(&self, reference: &str) -> Result<Transaction> {
        self.retry
            .run("find_deposit", CallKind::Read, || self.store.find_deposit(reference))
            .await?
            .ok_or_else(|| MeterError::DepositNotFound {
                reference: reference.to_string(),
            })
    }

    /// Opens a gateway order for `amount` and records it as a pending
    /// deposit keyed by the order id.
    pub async fn start_deposit(
        &self,
        account_id: &str,
        amount: i64,
        now: OffsetDateTime,
    ) -> Result<StartedDeposit> {
        let gateway = self.gateway()?;
        if amount < self.min_amount {
            return Err(MeterError::invalid(format!(
                "minimum deposit is {} {}",
                money::format_amount(self.min_amount, 2),
                self.currency
            )));
        }
        if amount % CENT != 0 {
            return Err(MeterError::invalid(
                "deposit amount must be a whole number of cents",
            ));
        }
        self.retry
            .run("get_account", CallKind::Read, || self.store.get_account(account_id))
            .await?
            .ok_or_else(|| MeterError::AccountNotFound {
                account_id: account_id.to_string(),
            })?;

        let order = gateway
            .create_order(amount, &self.deposit_description(amount))
            .await?;
        let transaction = self
            .create_pending_deposit(account_id, amount, &order.order_id, now)
            .await?;
        Ok(StartedDeposit {
            reference: order.order_id,
            approval_url: order.approval_url,
            transaction,
        })
    }

    async fn verify_order(
        &self,
        gateway: &Arc<dyn PaymentGateway>,
        reference: &str,
    ) -> Result<OrderVerification> {
        gateway.order_status(reference).await.map_err(|err| {
            tracing::warn!(reference, error = %err, "payment verification failed");
            MeterError::ExternalVerificationFailed {
                reference: reference.to_string(),
                reason: err.to_string(),
            }
        })
    }

    /// Synchronous confirmation requested by the account owner after
    /// approving the order.
    pub async fn confirm_deposit(
        &self,
        account_id: &str,
        reference: &str,
        now: OffsetDateTime,
    ) -> Result<Transaction> {
        let deposit = self.find_deposit(reference).await?;
        if deposit.account_id != account_id {
            return Err(MeterError::DepositNotFound {
                reference: reference.to_string(),
            });
        }
        if deposit.status.is_terminal() {
            self.metrics.record_duplicate_confirmation();
            return Ok(deposit);
        }

        match self.verify_order(self.gateway()?, reference).await? {
            OrderVerification::Verified { amount } => Ok(self
                .complete_deposit(reference, Some(amount), now)
                .await?
                .into_transaction()),
            OrderVerification::Unverified { status } => {
                tracing::info!(reference, %status, "payment not yet verified; deposit left pending");
                Err(MeterError::ExternalVerificationFailed {
                    reference: reference.to_string(),
                    reason: format!("order status is {status}"),
                })
            }
            OrderVerification::Declined { status } => {
                let reason = format!("order status is {status}");
                self.fail_deposit(reference, &reason, now).await?;
                Err(MeterError::ExternalVerificationFailed {
                    reference: reference.to_string(),
                    reason,
                })
            }
        }
    }

    /// Applies a gateway notification.
    ///
    /// The payload only says which order to look at. With a gateway
    /// configured the order is re-read from it and its verified amount is
    /// credited; without one the pending amount is credited. Storage and
    /// gateway failures are errors and leave the event unrecorded, as does a
    /// [`WebhookOutcome::Pending`] order, so a redelivery retries it.
    /// Everything else is acknowledged.
    pub async fn handle_webhook(
        &self,
        event: &WebhookEvent,
        now: OffsetDateTime,
    ) -> Result<WebhookOutcome> {
        if let Some(event_id) = event.event_id.as_deref() {
            let seen = self
                .retry
                .run("payment_event_seen", CallKind::Read, || {
                    self.store.payment_event_seen(event_id)
                })
                .await?;
            if seen {
                tracing::debug!(event_id, "duplicate webhook event");
                return Ok(WebhookOutcome::Duplicate {
                    event_id: event_id.to_string(),
                });
            }
        }

        let outcome = self.dispatch_webhook(event, now).await?;
        if matches!(outcome, WebhookOutcome::Pending { .. }) {
            return Ok(outcome);
        }

        if let Some(event_id) = event.event_id.as_deref() {
            let record = PaymentEventRecord {
                event_id: event_id.to_string(),
                event_type: event.event_type.clone(),
                resource_id: event.resource_id.clone(),
                resource_status: event.resource_status.clone(),
                received_at: now,
            };
            if let Err(err) = self
                .retry
                .run("record_payment_event", CallKind::Write, || {
                    self.store.record_payment_event(record.clone())
                })
                .await
            {
                tracing::warn!(event_id, error = %err, "failed to record webhook event");
            }
        }
        Ok(outcome)
    }

    async fn dispatch_webhook(
        &self,
        event: &WebhookEvent,
        now: OffsetDateTime,
    ) -> Result<WebhookOutcome> {
        if !event.is_completion() {
            tracing::debug!(
                event_type = %event.event_type,
                resource_status = %event.resource_status,
                "ignoring webhook event"
            );
            return Ok(WebhookOutcome::Ignored {
                reason: format!(
                    "event {} with status {} does not settle deposits",
                    event.event_type, event.resource_status
                ),
            });
        }

        let reference = event.resource_id.as_str();
        let deposit = match self.find_deposit(reference).await {
            Ok(deposit) => deposit,
            Err(MeterError::DepositNotFound { reference }) => {
                tracing::warn!(%reference, "webhook for unknown payment reference");
                return Ok(WebhookOutcome::Ignored {
                    reason: format!("no deposit recorded for {reference}"),
                });
            }
            Err(err) => return Err(err),
        };
        if deposit.status.is_terminal() {
            self.metrics.record_duplicate_confirmation();
            return Ok(WebhookOutcome::AlreadySettled {
                transaction: deposit,
            });
        }

        let Some(gateway) = self.gateway.as_ref() else {
            if event.amount.is_some_and(|amount| amount != deposit.amount) {
                tracing::warn!(
                    reference,
                    requested = deposit.amount,
                    "unverified webhook amount ignored; crediting the requested amount"
                );
            }
            let outcome = self.complete_deposit(reference, None, now).await?;
            return Ok(WebhookOutcome::settled(outcome));
        };

        match self.verify_order(gateway, reference).await? {
            OrderVerification::Verified { amount } if amount > 0 => {
                if let Some(claimed) = event.amount.filter(|claimed| *claimed != amount) {
                    tracing::warn!(
                        reference,
                        claimed,
                        verified = amount,
                        "webhook amount differs from verified amount"
                    );
                }
                let outcome = self.complete_deposit(reference, Some(amount), now).await?;
                Ok(WebhookOutcome::settled(outcome))
            }
            OrderVerification::Verified { amount } => {
                tracing::warn!(reference, amount, "gateway verified a non-positive amount");
                Ok(WebhookOutcome::Ignored {
                    reason: "gateway verified a non-positive amount".to_string(),
                })
            }
            OrderVerification::Unverified { status } => {
                tracing::info!(reference, %status, "webhook order not yet verified; deposit left pending");
                Ok(WebhookOutcome::Pending {
                    reference: reference.to_string(),
                    status,
                })
            }
            OrderVerification::Declined { status } => {
                let outcome = self
                    .fail_deposit(reference, &format!("order status is {status}"), now)
                    .await?;
                Ok(match outcome {
                    SettleOutcome::Applied(transaction) => WebhookOutcome::Failed { transaction },
                    SettleOutcome::AlreadySettled(transaction) => {
                        WebhookOutcome::AlreadySettled { transaction }
                    }
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::memory_store::MemoryStore;
    use crate::meter::store_types::{Account, Role};
    use crate::payments::{CreatedOrder, PAYMENT_CAPTURE_COMPLETED, PaymentError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-03-10 12:00 UTC);

    struct FakeGateway {
        verification: Mutex<std::result::Result<OrderVerification, String>>,
        status_calls: AtomicUsize,
    }

    impl FakeGateway {
        fn new(verification: OrderVerification) -> Arc<Self> {
            Arc::new(Self {
                verification: Mutex::new(Ok(verification)),
                status_calls: AtomicUsize::new(0),
            })
        }

        fn unreachable() -> Arc<Self> {
            Arc::new(Self {
                verification: Mutex::new(Err("connection refused".to_string())),
                status_calls: AtomicUsize::new(0),
            })
        }

        fn set(&self, verification: OrderVerification) {
            *self.verification.lock().expect("lock") = Ok(verification);
        }

        fn status_calls(&self) -> usize {
            self.status_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn create_order(
            &self,
            _amount: i64,
            _description: &str,
        ) -> std::result::Result<CreatedOrder, PaymentError> {
            Ok(CreatedOrder {
                order_id: "ORDER-1".to_string(),
                approval_url: "https://pay.example/approve/ORDER-1".to_string(),
            })
        }

        async fn order_status(
            &self,
            _order_id: &str,
        ) -> std::result::Result<OrderVerification, PaymentError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            self.verification
                .lock()
                .expect("lock")
                .clone()
                .map_err(PaymentError::InvalidResponse)
        }
    }

    async fn setup(balance: i64) -> (Arc<MemoryStore>, DepositReconciler) {
        let store = Arc::new(MemoryStore::new());
        store
            .create_account(
                Account {
                    id: "acc-1".to_string(),
                    balance,
                    free_operations_used: 0,
                    free_operations_reset_at: datetime!(2026-04-01 0:00 UTC),
                    role: Role::Normal,
                    version: 0,
                    created_at: NOW,
                },
                None,
            )
            .await
            .expect("create");
        let reconciler = DepositReconciler::new(
            store.clone(),
            RetryPolicy::new(Duration::from_secs(1), 1, 0),
            5_000_000,
            "USD",
            Arc::new(MeterMetrics::default()),
        );
        (store, reconciler)
    }

    async fn balance(store: &MemoryStore) -> i64 {
        store
            .get_account("acc-1")
            .await
            .expect("get")
            .expect("account")
            .balance
    }

    fn completed_event(event_id: &str, reference: &str) -> WebhookEvent {
        WebhookEvent {
            event_id: Some(event_id.to_string()),
            event_type: PAYMENT_CAPTURE_COMPLETED.to_string(),
            resource_id: reference.to_string(),
            resource_status: "COMPLETED".to_string(),
            amount: None,
        }
    }

    #[tokio::test]
    async fn completing_twice_credits_once() {
        let (store, reconciler) = setup(250_000).await;
        let pending = reconciler
            .create_pending_deposit("acc-1", 10_000_000, "ORDER-1", NOW)
            .await
            .expect("pending");
        assert_eq!(pending.status, TransactionStatus::Pending);
        assert_eq!(pending.balance_after, 250_000);
        assert_eq!(pending.description, "Deposit of 10.00 USD");

        let first = reconciler
            .complete_deposit("ORDER-1", Some(10_000_000), NOW)
            .await
            .expect("first");
        assert!(first.was_applied());
        let second = reconciler
            .complete_deposit("ORDER-1", Some(10_000_000), NOW)
            .await
            .expect("second");
        assert!(!second.was_applied());
        assert_eq!(first.transaction(), second.transaction());
        assert_eq!(balance(&store).await, 10_250_000);
    }

    #[tokio::test]
    async fn failed_deposits_are_terminal() {
        let (store, reconciler) = setup(0).await;
        reconciler
            .create_pending_deposit("acc-1", 10_000_000, "ORDER-1", NOW)
            .await
            .expect("pending");
        reconciler
            .fail_deposit("ORDER-1", "declined", NOW)
            .await
            .expect("fail");
        let outcome = reconciler
            .complete_deposit("ORDER-1", None, NOW)
            .await
            .expect("complete after fail");
        assert_eq!(outcome.transaction().status, TransactionStatus::Failed);
        assert_eq!(balance(&store).await, 0);
    }

    #[tokio::test]
    async fn duplicate_references_are_rejected() {
        let (_store, reconciler) = setup(0).await;
        reconciler
            .create_pending_deposit("acc-1", 10_000_000, "ORDER-1", NOW)
            .await
            .expect("first");
        let err = reconciler
            .create_pending_deposit("acc-1", 10_000_000, "ORDER-1", NOW)
            .await
            .expect_err("duplicate");
        assert!(matches!(err, MeterError::DuplicatePaymentReference { .. }));
    }

    #[tokio::test]
    async fn unknown_reference_is_not_found() {
        let (_store, reconciler) = setup(0).await;
        let err = reconciler
            .complete_deposit("ORDER-404", None, NOW)
            .await
            .expect_err("missing");
        assert!(matches!(err, MeterError::DepositNotFound { .. }));
    }

    #[tokio::test]
    async fn confirm_and_webhook_race_credits_once() {
        let (store, reconciler) = setup(0).await;
        let reconciler =
            reconciler.with_gateway(FakeGateway::new(OrderVerification::Verified {
                amount: 10_000_000,
            }));
        let started = reconciler
            .start_deposit("acc-1", 10_000_000, NOW)
            .await
            .expect("start");
        assert_eq!(started.reference, "ORDER-1");
        assert_eq!(started.transaction.status, TransactionStatus::Pending);

        let event = completed_event("WH-1", "ORDER-1");
        let (confirmed, webhook) = tokio::join!(
            reconciler.confirm_deposit("acc-1", "ORDER-1", NOW),
            reconciler.handle_webhook(&event, NOW),
        );
        assert_eq!(
            confirmed.expect("confirm").status,
            TransactionStatus::Completed
        );
        assert!(matches!(
            webhook.expect("webhook"),
            WebhookOutcome::Completed { .. } | WebhookOutcome::AlreadySettled { .. }
        ));
        assert_eq!(balance(&store).await, 10_000_000);
    }

    #[tokio::test]
    async fn unverified_confirmation_leaves_deposit_pending() {
        let (_store, reconciler) = setup(0).await;
        let reconciler = reconciler.with_gateway(FakeGateway::new(
            OrderVerification::Unverified {
                status: "CREATED".to_string(),
            },
        ));
        reconciler
            .start_deposit("acc-1", 10_000_000, NOW)
            .await
            .expect("start");
        let err = reconciler
            .confirm_deposit("acc-1", "ORDER-1", NOW)
            .await
            .expect_err("unverified");
        assert!(matches!(err, MeterError::ExternalVerificationFailed { .. }));
        let deposit = reconciler.find_deposit("ORDER-1").await.expect("find");
        assert_eq!(deposit.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn declined_confirmation_fails_the_deposit() {
        let (_store, reconciler) = setup(0).await;
        let reconciler = reconciler.with_gateway(FakeGateway::new(OrderVerification::Declined {
            status: "VOIDED".to_string(),
        }));
        reconciler
            .start_deposit("acc-1", 10_000_000, NOW)
            .await
            .expect("start");
        let err = reconciler
            .confirm_deposit("acc-1", "ORDER-1", NOW)
            .await
            .expect_err("declined");
        assert!(matches!(err, MeterError::ExternalVerificationFailed { .. }));
        let deposit = reconciler.find_deposit("ORDER-1").await.expect("find");
        assert_eq!(deposit.status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn start_deposit_validates_amount() {
        let (_store, reconciler) = setup(0).await;
        let reconciler = reconciler.with_gateway(FakeGateway::new(OrderVerification::Verified {
            amount: 0,
        }));
        let err = reconciler
            .start_deposit("acc-1", 4_990_000, NOW)
            .await
            .expect_err("below minimum");
        assert!(matches!(err, MeterError::InvalidRequest { .. }));
        let err = reconciler
            .start_deposit("acc-1", 5_005_000, NOW)
            .await
            .expect_err("fractional cents");
        assert!(matches!(err, MeterError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn webhook_events_are_deduplicated_and_filtered() {
        let (store, reconciler) = setup(0).await;
        reconciler
            .create_pending_deposit("acc-1", 10_000_000, "ORDER-1", NOW)
            .await
            .expect("pending");

        let mut approved = completed_event("WH-0", "ORDER-1");
        approved.event_type = "CHECKOUT.ORDER.APPROVED".to_string();
        assert!(matches!(
            reconciler.handle_webhook(&approved, NOW).await.expect("approved"),
            WebhookOutcome::Ignored { .. }
        ));

        let event = completed_event("WH-1", "ORDER-1");
        assert!(matches!(
            reconciler.handle_webhook(&event, NOW).await.expect("first"),
            WebhookOutcome::Completed { .. }
        ));
        assert!(matches!(
            reconciler.handle_webhook(&event, NOW).await.expect("again"),
            WebhookOutcome::Duplicate { .. }
        ));
        assert_eq!(balance(&store).await, 10_000_000);

        assert!(matches!(
            reconciler
                .handle_webhook(&completed_event("WH-2", "ORDER-404"), NOW)
                .await
                .expect("unknown"),
            WebhookOutcome::Ignored { .. }
        ));
    }

    #[tokio::test]
    async fn webhook_amount_without_gateway_is_not_credited() {
        let (store, reconciler) = setup(0).await;
        reconciler
            .create_pending_deposit("acc-1", 10_000_000, "ORDER-1", NOW)
            .await
            .expect("pending");

        let mut event = completed_event("WH-1", "ORDER-1");
        event.amount = Some(1_000_000_000);
        let outcome = reconciler.handle_webhook(&event, NOW).await.expect("webhook");
        let WebhookOutcome::Completed { transaction } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(transaction.amount, 10_000_000);
        assert_eq!(balance(&store).await, 10_000_000);
    }

    #[tokio::test]
    async fn declined_webhook_fails_deposit_and_ignores_forged_amount() {
        let (store, reconciler) = setup(0).await;
        let gateway = FakeGateway::new(OrderVerification::Declined {
            status: "VOIDED".to_string(),
        });
        let reconciler = reconciler.with_gateway(gateway.clone());
        reconciler
            .create_pending_deposit("acc-1", 10_000_000, "ORDER-1", NOW)
            .await
            .expect("pending");

        let mut forged = completed_event("WH-1", "ORDER-1");
        forged.amount = Some(1_000_000_000);
        let outcome = reconciler.handle_webhook(&forged, NOW).await.expect("webhook");
        let WebhookOutcome::Failed { transaction } = outcome else {
            panic!("expected failed deposit, got {outcome:?}");
        };
        assert_eq!(transaction.status, TransactionStatus::Failed);
        assert_eq!(gateway.status_calls(), 1);
        assert_eq!(balance(&store).await, 0);

        let deposit = reconciler.find_deposit("ORDER-1").await.expect("find");
        assert_eq!(deposit.status, TransactionStatus::Failed);

        let outcome = reconciler
            .handle_webhook(&completed_event("WH-2", "ORDER-1"), NOW)
            .await
            .expect("later event");
        assert!(matches!(outcome, WebhookOutcome::AlreadySettled { .. }));
        assert_eq!(gateway.status_calls(), 1);
        assert_eq!(balance(&store).await, 0);
    }

    #[tokio::test]
    async fn unverified_webhook_stays_pending_until_redelivery() {
        let (store, reconciler) = setup(0).await;
        let gateway = FakeGateway::new(OrderVerification::Unverified {
            status: "APPROVED".to_string(),
        });
        let reconciler = reconciler.with_gateway(gateway.clone());
        reconciler
            .create_pending_deposit("acc-1", 10_000_000, "ORDER-1", NOW)
            .await
            .expect("pending");

        let mut event = completed_event("WH-1", "ORDER-1");
        event.amount = Some(10_000_000);
        let outcome = reconciler.handle_webhook(&event, NOW).await.expect("webhook");
        assert!(matches!(
            outcome,
            WebhookOutcome::Pending { ref status, .. } if status == "APPROVED"
        ));
        assert_eq!(balance(&store).await, 0);
        let deposit = reconciler.find_deposit("ORDER-1").await.expect("find");
        assert_eq!(deposit.status, TransactionStatus::Pending);
        assert!(!store.payment_event_seen("WH-1").await.expect("seen"));

        gateway.set(OrderVerification::Verified { amount: 10_000_000 });
        let outcome = reconciler.handle_webhook(&event, NOW).await.expect("redelivery");
        assert!(matches!(outcome, WebhookOutcome::Completed { .. }));
        assert_eq!(balance(&store).await, 10_000_000);
        assert!(store.payment_event_seen("WH-1").await.expect("seen"));
    }

    #[tokio::test]
    async fn webhook_credits_verified_amount_over_payload_amount() {
        let (store, reconciler) = setup(0).await;
        let reconciler = reconciler.with_gateway(FakeGateway::new(OrderVerification::Verified {
            amount: 9_500_000,
        }));
        reconciler
            .create_pending_deposit("acc-1", 10_000_000, "ORDER-1", NOW)
            .await
            .expect("pending");

        let mut event = completed_event("WH-1", "ORDER-1");
        event.amount = Some(50_000_000);
        let outcome = reconciler.handle_webhook(&event, NOW).await.expect("webhook");
        let WebhookOutcome::Completed { transaction } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(transaction.amount, 9_500_000);
        assert_eq!(transaction.balance_after, 9_500_000);
        assert_eq!(balance(&store).await, 9_500_000);
    }

    #[tokio::test]
    async fn webhook_is_retried_when_gateway_is_unreachable() {
        let (store, reconciler) = setup(0).await;
        let reconciler = reconciler.with_gateway(FakeGateway::unreachable());
        reconciler
            .create_pending_deposit("acc-1", 10_000_000, "ORDER-1", NOW)
            .await
            .expect("pending");

        let err = reconciler
            .handle_webhook(&completed_event("WH-1", "ORDER-1"), NOW)
            .await
            .expect_err("gateway down");
        assert!(matches!(err, MeterError::ExternalVerificationFailed { .. }));
        assert!(!store.payment_event_seen("WH-1").await.expect("seen"));
        assert_eq!(balance(&store).await, 0);
    }
}
