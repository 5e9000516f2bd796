use std::sync::Arc;

use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use opmeter::meter::{
    Env, LedgerStore, ManualClock, MemoryStore, Meter, MeterConfig, TransactionStatus,
    WebhookOutcome,
};
use opmeter::payments::{PayPalConfig, PayPalGateway, parse_webhook_event};
use opmeter::MeterError;
use time::macros::datetime;

fn meter(store: Arc<dyn LedgerStore>) -> Meter {
    let config = MeterConfig::from_toml_str(
        r#"
[session]
secret = "integration-secret"

[deposits]
min_amount = 5.0
currency = "USD"
"#,
    )
    .expect("config");
    Meter::new(config, store, &Env::default())
        .expect("meter")
        .with_clock(Arc::new(ManualClock::new(datetime!(2026-03-10 12:00 UTC))))
}

fn capture_webhook(event_id: &str, order_id: &str, value: &str) -> String {
    format!(
        r#"{{
            "id": "{event_id}",
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {{
                "id": "CAPTURE-{event_id}",
                "status": "COMPLETED",
                "amount": {{"currency_code": "USD", "value": "{value}"}},
                "supplementary_data": {{"related_ids": {{"order_id": "{order_id}"}}}}
            }}
        }}"#
    )
}

async fn webhook_and_manual_completion_credit_once(store: Arc<dyn LedgerStore>) {
    let meter = meter(store);
    meter
        .register_account(Some("acc-1"), 500_000)
        .await
        .expect("register");
    let pending = meter
        .create_pending_deposit("acc-1", 10_000_000, "ORDER-1")
        .await
        .expect("pending");
    assert_eq!(pending.balance_after, 500_000);
    assert_eq!(meter.account("acc-1").await.expect("account").balance, 500_000);

    let event = parse_webhook_event(&capture_webhook("WH-1", "ORDER-1", "10.00")).expect("event");
    let outcome = meter.handle_webhook(&event).await.expect("webhook");
    let WebhookOutcome::Completed { transaction } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(transaction.balance_after, 10_500_000);

    let redelivered = meter.handle_webhook(&event).await.expect("redelivery");
    assert!(matches!(redelivered, WebhookOutcome::Duplicate { .. }));

    let other_event =
        parse_webhook_event(&capture_webhook("WH-2", "ORDER-1", "10.00")).expect("event");
    let second = meter.handle_webhook(&other_event).await.expect("second event");
    assert!(matches!(second, WebhookOutcome::AlreadySettled { .. }));

    let manual = meter
        .complete_deposit("ORDER-1", Some(10_000_000))
        .await
        .expect("manual completion");
    assert!(!manual.was_applied());
    assert_eq!(manual.transaction().status, TransactionStatus::Completed);

    assert_eq!(
        meter.account("acc-1").await.expect("account").balance,
        10_500_000
    );
    let snapshot = meter.metrics();
    assert_eq!(snapshot.deposits_completed, 1);
    assert_eq!(snapshot.duplicate_confirmations, 2);
}

async fn duplicate_reference_is_refused(store: Arc<dyn LedgerStore>) {
    let meter = meter(store);
    meter
        .register_account(Some("acc-1"), 0)
        .await
        .expect("register");
    meter
        .create_pending_deposit("acc-1", 10_000_000, "ORDER-1")
        .await
        .expect("first");
    let err = meter
        .create_pending_deposit("acc-1", 20_000_000, "ORDER-1")
        .await
        .expect_err("duplicate");
    assert!(matches!(err, MeterError::DuplicatePaymentReference { .. }));
}

#[tokio::test]
async fn memory_webhook_and_manual_completion_credit_once() {
    webhook_and_manual_completion_credit_once(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn memory_duplicate_reference_is_refused() {
    duplicate_reference_is_refused(Arc::new(MemoryStore::new())).await;
}

#[cfg(feature = "store-sqlite")]
#[tokio::test]
async fn sqlite_webhook_and_manual_completion_credit_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = opmeter::meter::SqliteStore::new(dir.path().join("ledger.sqlite"));
    store.init().await.expect("init");
    webhook_and_manual_completion_credit_once(Arc::new(store)).await;
}

#[cfg(feature = "store-sqlite")]
#[tokio::test]
async fn sqlite_duplicate_reference_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = opmeter::meter::SqliteStore::new(dir.path().join("ledger.sqlite"));
    store.init().await.expect("init");
    duplicate_reference_is_refused(Arc::new(store)).await;
}

#[tokio::test]
async fn paypal_deposit_round_trip() {
    if opmeter::utils::test_support::should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/oauth2/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"tok-1","token_type":"Bearer"}"#);
        })
        .await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v2/checkout/orders")
                .body_includes(r#""value":"20.00""#);
            then.status(201)
                .header("content-type", "application/json")
                .body(
                    r#"{"id":"ORDER-42","status":"CREATED","links":[
                        {"href":"https://paypal.test/approve/ORDER-42","rel":"approve"}]}"#,
                );
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/checkout/orders/ORDER-42");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"id":"ORDER-42","status":"APPROVED"}"#);
        })
        .await;
    let capture = server
        .mock_async(|when, then| {
            when.method(POST).path("/v2/checkout/orders/ORDER-42/capture");
            then.status(201)
                .header("content-type", "application/json")
                .body(
                    r#"{"id":"ORDER-42","status":"COMPLETED","purchase_units":[
                        {"payments":{"captures":[{"amount":{"value":"20.00"}}]}}]}"#,
                );
        })
        .await;

    let config = PayPalConfig::new(server.base_url(), "client", "secret").expect("paypal config");
    let meter = meter(Arc::new(MemoryStore::new()))
        .with_payment_gateway(Arc::new(PayPalGateway::new(config)));
    meter
        .register_account(Some("acc-1"), 0)
        .await
        .expect("register");

    let err = meter
        .start_deposit("acc-1", 1_000_000)
        .await
        .expect_err("below minimum");
    assert!(matches!(err, MeterError::InvalidRequest { .. }));

    let started = meter
        .start_deposit("acc-1", 20_000_000)
        .await
        .expect("start");
    create.assert_async().await;
    assert_eq!(started.reference, "ORDER-42");
    assert_eq!(started.approval_url, "https://paypal.test/approve/ORDER-42");
    assert_eq!(started.transaction.status, TransactionStatus::Pending);

    let confirmed = meter
        .confirm_deposit("acc-1", "ORDER-42")
        .await
        .expect("confirm");
    capture.assert_async().await;
    assert_eq!(confirmed.status, TransactionStatus::Completed);
    assert_eq!(confirmed.balance_after, 20_000_000);

    let again = meter
        .confirm_deposit("acc-1", "ORDER-42")
        .await
        .expect("confirm again");
    assert_eq!(again, confirmed);
    assert_eq!(
        meter.account("acc-1").await.expect("account").balance,
        20_000_000
    );
}

#[tokio::test]
async fn paypal_webhook_credits_the_verified_capture() {
    if opmeter::utils::test_support::should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/oauth2/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"tok-1","token_type":"Bearer"}"#);
        })
        .await;
    let lookup = server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/checkout/orders/ORDER-7");
            then.status(200)
                .header("content-type", "application/json")
                .body(
                    r#"{"id":"ORDER-7","status":"COMPLETED","purchase_units":[
                        {"payments":{"captures":[{"amount":{"value":"10.00"}}]}}]}"#,
                );
        })
        .await;

    let config = PayPalConfig::new(server.base_url(), "client", "secret").expect("paypal config");
    let meter = meter(Arc::new(MemoryStore::new()))
        .with_payment_gateway(Arc::new(PayPalGateway::new(config)));
    meter
        .register_account(Some("acc-1"), 0)
        .await
        .expect("register");
    meter
        .create_pending_deposit("acc-1", 10_000_000, "ORDER-7")
        .await
        .expect("pending");

    let forged =
        parse_webhook_event(&capture_webhook("WH-7", "ORDER-7", "999.00")).expect("event");
    assert_eq!(forged.amount, Some(999_000_000));
    let outcome = meter.handle_webhook(&forged).await.expect("webhook");
    lookup.assert_async().await;
    let WebhookOutcome::Completed { transaction } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(transaction.amount, 10_000_000);
    assert_eq!(
        meter.account("acc-1").await.expect("account").balance,
        10_000_000
    );
}
