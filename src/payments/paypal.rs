use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{CreatedOrder, OrderVerification, PaymentError, PaymentGateway, WebhookEvent};
use crate::meter::config::Env;
use crate::money;
use crate::utils::http::send_checked_json;

pub const SANDBOX_BASE_URL: &str = "https://api-m.sandbox.paypal.com";
pub const LIVE_BASE_URL: &str = "https://api-m.paypal.com";

#[derive(Clone)]
pub struct PayPalConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub currency: String,
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
}

impl std::fmt::Debug for PayPalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayPalConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("currency", &self.currency)
            .field("return_url", &self.return_url)
            .field("cancel_url", &self.cancel_url)
            .finish()
    }
}

impl PayPalConfig {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, PaymentError> {
        let base_url = base_url.into();
        let client_id = client_id.into();
        let client_secret = client_secret.into();
        if base_url.trim().is_empty() {
            return Err(PaymentError::NotConfigured("paypal base_url is required".to_string()));
        }
        if client_id.trim().is_empty() {
            return Err(PaymentError::NotConfigured("paypal client_id is required".to_string()));
        }
        if client_secret.trim().is_empty() {
            return Err(PaymentError::NotConfigured(
                "paypal client_secret is required".to_string(),
            ));
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id,
            client_secret,
            currency: "USD".to_string(),
            return_url: None,
            cancel_url: None,
        })
    }

    /// Reads `PAYPAL_CLIENT_ID`, `PAYPAL_CLIENT_SECRET` and `PAYPAL_SANDBOX`.
    pub fn from_env(env: &Env) -> Result<Self, PaymentError> {
        let client_id = env.get("PAYPAL_CLIENT_ID").unwrap_or_default();
        let client_secret = env.get("PAYPAL_CLIENT_SECRET").unwrap_or_default();
        let sandbox = env
            .get("PAYPAL_SANDBOX")
            .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
            .unwrap_or(true);
        let base_url = env.get("PAYPAL_BASE_URL").unwrap_or_else(|| {
            if sandbox {
                SANDBOX_BASE_URL.to_string()
            } else {
                LIVE_BASE_URL.to_string()
            }
        });
        Self::new(base_url, client_id, client_secret)
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn with_redirects(
        mut self,
        return_url: impl Into<String>,
        cancel_url: impl Into<String>,
    ) -> Self {
        self.return_url = Some(return_url.into());
        self.cancel_url = Some(cancel_url.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct PayPalGateway {
    http: reqwest::Client,
    config: PayPalConfig,
}

impl PayPalGateway {
    pub fn new(config: PayPalConfig) -> Self {
        Self::with_http(reqwest::Client::new(), config)
    }

    pub fn with_http(http: reqwest::Client, config: PayPalConfig) -> Self {
        Self { http, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn access_token(&self) -> Result<String, PaymentError> {
        let parsed = send_checked_json::<TokenResponse>(
            self.http
                .post(self.url("/v1/oauth2/token"))
                .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
                .form(&[("grant_type", "client_credentials")]),
        )
        .await?;
        let token = parsed
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                PaymentError::InvalidResponse("oauth response missing access_token".to_string())
            })?;
        let token_type = parsed
            .token_type
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Bearer".to_string());
        Ok(format!("{token_type} {token}"))
    }

    async fn capture(&self, authorization: &str, order_id: &str) -> Result<OrderResponse, PaymentError> {
        send_checked_json::<OrderResponse>(
            self.http
                .post(self.url(&format!("/v2/checkout/orders/{order_id}/capture")))
                .header(reqwest::header::AUTHORIZATION, authorization)
                .json(&json!({})),
        )
        .await
    }
}

#[async_trait]
impl PaymentGateway for PayPalGateway {
    async fn create_order(
        &self,
        amount: i64,
        description: &str,
    ) -> Result<CreatedOrder, PaymentError> {
        let authorization = self.access_token().await?;

        let mut body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "amount": {
                    "currency_code": self.config.currency,
                    "value": money::format_amount(amount, 2),
                },
                "description": description,
            }],
        });
        if let (Some(return_url), Some(cancel_url)) =
            (self.config.return_url.as_ref(), self.config.cancel_url.as_ref())
        {
            body["application_context"] = json!({
                "return_url": return_url,
                "cancel_url": cancel_url,
            });
        }

        let order = send_checked_json::<OrderResponse>(
            self.http
                .post(self.url("/v2/checkout/orders"))
                .header(reqwest::header::AUTHORIZATION, authorization)
                .json(&body),
        )
        .await?;

        let order_id = order
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| PaymentError::InvalidResponse("order response missing id".to_string()))?;
        let approval_url = order
            .links
            .into_iter()
            .find(|link| link.rel == "approve")
            .map(|link| link.href)
            .ok_or_else(|| {
                PaymentError::InvalidResponse("order response missing approve link".to_string())
            })?;
        Ok(CreatedOrder {
            order_id,
            approval_url,
        })
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderVerification, PaymentError> {
        let authorization = self.access_token().await?;
        let mut order = send_checked_json::<OrderResponse>(
            self.http
                .get(self.url(&format!("/v2/checkout/orders/{order_id}")))
                .header(reqwest::header::AUTHORIZATION, authorization.as_str()),
        )
        .await?;

        if order.status_str() == "APPROVED" {
            tracing::debug!(order_id, "capturing approved order");
            order = self.capture(&authorization, order_id).await?;
        }

        let status = order.status_str().to_string();
        match status.as_str() {
            "COMPLETED" => Ok(OrderVerification::Verified {
                amount: order.captured_amount()?,
            }),
            "VOIDED" | "DECLINED" => Ok(OrderVerification::Declined { status }),
            _ => Ok(OrderVerification::Unverified { status }),
        }
    }
}

/// Maps a raw PayPal webhook body to a [`WebhookEvent`]. The order id comes
/// from `resource.supplementary_data.related_ids.order_id`, falling back to
/// `resource.id`.
pub fn parse_webhook_event(raw: &str) -> Result<WebhookEvent, PaymentError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let event_type = value
        .get("event_type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| PaymentError::InvalidResponse("webhook missing event_type".to_string()))?;
    let resource = value
        .get("resource")
        .ok_or_else(|| PaymentError::InvalidResponse("webhook missing resource".to_string()))?;

    let resource_id = resource
        .pointer("/supplementary_data/related_ids/order_id")
        .and_then(serde_json::Value::as_str)
        .or_else(|| resource.get("id").and_then(serde_json::Value::as_str))
        .ok_or_else(|| PaymentError::InvalidResponse("webhook missing resource id".to_string()))?;
    let resource_status = resource
        .get("status")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();

    let amount = resource
        .pointer("/amount/value")
        .or_else(|| resource.pointer("/purchase_units/0/amount/value"))
        .and_then(serde_json::Value::as_str)
        .map(|raw| {
            money::parse_decimal(raw)
                .map_err(|err| PaymentError::InvalidResponse(format!("webhook amount: {err}")))
        })
        .transpose()?;

    Ok(WebhookEvent {
        event_id: value
            .get("id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string),
        event_type: event_type.to_string(),
        resource_id: resource_id.to_string(),
        resource_status: resource_status.to_string(),
        amount,
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    links: Vec<OrderLink>,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
}

impl OrderResponse {
    fn status_str(&self) -> &str {
        self.status.as_deref().unwrap_or("UNKNOWN")
    }

    fn captured_amount(&self) -> Result<i64, PaymentError> {
        let unit = self.purchase_units.first();
        let value = unit
            .and_then(|unit| unit.payments.as_ref())
            .and_then(|payments| payments.captures.first())
            .and_then(|capture| capture.amount.as_ref())
            .or_else(|| unit.and_then(|unit| unit.amount.as_ref()))
            .map(|amount| amount.value.as_str())
            .ok_or_else(|| {
                PaymentError::InvalidResponse("completed order carries no amount".to_string())
            })?;
        money::parse_decimal(value)
            .map_err(|err| PaymentError::InvalidResponse(format!("order amount: {err}")))
    }
}

#[derive(Debug, Deserialize)]
struct OrderLink {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct PurchaseUnit {
    #[serde(default)]
    amount: Option<OrderAmount>,
    #[serde(default)]
    payments: Option<OrderPayments>,
}

#[derive(Debug, Deserialize)]
struct OrderPayments {
    #[serde(default)]
    captures: Vec<OrderCapture>,
}

#[derive(Debug, Deserialize)]
struct OrderCapture {
    #[serde(default)]
    amount: Option<OrderAmount>,
}

#[derive(Debug, Deserialize)]
struct OrderAmount {
    value: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{
        Method::{GET, POST},
        MockServer,
    };

    fn gateway(server: &MockServer) -> PayPalGateway {
        let config = PayPalConfig::new(server.base_url(), "client-1", "secret-1").expect("config");
        PayPalGateway::new(config)
    }

    async fn mock_token(server: &MockServer) -> httpmock::Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/oauth2/token")
                    .header_exists("authorization")
                    .body_includes("grant_type=client_credentials");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"access_token":"tok-1","token_type":"Bearer","expires_in":3600}"#);
            })
            .await
    }

    #[tokio::test]
    async fn creates_order_and_returns_approval_link() -> Result<(), PaymentError> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let token = mock_token(&server).await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v2/checkout/orders")
                    .header("authorization", "Bearer tok-1")
                    .body_includes(r#""intent":"CAPTURE""#)
                    .body_includes(r#""value":"10.00""#);
                then.status(201)
                    .header("content-type", "application/json")
                    .body(
                        r#"{"id":"ORDER-1","status":"CREATED","links":[
                            {"href":"https://paypal.test/self","rel":"self","method":"GET"},
                            {"href":"https://paypal.test/approve","rel":"approve","method":"GET"}]}"#,
                    );
            })
            .await;

        let order = gateway(&server)
            .create_order(10_000_000, "Deposit of 10.00 USD")
            .await?;
        token.assert_async().await;
        create.assert_async().await;
        assert_eq!(order.order_id, "ORDER-1");
        assert_eq!(order.approval_url, "https://paypal.test/approve");
        Ok(())
    }

    #[tokio::test]
    async fn captures_approved_order_and_reports_amount() -> Result<(), PaymentError> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        mock_token(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/checkout/orders/ORDER-2");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"id":"ORDER-2","status":"APPROVED"}"#);
            })
            .await;
        let capture = server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/checkout/orders/ORDER-2/capture");
                then.status(201)
                    .header("content-type", "application/json")
                    .body(
                        r#"{"id":"ORDER-2","status":"COMPLETED","purchase_units":[
                            {"payments":{"captures":[{"amount":{"currency_code":"USD","value":"25.00"}}]}}]}"#,
                    );
            })
            .await;

        let status = gateway(&server).order_status("ORDER-2").await?;
        capture.assert_async().await;
        assert_eq!(status, OrderVerification::Verified { amount: 25_000_000 });
        Ok(())
    }

    #[tokio::test]
    async fn maps_order_states() -> Result<(), PaymentError> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        mock_token(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/checkout/orders/ORDER-VOID");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"id":"ORDER-VOID","status":"VOIDED"}"#);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/checkout/orders/ORDER-NEW");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"id":"ORDER-NEW","status":"CREATED"}"#);
            })
            .await;

        let gateway = gateway(&server);
        assert_eq!(
            gateway.order_status("ORDER-VOID").await?,
            OrderVerification::Declined {
                status: "VOIDED".to_string()
            }
        );
        assert_eq!(
            gateway.order_status("ORDER-NEW").await?,
            OrderVerification::Unverified {
                status: "CREATED".to_string()
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn surfaces_api_errors_with_body() {
        if crate::utils::test_support::should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/oauth2/token");
                then.status(401).body(r#"{"error":"invalid_client"}"#);
            })
            .await;

        let err = gateway(&server)
            .create_order(5_000_000, "Deposit")
            .await
            .expect_err("unauthorized");
        match err {
            PaymentError::Api { status, body } => {
                assert_eq!(status.as_u16(), 401);
                assert!(body.contains("invalid_client"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parses_capture_webhook_with_related_order_id() {
        let raw = r#"{
            "id": "WH-123",
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {
                "id": "CAPTURE-9",
                "status": "COMPLETED",
                "amount": {"currency_code": "USD", "value": "10.00"},
                "supplementary_data": {"related_ids": {"order_id": "ORDER-7"}}
            }
        }"#;
        let event = parse_webhook_event(raw).expect("parse");
        assert_eq!(event.event_id.as_deref(), Some("WH-123"));
        assert_eq!(event.resource_id, "ORDER-7");
        assert_eq!(event.amount, Some(10_000_000));
        assert!(event.is_completion());
    }

    #[test]
    fn order_webhook_falls_back_to_resource_id() {
        let raw = r#"{
            "id": "WH-124",
            "event_type": "CHECKOUT.ORDER.COMPLETED",
            "resource": {"id": "ORDER-8", "status": "COMPLETED"}
        }"#;
        let event = parse_webhook_event(raw).expect("parse");
        assert_eq!(event.resource_id, "ORDER-8");
        assert_eq!(event.amount, None);
    }

    #[test]
    fn rejects_webhook_without_resource() {
        let err = parse_webhook_event(r#"{"event_type":"PAYMENT.CAPTURE.COMPLETED"}"#)
            .expect_err("missing resource");
        assert!(matches!(err, PaymentError::InvalidResponse(_)));
    }

    #[test]
    fn config_debug_redacts_secret() {
        let config = PayPalConfig::new("https://paypal.test", "client", "super-secret").expect("config");
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
