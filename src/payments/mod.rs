//! External payment gateway seam used by deposit reconciliation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod paypal;

pub use paypal::{PayPalConfig, PayPalGateway, parse_webhook_event};

pub const PAYMENT_CAPTURE_COMPLETED: &str = "PAYMENT.CAPTURE.COMPLETED";
pub const CHECKOUT_ORDER_COMPLETED: &str = "CHECKOUT.ORDER.COMPLETED";
pub const RESOURCE_STATUS_COMPLETED: &str = "COMPLETED";

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("payment http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid payment gateway response: {0}")]
    InvalidResponse(String),
    #[error("payment gateway not configured: {0}")]
    NotConfigured(String),
    #[error("payment json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOrder {
    pub order_id: String,
    pub approval_url: String,
}

/// What the gateway reports about an order when asked synchronously.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrderVerification {
    /// Funds were captured; `amount` is in micro-units.
    Verified { amount: i64 },
    /// The order exists but has not been paid yet (or could not be captured).
    Unverified { status: String },
    /// The gateway explicitly refused the payment.
    Declined { status: String },
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(
        &self,
        amount: i64,
        description: &str,
    ) -> Result<CreatedOrder, PaymentError>;

    async fn order_status(&self, order_id: &str) -> Result<OrderVerification, PaymentError>;
}

/// Normalised webhook notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub event_type: String,
    pub resource_id: String,
    pub resource_status: String,
    /// Captured amount in micro-units, when the payload carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
}

impl WebhookEvent {
    pub fn is_completion(&self) -> bool {
        let completed_type = self.event_type == PAYMENT_CAPTURE_COMPLETED
            || self.event_type == CHECKOUT_ORDER_COMPLETED;
        completed_type && self.resource_status.eq_ignore_ascii_case(RESOURCE_STATUS_COMPLETED)
    }
}
