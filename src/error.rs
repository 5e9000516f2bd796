use thiserror::Error;

use crate::meter::ChargeResult;
use crate::meter::config::ConfigError;
use crate::money::format_amount;
use crate::payments::PaymentError;

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("invalid credential: {reason}")]
    CredentialInvalid { reason: String },
    #[error("credential has expired; sign in again or rotate the api key")]
    CredentialExpired,
    #[error("api key is not permitted to run {operation:?}; add it to the key's permissions")]
    PermissionDenied { operation: String },
    #[error("account {account_id} is not an administrator")]
    AdminRequired { account_id: String },
    #[error("account {account_id} is suspended")]
    AccountSuspended { account_id: String },
    #[error("account not found: {account_id}")]
    AccountNotFound { account_id: String },
    #[error(
        "insufficient entitlement: balance={} free_remaining={free_remaining} operation_cost={}; top up the balance or wait for the monthly reset",
        micros(.balance),
        micros(.operation_cost)
    )]
    InsufficientEntitlement {
        balance: i64,
        free_remaining: u32,
        operation_cost: i64,
    },
    #[error("rate limit exceeded: {limit}")]
    RateLimited { limit: String },
    #[error("concurrent update conflict; retry the request")]
    ConcurrencyConflict,
    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },
    #[error("payment {reference} could not be verified: {reason}")]
    ExternalVerificationFailed { reference: String, reason: String },
    #[error("no deposit recorded for payment reference {reference}")]
    DepositNotFound { reference: String },
    #[error("payment reference {reference} is already recorded")]
    DuplicatePaymentReference { reference: String },
    #[error("api key limit reached ({limit})")]
    KeyLimitReached { limit: u32 },
    #[error("api key not found: {key_id}")]
    ApiKeyNotFound { key_id: String },
    #[error("ledger inconsistency: {detail}")]
    LedgerInconsistency { detail: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("processing failed after charge was committed: {message}")]
    Processing {
        message: String,
        charge: ChargeResult,
    },
    #[error("internal error: {message}")]
    Internal { message: String },
    #[error("payment gateway error: {0}")]
    Payment(#[from] PaymentError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl MeterError {
    /// Errors that are guaranteed to have left no mutation behind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeterError::ConcurrencyConflict | MeterError::StorageUnavailable { .. }
        )
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        MeterError::InvalidRequest {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MeterError>;

fn micros(value: &i64) -> String {
    format_amount(*value, 6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_storage_errors_are_retryable() {
        assert!(MeterError::ConcurrencyConflict.is_retryable());
        assert!(
            MeterError::StorageUnavailable {
                message: "busy".to_string()
            }
            .is_retryable()
        );
        assert!(!MeterError::CredentialExpired.is_retryable());
        assert!(
            !MeterError::LedgerInconsistency {
                detail: "negative balance".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn insufficient_entitlement_message_explains_remediation() {
        let err = MeterError::InsufficientEntitlement {
            balance: 0,
            free_remaining: 0,
            operation_cost: 5_000,
        };
        let message = err.to_string();
        assert!(message.contains("balance=0.000000"));
        assert!(message.contains("operation_cost=0.005000"));
        assert!(message.contains("top up"));
    }
}
