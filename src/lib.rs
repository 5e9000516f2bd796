pub mod error;
pub mod meter;
pub mod money;
pub mod payments;
#[cfg(feature = "telemetry")]
pub mod telemetry;
pub mod utils;

pub use error::{MeterError, Result};
pub use meter::{
    Account, BalanceSummary, ChargeResult, Clock, Credential, Eligibility, Env, Identity,
    LedgerStore, ManualClock, MemoryStore, Meter, MeterConfig, Role, SystemClock, Transaction,
    TransactionStatus, WebhookOutcome,
};
#[cfg(feature = "store-sqlite")]
pub use meter::SqliteStore;
pub use payments::{PayPalConfig, PayPalGateway, PaymentGateway, WebhookEvent};
