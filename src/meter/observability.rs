use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterMetricsSnapshot {
    pub authentications: u64,
    pub auth_failures: u64,
    pub rate_limited: u64,
    pub free_charges: u64,
    pub paid_charges: u64,
    pub rejected_charges: u64,
    pub deposits_completed: u64,
    pub deposits_failed: u64,
    pub duplicate_confirmations: u64,
    pub usage_record_failures: u64,
}

/// Process-wide counters, safe to bump from concurrent requests.
#[derive(Debug, Default)]
pub struct MeterMetrics {
    authentications: AtomicU64,
    auth_failures: AtomicU64,
    rate_limited: AtomicU64,
    free_charges: AtomicU64,
    paid_charges: AtomicU64,
    rejected_charges: AtomicU64,
    deposits_completed: AtomicU64,
    deposits_failed: AtomicU64,
    duplicate_confirmations: AtomicU64,
    usage_record_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl MeterMetrics {
    pub fn record_authentication(&self) {
        bump(&self.authentications);
    }

    pub fn record_auth_failure(&self) {
        bump(&self.auth_failures);
    }

    pub fn record_rate_limited(&self) {
        bump(&self.rate_limited);
    }

    pub fn record_free_charge(&self) {
        bump(&self.free_charges);
    }

    pub fn record_paid_charge(&self) {
        bump(&self.paid_charges);
    }

    pub fn record_rejected_charge(&self) {
        bump(&self.rejected_charges);
    }

    pub fn record_deposit_completed(&self) {
        bump(&self.deposits_completed);
    }

    pub fn record_deposit_failed(&self) {
        bump(&self.deposits_failed);
    }

    pub fn record_duplicate_confirmation(&self) {
        bump(&self.duplicate_confirmations);
    }

    pub fn record_usage_failure(&self) {
        bump(&self.usage_record_failures);
    }

    pub fn snapshot(&self) -> MeterMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MeterMetricsSnapshot {
            authentications: load(&self.authentications),
            auth_failures: load(&self.auth_failures),
            rate_limited: load(&self.rate_limited),
            free_charges: load(&self.free_charges),
            paid_charges: load(&self.paid_charges),
            rejected_charges: load(&self.rejected_charges),
            deposits_completed: load(&self.deposits_completed),
            deposits_failed: load(&self.deposits_failed),
            duplicate_confirmations: load(&self.duplicate_confirmations),
            usage_record_failures: load(&self.usage_record_failures),
        }
    }
}
