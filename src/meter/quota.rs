//! Monthly free-operation rollover.
//!
//! Pure decision logic: callers that mutate the counter must evaluate it
//! inside the same store transaction that reads the counter. Evaluating it
//! anywhere else is advisory only.

use time::{Date, Month, OffsetDateTime, UtcOffset};

/// First instant (UTC midnight) of the calendar month following `now`.
pub fn next_reset_boundary(now: OffsetDateTime) -> OffsetDateTime {
    let now = now.to_offset(UtcOffset::UTC);
    let (year, month) = match now.month() {
        Month::December => (now.year() + 1, Month::January),
        month => (now.year(), month.next()),
    };
    Date::from_calendar_date(year, month, 1)
        .unwrap_or(Date::MAX)
        .midnight()
        .assume_utc()
}

/// First instant (UTC midnight) of the calendar month containing `now`.
pub fn month_start(now: OffsetDateTime) -> OffsetDateTime {
    let now = now.to_offset(UtcOffset::UTC);
    now.date()
        .replace_day(1)
        .unwrap_or(now.date())
        .midnight()
        .assume_utc()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaPolicy {
    monthly_free_allotment: u32,
}

/// Effective free-operation counter after applying the rollover rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaState {
    pub used: u32,
    pub reset_at: OffsetDateTime,
    pub allotment: u32,
    /// True when `now` crossed the stored boundary and the counter was zeroed.
    pub rolled_over: bool,
}

impl QuotaState {
    pub fn remaining(&self) -> u32 {
        self.allotment.saturating_sub(self.used)
    }

    pub fn has_free(&self) -> bool {
        self.used < self.allotment
    }
}

impl QuotaPolicy {
    pub fn new(monthly_free_allotment: u32) -> Self {
        Self {
            monthly_free_allotment,
        }
    }

    pub fn allotment(&self) -> u32 {
        self.monthly_free_allotment
    }

    pub fn is_due(&self, now: OffsetDateTime, reset_at: OffsetDateTime) -> bool {
        now >= reset_at
    }

    pub fn evaluate(&self, now: OffsetDateTime, used: u32, reset_at: OffsetDateTime) -> QuotaState {
        if self.is_due(now, reset_at) {
            return QuotaState {
                used: 0,
                reset_at: next_reset_boundary(now),
                allotment: self.monthly_free_allotment,
                rolled_over: true,
            };
        }
        QuotaState {
            used,
            reset_at,
            allotment: self.monthly_free_allotment,
            rolled_over: false,
        }
    }
}
