//! Hours balance ledger model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

const MINUTES_PER_HOUR: i64 = 60;
const HOURS_SCALE: u32 = 2;

/// One ledger row per user and billing period.
///
/// Usage is counted in whole minutes. Hour figures and percentages are derived from the
/// minute counter on every read and never stored.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HoursBalance {
    pub balance_id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub allocated_hours: i32,
    pub bonus_hours: i32,
    pub extra_purchased_hours: i32,
    pub rollover_hours: Decimal,
    pub minutes_used: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl HoursBalance {
    pub fn total_available_hours(&self) -> Decimal {
        Decimal::from(self.allocated_hours)
            + Decimal::from(self.bonus_hours)
            + Decimal::from(self.extra_purchased_hours)
            + self.rollover_hours
    }

    pub fn available_minutes(&self) -> Decimal {
        self.total_available_hours() * Decimal::from(MINUTES_PER_HOUR)
    }

    /// May be negative when usage exceeded the allowance.
    pub fn minutes_remaining(&self) -> Decimal {
        self.available_minutes() - Decimal::from(self.minutes_used)
    }

    pub fn hours_used(&self) -> Decimal {
        minutes_as_hours(Decimal::from(self.minutes_used))
    }

    /// May be negative when usage exceeded the allowance.
    pub fn hours_remaining(&self) -> Decimal {
        minutes_as_hours(self.minutes_remaining())
    }

    /// Zero when nothing is available; otherwise unbounded above 100.
    pub fn usage_percentage(&self) -> Decimal {
        percentage_of(Decimal::from(self.minutes_used), self.available_minutes())
            .round_dp(HOURS_SCALE)
    }

    /// Whether `at` falls inside `[period_start, period_end]`.
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.period_start <= at && at <= self.period_end
    }
}

fn minutes_as_hours(minutes: Decimal) -> Decimal {
    (minutes / Decimal::from(MINUTES_PER_HOUR)).round_dp(HOURS_SCALE)
}

pub(crate) fn percentage_of(used: Decimal, total: Decimal) -> Decimal {
    if total.is_zero() {
        Decimal::ZERO
    } else {
        used / total * Decimal::ONE_HUNDRED
    }
}

/// A balance together with its read-time derived fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoursBalanceView {
    #[serde(flatten)]
    pub balance: HoursBalance,
    pub hours_used: Decimal,
    pub total_available_hours: Decimal,
    pub hours_remaining: Decimal,
    pub usage_percentage: Decimal,
}

impl From<HoursBalance> for HoursBalanceView {
    fn from(balance: HoursBalance) -> Self {
        Self {
            hours_used: balance.hours_used(),
            total_available_hours: balance.total_available_hours(),
            hours_remaining: balance.hours_remaining(),
            usage_percentage: balance.usage_percentage(),
            balance,
        }
    }
}
