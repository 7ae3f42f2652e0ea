//! Subscription model.

use crate::models::{BillingInterval, SubscriptionPlan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "paused" => SubscriptionStatus::Paused,
            "cancelled" => SubscriptionStatus::Cancelled,
            _ => SubscriptionStatus::Active,
        }
    }
}

/// One billing relationship for one user. Never hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub plan: String,
    pub status: String,
    pub billing_interval: String,
    pub price_amount: i64,
    pub currency: String,
    pub monthly_hours: i32,
    pub start_date: DateTime<Utc>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub next_billing_date: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_string(&self.status)
    }

    pub fn plan(&self) -> Option<SubscriptionPlan> {
        SubscriptionPlan::parse(&self.plan)
    }

    pub fn billing_interval(&self) -> BillingInterval {
        BillingInterval::from_string(&self.billing_interval)
    }

    pub fn is_active(&self) -> bool {
        self.status() == SubscriptionStatus::Active
    }
}

/// Input for creating a subscription directly.
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub user_id: Uuid,
    pub plan: SubscriptionPlan,
    pub billing_interval: BillingInterval,
    pub price_amount: i64,
    pub monthly_hours: i32,
}

/// Fields of an active subscription that may change after creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionPatch {
    pub plan: Option<SubscriptionPlan>,
    pub price_amount: Option<i64>,
    pub monthly_hours: Option<i32>,
}

impl SubscriptionPatch {
    pub fn is_empty(&self) -> bool {
        self.plan.is_none() && self.price_amount.is_none() && self.monthly_hours.is_none()
    }
}
