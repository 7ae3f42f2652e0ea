//! Hours balance ledger.
//!
//! Allowances are additive hour counters and usage is an additive minute counter. Remaining
//! hours and usage percentage are derived on read (`HoursBalanceView`). Whether usage may run past the allowance, and
//! what happens to unused hours at period end, is decided by the injected policies.

use crate::error::BillingError;
use crate::models::{
    HoursBalance, HoursBalanceView, NewNotification, NewTimeLog, NotificationType, ProjectUsage,
    TimeLog,
};
use crate::services::clock::Clock;
use crate::services::metrics::record_hours_operation;
use crate::services::notifications::{emit, NotificationEmitter};
use crate::services::periods::{add_months, calendar_month, end_of_month};
use crate::services::policy::{RolloverPolicy, UsageDecision, UsagePolicy};
use crate::services::store::{BillingStore, TimeLogWrite, UsageWrite};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

const DEFAULT_HISTORY_LIMIT: i64 = 12;

pub(crate) fn new_balance(
    user_id: Uuid,
    subscription_id: Option<Uuid>,
    period: (DateTime<Utc>, DateTime<Utc>),
    allocated_hours: i32,
    rollover_hours: Decimal,
    now: DateTime<Utc>,
) -> HoursBalance {
    HoursBalance {
        balance_id: Uuid::new_v4(),
        user_id,
        subscription_id,
        period_start: period.0,
        period_end: period.1,
        allocated_hours,
        bonus_hours: 0,
        extra_purchased_hours: 0,
        rollover_hours,
        minutes_used: 0,
        created_utc: now,
        updated_utc: now,
    }
}

pub struct HoursLedger {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn NotificationEmitter>,
    usage_policy: UsagePolicy,
    rollover_policy: RolloverPolicy,
}

impl HoursLedger {
    pub fn new(
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn NotificationEmitter>,
        usage_policy: UsagePolicy,
        rollover_policy: RolloverPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            usage_policy,
            rollover_policy,
        }
    }

    /// Balance whose period contains now. `None` for users without one yet.
    #[instrument(skip(self))]
    pub async fn get_current_balance(
        &self,
        user_id: Uuid,
    ) -> Result<Option<HoursBalanceView>, BillingError> {
        Ok(self
            .store
            .find_balance_covering(user_id, self.clock.now())
            .await?
            .map(HoursBalanceView::from))
    }

    /// Open a balance for the calendar month containing `start_date` (default: now).
    #[instrument(skip(self))]
    pub async fn create_monthly_balance(
        &self,
        user_id: Uuid,
        subscription_id: Option<Uuid>,
        monthly_hours: i32,
        start_date: Option<DateTime<Utc>>,
    ) -> Result<HoursBalance, BillingError> {
        if monthly_hours < 0 {
            return Err(BillingError::Validation(
                "monthly_hours must not be negative".to_string(),
            ));
        }

        let now = self.clock.now();
        let period = calendar_month(start_date.unwrap_or(now));
        let balance = self
            .store
            .insert_balance(&new_balance(
                user_id,
                subscription_id,
                period,
                monthly_hours,
                Decimal::ZERO,
                now,
            ))
            .await?;

        record_hours_operation("balance_created");
        tracing::info!(
            balance_id = %balance.balance_id,
            period_start = %balance.period_start,
            allocated_hours = balance.allocated_hours,
            "Hours balance created"
        );
        Ok(balance)
    }

    /// Credit purchased hours to the balance that has not yet ended.
    #[instrument(skip(self))]
    pub async fn add_purchased_hours(
        &self,
        user_id: Uuid,
        hours: i32,
    ) -> Result<HoursBalance, BillingError> {
        if hours <= 0 {
            return Err(BillingError::Validation(
                "hours must be positive".to_string(),
            ));
        }

        let balance = self
            .store
            .find_open_balance(user_id, self.clock.now())
            .await?
            .ok_or(BillingError::NoActiveBalance)?;
        let balance = self
            .store
            .add_extra_hours(balance.balance_id, hours)
            .await?
            .ok_or(BillingError::NoActiveBalance)?;

        record_hours_operation("hours_purchased");
        tracing::info!(
            balance_id = %balance.balance_id,
            hours = hours,
            extra_purchased_hours = balance.extra_purchased_hours,
            "Purchased hours credited"
        );
        Ok(balance)
    }

    /// Record worked minutes against a balance.
    #[instrument(skip(self))]
    pub async fn update_usage(
        &self,
        balance_id: Uuid,
        minutes_used: i64,
    ) -> Result<HoursBalanceView, BillingError> {
        if minutes_used < 0 {
            return Err(BillingError::Validation(
                "minutes_used must not be negative".to_string(),
            ));
        }

        let write = self
            .store
            .add_minutes_used(balance_id, minutes_used, self.usage_policy.caps_usage())
            .await?;
        let updated = match write {
            UsageWrite::Applied(updated) => updated,
            UsageWrite::OverAllowance => {
                return Err(self.over_allowance(balance_id, minutes_used).await)
            }
            UsageWrite::BalanceMissing => return Err(BillingError::BalanceNotFound),
        };

        self.after_usage(&updated, minutes_used).await;
        Ok(updated.into())
    }

    /// Log the write and raise the low-balance warning when this increment crossed the
    /// threshold.
    async fn after_usage(&self, updated: &HoursBalance, added_minutes: i64) {
        record_hours_operation("usage_recorded");
        tracing::debug!(
            balance_id = %updated.balance_id,
            minutes = added_minutes,
            minutes_used = updated.minutes_used,
            "Usage recorded"
        );

        let before = HoursBalance {
            minutes_used: updated.minutes_used - added_minutes,
            ..updated.clone()
        };
        if let UsageDecision::AcceptWithWarning { usage_percentage } =
            self.usage_policy.evaluate(&before, added_minutes)
        {
            tracing::info!(
                user_id = %updated.user_id,
                usage_percentage = %usage_percentage,
                "Low hours balance"
            );
            emit(
                self.notifier.as_ref(),
                NewNotification::new(
                    updated.user_id,
                    NotificationType::Warning,
                    "Hours Running Low",
                    format!(
                        "You have {} hours remaining this month.",
                        updated.hours_remaining().round_dp(1).normalize()
                    ),
                )
                .with_action("/billing", Some("Buy Hours")),
            )
            .await;
        }
    }

    async fn over_allowance(&self, balance_id: Uuid, minutes: i64) -> BillingError {
        let requested = Decimal::from(minutes) / Decimal::from(60);
        let remaining = match self.store.get_balance(balance_id).await {
            Ok(Some(balance)) => balance.hours_remaining(),
            Ok(None) => return BillingError::BalanceNotFound,
            Err(e) => return e.into(),
        };
        record_hours_operation("usage_rejected");
        tracing::warn!(
            balance_id = %balance_id,
            requested_minutes = minutes,
            remaining = %remaining,
            "Usage rejected by hard cap"
        );
        BillingError::UsageLimitExceeded {
            requested: requested.round_dp(2),
            remaining,
        }
    }

    /// Open the next period's balance for a user.
    ///
    /// Returns `None` when the user has no current balance or it is not linked to a
    /// subscription. Calling it twice for the same period returns the existing row.
    #[instrument(skip(self))]
    pub async fn reset_monthly_balance(
        &self,
        user_id: Uuid,
    ) -> Result<Option<HoursBalance>, BillingError> {
        let now = self.clock.now();
        let Some(current) = self.store.find_balance_covering(user_id, now).await? else {
            tracing::debug!(user_id = %user_id, "No current balance to roll over");
            return Ok(None);
        };
        let Some(subscription_id) = current.subscription_id else {
            return Ok(None);
        };
        let Some(subscription) = self.store.get_subscription(subscription_id).await? else {
            tracing::warn!(
                subscription_id = %subscription_id,
                "Balance references a missing subscription"
            );
            return Ok(None);
        };

        let next_start = add_months(current.period_start, 1);
        if let Some(existing) = self
            .store
            .find_balance_for_period(user_id, next_start)
            .await?
        {
            return Ok(Some(existing));
        }

        let rollover = self.rollover_policy.rollover_hours(&current);
        let balance = new_balance(
            user_id,
            Some(subscription.subscription_id),
            (next_start, end_of_month(next_start)),
            subscription.monthly_hours,
            rollover,
            now,
        );

        let balance = match self.store.insert_balance(&balance).await {
            Ok(balance) => balance,
            // Lost a race with another reset for the same period.
            Err(AppError::Conflict(_)) => self
                .store
                .find_balance_for_period(user_id, next_start)
                .await?
                .ok_or(BillingError::BalanceNotFound)?,
            Err(e) => return Err(e.into()),
        };

        record_hours_operation("balance_reset");
        tracing::info!(
            balance_id = %balance.balance_id,
            period_start = %balance.period_start,
            allocated_hours = balance.allocated_hours,
            rollover_hours = %balance.rollover_hours,
            "Monthly balance reset"
        );
        Ok(Some(balance))
    }

    #[instrument(skip(self))]
    pub async fn get_balance_history(
        &self,
        user_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<HoursBalanceView>, BillingError> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).max(1);
        Ok(self
            .store
            .list_balances(user_id, limit)
            .await?
            .into_iter()
            .map(HoursBalanceView::from)
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn get_usage_by_project(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProjectUsage>, BillingError> {
        if end < start {
            return Err(BillingError::Validation(
                "end date must not precede start date".to_string(),
            ));
        }
        Ok(self.store.usage_by_project(user_id, start, end).await?)
    }

    /// Store worked time and, when the client has a current balance, charge it.
    #[instrument(skip(self, entry), fields(client_id = %entry.client_id, project_id = %entry.project_id))]
    pub async fn record_time_entry(
        &self,
        entry: NewTimeLog,
    ) -> Result<(TimeLog, Option<HoursBalanceView>), BillingError> {
        if entry.duration_minutes <= 0 {
            return Err(BillingError::Validation(
                "duration_minutes must be positive".to_string(),
            ));
        }

        let now = self.clock.now();
        let current = self.store.find_balance_covering(entry.client_id, now).await?;
        let minutes = i64::from(entry.duration_minutes);
        let time_log = TimeLog {
            time_log_id: Uuid::new_v4(),
            client_id: entry.client_id,
            project_id: entry.project_id,
            project_title: entry.project_title,
            task_name: entry.task_name,
            duration_minutes: entry.duration_minutes,
            start_time: entry.start_time,
            created_utc: now,
        };

        let balance_id = current.as_ref().map(|b| b.balance_id);
        let write = self
            .store
            .record_time_log(&time_log, balance_id, self.usage_policy.caps_usage())
            .await?;
        let (time_log, balance) = match write {
            TimeLogWrite::Recorded { time_log, balance } => (time_log, balance),
            TimeLogWrite::OverAllowance => {
                let balance_id = balance_id.ok_or(BillingError::NoActiveBalance)?;
                return Err(self.over_allowance(balance_id, minutes).await);
            }
        };
        record_hours_operation("time_logged");

        if let Some(updated) = &balance {
            self.after_usage(updated, minutes).await;
        }

        Ok((time_log, balance.map(HoursBalanceView::from)))
    }
}
