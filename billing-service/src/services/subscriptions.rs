//! Subscription lifecycle: create, patch, change plan, cancel, pause, resume.

use crate::error::BillingError;
use crate::models::{
    BillingInterval, CreateSubscription, NewNotification, NotificationType, PlanCatalog,
    Subscription, SubscriptionPatch, SubscriptionPlan, SubscriptionStatus,
};
use crate::services::clock::Clock;
use crate::services::metrics::record_subscription_operation;
use crate::services::notifications::{emit, NotificationEmitter};
use crate::services::periods::{add_months, period_bounds};
use crate::services::store::BillingStore;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Build an ACTIVE subscription whose first period starts at `now`.
pub(crate) fn new_subscription(
    user_id: Uuid,
    plan: SubscriptionPlan,
    interval: BillingInterval,
    price_amount: i64,
    monthly_hours: i32,
    currency: &str,
    now: DateTime<Utc>,
) -> Subscription {
    let (period_start, period_end) = period_bounds(now, interval);
    Subscription {
        subscription_id: Uuid::new_v4(),
        user_id,
        plan: plan.as_str().to_string(),
        status: SubscriptionStatus::Active.as_str().to_string(),
        billing_interval: interval.as_str().to_string(),
        price_amount,
        currency: currency.to_string(),
        monthly_hours,
        start_date: now,
        current_period_start: period_start,
        current_period_end: period_end,
        next_billing_date: period_end,
        cancelled_at: None,
        created_utc: now,
        updated_utc: now,
    }
}

/// Writes that can only conflict on the one-active-per-user index.
pub(crate) fn active_conflict(err: AppError) -> BillingError {
    match err {
        AppError::Conflict(_) => BillingError::SubscriptionAlreadyActive,
        other => BillingError::Storage(other),
    }
}

fn validate_amounts(price_amount: Option<i64>, monthly_hours: Option<i32>) -> Result<(), BillingError> {
    if price_amount.is_some_and(|p| p < 0) {
        return Err(BillingError::Validation(
            "price_amount must not be negative".to_string(),
        ));
    }
    if monthly_hours.is_some_and(|h| h < 0) {
        return Err(BillingError::Validation(
            "monthly_hours must not be negative".to_string(),
        ));
    }
    Ok(())
}

pub struct SubscriptionManager {
    store: Arc<dyn BillingStore>,
    catalog: Arc<PlanCatalog>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn NotificationEmitter>,
    currency: String,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn BillingStore>,
        catalog: Arc<PlanCatalog>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn NotificationEmitter>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
            notifier,
            currency: currency.into(),
        }
    }

    #[instrument(skip(self, input), fields(user_id = %input.user_id, plan = %input.plan.as_str()))]
    pub async fn create_subscription(
        &self,
        input: CreateSubscription,
    ) -> Result<Subscription, BillingError> {
        validate_amounts(Some(input.price_amount), Some(input.monthly_hours))?;

        if self
            .store
            .find_active_subscription(input.user_id)
            .await?
            .is_some()
        {
            return Err(BillingError::SubscriptionAlreadyActive);
        }

        let subscription = new_subscription(
            input.user_id,
            input.plan,
            input.billing_interval,
            input.price_amount,
            input.monthly_hours,
            &self.currency,
            self.clock.now(),
        );
        let subscription = self
            .store
            .insert_subscription(&subscription)
            .await
            .map_err(active_conflict)?;

        record_subscription_operation("created");
        tracing::info!(
            subscription_id = %subscription.subscription_id,
            period_end = %subscription.current_period_end,
            "Subscription created"
        );
        Ok(subscription)
    }

    /// Most recently created ACTIVE subscription, if any.
    #[instrument(skip(self))]
    pub async fn get_active_subscription(
        &self,
        user_id: Uuid,
    ) -> Result<Option<Subscription>, BillingError> {
        Ok(self.store.find_active_subscription(user_id).await?)
    }

    #[instrument(skip(self))]
    pub async fn get_user_subscriptions(
        &self,
        user_id: Uuid,
        status: Option<SubscriptionStatus>,
    ) -> Result<Vec<Subscription>, BillingError> {
        Ok(self.store.list_subscriptions(user_id, status).await?)
    }

    #[instrument(skip(self))]
    pub async fn get_subscription_by_id(
        &self,
        subscription_id: Uuid,
    ) -> Result<Subscription, BillingError> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)
    }

    async fn require_active(&self, user_id: Uuid) -> Result<Subscription, BillingError> {
        self.store
            .find_active_subscription(user_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription)
    }

    /// Apply a partial update to the user's active subscription. The billing period is
    /// left untouched.
    #[instrument(skip(self, patch))]
    pub async fn update_subscription(
        &self,
        user_id: Uuid,
        patch: SubscriptionPatch,
    ) -> Result<Subscription, BillingError> {
        if patch.is_empty() {
            return Err(BillingError::Validation(
                "Subscription update has no fields".to_string(),
            ));
        }
        validate_amounts(patch.price_amount, patch.monthly_hours)?;

        let mut subscription = self.require_active(user_id).await?;
        if let Some(plan) = patch.plan {
            subscription.plan = plan.as_str().to_string();
        }
        if let Some(price) = patch.price_amount {
            subscription.price_amount = price;
        }
        if let Some(hours) = patch.monthly_hours {
            subscription.monthly_hours = hours;
        }
        subscription.updated_utc = self.clock.now();

        let subscription = self.store.update_subscription(&subscription).await?;
        record_subscription_operation("updated");
        tracing::info!(
            subscription_id = %subscription.subscription_id,
            plan = %subscription.plan,
            price_amount = subscription.price_amount,
            monthly_hours = subscription.monthly_hours,
            "Subscription updated"
        );
        Ok(subscription)
    }

    /// Move the active subscription to another catalog plan at the catalog's price.
    #[instrument(skip(self))]
    pub async fn change_plan(
        &self,
        user_id: Uuid,
        plan_name: &str,
    ) -> Result<Subscription, BillingError> {
        let definition = self.catalog.plan_config(plan_name)?;
        if definition.requires_custom_price {
            return Err(BillingError::EnterpriseRequiresCustomPrice);
        }

        let current = self.require_active(user_id).await?;
        let price = definition.price_for(current.billing_interval());
        if price == 0 {
            return Err(BillingError::Validation(format!(
                "{} plan has no catalog price; update the price explicitly",
                definition.plan.as_str().to_uppercase()
            )));
        }

        self.update_subscription(
            user_id,
            SubscriptionPatch {
                plan: Some(definition.plan),
                price_amount: Some(price),
                monthly_hours: Some(definition.monthly_hours),
            },
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn cancel_subscription(&self, user_id: Uuid) -> Result<Subscription, BillingError> {
        let mut subscription = self.require_active(user_id).await?;
        let now = self.clock.now();
        subscription.status = SubscriptionStatus::Cancelled.as_str().to_string();
        subscription.cancelled_at = Some(now);
        subscription.updated_utc = now;

        let subscription = self.store.update_subscription(&subscription).await?;
        record_subscription_operation("cancelled");
        tracing::info!(subscription_id = %subscription.subscription_id, "Subscription cancelled");

        emit(
            self.notifier.as_ref(),
            NewNotification::new(
                user_id,
                NotificationType::Warning,
                "Subscription Cancelled",
                "Your subscription has been cancelled",
            )
            .with_action("/billing", None),
        )
        .await;

        Ok(subscription)
    }

    #[instrument(skip(self))]
    pub async fn pause_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Subscription, BillingError> {
        let mut subscription = self.get_subscription_by_id(subscription_id).await?;
        if subscription.status() != SubscriptionStatus::Active {
            return Err(BillingError::InvalidTransition(
                "Subscription must be active to pause".to_string(),
            ));
        }

        subscription.status = SubscriptionStatus::Paused.as_str().to_string();
        subscription.updated_utc = self.clock.now();

        let subscription = self.store.update_subscription(&subscription).await?;
        record_subscription_operation("paused");
        tracing::info!(subscription_id = %subscription_id, "Subscription paused");
        Ok(subscription)
    }

    /// Resume a paused subscription. The next billing date restarts one month from now.
    #[instrument(skip(self))]
    pub async fn resume_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Subscription, BillingError> {
        let mut subscription = self.get_subscription_by_id(subscription_id).await?;
        if subscription.status() != SubscriptionStatus::Paused {
            return Err(BillingError::InvalidTransition(
                "Subscription must be paused to resume".to_string(),
            ));
        }
        if self
            .store
            .find_active_subscription(subscription.user_id)
            .await?
            .is_some()
        {
            return Err(BillingError::SubscriptionAlreadyActive);
        }

        let now = self.clock.now();
        subscription.status = SubscriptionStatus::Active.as_str().to_string();
        subscription.next_billing_date = add_months(now, 1);
        subscription.updated_utc = now;

        let subscription = self
            .store
            .update_subscription(&subscription)
            .await
            .map_err(active_conflict)?;
        record_subscription_operation("resumed");
        tracing::info!(
            subscription_id = %subscription_id,
            next_billing_date = %subscription.next_billing_date,
            "Subscription resumed"
        );
        Ok(subscription)
    }

    /// Mark a subscription ACTIVE after its renewal invoice was paid and push the next
    /// billing date one month past `paid_at`.
    #[instrument(skip(self))]
    pub async fn reactivate_after_payment(
        &self,
        subscription_id: Uuid,
        paid_at: DateTime<Utc>,
    ) -> Result<Subscription, BillingError> {
        let mut subscription = self.get_subscription_by_id(subscription_id).await?;
        subscription.status = SubscriptionStatus::Active.as_str().to_string();
        subscription.next_billing_date = add_months(paid_at, 1);
        subscription.updated_utc = self.clock.now();

        let subscription = self
            .store
            .update_subscription(&subscription)
            .await
            .map_err(active_conflict)?;
        record_subscription_operation("renewed");
        Ok(subscription)
    }
}
