//! Storage seam for the billing services.
//!
//! `Database` (PostgreSQL) and `MemoryStore` both implement `BillingStore` and enforce the
//! same uniqueness rules: one active subscription per user, one default payment method per
//! user, one balance per user and period start, unique invoice numbers. Violations are
//! reported as `AppError::Conflict`. Subscriptions, balances, invoices and payment methods
//! must reference an existing customer; a missing one is reported as `AppError::NotFound`.

use crate::models::{
    Customer, HoursBalance, Invoice, InvoiceStatusChange, NewNotification, Notification,
    PaymentHistoryFilter, PaymentMethod, PaymentStatus, ProjectUsage, Subscription,
    SubscriptionStatus, TimeLog,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

/// Rows written together when a subscription is activated.
#[derive(Debug, Clone)]
pub struct ActivationRecords {
    pub subscription: Subscription,
    pub invoice: Invoice,
    pub balance: Option<HoursBalance>,
}

/// Result of an atomic usage increment.
#[derive(Debug, Clone)]
pub enum UsageWrite {
    Applied(HoursBalance),
    /// The increment did not fit in the minutes remaining; nothing was written.
    OverAllowance,
    BalanceMissing,
}

/// Result of writing a time log together with its usage charge.
#[derive(Debug, Clone)]
pub enum TimeLogWrite {
    Recorded {
        time_log: TimeLog,
        balance: Option<HoursBalance>,
    },
    /// The charge did not fit in the minutes remaining; neither row was written.
    OverAllowance,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // Customers

    async fn get_customer(&self, user_id: Uuid) -> Result<Option<Customer>, AppError>;

    async fn upsert_customer(&self, customer: &Customer) -> Result<Customer, AppError>;

    async fn set_external_customer_id(
        &self,
        user_id: Uuid,
        external_customer_id: &str,
    ) -> Result<(), AppError>;

    // Subscriptions

    async fn insert_subscription(&self, subscription: &Subscription)
        -> Result<Subscription, AppError>;

    async fn get_subscription(&self, subscription_id: Uuid)
        -> Result<Option<Subscription>, AppError>;

    /// Most recently created active subscription.
    async fn find_active_subscription(&self, user_id: Uuid)
        -> Result<Option<Subscription>, AppError>;

    /// Newest first.
    async fn list_subscriptions(
        &self,
        user_id: Uuid,
        status: Option<SubscriptionStatus>,
    ) -> Result<Vec<Subscription>, AppError>;

    /// Persist the mutable columns of an existing subscription.
    async fn update_subscription(&self, subscription: &Subscription)
        -> Result<Subscription, AppError>;

    // Hours balances

    async fn insert_balance(&self, balance: &HoursBalance) -> Result<HoursBalance, AppError>;

    async fn get_balance(&self, balance_id: Uuid) -> Result<Option<HoursBalance>, AppError>;

    /// Balance whose period contains `at`; the latest period start wins.
    async fn find_balance_covering(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<HoursBalance>, AppError>;

    /// Earliest balance whose period has not ended at `at`.
    async fn find_open_balance(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<HoursBalance>, AppError>;

    async fn find_balance_for_period(
        &self,
        user_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> Result<Option<HoursBalance>, AppError>;

    /// Newest period first.
    async fn list_balances(&self, user_id: Uuid, limit: i64)
        -> Result<Vec<HoursBalance>, AppError>;

    /// Atomically add to `minutes_used`. With `within_allowance` the increment is applied
    /// only if it fits in the minutes remaining at write time.
    async fn add_minutes_used(
        &self,
        balance_id: Uuid,
        minutes: i64,
        within_allowance: bool,
    ) -> Result<UsageWrite, AppError>;

    /// Atomically add to `extra_purchased_hours`.
    async fn add_extra_hours(
        &self,
        balance_id: Uuid,
        hours: i32,
    ) -> Result<Option<HoursBalance>, AppError>;

    // Invoices

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError>;

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;

    async fn update_invoice_status(
        &self,
        invoice_id: Uuid,
        change: &InvoiceStatusChange,
    ) -> Result<Option<Invoice>, AppError>;

    /// Newest invoice date first.
    async fn list_invoices(
        &self,
        user_id: Uuid,
        status: Option<PaymentStatus>,
    ) -> Result<Vec<Invoice>, AppError>;

    /// Paid invoices, most recently paid first.
    async fn list_paid_invoices(
        &self,
        user_id: Uuid,
        filter: &PaymentHistoryFilter,
    ) -> Result<Vec<Invoice>, AppError>;

    async fn count_invoices(&self) -> Result<i64, AppError>;

    // Activation

    /// Write subscription, invoice and optional balance all-or-nothing.
    async fn record_activation(
        &self,
        records: &ActivationRecords,
    ) -> Result<ActivationRecords, AppError>;

    // Payment methods

    /// Insert a method. When `is_default` is set, other defaults for the user are cleared first.
    async fn insert_payment_method(&self, method: &PaymentMethod)
        -> Result<PaymentMethod, AppError>;

    async fn get_payment_method(&self, payment_method_id: Uuid)
        -> Result<Option<PaymentMethod>, AppError>;

    async fn find_payment_method_by_external_id(
        &self,
        user_id: Uuid,
        external_payment_method_id: &str,
    ) -> Result<Option<PaymentMethod>, AppError>;

    /// Default first, then newest first.
    async fn list_payment_methods(&self, user_id: Uuid) -> Result<Vec<PaymentMethod>, AppError>;

    async fn default_payment_method(&self, user_id: Uuid)
        -> Result<Option<PaymentMethod>, AppError>;

    /// Clear the user's defaults, then flag `payment_method_id`.
    async fn set_default_payment_method(
        &self,
        user_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError>;

    async fn delete_payment_method(&self, payment_method_id: Uuid) -> Result<bool, AppError>;

    // Notifications

    async fn insert_notification(&self, notification: &Notification)
        -> Result<Notification, AppError>;

    /// Identical notification created at or after `since`.
    async fn find_recent_notification(
        &self,
        notification: &NewNotification,
        since: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError>;

    async fn list_notifications(
        &self,
        user_id: Uuid,
        limit: i64,
        unread_only: bool,
    ) -> Result<Vec<Notification>, AppError>;

    async fn count_unread_notifications(&self, user_id: Uuid) -> Result<i64, AppError>;

    async fn mark_notification_read(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> Result<bool, AppError>;

    async fn mark_all_notifications_read(&self, user_id: Uuid) -> Result<u64, AppError>;

    // Time logs

    /// Insert `time_log` and, when `balance_id` is set, add its minutes to that balance in
    /// one all-or-nothing write.
    async fn record_time_log(
        &self,
        time_log: &TimeLog,
        balance_id: Option<Uuid>,
        within_allowance: bool,
    ) -> Result<TimeLogWrite, AppError>;

    async fn usage_by_project(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProjectUsage>, AppError>;
}
