//! In-process `BillingStore` used by tests and database-less deployments.

use crate::models::{
    minutes_to_hours, Customer, HoursBalance, Invoice, InvoiceStatusChange, NewNotification,
    Notification, PaymentHistoryFilter, PaymentMethod, PaymentStatus, ProjectUsage, Subscription,
    SubscriptionStatus, TimeLog,
};
use crate::services::store::{ActivationRecords, BillingStore, TimeLogWrite, UsageWrite};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    customers: HashMap<Uuid, Customer>,
    subscriptions: Vec<Subscription>,
    balances: Vec<HoursBalance>,
    invoices: Vec<Invoice>,
    payment_methods: Vec<PaymentMethod>,
    notifications: Vec<Notification>,
    time_logs: Vec<TimeLog>,
}

impl Tables {
    fn check_customer(&self, user_id: Uuid) -> Result<(), AppError> {
        if !self.customers.contains_key(&user_id) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "customer {} does not exist",
                user_id
            )));
        }
        Ok(())
    }

    /// Apply a usage increment under the table lock.
    fn add_minutes_used(
        &mut self,
        balance_id: Uuid,
        minutes: i64,
        within_allowance: bool,
    ) -> UsageWrite {
        let Some(balance) = self.balances.iter_mut().find(|b| b.balance_id == balance_id) else {
            return UsageWrite::BalanceMissing;
        };
        if within_allowance && Decimal::from(minutes) > balance.minutes_remaining() {
            return UsageWrite::OverAllowance;
        }
        balance.minutes_used += minutes;
        balance.updated_utc = Utc::now();
        UsageWrite::Applied(balance.clone())
    }

    fn check_subscription(&self, subscription: &Subscription) -> Result<(), AppError> {
        let active = SubscriptionStatus::Active.as_str();
        if subscription.status == active
            && self.subscriptions.iter().any(|s| {
                s.user_id == subscription.user_id
                    && s.status == active
                    && s.subscription_id != subscription.subscription_id
            })
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "subscriptions_one_active_per_user"
            )));
        }
        Ok(())
    }

    fn check_invoice(&self, invoice: &Invoice) -> Result<(), AppError> {
        if self
            .invoices
            .iter()
            .any(|i| i.invoice_number == invoice.invoice_number)
        {
            return Err(AppError::Conflict(anyhow::anyhow!("invoices_invoice_number_key")));
        }
        Ok(())
    }

    fn check_balance(&self, balance: &HoursBalance) -> Result<(), AppError> {
        if self
            .balances
            .iter()
            .any(|b| b.user_id == balance.user_id && b.period_start == balance.period_start)
        {
            return Err(AppError::Conflict(anyhow::anyhow!("hours_balances_user_period")));
        }
        Ok(())
    }
}

/// Mutex-guarded tables with the same uniqueness and customer reference rules as the SQL
/// schema.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn get_customer(&self, user_id: Uuid) -> Result<Option<Customer>, AppError> {
        Ok(self.tables.lock().await.customers.get(&user_id).cloned())
    }

    async fn upsert_customer(&self, customer: &Customer) -> Result<Customer, AppError> {
        let mut tables = self.tables.lock().await;
        let saved = match tables.customers.get(&customer.user_id) {
            Some(existing) => Customer {
                email: customer.email.clone(),
                full_name: customer.full_name.clone(),
                external_customer_id: customer
                    .external_customer_id
                    .clone()
                    .or_else(|| existing.external_customer_id.clone()),
                ..existing.clone()
            },
            None => customer.clone(),
        };
        tables.customers.insert(saved.user_id, saved.clone());
        Ok(saved)
    }

    async fn set_external_customer_id(
        &self,
        user_id: Uuid,
        external_customer_id: &str,
    ) -> Result<(), AppError> {
        let mut tables = self.tables.lock().await;
        let customer = tables
            .customers
            .get_mut(&user_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Customer not found")))?;
        customer.external_customer_id = Some(external_customer_id.to_string());
        Ok(())
    }

    async fn insert_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, AppError> {
        let mut tables = self.tables.lock().await;
        tables.check_customer(subscription.user_id)?;
        tables.check_subscription(subscription)?;
        tables.subscriptions.push(subscription.clone());
        Ok(subscription.clone())
    }

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .subscriptions
            .iter()
            .find(|s| s.subscription_id == subscription_id)
            .cloned())
    }

    async fn find_active_subscription(
        &self,
        user_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id && s.is_active())
            .max_by_key(|s| s.created_utc)
            .cloned())
    }

    async fn list_subscriptions(
        &self,
        user_id: Uuid,
        status: Option<SubscriptionStatus>,
    ) -> Result<Vec<Subscription>, AppError> {
        let tables = self.tables.lock().await;
        let mut subscriptions: Vec<Subscription> = tables
            .subscriptions
            .iter()
            .rev()
            .filter(|s| s.user_id == user_id && status.map_or(true, |st| s.status() == st))
            .cloned()
            .collect();
        subscriptions.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        Ok(subscriptions)
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, AppError> {
        let mut tables = self.tables.lock().await;
        tables.check_subscription(subscription)?;
        let existing = tables
            .subscriptions
            .iter_mut()
            .find(|s| s.subscription_id == subscription.subscription_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;
        // Identity, interval and currency are fixed at creation.
        existing.plan = subscription.plan.clone();
        existing.status = subscription.status.clone();
        existing.price_amount = subscription.price_amount;
        existing.monthly_hours = subscription.monthly_hours;
        existing.current_period_start = subscription.current_period_start;
        existing.current_period_end = subscription.current_period_end;
        existing.next_billing_date = subscription.next_billing_date;
        existing.cancelled_at = subscription.cancelled_at;
        existing.updated_utc = subscription.updated_utc;
        Ok(existing.clone())
    }

    async fn insert_balance(&self, balance: &HoursBalance) -> Result<HoursBalance, AppError> {
        let mut tables = self.tables.lock().await;
        tables.check_customer(balance.user_id)?;
        tables.check_balance(balance)?;
        tables.balances.push(balance.clone());
        Ok(balance.clone())
    }

    async fn get_balance(&self, balance_id: Uuid) -> Result<Option<HoursBalance>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .balances
            .iter()
            .find(|b| b.balance_id == balance_id)
            .cloned())
    }

    async fn find_balance_covering(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<HoursBalance>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .balances
            .iter()
            .filter(|b| b.user_id == user_id && b.covers(at))
            .max_by_key(|b| b.period_start)
            .cloned())
    }

    async fn find_open_balance(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<HoursBalance>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .balances
            .iter()
            .filter(|b| b.user_id == user_id && b.period_end >= at)
            .min_by_key(|b| b.period_start)
            .cloned())
    }

    async fn find_balance_for_period(
        &self,
        user_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> Result<Option<HoursBalance>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .balances
            .iter()
            .find(|b| b.user_id == user_id && b.period_start == period_start)
            .cloned())
    }

    async fn list_balances(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<HoursBalance>, AppError> {
        let tables = self.tables.lock().await;
        let mut balances: Vec<HoursBalance> = tables
            .balances
            .iter()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        balances.sort_by(|a, b| b.period_start.cmp(&a.period_start));
        balances.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(balances)
    }

    async fn add_minutes_used(
        &self,
        balance_id: Uuid,
        minutes: i64,
        within_allowance: bool,
    ) -> Result<UsageWrite, AppError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.add_minutes_used(balance_id, minutes, within_allowance))
    }

    async fn add_extra_hours(
        &self,
        balance_id: Uuid,
        hours: i32,
    ) -> Result<Option<HoursBalance>, AppError> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .balances
            .iter_mut()
            .find(|b| b.balance_id == balance_id)
            .map(|b| {
                b.extra_purchased_hours += hours;
                b.updated_utc = Utc::now();
                b.clone()
            }))
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError> {
        let mut tables = self.tables.lock().await;
        tables.check_customer(invoice.user_id)?;
        tables.check_invoice(invoice)?;
        tables.invoices.push(invoice.clone());
        Ok(invoice.clone())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .invoices
            .iter()
            .find(|i| i.invoice_id == invoice_id)
            .cloned())
    }

    async fn update_invoice_status(
        &self,
        invoice_id: Uuid,
        change: &InvoiceStatusChange,
    ) -> Result<Option<Invoice>, AppError> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .invoices
            .iter_mut()
            .find(|i| i.invoice_id == invoice_id)
            .map(|invoice| {
                invoice.status = change.status.as_str().to_string();
                if change.paid_at.is_some() {
                    invoice.paid_at = change.paid_at;
                }
                if change.payment_method_id.is_some() {
                    invoice.payment_method_id = change.payment_method_id;
                }
                if change.external_payment_reference_id.is_some() {
                    invoice.external_payment_reference_id =
                        change.external_payment_reference_id.clone();
                }
                if change.description.is_some() {
                    invoice.description = change.description.clone();
                }
                invoice.updated_utc = Utc::now();
                invoice.clone()
            }))
    }

    async fn list_invoices(
        &self,
        user_id: Uuid,
        status: Option<PaymentStatus>,
    ) -> Result<Vec<Invoice>, AppError> {
        let tables = self.tables.lock().await;
        let mut invoices: Vec<Invoice> = tables
            .invoices
            .iter()
            .rev()
            .filter(|i| i.user_id == user_id && status.map_or(true, |st| i.status() == st))
            .cloned()
            .collect();
        invoices.sort_by(|a, b| b.invoice_date.cmp(&a.invoice_date));
        Ok(invoices)
    }

    async fn list_paid_invoices(
        &self,
        user_id: Uuid,
        filter: &PaymentHistoryFilter,
    ) -> Result<Vec<Invoice>, AppError> {
        let tables = self.tables.lock().await;
        let mut invoices: Vec<Invoice> = tables
            .invoices
            .iter()
            .rev()
            .filter(|i| i.user_id == user_id && i.status() == PaymentStatus::Paid)
            .filter(|i| match (filter.start_date, i.paid_at) {
                (Some(start), Some(paid)) => paid >= start,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .filter(|i| match (filter.end_date, i.paid_at) {
                (Some(end), Some(paid)) => paid <= end,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .cloned()
            .collect();
        invoices.sort_by(|a, b| b.paid_at.cmp(&a.paid_at));
        invoices.truncate(usize::try_from(filter.limit.unwrap_or(50)).unwrap_or(0));
        Ok(invoices)
    }

    async fn count_invoices(&self) -> Result<i64, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables.invoices.len() as i64)
    }

    async fn record_activation(
        &self,
        records: &ActivationRecords,
    ) -> Result<ActivationRecords, AppError> {
        let mut tables = self.tables.lock().await;
        // Validate everything before touching any table.
        tables.check_customer(records.subscription.user_id)?;
        tables.check_subscription(&records.subscription)?;
        tables.check_invoice(&records.invoice)?;
        if let Some(balance) = &records.balance {
            tables.check_balance(balance)?;
        }

        tables.subscriptions.push(records.subscription.clone());
        tables.invoices.push(records.invoice.clone());
        if let Some(balance) = &records.balance {
            tables.balances.push(balance.clone());
        }
        Ok(records.clone())
    }

    async fn insert_payment_method(
        &self,
        method: &PaymentMethod,
    ) -> Result<PaymentMethod, AppError> {
        let mut tables = self.tables.lock().await;
        tables.check_customer(method.user_id)?;
        if method.external_payment_method_id.is_some()
            && tables.payment_methods.iter().any(|m| {
                m.user_id == method.user_id
                    && m.external_payment_method_id == method.external_payment_method_id
            })
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "payment_methods_external_per_user"
            )));
        }
        if method.is_default {
            for existing in tables
                .payment_methods
                .iter_mut()
                .filter(|m| m.user_id == method.user_id)
            {
                existing.is_default = false;
            }
        }
        tables.payment_methods.push(method.clone());
        Ok(method.clone())
    }

    async fn get_payment_method(
        &self,
        payment_method_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .payment_methods
            .iter()
            .find(|m| m.payment_method_id == payment_method_id)
            .cloned())
    }

    async fn find_payment_method_by_external_id(
        &self,
        user_id: Uuid,
        external_payment_method_id: &str,
    ) -> Result<Option<PaymentMethod>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .payment_methods
            .iter()
            .find(|m| {
                m.user_id == user_id
                    && m.external_payment_method_id.as_deref() == Some(external_payment_method_id)
            })
            .cloned())
    }

    async fn list_payment_methods(&self, user_id: Uuid) -> Result<Vec<PaymentMethod>, AppError> {
        let tables = self.tables.lock().await;
        let mut methods: Vec<PaymentMethod> = tables
            .payment_methods
            .iter()
            .rev()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        methods.sort_by(|a, b| {
            b.is_default
                .cmp(&a.is_default)
                .then(b.created_utc.cmp(&a.created_utc))
        });
        Ok(methods)
    }

    async fn default_payment_method(
        &self,
        user_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .payment_methods
            .iter()
            .find(|m| m.user_id == user_id && m.is_default)
            .cloned())
    }

    async fn set_default_payment_method(
        &self,
        user_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        let mut tables = self.tables.lock().await;
        if !tables
            .payment_methods
            .iter()
            .any(|m| m.user_id == user_id && m.payment_method_id == payment_method_id)
        {
            return Ok(None);
        }
        let mut updated = None;
        for method in tables
            .payment_methods
            .iter_mut()
            .filter(|m| m.user_id == user_id)
        {
            method.is_default = method.payment_method_id == payment_method_id;
            if method.is_default {
                updated = Some(method.clone());
            }
        }
        Ok(updated)
    }

    async fn delete_payment_method(&self, payment_method_id: Uuid) -> Result<bool, AppError> {
        let mut tables = self.tables.lock().await;
        let before = tables.payment_methods.len();
        tables
            .payment_methods
            .retain(|m| m.payment_method_id != payment_method_id);
        Ok(tables.payment_methods.len() < before)
    }

    async fn insert_notification(
        &self,
        notification: &Notification,
    ) -> Result<Notification, AppError> {
        let mut tables = self.tables.lock().await;
        tables.notifications.push(notification.clone());
        Ok(notification.clone())
    }

    async fn find_recent_notification(
        &self,
        notification: &NewNotification,
        since: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .notifications
            .iter()
            .rev()
            .find(|n| {
                n.user_id == notification.user_id
                    && n.notification_type == notification.notification_type.as_str()
                    && n.title == notification.title
                    && n.message == notification.message
                    && n.created_utc >= since
            })
            .cloned())
    }

    async fn list_notifications(
        &self,
        user_id: Uuid,
        limit: i64,
        unread_only: bool,
    ) -> Result<Vec<Notification>, AppError> {
        let tables = self.tables.lock().await;
        let mut notifications: Vec<Notification> = tables
            .notifications
            .iter()
            .rev()
            .filter(|n| n.user_id == user_id && (!unread_only || !n.is_read))
            .cloned()
            .collect();
        notifications.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        notifications.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(notifications)
    }

    async fn count_unread_notifications(&self, user_id: Uuid) -> Result<i64, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && !n.is_read)
            .count() as i64)
    }

    async fn mark_notification_read(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> Result<bool, AppError> {
        let mut tables = self.tables.lock().await;
        match tables
            .notifications
            .iter_mut()
            .find(|n| n.notification_id == notification_id && n.user_id == user_id)
        {
            Some(notification) => {
                notification.is_read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_all_notifications_read(&self, user_id: Uuid) -> Result<u64, AppError> {
        let mut tables = self.tables.lock().await;
        let mut updated = 0;
        for notification in tables
            .notifications
            .iter_mut()
            .filter(|n| n.user_id == user_id && !n.is_read)
        {
            notification.is_read = true;
            updated += 1;
        }
        Ok(updated)
    }

    async fn record_time_log(
        &self,
        time_log: &TimeLog,
        balance_id: Option<Uuid>,
        within_allowance: bool,
    ) -> Result<TimeLogWrite, AppError> {
        let mut tables = self.tables.lock().await;
        let balance = match balance_id {
            Some(balance_id) => match tables.add_minutes_used(
                balance_id,
                i64::from(time_log.duration_minutes),
                within_allowance,
            ) {
                UsageWrite::Applied(balance) => Some(balance),
                UsageWrite::BalanceMissing => None,
                UsageWrite::OverAllowance => return Ok(TimeLogWrite::OverAllowance),
            },
            None => None,
        };
        tables.time_logs.push(time_log.clone());
        Ok(TimeLogWrite::Recorded {
            time_log: time_log.clone(),
            balance,
        })
    }

    async fn usage_by_project(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProjectUsage>, AppError> {
        let tables = self.tables.lock().await;
        let mut by_project: Vec<ProjectUsage> = Vec::new();
        for log in tables
            .time_logs
            .iter()
            .filter(|l| l.client_id == user_id && l.start_time >= start && l.start_time <= end)
        {
            match by_project.iter_mut().find(|p| p.project_id == log.project_id) {
                Some(entry) => entry.total_minutes += i64::from(log.duration_minutes),
                None => by_project.push(ProjectUsage {
                    project_id: log.project_id,
                    project_title: log.project_title.clone(),
                    total_minutes: i64::from(log.duration_minutes),
                    total_hours: Decimal::ZERO,
                }),
            }
        }
        for entry in by_project.iter_mut() {
            entry.total_hours = minutes_to_hours(entry.total_minutes);
        }
        by_project.sort_by(|a, b| b.total_minutes.cmp(&a.total_minutes));
        Ok(by_project)
    }
}
