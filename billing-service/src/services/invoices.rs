//! Invoice generation, settlement and reporting.

use crate::error::BillingError;
use crate::models::{
    to_major_units, BillingSummary, Invoice, InvoiceDocument, InvoiceLine, InvoiceParty,
    InvoiceStatusChange, NewNotification, NotificationType, PaymentDetails, PaymentHistoryFilter,
    PaymentStatus, TransactionType,
};
use crate::services::clock::Clock;
use crate::services::hours::HoursLedger;
use crate::services::metrics::{record_error, record_invoice_operation};
use crate::services::notifications::{emit, NotificationEmitter};
use crate::services::store::BillingStore;
use crate::services::subscriptions::SubscriptionManager;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

const MAX_NUMBER_ATTEMPTS: u32 = 3;
const RECENT_INVOICES: usize = 5;

/// `INV-{epoch millis}-{sequence}`, the sequence being the invoice count plus one,
/// zero-padded to three digits.
pub(crate) async fn next_invoice_number(
    store: &dyn BillingStore,
    now: DateTime<Utc>,
) -> Result<String, AppError> {
    let count = store.count_invoices().await?;
    Ok(format!("INV-{}-{:03}", now.timestamp_millis(), count + 1))
}

/// Fields of a new invoice; the number is assigned at insert time.
pub(crate) struct InvoiceDraft {
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub transaction_type: TransactionType,
    pub description: Option<String>,
    pub amount: i64,
    pub hours_purchased: Option<i32>,
    pub currency: String,
    pub due_date: DateTime<Utc>,
    pub payment_method_id: Option<Uuid>,
}

impl InvoiceDraft {
    pub fn into_invoice(self, invoice_number: String, now: DateTime<Utc>) -> Invoice {
        Invoice {
            invoice_id: Uuid::new_v4(),
            invoice_number,
            user_id: self.user_id,
            subscription_id: self.subscription_id,
            transaction_type: self.transaction_type.as_str().to_string(),
            description: self.description,
            subtotal: self.amount,
            tax: 0,
            total: self.amount,
            hours_purchased: self.hours_purchased,
            currency: self.currency,
            status: PaymentStatus::Unpaid.as_str().to_string(),
            invoice_date: now,
            due_date: self.due_date,
            paid_at: None,
            payment_method_id: self.payment_method_id,
            external_payment_reference_id: None,
            created_utc: now,
            updated_utc: now,
        }
    }
}

fn check_owner(invoice: &Invoice, owner_user_id: Option<Uuid>) -> Result<(), BillingError> {
    match owner_user_id {
        Some(owner) if owner != invoice.user_id => Err(BillingError::Unauthorized),
        _ => Ok(()),
    }
}

fn sum_totals(invoices: &[Invoice], status: PaymentStatus) -> i64 {
    invoices
        .iter()
        .filter(|i| i.status() == status)
        .map(|i| i.total)
        .sum()
}

pub struct InvoiceGenerator {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn NotificationEmitter>,
    subscriptions: Arc<SubscriptionManager>,
    hours: Arc<HoursLedger>,
    currency: String,
}

impl InvoiceGenerator {
    pub fn new(
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn NotificationEmitter>,
        subscriptions: Arc<SubscriptionManager>,
        hours: Arc<HoursLedger>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            subscriptions,
            hours,
            currency: currency.into(),
        }
    }

    async fn insert_numbered(&self, draft: InvoiceDraft) -> Result<Invoice, BillingError> {
        let now = self.clock.now();
        let mut invoice =
            draft.into_invoice(next_invoice_number(self.store.as_ref(), now).await?, now);
        let mut attempt = 1;
        loop {
            match self.store.insert_invoice(&invoice).await {
                Ok(saved) => return Ok(saved),
                Err(AppError::Conflict(_)) if attempt < MAX_NUMBER_ATTEMPTS => {
                    tracing::warn!(
                        invoice_number = %invoice.invoice_number,
                        attempt = attempt,
                        "Invoice number taken, retrying"
                    );
                    attempt += 1;
                    invoice.invoice_number =
                        next_invoice_number(self.store.as_ref(), self.clock.now()).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn require_invoice(&self, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        self.store
            .get_invoice(invoice_id)
            .await?
            .ok_or(BillingError::InvoiceNotFound)
    }

    async fn apply_change(
        &self,
        invoice_id: Uuid,
        change: &InvoiceStatusChange,
    ) -> Result<Invoice, BillingError> {
        self.store
            .update_invoice_status(invoice_id, change)
            .await?
            .ok_or(BillingError::InvoiceNotFound)
    }

    /// Bill a subscription's next period. The invoice is due on the subscription's next
    /// billing date and is tied to the user's default payment method when one exists.
    #[instrument(skip(self))]
    pub async fn create_subscription_invoice(
        &self,
        subscription_id: Uuid,
    ) -> Result<Invoice, BillingError> {
        let subscription = self
            .subscriptions
            .get_subscription_by_id(subscription_id)
            .await?;
        let payment_method = self
            .store
            .default_payment_method(subscription.user_id)
            .await?;

        let invoice = self
            .insert_numbered(InvoiceDraft {
                user_id: subscription.user_id,
                subscription_id: Some(subscription.subscription_id),
                transaction_type: TransactionType::SubscriptionRenewal,
                description: Some(format!(
                    "{} Plan - Monthly Subscription",
                    subscription.plan.to_uppercase()
                )),
                amount: subscription.price_amount,
                hours_purchased: None,
                currency: subscription.currency.clone(),
                due_date: subscription.next_billing_date,
                payment_method_id: payment_method.map(|m| m.payment_method_id),
            })
            .await?;

        record_invoice_operation("created", TransactionType::SubscriptionRenewal.as_str());
        tracing::info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            total = invoice.total,
            "Subscription invoice created"
        );

        emit(
            self.notifier.as_ref(),
            NewNotification::new(
                invoice.user_id,
                NotificationType::Info,
                "New Invoice Generated",
                format!(
                    "Invoice {} for ${:.2}",
                    invoice.invoice_number,
                    to_major_units(invoice.total)
                ),
            )
            .with_action(
                format!("/billing/invoices/{}", invoice.invoice_id),
                Some("View Invoice"),
            ),
        )
        .await;

        Ok(invoice)
    }

    /// Invoice a block of extra hours. `price_per_hour` is in minor units.
    #[instrument(skip(self))]
    pub async fn create_extra_hours_invoice(
        &self,
        user_id: Uuid,
        hours: i32,
        price_per_hour: i64,
        payment_method_id: Option<Uuid>,
    ) -> Result<Invoice, BillingError> {
        if hours <= 0 {
            return Err(BillingError::Validation("hours must be positive".to_string()));
        }
        if price_per_hour <= 0 {
            return Err(BillingError::Validation(
                "price_per_hour must be positive".to_string(),
            ));
        }
        if self.store.get_customer(user_id).await?.is_none() {
            return Err(BillingError::UserNotFound);
        }

        let payment_method_id = match payment_method_id {
            Some(id) => match self.store.get_payment_method(id).await? {
                Some(method) if method.user_id == user_id => Some(method.payment_method_id),
                _ => return Err(BillingError::PaymentMethodNotFound),
            },
            None => self
                .store
                .default_payment_method(user_id)
                .await?
                .map(|m| m.payment_method_id),
        };

        let amount = i64::from(hours) * price_per_hour;
        let invoice = self
            .insert_numbered(InvoiceDraft {
                user_id,
                subscription_id: None,
                transaction_type: TransactionType::AdditionalHours,
                description: Some(format!(
                    "{} extra hours @ ${:.2}/hr",
                    hours,
                    to_major_units(price_per_hour)
                )),
                amount,
                hours_purchased: Some(hours),
                currency: self.currency.clone(),
                due_date: self.clock.now(),
                payment_method_id,
            })
            .await?;

        record_invoice_operation("created", TransactionType::AdditionalHours.as_str());
        tracing::info!(
            invoice_id = %invoice.invoice_id,
            hours = hours,
            total = invoice.total,
            "Extra hours invoice created"
        );

        emit(
            self.notifier.as_ref(),
            NewNotification::new(
                user_id,
                NotificationType::Info,
                "Extra Hours Invoice",
                format!(
                    "Invoice for {} extra hours (${:.2})",
                    hours,
                    to_major_units(amount)
                ),
            )
            .with_action(
                format!("/billing/invoices/{}", invoice.invoice_id),
                Some("Pay Now"),
            ),
        )
        .await;

        Ok(invoice)
    }

    /// Settle an invoice.
    ///
    /// Renewal invoices reactivate their subscription; extra-hours invoices credit the
    /// purchased hours. Follow-up failures are logged and do not undo the payment.
    #[instrument(skip(self, details))]
    pub async fn mark_as_paid(
        &self,
        invoice_id: Uuid,
        details: PaymentDetails,
    ) -> Result<Invoice, BillingError> {
        let existing = self.require_invoice(invoice_id).await?;
        match existing.status() {
            PaymentStatus::Paid => return Err(BillingError::AlreadyPaid),
            PaymentStatus::Cancelled => {
                return Err(BillingError::InvalidTransition(
                    "Cancelled invoices cannot be paid".to_string(),
                ))
            }
            PaymentStatus::Unpaid | PaymentStatus::Failed => {}
        }

        let now = self.clock.now();
        let change = InvoiceStatusChange {
            paid_at: Some(details.paid_at.unwrap_or(now)),
            external_payment_reference_id: details.external_payment_reference_id,
            payment_method_id: details.payment_method_id,
            ..InvoiceStatusChange::to(PaymentStatus::Paid)
        };
        let invoice = self.apply_change(invoice_id, &change).await?;

        let transaction_type = invoice.transaction_type();
        record_invoice_operation("paid", transaction_type.as_str());
        tracing::info!(
            invoice_id = %invoice_id,
            total = invoice.total,
            transaction_type = %transaction_type.as_str(),
            "Invoice paid"
        );

        match (transaction_type, invoice.subscription_id, invoice.hours_purchased) {
            (TransactionType::SubscriptionRenewal, Some(subscription_id), _) => {
                if let Err(e) = self
                    .subscriptions
                    .reactivate_after_payment(subscription_id, now)
                    .await
                {
                    record_error(e.code(), "mark_as_paid");
                    tracing::error!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Invoice paid but subscription could not be reactivated"
                    );
                }
            }
            (TransactionType::AdditionalHours, _, Some(hours)) => {
                match self.hours.add_purchased_hours(invoice.user_id, hours).await {
                    Ok(_) => {}
                    Err(BillingError::NoActiveBalance) => {
                        tracing::warn!(
                            user_id = %invoice.user_id,
                            hours = hours,
                            "Extra hours paid but user has no open balance to credit"
                        );
                    }
                    Err(e) => {
                        record_error(e.code(), "mark_as_paid");
                        tracing::error!(
                            user_id = %invoice.user_id,
                            error = %e,
                            "Invoice paid but purchased hours could not be credited"
                        );
                    }
                }
            }
            _ => {}
        }

        emit(
            self.notifier.as_ref(),
            NewNotification::new(
                invoice.user_id,
                NotificationType::Success,
                "Payment Received",
                format!(
                    "Payment of ${:.2} processed successfully",
                    to_major_units(invoice.total)
                ),
            )
            .with_action(
                format!("/billing/invoices/{}", invoice.invoice_id),
                Some("View Receipt"),
            ),
        )
        .await;

        Ok(invoice)
    }

    #[instrument(skip(self))]
    pub async fn mark_as_failed(
        &self,
        invoice_id: Uuid,
        reason: Option<String>,
    ) -> Result<Invoice, BillingError> {
        let existing = self.require_invoice(invoice_id).await?;
        match existing.status() {
            PaymentStatus::Paid => return Err(BillingError::AlreadyPaid),
            PaymentStatus::Cancelled => {
                return Err(BillingError::InvalidTransition(
                    "Cancelled invoices cannot fail".to_string(),
                ))
            }
            PaymentStatus::Unpaid | PaymentStatus::Failed => {}
        }

        let description = reason.as_deref().map(|r| match &existing.description {
            Some(d) if !d.is_empty() => format!("{} | Failed: {}", d, r),
            _ => format!("Failed: {}", r),
        });
        let change = InvoiceStatusChange {
            description,
            ..InvoiceStatusChange::to(PaymentStatus::Failed)
        };
        let invoice = self.apply_change(invoice_id, &change).await?;

        record_invoice_operation("failed", invoice.transaction_type().as_str());
        tracing::warn!(
            invoice_id = %invoice_id,
            reason = reason.as_deref().unwrap_or("unspecified"),
            "Invoice payment failed"
        );

        emit(
            self.notifier.as_ref(),
            NewNotification::new(
                invoice.user_id,
                NotificationType::Error,
                "Payment Failed",
                reason.unwrap_or_else(|| "Your payment could not be processed".to_string()),
            )
            .with_action(
                format!("/billing/invoices/{}", invoice.invoice_id),
                Some("Retry Payment"),
            ),
        )
        .await;

        Ok(invoice)
    }

    #[instrument(skip(self))]
    pub async fn cancel_invoice(
        &self,
        invoice_id: Uuid,
        owner_user_id: Option<Uuid>,
    ) -> Result<Invoice, BillingError> {
        let existing = self.require_invoice(invoice_id).await?;
        check_owner(&existing, owner_user_id)?;
        if existing.status() == PaymentStatus::Paid {
            return Err(BillingError::AlreadyPaid);
        }

        let invoice = self
            .apply_change(invoice_id, &InvoiceStatusChange::to(PaymentStatus::Cancelled))
            .await?;
        record_invoice_operation("cancelled", invoice.transaction_type().as_str());
        tracing::info!(invoice_id = %invoice_id, "Invoice cancelled");
        Ok(invoice)
    }

    #[instrument(skip(self))]
    pub async fn get_invoice_by_id(
        &self,
        invoice_id: Uuid,
        owner_user_id: Option<Uuid>,
    ) -> Result<Invoice, BillingError> {
        let invoice = self.require_invoice(invoice_id).await?;
        check_owner(&invoice, owner_user_id)?;
        Ok(invoice)
    }

    /// Printable form of an invoice with a single line item.
    #[instrument(skip(self))]
    pub async fn render_invoice(
        &self,
        invoice_id: Uuid,
        owner_user_id: Option<Uuid>,
    ) -> Result<InvoiceDocument, BillingError> {
        let invoice = self.get_invoice_by_id(invoice_id, owner_user_id).await?;
        let customer = self.store.get_customer(invoice.user_id).await?;

        let subscription = match invoice.subscription_id {
            Some(id) => self.store.get_subscription(id).await?,
            None => None,
        };
        let line_description = match (invoice.transaction_type(), subscription) {
            (TransactionType::SubscriptionRenewal, Some(s)) => format!(
                "{} Plan - {} hours",
                s.plan.to_uppercase(),
                s.monthly_hours
            ),
            _ => invoice.description.clone().unwrap_or_default(),
        };

        let amount = to_major_units(invoice.total);
        Ok(InvoiceDocument {
            invoice_number: invoice.invoice_number.clone(),
            date: invoice.invoice_date,
            due_date: invoice.due_date,
            amount,
            currency: invoice.currency.to_uppercase(),
            status: invoice.status(),
            client: InvoiceParty {
                name: customer
                    .as_ref()
                    .and_then(|c| c.full_name.clone())
                    .unwrap_or_else(|| "N/A".to_string()),
                email: customer
                    .map(|c| c.email)
                    .unwrap_or_else(|| "N/A".to_string()),
            },
            items: vec![InvoiceLine {
                description: line_description,
                amount,
            }],
        })
    }

    #[instrument(skip(self))]
    pub async fn get_client_invoices(
        &self,
        user_id: Uuid,
        status: Option<PaymentStatus>,
    ) -> Result<Vec<Invoice>, BillingError> {
        Ok(self.store.list_invoices(user_id, status).await?)
    }

    /// Paid and pending totals in major units, failed count and the five newest invoices.
    #[instrument(skip(self))]
    pub async fn get_billing_summary(&self, user_id: Uuid) -> Result<BillingSummary, BillingError> {
        let invoices = self.store.list_invoices(user_id, None).await?;

        let total_paid = to_major_units(sum_totals(&invoices, PaymentStatus::Paid));
        let total_pending = to_major_units(sum_totals(&invoices, PaymentStatus::Unpaid));
        let total_failed = invoices
            .iter()
            .filter(|i| i.status() == PaymentStatus::Failed)
            .count() as i64;

        Ok(BillingSummary {
            total_paid,
            total_pending,
            total_failed,
            recent_invoices: invoices.into_iter().take(RECENT_INVOICES).collect(),
        })
    }

    #[instrument(skip(self))]
    pub async fn get_payment_history(
        &self,
        user_id: Uuid,
        filter: PaymentHistoryFilter,
    ) -> Result<Vec<Invoice>, BillingError> {
        if let (Some(start), Some(end)) = (filter.start_date, filter.end_date) {
            if end < start {
                return Err(BillingError::Validation(
                    "end date must not precede start date".to_string(),
                ));
            }
        }
        Ok(self.store.list_paid_invoices(user_id, &filter).await?)
    }
}
