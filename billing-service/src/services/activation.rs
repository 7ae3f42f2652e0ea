//! Billing orchestrator: paid activation, invoice payment, renewal and extra-hour purchases.
//!
//! Activation charges the customer's saved payment method first and then writes the
//! subscription, its first (already paid) invoice and the opening hours balance in one
//! store transaction. If that write fails after the charge went through, the charge is
//! refunded before the error is returned.

use crate::error::BillingError;
use crate::models::{
    BillingInterval, Customer, Invoice, PaymentDetails, PaymentMethod, PaymentStatus, PlanCatalog,
    SubscriptionPlan, SubscriptionStatus, TransactionType,
};
use crate::services::clock::Clock;
use crate::services::gateway::{ChargeOutcome, ChargeRequest, PaymentGateway};
use crate::services::hours::new_balance;
use crate::services::invoices::{next_invoice_number, InvoiceDraft, InvoiceGenerator};
use crate::services::metrics::{record_activation, record_charge_amount, record_error};
use crate::services::store::{ActivationRecords, BillingStore};
use crate::services::subscriptions::{new_subscription, SubscriptionManager};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Progress of one activation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationStage {
    PricingResolved,
    PaymentCharged,
    SubscriptionCreated,
    InvoiceRecorded,
    BalanceInitialized,
    Done,
}

impl ActivationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationStage::PricingResolved => "pricing_resolved",
            ActivationStage::PaymentCharged => "payment_charged",
            ActivationStage::SubscriptionCreated => "subscription_created",
            ActivationStage::InvoiceRecorded => "invoice_recorded",
            ActivationStage::BalanceInitialized => "balance_initialized",
            ActivationStage::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivationResult {
    pub subscription_id: Uuid,
    pub invoice_id: Uuid,
    pub balance_id: Option<Uuid>,
    pub charge_id: Option<String>,
}

/// Amount and allowance an activation will bill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPricing {
    pub plan: SubscriptionPlan,
    pub price_amount: i64,
    pub monthly_hours: i32,
}

/// Resolve what an activation bills. A custom price always means no metered hours.
pub fn resolve_pricing(
    catalog: &PlanCatalog,
    plan_name: &str,
    custom_price_amount: Option<i64>,
) -> Result<ResolvedPricing, BillingError> {
    let definition = catalog.plan_config(plan_name)?;

    if let Some(price) = custom_price_amount {
        if price <= 0 {
            return Err(BillingError::Validation(
                "custom_price_amount must be positive".to_string(),
            ));
        }
        return Ok(ResolvedPricing {
            plan: definition.plan,
            price_amount: price,
            monthly_hours: 0,
        });
    }

    if definition.requires_custom_price {
        return Err(BillingError::EnterpriseRequiresCustomPrice);
    }
    let price_amount = definition.price_for(BillingInterval::Monthly);
    if price_amount <= 0 {
        return Err(BillingError::Validation(format!(
            "{} plan requires a custom price",
            definition.plan.as_str().to_uppercase()
        )));
    }

    Ok(ResolvedPricing {
        plan: definition.plan,
        price_amount,
        monthly_hours: definition.monthly_hours,
    })
}

/// Turn a charge outcome into success or the typed payment error.
fn check_charge(outcome: &ChargeOutcome) -> Result<(), BillingError> {
    if outcome.status.is_accepted() {
        Ok(())
    } else if outcome.status.requires_customer() {
        Err(BillingError::PaymentRequiresAuthentication)
    } else {
        Err(BillingError::PaymentFailed(outcome.status.as_str().to_string()))
    }
}

fn external_method_id(method: &PaymentMethod) -> Result<String, BillingError> {
    method
        .external_payment_method_id
        .clone()
        .ok_or(BillingError::NoPaymentMethod)
}

fn external_customer_id(customer: &Customer) -> Result<String, BillingError> {
    customer
        .external_customer_id
        .clone()
        .ok_or(BillingError::NoCustomerReference)
}

pub struct BillingOrchestrator {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<PlanCatalog>,
    clock: Arc<dyn Clock>,
    subscriptions: Arc<SubscriptionManager>,
    invoices: Arc<InvoiceGenerator>,
    currency: String,
    extra_hour_price_minor_units: i64,
}

impl BillingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<PlanCatalog>,
        clock: Arc<dyn Clock>,
        subscriptions: Arc<SubscriptionManager>,
        invoices: Arc<InvoiceGenerator>,
        currency: impl Into<String>,
        extra_hour_price_minor_units: i64,
    ) -> Self {
        Self {
            store,
            gateway,
            catalog,
            clock,
            subscriptions,
            invoices,
            currency: currency.into(),
            extra_hour_price_minor_units,
        }
    }

    async fn require_customer(&self, user_id: Uuid) -> Result<Customer, BillingError> {
        self.store
            .get_customer(user_id)
            .await?
            .ok_or(BillingError::UserNotFound)
    }

    /// Charge the user's default payment method and start a paid subscription.
    #[instrument(skip(self), fields(stage = tracing::field::Empty))]
    pub async fn activate_subscription(
        &self,
        user_id: Uuid,
        plan_name: &str,
        custom_price_amount: Option<i64>,
    ) -> Result<ActivationResult, BillingError> {
        let customer = self.require_customer(user_id).await?;
        let customer_ref = external_customer_id(&customer)?;
        let payment_method = self
            .store
            .default_payment_method(user_id)
            .await?
            .ok_or(BillingError::NoPaymentMethod)?;
        let method_ref = external_method_id(&payment_method)?;

        let pricing = resolve_pricing(&self.catalog, plan_name, custom_price_amount)?;
        let plan = pricing.plan.as_str();
        self.stage(ActivationStage::PricingResolved);
        tracing::info!(
            user_id = %user_id,
            plan = plan,
            price_amount = pricing.price_amount,
            monthly_hours = pricing.monthly_hours,
            "Activating subscription"
        );

        if self.store.find_active_subscription(user_id).await?.is_some() {
            record_activation(plan, "rejected");
            return Err(BillingError::SubscriptionAlreadyActive);
        }

        let now = self.clock.now();
        let plan_label = plan.to_uppercase();
        let outcome = self
            .gateway
            .charge_off_session(&ChargeRequest {
                customer_id: customer_ref,
                payment_method_id: method_ref,
                amount_minor_units: pricing.price_amount,
                currency: self.currency.clone(),
                description: Some(format!("{} Plan - First Month", plan_label)),
                idempotency_key: Some(format!(
                    "activation-{}-{}-{}",
                    user_id,
                    plan,
                    now.timestamp_millis()
                )),
            })
            .await
            .map_err(|e| {
                record_activation(plan, "gateway_error");
                BillingError::Gateway(e.to_string())
            })?;

        if let Err(e) = check_charge(&outcome) {
            record_activation(plan, "payment_failed");
            tracing::warn!(
                user_id = %user_id,
                status = %outcome.status.as_str(),
                "Activation charge not completed"
            );
            return Err(e);
        }
        self.stage(ActivationStage::PaymentCharged);
        record_charge_amount(
            &self.currency,
            TransactionType::SubscriptionRenewal.as_str(),
            pricing.price_amount,
        );

        let subscription = new_subscription(
            user_id,
            pricing.plan,
            BillingInterval::Monthly,
            pricing.price_amount,
            pricing.monthly_hours,
            &self.currency,
            now,
        );
        let mut invoice = InvoiceDraft {
            user_id,
            subscription_id: Some(subscription.subscription_id),
            transaction_type: TransactionType::SubscriptionRenewal,
            description: Some(format!("{} Plan - First Month", plan_label)),
            amount: pricing.price_amount,
            hours_purchased: None,
            currency: self.currency.clone(),
            due_date: now,
            payment_method_id: Some(payment_method.payment_method_id),
        }
        .into_invoice(next_invoice_number(self.store.as_ref(), now).await?, now);
        invoice.status = PaymentStatus::Paid.as_str().to_string();
        invoice.paid_at = Some(now);
        invoice.external_payment_reference_id = outcome.charge_id.clone();

        let balance = (pricing.monthly_hours > 0).then(|| {
            new_balance(
                user_id,
                Some(subscription.subscription_id),
                (subscription.current_period_start, subscription.current_period_end),
                pricing.monthly_hours,
                Decimal::ZERO,
                now,
            )
        });

        let records = ActivationRecords {
            subscription,
            invoice,
            balance,
        };
        let saved = match self.store.record_activation(&records).await {
            Ok(saved) => saved,
            Err(e) => {
                record_activation(plan, "write_failed");
                record_error("activation_write_failed", "activate_subscription");
                tracing::error!(
                    user_id = %user_id,
                    charge_id = outcome.charge_id.as_deref().unwrap_or("none"),
                    error = %e,
                    "Charge succeeded but activation records could not be written"
                );
                self.refund_charge(&outcome).await;
                return Err(e.into());
            }
        };

        self.stage(ActivationStage::SubscriptionCreated);
        self.stage(ActivationStage::InvoiceRecorded);
        if saved.balance.is_some() {
            self.stage(ActivationStage::BalanceInitialized);
        }
        self.stage(ActivationStage::Done);
        record_activation(plan, "activated");
        tracing::info!(
            user_id = %user_id,
            subscription_id = %saved.subscription.subscription_id,
            invoice_id = %saved.invoice.invoice_id,
            "Subscription activated"
        );

        Ok(ActivationResult {
            subscription_id: saved.subscription.subscription_id,
            invoice_id: saved.invoice.invoice_id,
            balance_id: saved.balance.map(|b| b.balance_id),
            charge_id: outcome.charge_id,
        })
    }

    fn stage(&self, stage: ActivationStage) {
        tracing::Span::current().record("stage", stage.as_str());
        tracing::debug!(stage = stage.as_str(), "Activation stage reached");
    }

    async fn refund_charge(&self, outcome: &ChargeOutcome) {
        let Some(charge_id) = outcome.charge_id.as_deref() else {
            tracing::error!("No charge reference to refund; manual reconciliation required");
            return;
        };
        let key = format!("refund-{}", charge_id);
        match self.gateway.refund_charge(charge_id, Some(&key)).await {
            Ok(refund) => tracing::warn!(
                charge_id = %charge_id,
                refund_id = %refund.refund_id,
                status = %refund.status,
                "Activation charge refunded"
            ),
            Err(e) => {
                record_error("refund_failed", "activate_subscription");
                tracing::error!(
                    charge_id = %charge_id,
                    error = %e,
                    "Refund of activation charge failed; manual reconciliation required"
                );
            }
        }
    }

    /// Charge an outstanding invoice off-session with its payment method, falling back
    /// to the user's default.
    #[instrument(skip(self))]
    pub async fn pay_invoice(&self, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        let invoice = self.invoices.get_invoice_by_id(invoice_id, None).await?;
        match invoice.status() {
            PaymentStatus::Paid => return Err(BillingError::AlreadyPaid),
            PaymentStatus::Cancelled => {
                return Err(BillingError::InvalidTransition(
                    "Cancelled invoices cannot be paid".to_string(),
                ))
            }
            PaymentStatus::Unpaid | PaymentStatus::Failed => {}
        }

        let customer = self.require_customer(invoice.user_id).await?;
        let customer_ref = external_customer_id(&customer)?;

        let attached = match invoice.payment_method_id {
            Some(id) => self
                .store
                .get_payment_method(id)
                .await?
                .filter(|m| m.user_id == invoice.user_id),
            None => None,
        };
        let payment_method = match attached {
            Some(method) => method,
            None => self
                .store
                .default_payment_method(invoice.user_id)
                .await?
                .ok_or(BillingError::NoPaymentMethod)?,
        };
        let method_ref = external_method_id(&payment_method)?;

        let outcome = self
            .gateway
            .charge_off_session(&ChargeRequest {
                customer_id: customer_ref,
                payment_method_id: method_ref,
                amount_minor_units: invoice.total,
                currency: invoice.currency.clone(),
                description: invoice
                    .description
                    .clone()
                    .or_else(|| Some(invoice.invoice_number.clone())),
                // A retry after a failure carries a new key because the failure bumps updated_utc.
                idempotency_key: Some(format!(
                    "invoice-{}-{}",
                    invoice.invoice_id,
                    invoice.updated_utc.timestamp_millis()
                )),
            })
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))?;

        if let Err(e) = check_charge(&outcome) {
            tracing::warn!(
                invoice_id = %invoice_id,
                status = %outcome.status.as_str(),
                "Invoice charge not completed"
            );
            let reason = match &e {
                BillingError::PaymentRequiresAuthentication => {
                    "Payment requires customer authentication".to_string()
                }
                _ => format!("Payment {}", outcome.status.as_str()),
            };
            self.invoices.mark_as_failed(invoice_id, Some(reason)).await?;
            return Err(e);
        }

        record_charge_amount(&invoice.currency, &invoice.transaction_type, invoice.total);
        self.invoices
            .mark_as_paid(
                invoice_id,
                PaymentDetails {
                    external_payment_reference_id: outcome.charge_id,
                    paid_at: None,
                    payment_method_id: Some(payment_method.payment_method_id),
                },
            )
            .await
    }

    /// Invoice the subscription's next period and charge it immediately.
    #[instrument(skip(self))]
    pub async fn renew_subscription(&self, subscription_id: Uuid) -> Result<Invoice, BillingError> {
        let subscription = self
            .subscriptions
            .get_subscription_by_id(subscription_id)
            .await?;
        if subscription.status() == SubscriptionStatus::Cancelled {
            return Err(BillingError::InvalidTransition(
                "Cancelled subscriptions cannot be renewed".to_string(),
            ));
        }

        let invoice = self
            .invoices
            .create_subscription_invoice(subscription_id)
            .await?;
        self.pay_invoice(invoice.invoice_id).await
    }

    /// Raise an UNPAID invoice for extra hours at the configured per-hour price.
    #[instrument(skip(self))]
    pub async fn purchase_extra_hours(
        &self,
        user_id: Uuid,
        hours: i32,
        payment_method_id: Option<Uuid>,
    ) -> Result<Invoice, BillingError> {
        self.invoices
            .create_extra_hours_invoice(
                user_id,
                hours,
                self.extra_hour_price_minor_units,
                payment_method_id,
            )
            .await
    }
}
