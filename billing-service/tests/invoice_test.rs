//! Invoice generation, settlement and reporting integration tests for billing-service.

mod common;

use billing_service::error::BillingError;
use billing_service::models::{
    BillingInterval, CreateSubscription, PaymentDetails, PaymentHistoryFilter, PaymentStatus,
    SubscriptionPlan, SubscriptionStatus, TransactionType,
};
use billing_service::services::gateway::ChargeStatus;
use chrono::{Duration, Months};
use common::{test_now, TestHarness};
use rust_decimal::Decimal;
use std::str::FromStr;
use uuid::Uuid;

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

#[tokio::test]
async fn subscription_invoice_is_due_on_next_billing_date() {
    let h = TestHarness::new();
    let (user_id, method) = h.seed_client().await;
    let subscription = h
        .services
        .subscriptions
        .create_subscription(CreateSubscription {
            user_id,
            plan: SubscriptionPlan::Starter,
            billing_interval: BillingInterval::Monthly,
            price_amount: 125_000,
            monthly_hours: 200,
        })
        .await
        .unwrap();

    let invoice = h
        .services
        .invoices
        .create_subscription_invoice(subscription.subscription_id)
        .await
        .unwrap();

    assert_eq!(invoice.status(), PaymentStatus::Unpaid);
    assert_eq!(invoice.transaction_type(), TransactionType::SubscriptionRenewal);
    assert_eq!(
        invoice.description.as_deref(),
        Some("STARTER Plan - Monthly Subscription")
    );
    assert_eq!(invoice.subtotal, 125_000);
    assert_eq!(invoice.tax, 0);
    assert_eq!(invoice.total, invoice.subtotal + invoice.tax);
    assert_eq!(invoice.due_date, subscription.next_billing_date);
    assert_eq!(invoice.payment_method_id, Some(method.payment_method_id));
    assert_eq!(
        invoice.invoice_number,
        format!("INV-{}-001", test_now().timestamp_millis())
    );

    let notifications = h
        .services
        .notifications
        .list_notifications(user_id, 10, false)
        .await
        .unwrap();
    assert_eq!(notifications[0].title, "New Invoice Generated");
    assert_eq!(
        notifications[0].message,
        format!("Invoice {} for $1250.00", invoice.invoice_number)
    );
    assert_eq!(
        notifications[0].action_url,
        Some(format!("/billing/invoices/{}", invoice.invoice_id))
    );
}

#[tokio::test]
async fn invoice_numbers_are_sequential() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;

    let first = h
        .services
        .orchestrator
        .purchase_extra_hours(user_id, 1, None)
        .await
        .unwrap();
    let second = h
        .services
        .orchestrator
        .purchase_extra_hours(user_id, 2, None)
        .await
        .unwrap();

    assert!(first.invoice_number.ends_with("-001"));
    assert!(second.invoice_number.ends_with("-002"));
}

#[tokio::test]
async fn extra_hours_invoice_uses_configured_price() {
    let h = TestHarness::new();
    let (user_id, method) = h.seed_client().await;

    let invoice = h
        .services
        .orchestrator
        .purchase_extra_hours(user_id, 10, None)
        .await
        .unwrap();

    assert_eq!(invoice.transaction_type(), TransactionType::AdditionalHours);
    assert_eq!(invoice.total, 75_000);
    assert_eq!(invoice.hours_purchased, Some(10));
    assert_eq!(invoice.due_date, test_now());
    assert_eq!(
        invoice.description.as_deref(),
        Some("10 extra hours @ $75.00/hr")
    );
    assert_eq!(invoice.payment_method_id, Some(method.payment_method_id));
}

#[tokio::test]
async fn extra_hours_invoice_checks_user_and_payment_method() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    let (_, other_method) = h.seed_client().await;

    let err = h
        .services
        .orchestrator
        .purchase_extra_hours(user_id, 5, Some(other_method.payment_method_id))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::PaymentMethodNotFound));

    let err = h
        .services
        .orchestrator
        .purchase_extra_hours(Uuid::new_v4(), 5, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::UserNotFound));

    let err = h
        .services
        .orchestrator
        .purchase_extra_hours(user_id, 0, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
}

#[tokio::test]
async fn paying_extra_hours_credits_the_balance() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    h.services
        .orchestrator
        .activate_subscription(user_id, "starter", None)
        .await
        .unwrap();
    let invoice = h
        .services
        .orchestrator
        .purchase_extra_hours(user_id, 10, None)
        .await
        .unwrap();

    let paid = h
        .services
        .orchestrator
        .pay_invoice(invoice.invoice_id)
        .await
        .unwrap();

    assert_eq!(paid.status(), PaymentStatus::Paid);
    assert_eq!(paid.paid_at, Some(test_now()));
    assert!(paid.external_payment_reference_id.is_some());
    let balance = h
        .services
        .hours
        .get_current_balance(user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(balance.balance.extra_purchased_hours, 10);
    assert_eq!(balance.total_available_hours, Decimal::from(210));

    let charge = h.gateway.charges().pop().unwrap();
    assert_eq!(charge.amount_minor_units, 75_000);
    assert!(charge
        .idempotency_key
        .unwrap_or_default()
        .starts_with(&format!("invoice-{}-", invoice.invoice_id)));

    let notifications = h
        .services
        .notifications
        .list_notifications(user_id, 1, false)
        .await
        .unwrap();
    assert_eq!(notifications[0].title, "Payment Received");
    assert_eq!(
        notifications[0].message,
        "Payment of $750.00 processed successfully"
    );
}

#[tokio::test]
async fn paying_extra_hours_without_balance_still_settles() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    let invoice = h
        .services
        .orchestrator
        .purchase_extra_hours(user_id, 3, None)
        .await
        .unwrap();

    let paid = h
        .services
        .invoices
        .mark_as_paid(invoice.invoice_id, PaymentDetails::default())
        .await
        .unwrap();

    assert_eq!(paid.status(), PaymentStatus::Paid);
}

#[tokio::test]
async fn paid_is_terminal() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    let invoice = h
        .services
        .orchestrator
        .purchase_extra_hours(user_id, 1, None)
        .await
        .unwrap();
    h.services
        .invoices
        .mark_as_paid(
            invoice.invoice_id,
            PaymentDetails {
                external_payment_reference_id: Some("pi_manual".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = h
        .services
        .invoices
        .mark_as_paid(invoice.invoice_id, PaymentDetails::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::AlreadyPaid));

    let err = h
        .services
        .invoices
        .mark_as_failed(invoice.invoice_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::AlreadyPaid));

    let err = h
        .services
        .invoices
        .cancel_invoice(invoice.invoice_id, Some(user_id))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::AlreadyPaid));

    let err = h
        .services
        .orchestrator
        .pay_invoice(invoice.invoice_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::AlreadyPaid));
    assert!(h.gateway.charges().is_empty());
}

#[tokio::test]
async fn cancelled_invoice_cannot_be_paid() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    let invoice = h
        .services
        .orchestrator
        .purchase_extra_hours(user_id, 1, None)
        .await
        .unwrap();

    let cancelled = h
        .services
        .invoices
        .cancel_invoice(invoice.invoice_id, Some(user_id))
        .await
        .unwrap();
    assert_eq!(cancelled.status(), PaymentStatus::Cancelled);

    let err = h
        .services
        .invoices
        .mark_as_paid(invoice.invoice_id, PaymentDetails::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition(_)));
}

#[tokio::test]
async fn declined_payment_fails_the_invoice_and_can_be_retried() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    let invoice = h
        .services
        .orchestrator
        .purchase_extra_hours(user_id, 2, None)
        .await
        .unwrap();
    h.gateway
        .push_charge_status(ChargeStatus::RequiresPaymentMethod);

    let err = h
        .services
        .orchestrator
        .pay_invoice(invoice.invoice_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::PaymentRequiresAuthentication));

    let failed = h
        .services
        .invoices
        .get_invoice_by_id(invoice.invoice_id, Some(user_id))
        .await
        .unwrap();
    assert_eq!(failed.status(), PaymentStatus::Failed);
    assert_eq!(
        failed.description.as_deref(),
        Some("2 extra hours @ $75.00/hr | Failed: Payment requires customer authentication")
    );

    let summary = h
        .services
        .invoices
        .get_billing_summary(user_id)
        .await
        .unwrap();
    assert_eq!(summary.total_failed, 1);

    let paid = h
        .services
        .orchestrator
        .pay_invoice(invoice.invoice_id)
        .await
        .expect("Retry after failure should succeed");
    assert_eq!(paid.status(), PaymentStatus::Paid);
    assert_eq!(h.gateway.charges().len(), 2);
}

#[tokio::test]
async fn mark_as_failed_without_reason_uses_default_message() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    let invoice = h
        .services
        .orchestrator
        .purchase_extra_hours(user_id, 1, None)
        .await
        .unwrap();

    let failed = h
        .services
        .invoices
        .mark_as_failed(invoice.invoice_id, None)
        .await
        .unwrap();

    assert_eq!(failed.description, invoice.description);
    let notifications = h
        .services
        .notifications
        .list_notifications(user_id, 1, false)
        .await
        .unwrap();
    assert_eq!(notifications[0].title, "Payment Failed");
    assert_eq!(notifications[0].message, "Your payment could not be processed");
    assert_eq!(notifications[0].action_label.as_deref(), Some("Retry Payment"));
}

#[tokio::test]
async fn unreachable_processor_leaves_invoice_unpaid() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    let invoice = h
        .services
        .orchestrator
        .purchase_extra_hours(user_id, 1, None)
        .await
        .unwrap();
    h.gateway.set_unavailable(true);

    let err = h
        .services
        .orchestrator
        .pay_invoice(invoice.invoice_id)
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::Gateway(_)));
    let unchanged = h
        .services
        .invoices
        .get_invoice_by_id(invoice.invoice_id, None)
        .await
        .unwrap();
    assert_eq!(unchanged.status(), PaymentStatus::Unpaid);
}

#[tokio::test]
async fn renewal_bills_and_reactivates_the_subscription() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    let activation = h
        .services
        .orchestrator
        .activate_subscription(user_id, "growth", None)
        .await
        .unwrap();
    h.clock.advance(Duration::days(31));

    let invoice = h
        .services
        .orchestrator
        .renew_subscription(activation.subscription_id)
        .await
        .unwrap();

    assert_eq!(invoice.status(), PaymentStatus::Paid);
    assert_eq!(invoice.total, 250_000);
    let subscription = h
        .services
        .subscriptions
        .get_subscription_by_id(activation.subscription_id)
        .await
        .unwrap();
    assert_eq!(subscription.status(), SubscriptionStatus::Active);
    assert_eq!(
        subscription.next_billing_date,
        (test_now() + Duration::days(31))
            .checked_add_months(Months::new(1))
            .unwrap()
    );
}

#[tokio::test]
async fn paying_a_paused_subscription_invoice_reactivates_it() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    let activation = h
        .services
        .orchestrator
        .activate_subscription(user_id, "starter", None)
        .await
        .unwrap();
    h.services
        .subscriptions
        .pause_subscription(activation.subscription_id)
        .await
        .unwrap();

    h.services
        .orchestrator
        .renew_subscription(activation.subscription_id)
        .await
        .unwrap();

    let subscription = h
        .services
        .subscriptions
        .get_active_subscription(user_id)
        .await
        .unwrap()
        .expect("Renewal payment should reactivate");
    assert_eq!(subscription.subscription_id, activation.subscription_id);
}

#[tokio::test]
async fn cancelled_subscription_cannot_be_renewed() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    let activation = h
        .services
        .orchestrator
        .activate_subscription(user_id, "starter", None)
        .await
        .unwrap();
    h.services
        .subscriptions
        .cancel_subscription(user_id)
        .await
        .unwrap();

    let err = h
        .services
        .orchestrator
        .renew_subscription(activation.subscription_id)
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::InvalidTransition(_)));
}

#[tokio::test]
async fn rendered_invoice_describes_the_plan() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    let activation = h
        .services
        .orchestrator
        .activate_subscription(user_id, "starter", None)
        .await
        .unwrap();

    let document = h
        .services
        .invoices
        .render_invoice(activation.invoice_id, Some(user_id))
        .await
        .unwrap();

    assert_eq!(document.currency, "USD");
    assert_eq!(document.amount, dec("1250.00"));
    assert_eq!(document.status, PaymentStatus::Paid);
    assert_eq!(document.client.name, "Ada Client");
    assert_eq!(document.items.len(), 1);
    assert_eq!(document.items[0].description, "STARTER Plan - 200 hours");

    let err = h
        .services
        .invoices
        .render_invoice(activation.invoice_id, Some(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Unauthorized));
}

#[tokio::test]
async fn billing_summary_totals_by_status() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    h.services
        .orchestrator
        .activate_subscription(user_id, "starter", None)
        .await
        .unwrap();
    h.services
        .orchestrator
        .purchase_extra_hours(user_id, 10, None)
        .await
        .unwrap();
    let failed = h
        .services
        .orchestrator
        .purchase_extra_hours(user_id, 1, None)
        .await
        .unwrap();
    h.services
        .invoices
        .mark_as_failed(failed.invoice_id, Some("card expired".to_string()))
        .await
        .unwrap();

    let summary = h
        .services
        .invoices
        .get_billing_summary(user_id)
        .await
        .unwrap();

    assert_eq!(summary.total_paid, dec("1250.00"));
    assert_eq!(summary.total_pending, dec("750.00"));
    assert_eq!(summary.total_failed, 1);
    assert_eq!(summary.recent_invoices.len(), 3);
}

#[tokio::test]
async fn payment_history_filters_by_paid_date() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    h.services
        .orchestrator
        .activate_subscription(user_id, "starter", None)
        .await
        .unwrap();
    h.services
        .orchestrator
        .purchase_extra_hours(user_id, 10, None)
        .await
        .unwrap();

    let all = h
        .services
        .invoices
        .get_payment_history(user_id, PaymentHistoryFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 1);

    let later = h
        .services
        .invoices
        .get_payment_history(
            user_id,
            PaymentHistoryFilter {
                start_date: Some(test_now() + Duration::days(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(later.is_empty());

    let err = h
        .services
        .invoices
        .get_payment_history(
            user_id,
            PaymentHistoryFilter {
                start_date: Some(test_now()),
                end_date: Some(test_now() - Duration::days(1)),
                limit: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
}

#[tokio::test]
async fn client_cannot_cancel_someone_elses_invoice() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    let invoice = h
        .services
        .orchestrator
        .purchase_extra_hours(user_id, 1, None)
        .await
        .unwrap();

    let err = h
        .services
        .invoices
        .cancel_invoice(invoice.invoice_id, Some(Uuid::new_v4()))
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::Unauthorized));
}
