//! Hours balance ledger integration tests for billing-service.

mod common;

use billing_service::error::BillingError;
use billing_service::models::{
    BillingInterval, CreateSubscription, NewTimeLog, SubscriptionPlan,
};
use billing_service::services::{RolloverPolicy, UsagePolicy};
use chrono::{Duration, TimeZone, Utc};
use common::{test_now, TestHarness};
use rust_decimal::Decimal;
use std::str::FromStr;
use uuid::Uuid;

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

async fn subscribed_balance(h: &TestHarness, monthly_hours: i32) -> (Uuid, Uuid) {
    let user_id = h.seed_user().await;
    let subscription = h
        .services
        .subscriptions
        .create_subscription(CreateSubscription {
            user_id,
            plan: SubscriptionPlan::Starter,
            billing_interval: BillingInterval::Monthly,
            price_amount: 125_000,
            monthly_hours,
        })
        .await
        .unwrap();
    let balance = h
        .services
        .hours
        .create_monthly_balance(user_id, Some(subscription.subscription_id), monthly_hours, None)
        .await
        .unwrap();
    (user_id, balance.balance_id)
}

fn time_entry(client_id: Uuid, project_id: Uuid, minutes: i32) -> NewTimeLog {
    NewTimeLog {
        client_id,
        project_id,
        project_title: "Website Redesign".to_string(),
        task_name: Some("Wireframes".to_string()),
        duration_minutes: minutes,
        start_time: test_now() - Duration::hours(2),
    }
}

#[tokio::test]
async fn monthly_balance_covers_the_calendar_month() {
    let h = TestHarness::new();
    let user_id = h.seed_user().await;

    let balance = h
        .services
        .hours
        .create_monthly_balance(user_id, None, 40, None)
        .await
        .unwrap();

    assert_eq!(
        balance.period_start,
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    );
    assert_eq!(
        balance.period_end,
        Utc.with_ymd_and_hms(2026, 3, 31, 23, 59, 59).unwrap()
    );
    assert_eq!(balance.allocated_hours, 40);
    assert_eq!(balance.minutes_used, 0);

    let current = h
        .services
        .hours
        .get_current_balance(user_id)
        .await
        .unwrap()
        .expect("Balance should cover now");
    assert_eq!(current.hours_remaining, Decimal::from(40));
    assert_eq!(current.usage_percentage, Decimal::ZERO);
}

#[tokio::test]
async fn crossing_the_threshold_warns_once() {
    let h = TestHarness::new();
    let user_id = h.seed_user().await;
    let balance = h
        .services
        .hours
        .create_monthly_balance(user_id, None, 10, None)
        .await
        .unwrap();

    let view = h
        .services
        .hours
        .update_usage(balance.balance_id, 450)
        .await
        .unwrap();
    assert_eq!(view.hours_used, dec("7.5"));
    assert_eq!(view.balance.minutes_used, 450);
    assert_eq!(h.services.notifications.unread_count(user_id).await.unwrap(), 0);

    let view = h
        .services
        .hours
        .update_usage(balance.balance_id, 60)
        .await
        .unwrap();
    assert_eq!(view.usage_percentage, Decimal::from(85));

    let notifications = h
        .services
        .notifications
        .list_notifications(user_id, 10, true)
        .await
        .unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].title, "Hours Running Low");
    assert_eq!(
        notifications[0].message,
        "You have 1.5 hours remaining this month."
    );
    assert_eq!(notifications[0].action_label.as_deref(), Some("Buy Hours"));

    h.services
        .hours
        .update_usage(balance.balance_id, 30)
        .await
        .unwrap();
    assert_eq!(h.services.notifications.unread_count(user_id).await.unwrap(), 1);
}

#[tokio::test]
async fn soft_limit_lets_usage_run_past_the_allowance() {
    let h = TestHarness::new();
    let user_id = h.seed_user().await;
    let balance = h
        .services
        .hours
        .create_monthly_balance(user_id, None, 1, None)
        .await
        .unwrap();

    let view = h
        .services
        .hours
        .update_usage(balance.balance_id, 90)
        .await
        .unwrap();

    assert_eq!(view.hours_remaining, dec("-0.5"));
    assert_eq!(view.usage_percentage, Decimal::from(150));
}

#[tokio::test]
async fn hard_cap_rejects_usage_beyond_remaining() {
    let h = TestHarness::with_usage_policy(UsagePolicy::HardCap);
    let user_id = h.seed_user().await;
    let balance = h
        .services
        .hours
        .create_monthly_balance(user_id, None, 1, None)
        .await
        .unwrap();

    let err = h
        .services
        .hours
        .update_usage(balance.balance_id, 90)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BillingError::UsageLimitExceeded { remaining, .. } if remaining == Decimal::ONE
    ));

    let view = h
        .services
        .hours
        .update_usage(balance.balance_id, 60)
        .await
        .expect("Usage up to the allowance should be accepted");
    assert_eq!(view.hours_remaining, Decimal::ZERO);
}

#[tokio::test]
async fn uneven_minute_entries_add_up_to_exact_hours() {
    let h = TestHarness::new();
    let user_id = h.seed_user().await;
    let balance = h
        .services
        .hours
        .create_monthly_balance(user_id, None, 10, None)
        .await
        .unwrap();

    for _ in 0..3 {
        h.services
            .hours
            .update_usage(balance.balance_id, 20)
            .await
            .unwrap();
    }
    let view = h
        .services
        .hours
        .get_current_balance(user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.hours_used, Decimal::ONE);
    assert_eq!(view.hours_remaining, Decimal::from(9));

    let mut view = view;
    for _ in 0..60 {
        view = h
            .services
            .hours
            .update_usage(balance.balance_id, 1)
            .await
            .unwrap();
    }
    assert_eq!(view.balance.minutes_used, 120);
    assert_eq!(view.hours_used, Decimal::from(2));
    assert_eq!(view.hours_remaining, Decimal::from(8));
    assert_eq!(view.usage_percentage, Decimal::from(20));
}

#[tokio::test]
async fn hard_cap_holds_for_concurrent_usage() {
    let h = TestHarness::with_usage_policy(UsagePolicy::HardCap);
    let user_id = h.seed_user().await;
    let balance = h
        .services
        .hours
        .create_monthly_balance(user_id, None, 1, None)
        .await
        .unwrap();

    let balance_id = balance.balance_id;
    let attempts: Vec<_> = (0..5)
        .map(|_| {
            let hours = h.services.hours.clone();
            tokio::spawn(async move { hours.update_usage(balance_id, 30).await })
        })
        .collect();
    let mut accepted = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(err) => assert!(matches!(err, BillingError::UsageLimitExceeded { .. })),
        }
    }

    assert_eq!(accepted, 2);
    let view = h
        .services
        .hours
        .get_current_balance(user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.balance.minutes_used, 60);
    assert_eq!(view.hours_remaining, Decimal::ZERO);
}

#[tokio::test]
async fn usage_input_is_validated() {
    let h = TestHarness::new();

    let err = h
        .services
        .hours
        .update_usage(Uuid::new_v4(), -5)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    let err = h
        .services
        .hours
        .update_usage(Uuid::new_v4(), 5)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::BalanceNotFound));
}

#[tokio::test]
async fn purchased_hours_extend_the_open_balance() {
    let h = TestHarness::new();
    let user_id = h.seed_user().await;
    h.services
        .hours
        .create_monthly_balance(user_id, None, 10, None)
        .await
        .unwrap();

    let balance = h
        .services
        .hours
        .add_purchased_hours(user_id, 5)
        .await
        .unwrap();
    assert_eq!(balance.extra_purchased_hours, 5);
    assert_eq!(balance.total_available_hours(), Decimal::from(15));

    let err = h
        .services
        .hours
        .add_purchased_hours(user_id, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    let err = h
        .services
        .hours
        .add_purchased_hours(Uuid::new_v4(), 5)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NoActiveBalance));
}

#[tokio::test]
async fn reset_opens_next_month_and_is_idempotent() {
    let h = TestHarness::new();
    let (user_id, _) = subscribed_balance(&h, 200).await;

    let next = h
        .services
        .hours
        .reset_monthly_balance(user_id)
        .await
        .unwrap()
        .expect("Next balance should be created");
    assert_eq!(
        next.period_start,
        Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
    );
    assert_eq!(
        next.period_end,
        Utc.with_ymd_and_hms(2026, 4, 30, 23, 59, 59).unwrap()
    );
    assert_eq!(next.allocated_hours, 200);
    assert_eq!(next.rollover_hours, Decimal::ZERO);

    let again = h
        .services
        .hours
        .reset_monthly_balance(user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.balance_id, next.balance_id);

    let history = h
        .services
        .hours
        .get_balance_history(user_id, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].balance.balance_id, next.balance_id);
}

#[tokio::test]
async fn resets_after_mid_month_activation_leave_early_month_uncovered() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    h.services
        .orchestrator
        .activate_subscription(user_id, "starter", None)
        .await
        .unwrap();

    let april = h
        .services
        .hours
        .reset_monthly_balance(user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(april.period_start, Utc.with_ymd_and_hms(2026, 4, 15, 10, 0, 0).unwrap());
    assert_eq!(april.period_end, Utc.with_ymd_and_hms(2026, 4, 30, 23, 59, 59).unwrap());

    h.clock.set(Utc.with_ymd_and_hms(2026, 4, 20, 9, 0, 0).unwrap());
    let may = h
        .services
        .hours
        .reset_monthly_balance(user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(may.period_start, Utc.with_ymd_and_hms(2026, 5, 15, 10, 0, 0).unwrap());

    h.clock.set(Utc.with_ymd_and_hms(2026, 5, 5, 9, 0, 0).unwrap());
    assert!(h
        .services
        .hours
        .get_current_balance(user_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn carry_forward_rollover_is_capped() {
    let h = TestHarness::with_rollover_policy(RolloverPolicy::CarryForwardUnused {
        cap_hours: Some(Decimal::from(20)),
    });
    let (user_id, balance_id) = subscribed_balance(&h, 200).await;
    h.services
        .hours
        .update_usage(balance_id, 150 * 60)
        .await
        .unwrap();

    let next = h
        .services
        .hours
        .reset_monthly_balance(user_id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(next.rollover_hours, Decimal::from(20));
    assert_eq!(next.total_available_hours(), Decimal::from(220));
}

#[tokio::test]
async fn reset_without_a_subscription_linked_balance_is_a_no_op() {
    let h = TestHarness::new();
    let user_id = h.seed_user().await;

    assert!(h
        .services
        .hours
        .reset_monthly_balance(user_id)
        .await
        .unwrap()
        .is_none());

    h.services
        .hours
        .create_monthly_balance(user_id, None, 10, None)
        .await
        .unwrap();
    assert!(h
        .services
        .hours
        .reset_monthly_balance(user_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn time_entries_charge_the_current_balance_and_roll_up_by_project() {
    let h = TestHarness::new();
    let (user_id, _) = subscribed_balance(&h, 200).await;
    let project_id = Uuid::new_v4();

    let (log, balance) = h
        .services
        .hours
        .record_time_entry(time_entry(user_id, project_id, 60))
        .await
        .unwrap();
    assert_eq!(log.duration_minutes, 60);
    assert_eq!(balance.unwrap().hours_used, Decimal::ONE);

    h.services
        .hours
        .record_time_entry(time_entry(user_id, project_id, 30))
        .await
        .unwrap();

    let usage = h
        .services
        .hours
        .get_usage_by_project(
            user_id,
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 31, 23, 59, 59).unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].total_minutes, 90);
    assert_eq!(usage[0].total_hours, dec("1.5"));
    assert_eq!(usage[0].project_title, "Website Redesign");
}

#[tokio::test]
async fn time_entry_without_balance_is_still_logged() {
    let h = TestHarness::new();
    let user_id = h.seed_user().await;

    let (_, balance) = h
        .services
        .hours
        .record_time_entry(time_entry(user_id, Uuid::new_v4(), 45))
        .await
        .unwrap();

    assert!(balance.is_none());
}

#[tokio::test]
async fn rejected_time_entry_is_not_logged() {
    let h = TestHarness::with_usage_policy(UsagePolicy::HardCap);
    let (user_id, _) = subscribed_balance(&h, 1).await;
    let project_id = Uuid::new_v4();

    let err = h
        .services
        .hours
        .record_time_entry(time_entry(user_id, project_id, 120))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::UsageLimitExceeded { .. }));

    let usage = h
        .services
        .hours
        .get_usage_by_project(user_id, test_now() - Duration::days(1), test_now())
        .await
        .unwrap();
    assert!(usage.is_empty());
}

#[tokio::test]
async fn entry_over_the_cap_leaves_earlier_usage_untouched() {
    let h = TestHarness::with_usage_policy(UsagePolicy::HardCap);
    let (user_id, _) = subscribed_balance(&h, 1).await;
    let project_id = Uuid::new_v4();

    h.services
        .hours
        .record_time_entry(time_entry(user_id, project_id, 45))
        .await
        .unwrap();
    let err = h
        .services
        .hours
        .record_time_entry(time_entry(user_id, project_id, 20))
        .await
        .unwrap_err();
    match err {
        BillingError::UsageLimitExceeded {
            requested,
            remaining,
        } => {
            assert_eq!(requested, dec("0.33"));
            assert_eq!(remaining, dec("0.25"));
        }
        other => panic!("Expected usage limit error, got {:?}", other),
    }

    let usage = h
        .services
        .hours
        .get_usage_by_project(user_id, test_now() - Duration::days(1), test_now())
        .await
        .unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].total_minutes, 45);

    let view = h
        .services
        .hours
        .get_current_balance(user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.balance.minutes_used, 45);
}

#[tokio::test]
async fn balance_for_unknown_customer_is_rejected() {
    let h = TestHarness::new();

    let err = h
        .services
        .hours
        .create_monthly_balance(Uuid::new_v4(), None, 10, None)
        .await
        .unwrap_err();

    assert_eq!(err.code(), "missing_reference");
}

#[tokio::test]
async fn usage_range_must_be_ordered() {
    let h = TestHarness::new();

    let err = h
        .services
        .hours
        .get_usage_by_project(Uuid::new_v4(), test_now(), test_now() - Duration::days(1))
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::Validation(_)));
}
