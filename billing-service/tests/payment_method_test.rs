//! Saved payment method integration tests for billing-service.

mod common;

use billing_service::error::BillingError;
use billing_service::services::gateway::CardDetails;
use billing_service::services::BillingStore;
use chrono::Duration;
use common::TestHarness;
use uuid::Uuid;

fn visa() -> CardDetails {
    CardDetails {
        brand: Some("visa".to_string()),
        last_four: Some("4242".to_string()),
        exp_month: Some(8),
        exp_year: Some(2031),
    }
}

#[tokio::test]
async fn setup_intent_creates_processor_customer_once() {
    let h = TestHarness::new();
    let user_id = Uuid::new_v4();
    h.seed_customer(user_id, None).await;

    let first = h
        .services
        .payment_methods
        .create_setup_intent(user_id)
        .await
        .unwrap();
    assert!(first.client_secret.is_some());

    let customer = h.store.get_customer(user_id).await.unwrap().unwrap();
    let customer_ref = customer
        .external_customer_id
        .expect("Customer reference should be stored");

    h.services
        .payment_methods
        .create_setup_intent(user_id)
        .await
        .unwrap();
    let again = h
        .services
        .payment_methods
        .get_or_create_customer(user_id)
        .await
        .unwrap();
    assert_eq!(again, customer_ref);
}

#[tokio::test]
async fn setup_intent_for_unknown_user_fails() {
    let h = TestHarness::new();

    let err = h
        .services
        .payment_methods
        .create_setup_intent(Uuid::new_v4())
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::UserNotFound));
}

#[tokio::test]
async fn confirmed_card_becomes_the_default() {
    let h = TestHarness::new();
    let (user_id, original) = h.seed_client().await;
    let intent = h
        .services
        .payment_methods
        .create_setup_intent(user_id)
        .await
        .unwrap();
    h.gateway
        .complete_setup_intent(&intent.setup_intent_id, "pm_new_card", visa());

    let method = h
        .services
        .payment_methods
        .confirm_payment_method(user_id, &intent.setup_intent_id)
        .await
        .unwrap();

    assert!(method.is_default);
    assert_eq!(method.card_brand.as_deref(), Some("VISA"));
    assert_eq!(method.card_last_four.as_deref(), Some("4242"));
    assert_eq!(method.external_payment_method_id.as_deref(), Some("pm_new_card"));
    assert_eq!(
        method.billing_email,
        Some(format!("{}@client.test", user_id.simple()))
    );

    let methods = h
        .services
        .payment_methods
        .list_payment_methods(user_id)
        .await
        .unwrap();
    assert_eq!(methods.len(), 2);
    assert_eq!(methods[0].payment_method_id, method.payment_method_id);
    assert!(!methods
        .iter()
        .find(|m| m.payment_method_id == original.payment_method_id)
        .unwrap()
        .is_default);
}

#[tokio::test]
async fn confirming_twice_returns_the_saved_method() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    let intent = h
        .services
        .payment_methods
        .create_setup_intent(user_id)
        .await
        .unwrap();
    h.gateway
        .complete_setup_intent(&intent.setup_intent_id, "pm_twice", visa());

    let first = h
        .services
        .payment_methods
        .confirm_payment_method(user_id, &intent.setup_intent_id)
        .await
        .unwrap();
    let second = h
        .services
        .payment_methods
        .confirm_payment_method(user_id, &intent.setup_intent_id)
        .await
        .unwrap();

    assert_eq!(first.payment_method_id, second.payment_method_id);
    assert_eq!(
        h.services
            .payment_methods
            .list_payment_methods(user_id)
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn setup_intent_of_another_customer_is_refused() {
    let h = TestHarness::new();
    let (owner, _) = h.seed_client().await;
    let (other, _) = h.seed_client().await;
    let intent = h
        .services
        .payment_methods
        .create_setup_intent(owner)
        .await
        .unwrap();
    h.gateway
        .complete_setup_intent(&intent.setup_intent_id, "pm_owner_card", visa());

    let err = h
        .services
        .payment_methods
        .confirm_payment_method(other, &intent.setup_intent_id)
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::Unauthorized));
    let methods = h
        .services
        .payment_methods
        .list_payment_methods(other)
        .await
        .unwrap();
    assert!(methods
        .iter()
        .all(|m| m.external_payment_method_id.as_deref() != Some("pm_owner_card")));
}

#[tokio::test]
async fn synced_customer_keeps_processor_reference() {
    let h = TestHarness::new();
    let user_id = Uuid::new_v4();
    h.services
        .payment_methods
        .sync_customer(user_id, "lin@client.test", Some("Lin Client"))
        .await
        .unwrap();
    let reference = h
        .services
        .payment_methods
        .get_or_create_customer(user_id)
        .await
        .unwrap();

    let customer = h
        .services
        .payment_methods
        .sync_customer(user_id, "lin@moved.test", None)
        .await
        .unwrap();

    assert_eq!(customer.email, "lin@moved.test");
    assert!(customer.full_name.is_none());
    assert_eq!(customer.external_customer_id.as_deref(), Some(reference.as_str()));
}

#[tokio::test]
async fn incomplete_setup_intent_is_rejected() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    let intent = h
        .services
        .payment_methods
        .create_setup_intent(user_id)
        .await
        .unwrap();

    let err = h
        .services
        .payment_methods
        .confirm_payment_method(user_id, &intent.setup_intent_id)
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::InvalidTransition(_)));
}

#[tokio::test]
async fn set_default_switches_the_single_default() {
    let h = TestHarness::new();
    let (user_id, first) = h.seed_client().await;
    let second = h.seed_payment_method(user_id, "pm_second", false).await;

    let updated = h
        .services
        .payment_methods
        .set_default_payment_method(user_id, second.payment_method_id)
        .await
        .unwrap();
    assert!(updated.is_default);

    let methods = h
        .services
        .payment_methods
        .list_payment_methods(user_id)
        .await
        .unwrap();
    assert_eq!(methods.iter().filter(|m| m.is_default).count(), 1);
    assert_eq!(methods[0].payment_method_id, second.payment_method_id);
    assert_ne!(methods[0].payment_method_id, first.payment_method_id);

    let (_, foreign) = h.seed_client().await;
    let err = h
        .services
        .payment_methods
        .set_default_payment_method(user_id, foreign.payment_method_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::PaymentMethodNotFound));
}

#[tokio::test]
async fn deleting_the_default_promotes_the_newest_remaining() {
    let h = TestHarness::new();
    let (user_id, default) = h.seed_client().await;
    h.clock.advance(Duration::minutes(1));
    h.seed_payment_method(user_id, "pm_older", false).await;
    h.clock.advance(Duration::minutes(1));
    let newest = h.seed_payment_method(user_id, "pm_newest", false).await;

    h.services
        .payment_methods
        .delete_payment_method(user_id, default.payment_method_id)
        .await
        .unwrap();

    let methods = h
        .services
        .payment_methods
        .list_payment_methods(user_id)
        .await
        .unwrap();
    assert_eq!(methods.len(), 2);
    assert_eq!(methods[0].payment_method_id, newest.payment_method_id);
    assert!(methods[0].is_default);
}

#[tokio::test]
async fn last_method_is_kept_while_subscribed() {
    let h = TestHarness::new();
    let (user_id, method) = h.seed_client().await;
    h.services
        .orchestrator
        .activate_subscription(user_id, "starter", None)
        .await
        .unwrap();

    let err = h
        .services
        .payment_methods
        .delete_payment_method(user_id, method.payment_method_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::LastPaymentMethod));

    h.services
        .subscriptions
        .cancel_subscription(user_id)
        .await
        .unwrap();
    h.services
        .payment_methods
        .delete_payment_method(user_id, method.payment_method_id)
        .await
        .expect("Deletion should succeed once no subscription is active");
    assert!(h
        .services
        .payment_methods
        .list_payment_methods(user_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn cannot_delete_another_users_method() {
    let h = TestHarness::new();
    let (user_id, _) = h.seed_client().await;
    let (_, foreign) = h.seed_client().await;

    let err = h
        .services
        .payment_methods
        .delete_payment_method(user_id, foreign.payment_method_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Unauthorized));

    let err = h
        .services
        .payment_methods
        .delete_payment_method(user_id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::PaymentMethodNotFound));
}
