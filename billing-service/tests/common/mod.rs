//! Test helper module for billing-service integration tests.
//!
//! Services run over the in-memory store, the mock payment gateway and a fixed clock.

#![allow(dead_code)]

use billing_service::config::{
    BillingConfig, NotificationSettings, PolicyConfig, PricingConfig, StripeConfig,
};
use billing_service::models::{Customer, PaymentMethod, PlanCatalog};
use billing_service::services::{
    init_metrics, BillingServices, BillingSettings, BillingStore, Clock, FixedClock, MemoryStore,
    MockPaymentGateway, RolloverPolicy, UsagePolicy,
};
use billing_service::startup::{AppState, Application};
use chrono::{DateTime, TimeZone, Utc};
use secrecy::Secret;
use service_core::config::Config as CoreConfig;
use std::sync::Arc;
use uuid::Uuid;

/// Mid-month so calendar-month and subscription-period arithmetic differ.
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 15, 10, 0, 0).unwrap()
}

/// Billing services plus handles on their collaborators.
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<MockPaymentGateway>,
    pub clock: Arc<FixedClock>,
    pub services: BillingServices,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(BillingSettings::default())
    }

    pub fn with_usage_policy(policy: UsagePolicy) -> Self {
        Self::with_settings(BillingSettings {
            usage_policy: policy,
            ..BillingSettings::default()
        })
    }

    pub fn with_rollover_policy(policy: RolloverPolicy) -> Self {
        Self::with_settings(BillingSettings {
            rollover_policy: policy,
            ..BillingSettings::default()
        })
    }

    pub fn with_settings(settings: BillingSettings) -> Self {
        init_metrics();
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockPaymentGateway::new());
        let clock = Arc::new(FixedClock::new(test_now()));
        let services = BillingServices::new(store.clone(), gateway.clone(), clock.clone(), settings);
        Self {
            store,
            gateway,
            clock,
            services,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            services: self.services.clone(),
            clock: self.clock.clone(),
        }
    }

    /// A customer known to the processor with one saved default card.
    pub async fn seed_client(&self) -> (Uuid, PaymentMethod) {
        let user_id = Uuid::new_v4();
        self.seed_customer(user_id, Some(format!("cus_{}", user_id.simple())))
            .await;
        let method = self.seed_payment_method(user_id, "pm_card_visa", true).await;
        (user_id, method)
    }

    /// A mirrored customer with no processor reference yet.
    pub async fn seed_user(&self) -> Uuid {
        let user_id = Uuid::new_v4();
        self.seed_customer(user_id, None).await;
        user_id
    }

    pub async fn seed_customer(&self, user_id: Uuid, external_customer_id: Option<String>) -> Customer {
        self.store
            .upsert_customer(&Customer {
                user_id,
                email: format!("{}@client.test", user_id.simple()),
                full_name: Some("Ada Client".to_string()),
                external_customer_id,
                created_utc: test_now(),
            })
            .await
            .expect("Failed to seed customer")
    }

    pub async fn seed_payment_method(
        &self,
        user_id: Uuid,
        external_id: &str,
        is_default: bool,
    ) -> PaymentMethod {
        self.store
            .insert_payment_method(&PaymentMethod {
                payment_method_id: Uuid::new_v4(),
                user_id,
                method_type: "card".to_string(),
                is_default,
                card_brand: Some("VISA".to_string()),
                card_last_four: Some("4242".to_string()),
                card_exp_month: Some(12),
                card_exp_year: Some(2030),
                external_payment_method_id: Some(external_id.to_string()),
                billing_email: None,
                created_utc: self.clock_now(),
            })
            .await
            .expect("Failed to seed payment method")
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// HTTP test application on a random port, backed by the in-memory store and mock gateway.
pub struct TestApp {
    pub http_address: String,
    pub port: u16,
    pub services: BillingServices,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let config = BillingConfig {
            common: CoreConfig { port: 0 },
            service_name: "billing-service-test".to_string(),
            service_version: "0.1.0".to_string(),
            log_level: "warn".to_string(),
            otlp_endpoint: None,
            database: None,
            stripe: StripeConfig {
                api_base_url: "http://127.0.0.1:9".to_string(),
                secret_key: Secret::new(String::new()),
            },
            pricing: PricingConfig {
                currency: "usd".to_string(),
                extra_hour_price_minor_units: 7500,
                catalog: PlanCatalog::default(),
            },
            notifications: NotificationSettings {
                dedup_window_seconds: 300,
            },
            policies: PolicyConfig {
                usage: UsagePolicy::default(),
                rollover: RolloverPolicy::default(),
            },
        };

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");
        let port = app.port();
        let services = app.services().clone();
        let http_address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("{}/health", http_address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            http_address,
            port,
            services,
        }
    }
}
